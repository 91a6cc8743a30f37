//! Type interning
//!
//! Each compilation unit owns one [`TypeTable`]. Interning deduplicates
//! structurally equal types and hands out dense [`TypeId`]s; an interned type
//! is never mutated afterwards, so ids are stable memo keys (the layout
//! resolver relies on this).

use super::Type;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Handle to an interned type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Deduplicated type storage
#[derive(Debug, Clone, Default, Serialize)]
pub struct TypeTable {
    types: Vec<Type>,
    #[serde(skip)]
    index: HashMap<Type, TypeId>,
}

impl TypeTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a table from types in id order (duplicates are kept as-is so
    /// existing ids stay valid)
    pub fn from_types(types: Vec<Type>) -> Self {
        let mut index = HashMap::with_capacity(types.len());
        for (i, ty) in types.iter().enumerate() {
            index.entry(ty.clone()).or_insert(TypeId(i as u32));
        }
        Self { types, index }
    }

    /// Intern a type, returning the existing id for an equal type
    pub fn intern(&mut self, ty: &Type) -> TypeId {
        if let Some(id) = self.index.get(ty) {
            return *id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty.clone());
        self.index.insert(ty.clone(), id);
        id
    }

    /// Look up an already-interned type
    pub fn lookup(&self, ty: &Type) -> Option<TypeId> {
        self.index.get(ty).copied()
    }

    /// Type for an id
    pub fn get(&self, id: TypeId) -> Option<&Type> {
        self.types.get(id.0 as usize)
    }

    /// Number of interned types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when nothing is interned
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Iterate `(id, type)` pairs in id order
    pub fn iter(&self) -> impl Iterator<Item = (TypeId, &Type)> {
        self.types
            .iter()
            .enumerate()
            .map(|(i, t)| (TypeId(i as u32), t))
    }
}

impl PartialEq for TypeTable {
    fn eq(&self, other: &Self) -> bool {
        self.types == other.types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedups() {
        let mut table = TypeTable::new();
        let a = table.intern(&Type::I32);
        let b = table.intern(&Type::F64);
        let c = table.intern(&Type::I32);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(b), Some(&Type::F64));
    }

    #[test]
    fn test_from_types_preserves_ids() {
        let table = TypeTable::from_types(vec![Type::BOOL, Type::unit()]);
        assert_eq!(table.lookup(&Type::unit()), Some(TypeId(1)));
    }
}
