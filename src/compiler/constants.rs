//! Constant pool
//!
//! Literal values of a compilation unit, deduplicated bit-exactly. The pool
//! is built during lowering (and extended by constant folding) and is then
//! shared read-only by every frame of both execution modes.

use crate::compiler::ir::ConstId;
use crate::runtime::TypedValue;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use std::collections::HashMap;

/// Immutable-after-compilation table of typed constants
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    values: Vec<TypedValue>,
    index: HashMap<TypedValue, ConstId>,
}

impl ConstantPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a pool from values in id order
    pub fn from_values(values: Vec<TypedValue>) -> Self {
        let mut index = HashMap::with_capacity(values.len());
        for (i, v) in values.iter().enumerate() {
            index.entry(v.clone()).or_insert(ConstId(i as u32));
        }
        Self { values, index }
    }

    /// Add a value, reusing an existing bit-identical entry
    pub fn intern(&mut self, value: TypedValue) -> ConstId {
        if let Some(id) = self.index.get(&value) {
            return *id;
        }
        let id = ConstId(self.values.len() as u32);
        self.index.insert(value.clone(), id);
        self.values.push(value);
        id
    }

    /// Value for an id
    pub fn get(&self, id: ConstId) -> Option<&TypedValue> {
        self.values.get(id.0 as usize)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Entries in id order
    pub fn values(&self) -> &[TypedValue] {
        &self.values
    }
}

impl PartialEq for ConstantPool {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
    }
}

impl Serialize for ConstantPool {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.values.len()))?;
        for v in &self.values {
            seq.serialize_element(&format!("{}: {}", v, v.ty()))?;
        }
        seq.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_is_bit_exact() {
        let mut pool = ConstantPool::new();
        let a = pool.intern(TypedValue::f64(0.0));
        let b = pool.intern(TypedValue::f64(-0.0));
        let c = pool.intern(TypedValue::f64(0.0));
        assert_ne!(a, b);
        assert_eq!(a, c);
        // same bits, different type
        let d = pool.intern(TypedValue::i64(0));
        assert_ne!(a, d);
        assert_eq!(pool.len(), 3);
    }
}
