//! # Layout Resolver
//!
//! Size, alignment and field offsets of every concrete type, as seen by the
//! native path and by the argument/return ABI.
//!
//! ## Rules
//!
//! | Type | Size | Align |
//! |------|------|-------|
//! | Primitive | width / 8 (bool 1) | size |
//! | `Complex(e)` | 2 x e | e |
//! | `Vector`, fixed `Tensor` | count x element, row-major inline | element component |
//! | `Tensor` with a dynamic dim | 8 + 8 x rank (descriptor) | 8 |
//! | `Struct` | fields in declaration order, natural padding, rounded to align | max field (1 if empty) |
//! | `Function` | 8 (function id) | 8 |
//! | `Reference` | 8 (address) | 8 |
//!
//! A dynamic tensor descriptor is `{ data: u64 address, dims: [u64; rank] }`;
//! the element buffer lives out of line.
//!
//! Layouts are memoized by [`TypeId`]. Interned types are immutable, so a
//! memoized layout is valid for the lifetime of the unit. Runtime lookups go
//! through a [`LayoutResolver`], which serves interned types from the memo.
//!
//! [`compute_layout`] saturates on overflow; [`checked_size`] is the exact
//! form the checker and verifier use to reject types no layout can describe.

use crate::types::{elem_kind_of, StructField, Type, TypeId, TypeTable};
use dashmap::DashMap;
use std::sync::Arc;

/// How a value of the type is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// One primitive value
    Scalar,
    /// Two float components (re, im)
    Complex,
    /// Inline row-major elements
    Inline {
        /// Bytes per element
        elem_size: usize,
        /// Element count
        count: usize,
    },
    /// Out-of-line buffer behind a `{data, dims}` descriptor
    Descriptor {
        /// Tensor rank
        rank: usize,
    },
    /// Struct fields at `field_offsets`
    Struct,
    /// 8-byte function id
    FunctionId,
    /// 8-byte address
    Address,
}

/// Resolved layout of one type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Size in bytes (a multiple of `align`)
    pub size: usize,
    /// Alignment in bytes
    pub align: usize,
    /// Byte offset of each struct field (empty for non-structs)
    pub field_offsets: Vec<usize>,
    /// Storage form
    pub storage: Storage,
}

impl Layout {
    fn simple(size: usize, align: usize, storage: Storage) -> Self {
        Self {
            size,
            align,
            field_offsets: Vec::new(),
            storage,
        }
    }
}

/// Round `offset` up to a multiple of `align`
pub fn align_up(offset: usize, align: usize) -> usize {
    if align <= 1 {
        offset
    } else {
        offset.saturating_add(align - 1) / align * align
    }
}

fn checked_align_up(offset: usize, align: usize) -> Option<usize> {
    if align <= 1 {
        Some(offset)
    } else {
        Some(offset.checked_add(align - 1)? / align * align)
    }
}

/// Largest size a layout may have
pub const MAX_LAYOUT_SIZE: usize = isize::MAX as usize;

/// Offset of the dims array inside a dynamic tensor descriptor
pub const DESCRIPTOR_DIMS_OFFSET: usize = 8;

/// Compute the layout of a type (no memoization)
pub fn compute_layout(ty: &Type) -> Layout {
    match ty {
        Type::Primitive { .. } => {
            let size = ty.scalar_kind().map_or(8, |k| k.byte_size());
            Layout::simple(size, size, Storage::Scalar)
        }
        Type::Complex(elem) => {
            let size = elem.scalar_kind().map_or(8, |k| k.byte_size());
            Layout::simple(2 * size, size, Storage::Complex)
        }
        Type::Vector(elem, _) | Type::Tensor(elem, _) => {
            if let Some(shape) = ty.fixed_shape() {
                let kind = elem_kind_of(elem);
                let elem_size = kind.map_or(8, |k| k.byte_size());
                let align = kind.map_or(8, |k| k.component().byte_size());
                let count = shape.iter().fold(1usize, |acc, d| acc.saturating_mul(*d));
                let size = align_up(elem_size.saturating_mul(count), align);
                Layout::simple(size, align, Storage::Inline { elem_size, count })
            } else {
                let rank = ty.dims().map_or(0, |d| d.len());
                Layout::simple(
                    DESCRIPTOR_DIMS_OFFSET + 8 * rank,
                    8,
                    Storage::Descriptor { rank },
                )
            }
        }
        Type::Struct(fields) => {
            let mut offset = 0;
            let mut align = 1;
            let mut offsets = Vec::with_capacity(fields.len());
            for field in fields {
                let fl = compute_layout(&field.ty);
                offset = align_up(offset, fl.align);
                offsets.push(offset);
                offset = offset.saturating_add(fl.size);
                align = align.max(fl.align);
            }
            Layout {
                size: align_up(offset, align),
                align,
                field_offsets: offsets,
                storage: Storage::Struct,
            }
        }
        Type::Function(..) => Layout::simple(8, 8, Storage::FunctionId),
        Type::Reference(..) => Layout::simple(8, 8, Storage::Address),
    }
}

/// Exact size of `ty`, or `None` when computing it overflows or the result
/// exceeds [`MAX_LAYOUT_SIZE`]
pub fn checked_size(ty: &Type) -> Option<usize> {
    checked_extent(ty).map(|(size, _)| size)
}

fn checked_extent(ty: &Type) -> Option<(usize, usize)> {
    let (size, align) = match ty {
        Type::Vector(elem, _) | Type::Tensor(elem, _) if ty.fixed_shape().is_some() => {
            let shape = ty.fixed_shape()?;
            let kind = elem_kind_of(elem);
            let elem_size = kind.map_or(8, |k| k.byte_size());
            let align = kind.map_or(8, |k| k.component().byte_size());
            let count = shape.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))?;
            (checked_align_up(elem_size.checked_mul(count)?, align)?, align)
        }
        Type::Struct(fields) => {
            let mut offset = 0usize;
            let mut align = 1;
            for field in fields {
                let (size, field_align) = checked_extent(&field.ty)?;
                offset = checked_align_up(offset, field_align)?.checked_add(size)?;
                align = align.max(field_align);
            }
            (checked_align_up(offset, align)?, align)
        }
        _ => {
            let layout = compute_layout(ty);
            (layout.size, layout.align)
        }
    };
    (size <= MAX_LAYOUT_SIZE).then_some((size, align))
}

/// Struct type of an argument record: one field per parameter, named by
/// position, laid out like any other struct
pub fn record_type(params: &[Type]) -> Type {
    Type::Struct(
        params
            .iter()
            .enumerate()
            .map(|(i, ty)| StructField {
                name: i.to_string(),
                ty: ty.clone(),
            })
            .collect(),
    )
}

/// Thread-safe layout memo keyed by interned type
#[derive(Debug, Default)]
pub struct LayoutCache {
    memo: DashMap<TypeId, Arc<Layout>>,
}

impl LayoutCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Layout of an interned type; `None` for an unknown id
    pub fn layout_of(&self, types: &TypeTable, id: TypeId) -> Option<Arc<Layout>> {
        if let Some(layout) = self.memo.get(&id) {
            return Some(layout.clone());
        }
        let ty = types.get(id)?;
        let layout = Arc::new(compute_layout(ty));
        Some(self.memo.entry(id).or_insert(layout).clone())
    }

    /// Number of memoized layouts
    pub fn len(&self) -> usize {
        self.memo.len()
    }

    /// True when nothing is memoized yet
    pub fn is_empty(&self) -> bool {
        self.memo.is_empty()
    }
}

/// Layout lookup for one unit
///
/// Types interned in the unit's table are served from its [`LayoutCache`];
/// anything else (and every lookup on a detached resolver) is computed.
#[derive(Debug, Clone, Copy)]
pub struct LayoutResolver<'u> {
    unit: Option<(&'u TypeTable, &'u LayoutCache)>,
}

impl<'u> LayoutResolver<'u> {
    /// Resolver backed by a type table and its memo
    pub fn new(types: &'u TypeTable, cache: &'u LayoutCache) -> Self {
        Self {
            unit: Some((types, cache)),
        }
    }

    /// Resolver without a memo
    pub fn detached() -> Self {
        Self { unit: None }
    }

    /// Layout of `ty`
    pub fn of(&self, ty: &Type) -> Arc<Layout> {
        if let Some((types, cache)) = self.unit {
            if let Some(layout) = types.lookup(ty).and_then(|id| cache.layout_of(types, id)) {
                return layout;
            }
        }
        Arc::new(compute_layout(ty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Dim;

    fn field(name: &str, ty: Type) -> StructField {
        StructField {
            name: name.to_string(),
            ty,
        }
    }

    #[test]
    fn test_primitive_sizes() {
        assert_eq!(compute_layout(&Type::BOOL).size, 1);
        assert_eq!(compute_layout(&Type::I16).size, 2);
        assert_eq!(compute_layout(&Type::F64).align, 8);
    }

    #[test]
    fn test_struct_padding_in_declaration_order() {
        let ty = Type::Struct(vec![
            field("a", Type::U8),
            field("b", Type::I32),
            field("c", Type::U8),
        ]);
        let layout = compute_layout(&ty);
        assert_eq!(layout.field_offsets, vec![0, 4, 8]);
        assert_eq!(layout.size, 12);
        assert_eq!(layout.align, 4);
    }

    #[test]
    fn test_unit_struct() {
        let layout = compute_layout(&Type::unit());
        assert_eq!(layout.size, 0);
        assert_eq!(layout.align, 1);
    }

    #[test]
    fn test_tensor_storage_forms() {
        let fixed = Type::Tensor(Box::new(Type::F32), vec![Dim::Fixed(2), Dim::Fixed(3)]);
        let l = compute_layout(&fixed);
        assert_eq!(l.size, 24);
        assert_eq!(l.storage, Storage::Inline { elem_size: 4, count: 6 });

        let dynamic = Type::Tensor(Box::new(Type::F64), vec![Dim::Fixed(2), Dim::Dynamic]);
        let l = compute_layout(&dynamic);
        assert_eq!(l.size, 24);
        assert_eq!(l.align, 8);
        assert_eq!(l.storage, Storage::Descriptor { rank: 2 });
    }

    #[test]
    fn test_complex_layout() {
        let l = compute_layout(&Type::Complex(Box::new(Type::F32)));
        assert_eq!((l.size, l.align), (8, 4));
    }

    #[test]
    fn test_memo_returns_same_layout() {
        let mut table = TypeTable::new();
        let id = table.intern(&Type::Struct(vec![field("x", Type::F64), field("y", Type::I8)]));
        let cache = LayoutCache::new();
        let a = cache.layout_of(&table, id).unwrap();
        let b = cache.layout_of(&table, id).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.size, 16);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_checked_size_rejects_overflow() {
        let huge = Type::Vector(Box::new(Type::F64), usize::MAX / 4);
        assert_eq!(checked_size(&huge), None);
        assert_eq!(compute_layout(&huge).size, align_up(usize::MAX, 8));

        let wide = Type::Tensor(
            Box::new(Type::U8),
            vec![Dim::Fixed(1 << 40), Dim::Fixed(1 << 40)],
        );
        assert_eq!(checked_size(&wide), None);

        let nested = Type::Struct(vec![field("a", Type::I64), field("b", huge)]);
        assert_eq!(checked_size(&nested), None);

        let fine = Type::Struct(vec![field("a", Type::U8), field("b", Type::I32)]);
        assert_eq!(checked_size(&fine), Some(8));
    }

    #[test]
    fn test_resolver_uses_memo_for_interned_types() {
        let mut table = TypeTable::new();
        let record = record_type(&[Type::I8, Type::F64]);
        table.intern(&record);
        let cache = LayoutCache::new();
        let resolver = LayoutResolver::new(&table, &cache);
        let a = resolver.of(&record);
        let b = resolver.of(&record);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.field_offsets, vec![0, 8]);
        assert_eq!(cache.len(), 1);

        let stray = resolver.of(&Type::U16);
        assert_eq!(stray.size, 2);
        assert_eq!(cache.len(), 1);
        assert!(!Arc::ptr_eq(&LayoutResolver::detached().of(&record), &a));
    }
}
