//! # Value ABI
//!
//! The byte form of a [`TypedValue`] follows its [`Layout`]:
//!
//! | Storage | Bytes |
//! |---------|-------|
//! | `Scalar` | low `size` bytes of the canonical pattern, little-endian |
//! | `Complex` | re then im, each one component wide |
//! | `Inline` | row-major elements, zero padded to `size` |
//! | `Descriptor` | `u64` buffer address, then one `u64` per dim; buffer out of line |
//! | `Struct` | each field at its offset, padding zeroed |
//! | `FunctionId` | function id as `u64` |
//!
//! References never cross this boundary; encoding one is an internal error.
//!
//! Layouts come from a [`LayoutResolver`], so a compiled unit's memo serves
//! every record the ABI touches.
//!
//! Out-of-line tensor buffers live in an [`AbiMemory`]. The native machine
//! implements it over its own address space; [`ScratchMemory`] is the bump
//! region underneath the machine's stack and heap, also usable on its own
//! for host-side records.

use super::{Repr, TypedValue};
use crate::compiler::ir::FunctionId;
use crate::compiler::layout::{align_up, Layout, LayoutResolver, Storage, DESCRIPTOR_DIMS_OFFSET};
use crate::error::RuntimeError;
use crate::tensor;
use crate::types::Type;

pub use crate::compiler::layout::record_type;

/// Byte-addressed memory that can hold out-of-line buffers
pub trait AbiMemory {
    /// Copy `out.len()` bytes starting at `addr`
    fn load(&self, addr: u64, out: &mut [u8]) -> Result<(), RuntimeError>;
    /// Write `bytes` starting at `addr`
    fn store(&mut self, addr: u64, bytes: &[u8]) -> Result<(), RuntimeError>;
    /// Reserve `size` bytes aligned to `align`
    fn alloc(&mut self, size: usize, align: usize) -> Result<u64, RuntimeError>;
}

/// Growable bump-allocated region starting at a fixed base address
#[derive(Debug, Clone)]
pub struct ScratchMemory {
    base: u64,
    limit: usize,
    bytes: Vec<u8>,
}

impl ScratchMemory {
    /// Region at `base` that may grow up to `limit` bytes
    pub fn new(base: u64, limit: usize) -> Self {
        Self {
            base,
            limit,
            bytes: Vec::new(),
        }
    }

    /// First address of the region
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Bytes allocated so far
    pub fn used(&self) -> usize {
        self.bytes.len()
    }

    /// True when `addr..addr+len` lies inside the allocated part
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        self.range(addr, len).is_some()
    }

    /// Drop every allocation
    pub fn reset(&mut self) {
        self.bytes.clear();
    }

    /// Drop every allocation at or above `addr` (stack-style release)
    pub fn release(&mut self, addr: u64) {
        if let Some(start) = addr.checked_sub(self.base).and_then(|o| usize::try_from(o).ok()) {
            if start < self.bytes.len() {
                self.bytes.truncate(start);
            }
        }
    }

    fn range(&self, addr: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.bytes.len()).then_some(start..end)
    }

    fn out_of_range(&self, addr: u64, len: usize) -> RuntimeError {
        RuntimeError::internal(format!(
            "access of {} bytes at 0x{:x} outside region 0x{:x}+{}",
            len,
            addr,
            self.base,
            self.bytes.len()
        ))
    }
}

impl AbiMemory for ScratchMemory {
    fn load(&self, addr: u64, out: &mut [u8]) -> Result<(), RuntimeError> {
        let range = self.range(addr, out.len()).ok_or_else(|| self.out_of_range(addr, out.len()))?;
        out.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn store(&mut self, addr: u64, bytes: &[u8]) -> Result<(), RuntimeError> {
        let range = self
            .range(addr, bytes.len())
            .ok_or_else(|| self.out_of_range(addr, bytes.len()))?;
        self.bytes[range].copy_from_slice(bytes);
        Ok(())
    }

    fn alloc(&mut self, size: usize, align: usize) -> Result<u64, RuntimeError> {
        let start = align_up(self.bytes.len(), align.max(1));
        let end = start + size;
        if end > self.limit {
            return Err(RuntimeError::internal(format!(
                "region at 0x{:x} exhausted ({} of {} bytes)",
                self.base, end, self.limit
            )));
        }
        self.bytes.resize(end, 0);
        Ok(self.base + start as u64)
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> Result<u64, RuntimeError> {
    let chunk = bytes
        .get(offset..offset + 8)
        .ok_or_else(|| RuntimeError::internal("truncated value record"))?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(chunk);
    Ok(u64::from_le_bytes(buf))
}

fn write_u64(out: &mut [u8], offset: usize, value: u64) -> Result<(), RuntimeError> {
    let chunk = out
        .get_mut(offset..offset + 8)
        .ok_or_else(|| RuntimeError::internal("value record too small"))?;
    chunk.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Encode a value into `out` (exactly `layout.size` bytes)
pub fn encode_into(
    value: &TypedValue,
    layout: &Layout,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
    out: &mut [u8],
) -> Result<(), RuntimeError> {
    if out.len() < layout.size {
        return Err(RuntimeError::internal(format!(
            "{} bytes for a {}-byte {}",
            out.len(),
            layout.size,
            value.ty()
        )));
    }
    match (&layout.storage, value.repr()) {
        (Storage::Scalar, Repr::Scalar(bits)) => {
            let kind = value
                .scalar_kind()
                .ok_or_else(|| RuntimeError::internal("scalar payload without scalar type"))?;
            kind.write_le(*bits, &mut out[..layout.size]);
        }
        (Storage::Complex, Repr::Complex(re, im)) => {
            let kind = value
                .ty()
                .complex_elem()
                .ok_or_else(|| RuntimeError::internal("complex payload without complex type"))?;
            let half = kind.byte_size();
            kind.write_le(*re, &mut out[..half]);
            kind.write_le(*im, &mut out[half..2 * half]);
        }
        (Storage::Inline { .. }, Repr::Tensor { data, .. }) => {
            out[..data.len()].copy_from_slice(data);
            out[data.len()..layout.size].fill(0);
        }
        (Storage::Descriptor { rank }, Repr::Tensor { shape, data }) => {
            if shape.len() != *rank {
                return Err(RuntimeError::internal(format!(
                    "rank {} value for a rank {} descriptor",
                    shape.len(),
                    rank
                )));
            }
            let align = value.ty().elem_kind().map_or(8, |k| k.component().byte_size());
            let addr = mem.alloc(data.len(), align)?;
            mem.store(addr, data)?;
            write_u64(out, 0, addr)?;
            for (i, extent) in shape.iter().enumerate() {
                write_u64(out, DESCRIPTOR_DIMS_OFFSET + 8 * i, *extent as u64)?;
            }
        }
        (Storage::Struct, Repr::Struct(fields)) => {
            out[..layout.size].fill(0);
            for (field, offset) in fields.iter().zip(&layout.field_offsets) {
                let fl = layouts.of(field.ty());
                encode_into(field, &fl, layouts, mem, &mut out[*offset..*offset + fl.size])?;
            }
        }
        (Storage::FunctionId, Repr::Function(id)) => write_u64(out, 0, id.0 as u64)?,
        (Storage::Address, _) | (_, Repr::Ref(_)) => {
            return Err(RuntimeError::internal("references cannot cross the value ABI"))
        }
        _ => {
            return Err(RuntimeError::internal(format!(
                "payload does not match the layout of {}",
                value.ty()
            )))
        }
    }
    Ok(())
}

/// Encode a value into a freshly allocated record
pub fn encode(
    value: &TypedValue,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
) -> Result<Vec<u8>, RuntimeError> {
    let layout = layouts.of(value.ty());
    let mut out = vec![0u8; layout.size];
    encode_into(value, &layout, layouts, mem, &mut out)?;
    Ok(out)
}

/// Read a value of type `ty` stored at `addr`
pub fn load_value(
    ty: &Type,
    addr: u64,
    layouts: LayoutResolver<'_>,
    mem: &dyn AbiMemory,
) -> Result<TypedValue, RuntimeError> {
    let layout = layouts.of(ty);
    let mut bytes = vec![0u8; layout.size];
    mem.load(addr, &mut bytes)?;
    decode_with(ty, &layout, &bytes, layouts, mem)
}

/// Write `value` at `addr`, allocating out-of-line buffers in `mem`
pub fn store_value(
    value: &TypedValue,
    addr: u64,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
) -> Result<(), RuntimeError> {
    let bytes = encode(value, layouts, mem)?;
    mem.store(addr, &bytes)
}

/// Decode a value of type `ty` from its record bytes
pub fn decode(
    ty: &Type,
    bytes: &[u8],
    layouts: LayoutResolver<'_>,
    mem: &dyn AbiMemory,
) -> Result<TypedValue, RuntimeError> {
    let layout = layouts.of(ty);
    decode_with(ty, &layout, bytes, layouts, mem)
}

/// Decode with an already resolved layout
pub fn decode_with(
    ty: &Type,
    layout: &Layout,
    bytes: &[u8],
    layouts: LayoutResolver<'_>,
    mem: &dyn AbiMemory,
) -> Result<TypedValue, RuntimeError> {
    if bytes.len() < layout.size {
        return Err(RuntimeError::internal(format!(
            "{} bytes for a {}-byte {}",
            bytes.len(),
            layout.size,
            ty
        )));
    }
    match layout.storage {
        Storage::Scalar => {
            let kind = ty
                .scalar_kind()
                .ok_or_else(|| RuntimeError::internal(format!("{} has no scalar kind", ty)))?;
            Ok(TypedValue::scalar(kind, kind.read_le(&bytes[..layout.size])))
        }
        Storage::Complex => {
            let kind = ty
                .complex_elem()
                .ok_or_else(|| RuntimeError::internal(format!("{} is not complex", ty)))?;
            let half = kind.byte_size();
            Ok(TypedValue::raw(
                ty.clone(),
                Repr::Complex(kind.read_le(&bytes[..half]), kind.read_le(&bytes[half..2 * half])),
            ))
        }
        Storage::Inline { elem_size, count } => {
            let shape = ty
                .fixed_shape()
                .ok_or_else(|| RuntimeError::internal(format!("{} has no fixed shape", ty)))?;
            let data = bytes[..elem_size * count].to_vec();
            Ok(TypedValue::raw(ty.clone(), Repr::Tensor { shape, data }))
        }
        Storage::Descriptor { rank } => {
            let addr = read_u64(bytes, 0)?;
            let shape = (0..rank)
                .map(|i| read_u64(bytes, DESCRIPTOR_DIMS_OFFSET + 8 * i).map(|d| d as usize))
                .collect::<Result<Vec<_>, _>>()?;
            let elem = ty
                .elem_kind()
                .ok_or_else(|| RuntimeError::internal(format!("{} has no element kind", ty)))?;
            let mut data = vec![0u8; tensor::element_count(&shape) * elem.byte_size()];
            mem.load(addr, &mut data)?;
            TypedValue::from_parts(ty.clone(), Repr::Tensor { shape, data })
                .map_err(|e| RuntimeError::internal(e.to_string()))
        }
        Storage::Struct => {
            let Type::Struct(decl) = ty else {
                return Err(RuntimeError::internal(format!("{} is not a struct", ty)));
            };
            let mut fields = Vec::with_capacity(decl.len());
            for (field, offset) in decl.iter().zip(&layout.field_offsets) {
                let fl = layouts.of(&field.ty);
                fields.push(decode_with(&field.ty, &fl, &bytes[*offset..*offset + fl.size], layouts, mem)?);
            }
            Ok(TypedValue::raw(ty.clone(), Repr::Struct(fields)))
        }
        Storage::FunctionId => {
            let id = read_u64(bytes, 0)?;
            let id = u32::try_from(id).map_err(|_| RuntimeError::internal("function id out of range"))?;
            Ok(TypedValue::function(FunctionId(id), ty.clone()))
        }
        Storage::Address => Err(RuntimeError::internal("references cannot cross the value ABI")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::numeric::ScalarKind;
    use crate::compiler::layout::{compute_layout, LayoutCache};
    use crate::types::{Dim, StructField, TypeTable};

    fn plain() -> LayoutResolver<'static> {
        LayoutResolver::detached()
    }

    fn mem() -> ScratchMemory {
        ScratchMemory::new(0x3_0000_0000, 1 << 16)
    }

    #[test]
    fn test_struct_record_bytes() {
        let v = TypedValue::structure(vec![
            ("tag", TypedValue::u8(7)),
            ("n", TypedValue::i32(-2)),
        ]);
        let mut m = mem();
        let bytes = encode(&v, plain(), &mut m).unwrap();
        assert_eq!(bytes, vec![7, 0, 0, 0, 0xfe, 0xff, 0xff, 0xff]);
        assert_eq!(decode(v.ty(), &bytes, plain(), &m).unwrap(), v);
    }

    #[test]
    fn test_dynamic_tensor_goes_out_of_line() {
        let v = TypedValue::tensor_f64(vec![Dim::Dynamic], vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let mut m = mem();
        let bytes = encode(&v, plain(), &mut m).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(read_u64(&bytes, 0).unwrap(), m.base());
        assert_eq!(read_u64(&bytes, 8).unwrap(), 3);
        assert_eq!(m.used(), 24);
        assert_eq!(decode(v.ty(), &bytes, plain(), &m).unwrap(), v);
    }

    #[test]
    fn test_negative_i8_sign_extends_on_decode() {
        let mut m = mem();
        let bytes = encode(&TypedValue::i8(-1), plain(), &mut m).unwrap();
        assert_eq!(bytes, vec![0xff]);
        assert_eq!(decode(&Type::I8, &bytes, plain(), &m).unwrap().as_i64(), Some(-1));
    }

    #[test]
    fn test_references_rejected() {
        let ty = Type::Reference(Box::new(Type::I64), crate::types::Mutability::Shared);
        let v = TypedValue::raw(ty, Repr::Ref(0));
        assert!(encode(&v, plain(), &mut mem()).is_err());
    }

    #[test]
    fn test_scratch_bounds() {
        let mut m = ScratchMemory::new(0x1000, 16);
        let a = m.alloc(8, 8).unwrap();
        assert!(m.store(a, &[1; 8]).is_ok());
        assert!(m.store(a + 4, &[1; 8]).is_err());
        assert!(m.alloc(16, 8).is_err());
        m.release(a);
        assert_eq!(m.used(), 0);
        let nested = Type::Struct(vec![StructField {
            name: "f".into(),
            ty: Type::F64,
        }]);
        assert_eq!(compute_layout(&nested).size, 8);
    }

    #[test]
    fn test_argument_record_round_trip() {
        let params = vec![Type::I8, Type::F64, Type::complex(ScalarKind::F32)];
        let record = record_type(&params);
        let layout = compute_layout(&record);
        assert_eq!(layout.field_offsets, vec![0, 8, 16]);
        let mut m = mem();
        let addr = m.alloc(layout.size, layout.align).unwrap();
        let args = TypedValue::raw(
            record.clone(),
            Repr::Struct(vec![TypedValue::i8(-3), TypedValue::f64(0.5), TypedValue::complex32(1.0, -1.0)]),
        );
        store_value(&args, addr, plain(), &mut m).unwrap();
        let back = load_value(&record, addr, plain(), &m).unwrap();
        assert_eq!(back, args);
        assert_eq!(back.fields().unwrap()[0].as_i64(), Some(-3));
    }

    #[test]
    fn test_record_layouts_come_from_memo() {
        let params = vec![Type::F64, Type::I32];
        let record = record_type(&params);
        let mut table = TypeTable::new();
        for ty in params.iter().chain([&record]) {
            table.intern(ty);
        }
        let cache = LayoutCache::new();
        let layouts = LayoutResolver::new(&table, &cache);
        let memoized = layouts.of(&record);

        let mut m = mem();
        let addr = m.alloc(memoized.size, memoized.align).unwrap();
        let args = TypedValue::raw(
            record.clone(),
            Repr::Struct(vec![TypedValue::f64(2.5), TypedValue::i32(-9)]),
        );
        store_value(&args, addr, layouts, &mut m).unwrap();
        assert_eq!(load_value(&record, addr, layouts, &m).unwrap(), args);

        assert_eq!(cache.len(), 3);
        assert!(Arc::ptr_eq(&layouts.of(&record), &memoized));
    }
}
