//! # Native Helpers
//!
//! Host routines reached from TVM64 code through `call <hash>`, where the
//! hash is [`helper_hash`] of the helper's symbol name. Lowered code
//! reaches a helper for every operation that is not a fixed-width scalar
//! computation: complex arithmetic and comparison, and all tensor work.
//!
//! ## Calling convention
//!
//! | Register | Meaning |
//! |----------|---------|
//! | `r1` | address of the result slot |
//! | `r2` | address of the first operand |
//! | `r3` | address of the second operand (or of the `i64` index array) |
//! | `r4` | index of the call site in the function's site table |
//!
//! Operands are decoded through the value ABI, with layouts from the
//! running unit's memo, and computed with the same
//! [`numeric`](crate::numeric) and [`tensor`](crate::tensor) kernels as the
//! interpreter, so both modes agree bit for bit.

use super::encoding::helper_hash;
use crate::compiler::layout::LayoutResolver;
use crate::error::RuntimeError;
use crate::numeric::{self, ArithOp, CmpOp};
use crate::runtime::abi::{load_value, store_value, AbiMemory};
use crate::runtime::interpreter::{conform, elem_of, parts, view};
use crate::runtime::{Repr, TypedValue};
use crate::tensor;
use crate::types::Type;
use std::collections::HashMap;

/// Complex `+ - * /`
pub const COMPLEX_BINARY: &str = "tvm_complex_binary";
/// Complex `==` / `!=`
pub const COMPLEX_COMPARE: &str = "tvm_complex_compare";
/// Elementwise tensor arithmetic
pub const TENSOR_BINARY: &str = "tvm_tensor_binary";
/// Tensor times scalar
pub const TENSOR_SCALE: &str = "tvm_tensor_scale";
/// Inner product
pub const TENSOR_DOT: &str = "tvm_tensor_dot";
/// Matrix product
pub const TENSOR_MATMUL: &str = "tvm_tensor_matmul";
/// Sum of elements
pub const TENSOR_SUM: &str = "tvm_tensor_sum";
/// Bounds-checked element read
pub const TENSOR_EXTRACT: &str = "tvm_tensor_extract";
/// Static shape change
pub const TENSOR_CAST: &str = "tvm_tensor_cast";

/// Operator carried by a call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteOp {
    /// Arithmetic operator
    Arith(ArithOp),
    /// Comparison operator
    Compare(CmpOp),
    /// The helper implies its operation
    None,
}

/// Static description of one helper call site
#[derive(Debug, Clone, PartialEq)]
pub struct HelperSite {
    /// Hash of the helper called at this site
    pub helper: u32,
    /// Operator
    pub op: SiteOp,
    /// Result type
    pub result: Type,
    /// Operand types; for element reads the tensor followed by one `i64`
    /// per index
    pub operands: Vec<Type>,
    /// Trap on overflow instead of wrapping
    pub checked: bool,
}

impl HelperSite {
    /// Site calling the helper named `name`
    pub fn new(name: &str, op: SiteOp, result: Type, operands: Vec<Type>, checked: bool) -> Self {
        Self {
            helper: helper_hash(name),
            op,
            result,
            operands,
            checked,
        }
    }

    fn operand(&self, i: usize) -> Result<&Type, RuntimeError> {
        self.operands
            .get(i)
            .ok_or_else(|| RuntimeError::internal(format!("helper site has no operand {}", i)))
    }

    fn arith(&self) -> Result<ArithOp, RuntimeError> {
        match self.op {
            SiteOp::Arith(op) => Ok(op),
            _ => Err(RuntimeError::internal("helper site has no arithmetic operator")),
        }
    }
}

/// Register values passed to a helper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperArgs {
    /// Result address (`r1`)
    pub dst: u64,
    /// First operand address (`r2`)
    pub lhs: u64,
    /// Second operand address (`r3`)
    pub rhs: u64,
}

/// Helper entry point
pub type HelperFn =
    fn(&HelperSite, LayoutResolver<'_>, &mut dyn AbiMemory, HelperArgs) -> Result<(), RuntimeError>;

lazy_static::lazy_static! {
    /// Helper registry keyed by symbol hash
    static ref HELPERS: HashMap<u32, (&'static str, HelperFn)> = {
        let entries: [(&'static str, HelperFn); 9] = [
            (COMPLEX_BINARY, complex_binary),
            (COMPLEX_COMPARE, complex_compare),
            (TENSOR_BINARY, tensor_binary),
            (TENSOR_SCALE, tensor_scale),
            (TENSOR_DOT, tensor_dot),
            (TENSOR_MATMUL, tensor_matmul),
            (TENSOR_SUM, tensor_sum),
            (TENSOR_EXTRACT, tensor_extract),
            (TENSOR_CAST, tensor_cast),
        ];
        entries
            .into_iter()
            .map(|(name, f)| (helper_hash(name), (name, f)))
            .collect()
    };
}

/// Helper registered under `hash`
pub fn lookup(hash: u32) -> Option<HelperFn> {
    HELPERS.get(&hash).map(|(_, f)| *f)
}

/// Symbol name registered under `hash`
pub fn helper_name(hash: u32) -> Option<&'static str> {
    HELPERS.get(&hash).map(|(name, _)| *name)
}

/// True when `hash` names a registered helper
pub fn is_known(hash: u32) -> bool {
    HELPERS.contains_key(&hash)
}

// =============================================================================
// HELPER BODIES
// =============================================================================

fn complex_binary(
    site: &HelperSite,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
    args: HelperArgs,
) -> Result<(), RuntimeError> {
    let a = load_value(site.operand(0)?, args.lhs, layouts, mem)?;
    let b = load_value(site.operand(1)?, args.rhs, layouts, mem)?;
    let elem = site
        .result
        .complex_elem()
        .ok_or_else(|| RuntimeError::internal(format!("{} is not complex", site.result)))?;
    let (re, im) = numeric::complex_binary(site.arith()?, elem, parts(&a)?, parts(&b)?)?;
    store_value(&TypedValue::raw(site.result.clone(), Repr::Complex(re, im)), args.dst, layouts, mem)
}

fn complex_compare(
    site: &HelperSite,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
    args: HelperArgs,
) -> Result<(), RuntimeError> {
    let ty = site.operand(0)?;
    let a = load_value(ty, args.lhs, layouts, mem)?;
    let b = load_value(site.operand(1)?, args.rhs, layouts, mem)?;
    let elem = ty
        .complex_elem()
        .ok_or_else(|| RuntimeError::internal(format!("{} is not complex", ty)))?;
    let SiteOp::Compare(op) = site.op else {
        return Err(RuntimeError::internal("complex compare site without a comparison"));
    };
    let result = numeric::complex_compare(op, elem, parts(&a)?, parts(&b)?)?;
    store_value(&TypedValue::boolean(result), args.dst, layouts, mem)
}

fn tensor_binary(
    site: &HelperSite,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
    args: HelperArgs,
) -> Result<(), RuntimeError> {
    let a = load_value(site.operand(0)?, args.lhs, layouts, mem)?;
    let b = load_value(site.operand(1)?, args.rhs, layouts, mem)?;
    let (va, vb) = (view(&a)?, view(&b)?);
    let data = tensor::elementwise(site.arith()?, &va, &vb, site.checked)?;
    let shape = va.shape.to_vec();
    store_value(&TypedValue::raw(site.result.clone(), Repr::Tensor { shape, data }), args.dst, layouts, mem)
}

fn tensor_scale(
    site: &HelperSite,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
    args: HelperArgs,
) -> Result<(), RuntimeError> {
    let t = load_value(site.operand(0)?, args.lhs, layouts, mem)?;
    let factor = elem_of(&load_value(site.operand(1)?, args.rhs, layouts, mem)?)?;
    let vt = view(&t)?;
    let data = tensor::scale(&vt, factor, site.checked)?;
    let shape = vt.shape.to_vec();
    store_value(&TypedValue::raw(site.result.clone(), Repr::Tensor { shape, data }), args.dst, layouts, mem)
}

fn tensor_dot(
    site: &HelperSite,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
    args: HelperArgs,
) -> Result<(), RuntimeError> {
    let a = load_value(site.operand(0)?, args.lhs, layouts, mem)?;
    let b = load_value(site.operand(1)?, args.rhs, layouts, mem)?;
    let va = view(&a)?;
    let result = tensor::dot(&va, &view(&b)?, false)?;
    store_value(&TypedValue::from_elem(va.elem, result), args.dst, layouts, mem)
}

fn tensor_matmul(
    site: &HelperSite,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
    args: HelperArgs,
) -> Result<(), RuntimeError> {
    let a = load_value(site.operand(0)?, args.lhs, layouts, mem)?;
    let b = load_value(site.operand(1)?, args.rhs, layouts, mem)?;
    let (shape, data) = tensor::matmul(&view(&a)?, &view(&b)?, false)?;
    conform(&site.result, &shape)?;
    store_value(&TypedValue::raw(site.result.clone(), Repr::Tensor { shape, data }), args.dst, layouts, mem)
}

fn tensor_sum(
    site: &HelperSite,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
    args: HelperArgs,
) -> Result<(), RuntimeError> {
    let t = load_value(site.operand(0)?, args.lhs, layouts, mem)?;
    let vt = view(&t)?;
    store_value(&TypedValue::from_elem(vt.elem, tensor::sum(&vt, false)?), args.dst, layouts, mem)
}

fn tensor_extract(
    site: &HelperSite,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
    args: HelperArgs,
) -> Result<(), RuntimeError> {
    let t = load_value(site.operand(0)?, args.lhs, layouts, mem)?;
    let count = site.operands.len().saturating_sub(1);
    let mut raw = vec![0u8; 8 * count];
    mem.load(args.rhs, &mut raw)?;
    let indices: Vec<i64> = raw
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect();
    let vt = view(&t)?;
    let flat = tensor::flat_index(vt.shape, &indices)?;
    store_value(&TypedValue::from_elem(vt.elem, vt.get(flat)), args.dst, layouts, mem)
}

fn tensor_cast(
    site: &HelperSite,
    layouts: LayoutResolver<'_>,
    mem: &mut dyn AbiMemory,
    args: HelperArgs,
) -> Result<(), RuntimeError> {
    let (_, repr) = load_value(site.operand(0)?, args.lhs, layouts, mem)?.into_parts();
    let Repr::Tensor { shape, data } = repr else {
        return Err(RuntimeError::internal("cast of a non-tensor"));
    };
    conform(&site.result, &shape)?;
    store_value(&TypedValue::raw(site.result.clone(), Repr::Tensor { shape, data }), args.dst, layouts, mem)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeErrorKind;
    use crate::runtime::abi::ScratchMemory;
    use crate::types::Dim;

    fn place(mem: &mut ScratchMemory, v: &TypedValue) -> u64 {
        let layout = LayoutResolver::detached().of(v.ty());
        let addr = mem.alloc(layout.size, layout.align).unwrap();
        store_value(v, addr, LayoutResolver::detached(), mem).unwrap();
        addr
    }

    #[test]
    fn test_registry_names_round_trip() {
        for name in [COMPLEX_BINARY, TENSOR_DOT, TENSOR_CAST] {
            let hash = helper_hash(name);
            assert!(is_known(hash));
            assert_eq!(helper_name(hash), Some(name));
        }
        assert!(lookup(helper_hash("tvm_missing")).is_none());
    }

    #[test]
    fn test_dot_helper() {
        let mut mem = ScratchMemory::new(0x3_0000_0000, 4096);
        let a = TypedValue::vector_f64(&[1.0, 2.0]);
        let b = TypedValue::vector_f64(&[3.0, 4.0]);
        let (pa, pb) = (place(&mut mem, &a), place(&mut mem, &b));
        let dst = mem.alloc(8, 8).unwrap();
        let site = HelperSite::new(TENSOR_DOT, SiteOp::None, Type::F64, vec![a.ty().clone(), b.ty().clone()], false);
        let f = lookup(site.helper).unwrap();
        f(&site, LayoutResolver::detached(), &mut mem, HelperArgs { dst, lhs: pa, rhs: pb }).unwrap();
        assert_eq!(load_value(&Type::F64, dst, LayoutResolver::detached(), &mem).unwrap().as_f64(), Some(11.0));
    }

    #[test]
    fn test_cast_to_fixed_shape_mismatch() {
        let mut mem = ScratchMemory::new(0x3_0000_0000, 4096);
        let v = TypedValue::tensor_f64(vec![Dim::Dynamic], vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let src = place(&mut mem, &v);
        let target = Type::Tensor(Box::new(Type::F64), vec![Dim::Fixed(2)]);
        let dst = mem.alloc(16, 8).unwrap();
        let site = HelperSite::new(TENSOR_CAST, SiteOp::None, target, vec![v.ty().clone()], false);
        let err = tensor_cast(&site, LayoutResolver::detached(), &mut mem, HelperArgs { dst, lhs: src, rhs: 0 }).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::ShapeMismatch);
    }
}
