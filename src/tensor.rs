//! # Tensor Kernels
//!
//! Shape arithmetic and element loops for vector/tensor instructions. Buffers
//! are row-major, contiguous and little-endian; complex elements store the
//! real part first. Like [`crate::numeric`], these kernels are shared by the
//! interpreter and the native helpers.
//!
//! Every kernel validates shapes before allocating its result, so a shape
//! failure never produces a partial buffer.

use crate::numeric::{self, ArithError, ArithOp, ScalarKind};
use serde::{Deserialize, Serialize};

/// Element storage kind of a vector or tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemKind {
    /// Real scalar element
    Scalar(ScalarKind),
    /// Complex element with the given float component kind
    Complex(ScalarKind),
}

impl ElemKind {
    /// Bytes per element
    pub fn byte_size(self) -> usize {
        match self {
            ElemKind::Scalar(k) => k.byte_size(),
            ElemKind::Complex(k) => 2 * k.byte_size(),
        }
    }

    /// Component scalar kind
    pub fn component(self) -> ScalarKind {
        match self {
            ElemKind::Scalar(k) | ElemKind::Complex(k) => k,
        }
    }
}

/// A single element value in canonical form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemValue {
    /// Real element bits
    Scalar(u64),
    /// Complex element (re, im) bits
    Complex(u64, u64),
}

/// Kernel failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    /// Operand shapes disagree
    ShapeMismatch {
        /// Shape required by the operation
        expected: Vec<usize>,
        /// Shape that was supplied
        found: Vec<usize>,
    },
    /// An element index is outside the tensor
    IndexOutOfBounds {
        /// Offending index
        index: i64,
        /// Extent of the indexed axis
        extent: usize,
    },
    /// Scalar arithmetic failure inside the element loop
    Arith(ArithError),
}

impl From<ArithError> for TensorError {
    fn from(err: ArithError) -> Self {
        TensorError::Arith(err)
    }
}

/// Borrowed view over a tensor buffer
#[derive(Debug, Clone, Copy)]
pub struct TensorView<'a> {
    /// Element kind
    pub elem: ElemKind,
    /// Runtime shape
    pub shape: &'a [usize],
    /// Row-major data
    pub data: &'a [u8],
}

impl<'a> TensorView<'a> {
    /// Create a view, checking the buffer-length invariant
    pub fn new(elem: ElemKind, shape: &'a [usize], data: &'a [u8]) -> Option<Self> {
        if data.len() != element_count(shape) * elem.byte_size() {
            return None;
        }
        Some(Self { elem, shape, data })
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        element_count(self.shape)
    }

    /// True when the tensor has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read element `i` (flat row-major index)
    pub fn get(&self, i: usize) -> ElemValue {
        read_elem(self.elem, self.data, i)
    }
}

/// Product of the dimensions (1 for rank 0)
pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Read element `i` from a raw buffer
pub fn read_elem(elem: ElemKind, data: &[u8], i: usize) -> ElemValue {
    let size = elem.byte_size();
    let bytes = &data[i * size..(i + 1) * size];
    match elem {
        ElemKind::Scalar(k) => ElemValue::Scalar(k.read_le(bytes)),
        ElemKind::Complex(k) => {
            let half = k.byte_size();
            ElemValue::Complex(k.read_le(&bytes[..half]), k.read_le(&bytes[half..]))
        }
    }
}

/// Write element `i` into a raw buffer
pub fn write_elem(elem: ElemKind, data: &mut [u8], i: usize, value: ElemValue) {
    let size = elem.byte_size();
    let bytes = &mut data[i * size..(i + 1) * size];
    match (elem, value) {
        (ElemKind::Scalar(k), ElemValue::Scalar(v)) => k.write_le(v, bytes),
        (ElemKind::Complex(k), ElemValue::Complex(re, im)) => {
            let half = k.byte_size();
            k.write_le(re, &mut bytes[..half]);
            k.write_le(im, &mut bytes[half..]);
        }
        // Mixed element kinds are rejected by the type checker; write zeros.
        _ => bytes.fill(0),
    }
}

fn elem_binary(op: ArithOp, elem: ElemKind, a: ElemValue, b: ElemValue, checked: bool) -> Result<ElemValue, ArithError> {
    match (elem, a, b) {
        (ElemKind::Scalar(k), ElemValue::Scalar(x), ElemValue::Scalar(y)) => {
            Ok(ElemValue::Scalar(numeric::binary(op, k, x, y, checked)?))
        }
        (ElemKind::Complex(k), ElemValue::Complex(ar, ai), ElemValue::Complex(br, bi)) => {
            let (re, im) = numeric::complex_binary(op, k, (ar, ai), (br, bi))?;
            Ok(ElemValue::Complex(re, im))
        }
        _ => Err(ArithError::Unsupported),
    }
}

fn zero(elem: ElemKind) -> ElemValue {
    match elem {
        ElemKind::Scalar(k) => ElemValue::Scalar(k.zero()),
        ElemKind::Complex(k) => ElemValue::Complex(k.zero(), k.zero()),
    }
}

fn check_same_shape(a: &[usize], b: &[usize]) -> Result<(), TensorError> {
    if a != b {
        return Err(TensorError::ShapeMismatch {
            expected: a.to_vec(),
            found: b.to_vec(),
        });
    }
    Ok(())
}

/// Elementwise `a op b`; shapes must be identical
pub fn elementwise(op: ArithOp, a: &TensorView, b: &TensorView, checked: bool) -> Result<Vec<u8>, TensorError> {
    check_same_shape(a.shape, b.shape)?;
    let mut out = vec![0u8; a.data.len()];
    for i in 0..a.len() {
        let v = elem_binary(op, a.elem, a.get(i), b.get(i), checked)?;
        write_elem(a.elem, &mut out, i, v);
    }
    Ok(out)
}

/// Multiply every element by a scalar of the element kind
pub fn scale(t: &TensorView, factor: ElemValue, checked: bool) -> Result<Vec<u8>, TensorError> {
    let mut out = vec![0u8; t.data.len()];
    for i in 0..t.len() {
        let v = elem_binary(ArithOp::Mul, t.elem, t.get(i), factor, checked)?;
        write_elem(t.elem, &mut out, i, v);
    }
    Ok(out)
}

/// Left-to-right sum of all elements, starting from zero
pub fn sum(t: &TensorView, checked: bool) -> Result<ElemValue, TensorError> {
    let mut acc = zero(t.elem);
    for i in 0..t.len() {
        acc = elem_binary(ArithOp::Add, t.elem, acc, t.get(i), checked)?;
    }
    Ok(acc)
}

/// Inner product of two rank-1 tensors of equal length
pub fn dot(a: &TensorView, b: &TensorView, checked: bool) -> Result<ElemValue, TensorError> {
    check_same_shape(a.shape, b.shape)?;
    let mut acc = zero(a.elem);
    for i in 0..a.len() {
        let p = elem_binary(ArithOp::Mul, a.elem, a.get(i), b.get(i), checked)?;
        acc = elem_binary(ArithOp::Add, a.elem, acc, p, checked)?;
    }
    Ok(acc)
}

/// Matrix product of `[m, k] x [k, n]`, returning the `[m, n]` shape and data
pub fn matmul(a: &TensorView, b: &TensorView, checked: bool) -> Result<(Vec<usize>, Vec<u8>), TensorError> {
    if a.shape.len() != 2 || b.shape.len() != 2 || a.shape[1] != b.shape[0] {
        let expected = match (a.shape.get(1), b.shape.get(1)) {
            (Some(&k), Some(&n)) => vec![k, n],
            _ => vec![],
        };
        return Err(TensorError::ShapeMismatch {
            expected,
            found: b.shape.to_vec(),
        });
    }
    let (m, k, n) = (a.shape[0], a.shape[1], b.shape[1]);
    let mut out = vec![0u8; m * n * a.elem.byte_size()];
    for i in 0..m {
        for j in 0..n {
            let mut acc = zero(a.elem);
            for p in 0..k {
                let prod = elem_binary(ArithOp::Mul, a.elem, a.get(i * k + p), b.get(p * n + j), checked)?;
                acc = elem_binary(ArithOp::Add, a.elem, acc, prod, checked)?;
            }
            write_elem(a.elem, &mut out, i * n + j, acc);
        }
    }
    Ok((vec![m, n], out))
}

/// Flatten a multi-dimensional index with bounds checks
pub fn flat_index(shape: &[usize], indices: &[i64]) -> Result<usize, TensorError> {
    if shape.len() != indices.len() {
        return Err(TensorError::ShapeMismatch {
            expected: shape.to_vec(),
            found: vec![indices.len()],
        });
    }
    let mut flat = 0usize;
    for (&extent, &index) in shape.iter().zip(indices) {
        if index < 0 || index as usize >= extent {
            return Err(TensorError::IndexOutOfBounds { index, extent });
        }
        flat = flat * extent + index as usize;
    }
    Ok(flat)
}

/// Check a runtime shape against a declared shape (`None` = dynamic dim)
pub fn conform(declared: &[Option<usize>], actual: &[usize]) -> Result<(), TensorError> {
    let matches = declared.len() == actual.len()
        && declared
            .iter()
            .zip(actual)
            .all(|(d, a)| d.map_or(true, |d| d == *a));
    if matches {
        Ok(())
    } else {
        Err(TensorError::ShapeMismatch {
            expected: declared.iter().map(|d| d.unwrap_or(0)).collect(),
            found: actual.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f64_buf(values: &[f64]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn f64_values(buf: &[u8]) -> Vec<f64> {
        buf.chunks(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect()
    }

    const F64: ElemKind = ElemKind::Scalar(ScalarKind::F64);

    #[test]
    fn test_elementwise_add() {
        let a = f64_buf(&[1.0, 2.0, 3.0]);
        let b = f64_buf(&[10.0, 20.0, 30.0]);
        let shape = [3];
        let va = TensorView::new(F64, &shape, &a).unwrap();
        let vb = TensorView::new(F64, &shape, &b).unwrap();
        let out = elementwise(ArithOp::Add, &va, &vb, false).unwrap();
        assert_eq!(f64_values(&out), vec![11.0, 22.0, 33.0]);
    }

    #[test]
    fn test_shape_mismatch_no_buffer() {
        let a = f64_buf(&[1.0, 2.0, 3.0]);
        let b = f64_buf(&[1.0, 2.0]);
        let va = TensorView::new(F64, &[3], &a).unwrap();
        let vb = TensorView::new(F64, &[2], &b).unwrap();
        let err = elementwise(ArithOp::Add, &va, &vb, false).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_view_rejects_bad_length() {
        let a = f64_buf(&[1.0, 2.0]);
        assert!(TensorView::new(F64, &[3], &a).is_none());
    }

    #[test]
    fn test_matmul_2x2() {
        let a = f64_buf(&[1.0, 2.0, 3.0, 4.0]);
        let b = f64_buf(&[5.0, 6.0, 7.0, 8.0]);
        let va = TensorView::new(F64, &[2, 2], &a).unwrap();
        let vb = TensorView::new(F64, &[2, 2], &b).unwrap();
        let (shape, out) = matmul(&va, &vb, false).unwrap();
        assert_eq!(shape, vec![2, 2]);
        assert_eq!(f64_values(&out), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_dot_checked_overflow() {
        let elem = ElemKind::Scalar(ScalarKind::I8);
        let a = [100u8, 100];
        let b = [2u8, 1];
        let va = TensorView::new(elem, &[2], &a).unwrap();
        let vb = TensorView::new(elem, &[2], &b).unwrap();
        assert_eq!(
            dot(&va, &vb, true),
            Err(TensorError::Arith(ArithError::Overflow))
        );
        // 200 + 100 = 300 wraps twice in i8: 300 - 256 = 44
        assert_eq!(dot(&va, &vb, false).unwrap(), ElemValue::Scalar(44));
    }

    #[test]
    fn test_flat_index_bounds() {
        assert_eq!(flat_index(&[2, 3], &[1, 2]).unwrap(), 5);
        assert!(matches!(
            flat_index(&[2, 3], &[2, 0]),
            Err(TensorError::IndexOutOfBounds { index: 2, extent: 2 })
        ));
        assert!(flat_index(&[2, 3], &[-1, 0]).is_err());
    }

    #[test]
    fn test_conform_dynamic_dims() {
        assert!(conform(&[None, Some(3)], &[7, 3]).is_ok());
        assert!(conform(&[None, Some(3)], &[7, 4]).is_err());
        assert!(conform(&[None], &[7, 4]).is_err());
    }

    #[test]
    fn test_complex_sum() {
        let elem = ElemKind::Complex(ScalarKind::F64);
        let data = f64_buf(&[1.0, 1.0, 2.0, -3.0]);
        let view = TensorView::new(elem, &[2], &data).unwrap();
        let total = sum(&view, false).unwrap();
        assert_eq!(
            total,
            ElemValue::Complex(3.0f64.to_bits(), (-2.0f64).to_bits())
        );
    }
}
