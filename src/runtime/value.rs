use std::fmt;

use crate::compiler::ir::FunctionId;
use crate::error::{Error, Result};
use crate::numeric::ScalarKind;
use crate::tensor::{self, ElemKind, ElemValue, TensorView};
use crate::types::{elem_kind_of, Dim, StructField, Type};

/// Value payload in canonical form
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Repr {
    /// Primitive bits (sign/zero-extended to 64 bits)
    Scalar(u64),
    /// Complex component bits (re, im)
    Complex(u64, u64),
    /// Vector or tensor: runtime shape plus exclusively owned row-major buffer
    Tensor {
        /// Runtime shape
        shape: Vec<usize>,
        /// Little-endian element bytes
        data: Vec<u8>,
    },
    /// Struct fields in declaration order
    Struct(Vec<TypedValue>),
    /// Function value
    Function(FunctionId),
    /// Frame-local stack slot handle
    Ref(u32),
}

/// A runtime value paired with its static type.
///
/// Equality is bit-exact: two `f64` NaNs with the same payload are equal and
/// `0.0` differs from `-0.0`. This is the equality used to compare the two
/// execution modes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TypedValue {
    ty: Type,
    repr: Repr,
}

impl TypedValue {
    /// Pair a type and payload without validation (engine-internal)
    pub(crate) fn raw(ty: Type, repr: Repr) -> Self {
        Self { ty, repr }
    }

    /// Pair a type and payload, checking that they agree
    pub fn from_parts(ty: Type, repr: Repr) -> Result<Self> {
        let value = Self { ty, repr };
        value.check_invariants()?;
        Ok(value)
    }

    /// Static type
    pub fn ty(&self) -> &Type {
        &self.ty
    }

    /// Payload
    pub fn repr(&self) -> &Repr {
        &self.repr
    }

    /// Split into type and payload
    pub fn into_parts(self) -> (Type, Repr) {
        (self.ty, self.repr)
    }

    // ========================================================================
    // Constructors
    // ========================================================================

    /// Scalar of a kind from canonical (or raw, normalized here) bits
    pub fn scalar(kind: ScalarKind, bits: u64) -> Self {
        Self::raw(Type::from_scalar(kind), Repr::Scalar(kind.normalize(bits)))
    }

    /// `i8` value
    pub fn i8(v: i8) -> Self {
        Self::scalar(ScalarKind::I8, v as i64 as u64)
    }

    /// `i16` value
    pub fn i16(v: i16) -> Self {
        Self::scalar(ScalarKind::I16, v as i64 as u64)
    }

    /// `i32` value
    pub fn i32(v: i32) -> Self {
        Self::scalar(ScalarKind::I32, v as i64 as u64)
    }

    /// `i64` value
    pub fn i64(v: i64) -> Self {
        Self::scalar(ScalarKind::I64, v as u64)
    }

    /// `u8` value
    pub fn u8(v: u8) -> Self {
        Self::scalar(ScalarKind::U8, v as u64)
    }

    /// `u16` value
    pub fn u16(v: u16) -> Self {
        Self::scalar(ScalarKind::U16, v as u64)
    }

    /// `u32` value
    pub fn u32(v: u32) -> Self {
        Self::scalar(ScalarKind::U32, v as u64)
    }

    /// `u64` value
    pub fn u64(v: u64) -> Self {
        Self::scalar(ScalarKind::U64, v)
    }

    /// `f32` value
    pub fn f32(v: f32) -> Self {
        Self::scalar(ScalarKind::F32, v.to_bits() as u64)
    }

    /// `f64` value
    pub fn f64(v: f64) -> Self {
        Self::scalar(ScalarKind::F64, v.to_bits())
    }

    /// `bool` value
    pub fn boolean(v: bool) -> Self {
        Self::scalar(ScalarKind::Bool, v as u64)
    }

    /// The unit value
    pub fn unit() -> Self {
        Self::raw(Type::unit(), Repr::Struct(Vec::new()))
    }

    /// `complex<f64>` value
    pub fn complex64(re: f64, im: f64) -> Self {
        Self::raw(
            Type::complex(ScalarKind::F64),
            Repr::Complex(re.to_bits(), im.to_bits()),
        )
    }

    /// `complex<f32>` value
    pub fn complex32(re: f32, im: f32) -> Self {
        Self::raw(
            Type::complex(ScalarKind::F32),
            Repr::Complex(re.to_bits() as u64, im.to_bits() as u64),
        )
    }

    /// Vector or tensor value with static type `ty`, runtime `shape` and
    /// row-major little-endian `data`
    pub fn tensor(ty: Type, shape: Vec<usize>, data: Vec<u8>) -> Result<Self> {
        Self::from_parts(ty, Repr::Tensor { shape, data })
    }

    /// `vec<f64, n>` from values
    pub fn vector_f64(values: &[f64]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::raw(
            Type::Vector(Box::new(Type::F64), values.len()),
            Repr::Tensor {
                shape: vec![values.len()],
                data,
            },
        )
    }

    /// `f64` tensor with the given static dims and runtime shape
    pub fn tensor_f64(dims: Vec<Dim>, shape: Vec<usize>, values: &[f64]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::tensor(Type::Tensor(Box::new(Type::F64), dims), shape, data)
    }

    /// `i64` tensor with the given static dims and runtime shape
    pub fn tensor_i64(dims: Vec<Dim>, shape: Vec<usize>, values: &[i64]) -> Result<Self> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::tensor(Type::Tensor(Box::new(Type::I64), dims), shape, data)
    }

    /// Struct value; the type is built from the field values in order
    pub fn structure(fields: Vec<(&str, TypedValue)>) -> Self {
        let ty = Type::Struct(
            fields
                .iter()
                .map(|(name, v)| StructField {
                    name: name.to_string(),
                    ty: v.ty.clone(),
                })
                .collect(),
        );
        let values = fields.into_iter().map(|(_, v)| v).collect();
        Self::raw(ty, Repr::Struct(values))
    }

    /// Function value of the given function type
    pub fn function(id: FunctionId, ty: Type) -> Self {
        Self::raw(ty, Repr::Function(id))
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Scalar kind, for primitive values
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        self.ty.scalar_kind()
    }

    /// Canonical bits of a primitive value
    pub fn bits(&self) -> Option<u64> {
        match self.repr {
            Repr::Scalar(b) => Some(b),
            _ => None,
        }
    }

    /// Integer value as `i64` (unsigned values reinterpret their bits)
    pub fn as_i64(&self) -> Option<i64> {
        let kind = self.scalar_kind().filter(|k| k.is_int())?;
        Some(kind.decode_int(self.bits()?) as i64)
    }

    /// Integer value as `u64`
    pub fn as_u64(&self) -> Option<u64> {
        self.scalar_kind().filter(|k| k.is_int())?;
        self.bits()
    }

    /// Float value widened to `f64`
    pub fn as_f64(&self) -> Option<f64> {
        let kind = self.scalar_kind().filter(|k| k.is_float())?;
        Some(kind.decode_float(self.bits()?))
    }

    /// Bool value
    pub fn as_bool(&self) -> Option<bool> {
        self.scalar_kind().filter(|k| *k == ScalarKind::Bool)?;
        Some(self.bits()? != 0)
    }

    /// Complex value widened to `f64` components
    pub fn as_complex(&self) -> Option<(f64, f64)> {
        let elem = self.ty.complex_elem()?;
        match self.repr {
            Repr::Complex(re, im) => Some((elem.decode_float(re), elem.decode_float(im))),
            _ => None,
        }
    }

    /// Runtime shape of a vector/tensor
    pub fn shape(&self) -> Option<&[usize]> {
        match &self.repr {
            Repr::Tensor { shape, .. } => Some(shape),
            _ => None,
        }
    }

    /// Buffer of a vector/tensor
    pub fn data(&self) -> Option<&[u8]> {
        match &self.repr {
            Repr::Tensor { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Elements of a real-valued vector/tensor widened to `f64`
    pub fn to_f64_vec(&self) -> Option<Vec<f64>> {
        let ElemKind::Scalar(kind) = self.ty.elem_kind()? else {
            return None;
        };
        let data = self.data()?;
        let count = tensor::element_count(self.shape()?);
        Some(
            (0..count)
                .map(|i| match tensor::read_elem(ElemKind::Scalar(kind), data, i) {
                    ElemValue::Scalar(b) if kind.is_float() => kind.decode_float(b),
                    ElemValue::Scalar(b) => kind.decode_int(b) as f64,
                    ElemValue::Complex(..) => f64::NAN,
                })
                .collect(),
        )
    }

    /// Struct field values
    pub fn fields(&self) -> Option<&[TypedValue]> {
        match &self.repr {
            Repr::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Struct field by name
    pub fn field(&self, name: &str) -> Option<&TypedValue> {
        let Type::Struct(decl) = &self.ty else {
            return None;
        };
        let index = decl.iter().position(|f| f.name == name)?;
        self.fields()?.get(index)
    }

    /// Function id of a function value
    pub fn function_id(&self) -> Option<FunctionId> {
        match self.repr {
            Repr::Function(id) => Some(id),
            _ => None,
        }
    }

    /// Scalar or complex value as a tensor element
    pub(crate) fn to_elem(&self) -> Option<ElemValue> {
        match self.repr {
            Repr::Scalar(b) => Some(ElemValue::Scalar(b)),
            Repr::Complex(re, im) => Some(ElemValue::Complex(re, im)),
            _ => None,
        }
    }

    /// Scalar or complex value from a tensor element
    pub(crate) fn from_elem(elem: ElemKind, value: ElemValue) -> Self {
        match (elem, value) {
            (ElemKind::Scalar(k), ElemValue::Scalar(b)) => Self::scalar(k, b),
            (ElemKind::Complex(k), ElemValue::Complex(re, im)) => {
                Self::raw(Type::complex(k), Repr::Complex(k.normalize(re), k.normalize(im)))
            }
            (ElemKind::Scalar(k), ElemValue::Complex(re, _)) => Self::scalar(k, re),
            (ElemKind::Complex(k), ElemValue::Scalar(b)) => {
                Self::raw(Type::complex(k), Repr::Complex(k.normalize(b), k.zero()))
            }
        }
    }

    /// Borrowed tensor view of a vector/tensor value
    pub fn tensor_view(&self) -> Option<TensorView<'_>> {
        let elem = self.ty.elem_kind()?;
        match &self.repr {
            Repr::Tensor { shape, data } => TensorView::new(elem, shape, data),
            _ => None,
        }
    }

    // ========================================================================
    // Invariants
    // ========================================================================

    /// Check that the payload matches the type, recursively.
    ///
    /// For tensors this enforces `data.len() == product(shape) * element size`
    /// and that every fixed dimension of the static type equals the runtime
    /// extent.
    pub fn check_invariants(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::InvalidValue(msg));
        match (&self.ty, &self.repr) {
            (ty, Repr::Scalar(bits)) => match ty.scalar_kind() {
                Some(kind) if kind.normalize(*bits) == *bits => Ok(()),
                Some(kind) => bad(format!("bits 0x{:x} are not canonical for {}", bits, kind)),
                None => bad(format!("scalar payload for non-primitive {}", ty)),
            },
            (ty, Repr::Complex(re, im)) => match ty.complex_elem() {
                Some(k) if k.normalize(*re) == *re && k.normalize(*im) == *im => Ok(()),
                _ => bad(format!("complex payload does not fit {}", ty)),
            },
            (ty @ (Type::Vector(elem, _) | Type::Tensor(elem, _)), Repr::Tensor { shape, data }) => {
                let Some(kind) = elem_kind_of(elem) else {
                    return bad(format!("invalid element type in {}", ty));
                };
                let declared = ty.declared_shape().unwrap_or_default();
                if tensor::conform(&declared, shape).is_err() {
                    return bad(format!("shape {:?} does not conform to {}", shape, ty));
                }
                let expected = tensor::element_count(shape) * kind.byte_size();
                if data.len() != expected {
                    return bad(format!(
                        "buffer of {} bytes, shape {:?} needs {}",
                        data.len(),
                        shape,
                        expected
                    ));
                }
                Ok(())
            }
            (Type::Struct(decl), Repr::Struct(values)) => {
                if decl.len() != values.len() {
                    return bad(format!("{} field values for {}", values.len(), self.ty));
                }
                for (field, value) in decl.iter().zip(values) {
                    if field.ty != value.ty {
                        return bad(format!("field `{}` holds a {}", field.name, value.ty));
                    }
                    value.check_invariants()?;
                }
                Ok(())
            }
            (Type::Function(..), Repr::Function(_)) => Ok(()),
            (Type::Reference(..), Repr::Ref(_)) => Ok(()),
            (ty, _) => bad(format!("payload does not match type {}", ty)),
        }
    }
}

fn fmt_scalar(f: &mut fmt::Formatter<'_>, kind: ScalarKind, bits: u64) -> fmt::Result {
    match kind {
        ScalarKind::Bool => write!(f, "{}", bits != 0),
        k if k.is_float() => write!(f, "{:?}", k.decode_float(bits)),
        k => write!(f, "{}", k.decode_int(bits)),
    }
}

fn fmt_elem(f: &mut fmt::Formatter<'_>, elem: ElemKind, value: ElemValue) -> fmt::Result {
    match value {
        ElemValue::Scalar(b) => fmt_scalar(f, elem.component(), b),
        ElemValue::Complex(re, im) => {
            write!(f, "(")?;
            fmt_scalar(f, elem.component(), re)?;
            write!(f, ", ")?;
            fmt_scalar(f, elem.component(), im)?;
            write!(f, "i)")
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            Repr::Scalar(bits) => match self.ty.scalar_kind() {
                Some(kind) => fmt_scalar(f, kind, *bits),
                None => write!(f, "<invalid>"),
            },
            Repr::Complex(re, im) => match self.ty.complex_elem() {
                Some(k) => fmt_elem(f, ElemKind::Complex(k), ElemValue::Complex(*re, *im)),
                None => write!(f, "<invalid>"),
            },
            Repr::Tensor { shape, data } => {
                let Some(elem) = self.ty.elem_kind() else {
                    return write!(f, "<invalid>");
                };
                write!(f, "[")?;
                for i in 0..tensor::element_count(shape) {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    fmt_elem(f, elem, tensor::read_elem(elem, data, i))?;
                }
                write!(f, "]")
            }
            Repr::Struct(values) => {
                let Type::Struct(decl) = &self.ty else {
                    return write!(f, "<invalid>");
                };
                if values.is_empty() {
                    return write!(f, "()");
                }
                write!(f, "{{ ")?;
                for (i, (field, value)) in decl.iter().zip(values).enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, value)?;
                }
                write!(f, " }}")
            }
            Repr::Function(id) => write!(f, "fn#{}", id.0),
            Repr::Ref(slot) => write!(f, "&slot{}", slot),
        }
    }
}
