//! # Type System
//!
//! Static types for the engine. Every value the IR manipulates has one of the
//! [`Type`] variants below; types are structural (`Eq + Hash`) and interned per
//! compilation unit in a [`TypeTable`].
//!
//! ## Shapes
//!
//! ```text
//! Vector(f64, 3)                 three f64 values, inline
//! Tensor(f32, [Fixed(2), Fixed(2)])  2x2 matrix, inline
//! Tensor(f64, [Dynamic])         rank-1 tensor, length known at run time
//! Complex(f64)                   (re, im) pair
//! Struct([])                     the unit type
//! ```
//!
//! Checking happens in [`checker`]; implicit promotion rules live in
//! [`promote`]. The checker's output is the typed tree in [`typed`].

pub mod checker;
pub mod intern;
pub mod promote;
pub mod typed;

pub use checker::{FunctionSig, TypeChecker, TypeEnv};
pub use intern::{TypeId, TypeTable};
pub use promote::promote;

use crate::ast::Span;
use crate::numeric::ScalarKind;
use crate::tensor::ElemKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primitive kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PrimKind {
    /// Two's complement signed integer
    SignedInt,
    /// Unsigned integer
    UnsignedInt,
    /// IEEE-754 float
    Float,
    /// Boolean (width 1)
    Bool,
}

/// A tensor dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    /// Known at compile time
    Fixed(usize),
    /// Known only at run time
    Dynamic,
}

/// Reference mutability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mutability {
    /// Read-only
    Shared,
    /// Read-write
    Mutable,
}

/// Named struct field
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructField {
    /// Field name
    pub name: String,
    /// Field type
    pub ty: Type,
}

/// Static type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// Scalar of a kind and bit width
    Primitive {
        /// Kind
        kind: PrimKind,
        /// Width in bits (1 for bool)
        width: u8,
    },
    /// Fixed-length vector
    Vector(Box<Type>, usize),
    /// Tensor with a possibly dynamic shape
    Tensor(Box<Type>, Vec<Dim>),
    /// Complex number over a float element
    Complex(Box<Type>),
    /// Ordered named fields
    Struct(Vec<StructField>),
    /// Function value
    Function(Vec<Type>, Box<Type>),
    /// Frame-local reference
    Reference(Box<Type>, Mutability),
}

macro_rules! prim_const {
    ($name:ident, $kind:ident, $width:expr) => {
        #[doc = concat!("`", stringify!($name), "`")]
        pub const $name: Type = Type::Primitive {
            kind: PrimKind::$kind,
            width: $width,
        };
    };
}

impl Type {
    prim_const!(I8, SignedInt, 8);
    prim_const!(I16, SignedInt, 16);
    prim_const!(I32, SignedInt, 32);
    prim_const!(I64, SignedInt, 64);
    prim_const!(U8, UnsignedInt, 8);
    prim_const!(U16, UnsignedInt, 16);
    prim_const!(U32, UnsignedInt, 32);
    prim_const!(U64, UnsignedInt, 64);
    prim_const!(F32, Float, 32);
    prim_const!(F64, Float, 64);
    prim_const!(BOOL, Bool, 1);

    /// The unit type (empty struct)
    pub fn unit() -> Type {
        Type::Struct(Vec::new())
    }

    /// True for the empty struct
    pub fn is_unit(&self) -> bool {
        matches!(self, Type::Struct(fields) if fields.is_empty())
    }

    /// Primitive type for a scalar kind
    pub fn from_scalar(kind: ScalarKind) -> Type {
        match kind {
            ScalarKind::Bool => Type::BOOL,
            ScalarKind::I8 => Type::I8,
            ScalarKind::I16 => Type::I16,
            ScalarKind::I32 => Type::I32,
            ScalarKind::I64 => Type::I64,
            ScalarKind::U8 => Type::U8,
            ScalarKind::U16 => Type::U16,
            ScalarKind::U32 => Type::U32,
            ScalarKind::U64 => Type::U64,
            ScalarKind::F32 => Type::F32,
            ScalarKind::F64 => Type::F64,
        }
    }

    /// Scalar kind of a primitive
    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            Type::Primitive { kind, width } => match (kind, width) {
                (PrimKind::Bool, 1) => Some(ScalarKind::Bool),
                (PrimKind::SignedInt, 8) => Some(ScalarKind::I8),
                (PrimKind::SignedInt, 16) => Some(ScalarKind::I16),
                (PrimKind::SignedInt, 32) => Some(ScalarKind::I32),
                (PrimKind::SignedInt, 64) => Some(ScalarKind::I64),
                (PrimKind::UnsignedInt, 8) => Some(ScalarKind::U8),
                (PrimKind::UnsignedInt, 16) => Some(ScalarKind::U16),
                (PrimKind::UnsignedInt, 32) => Some(ScalarKind::U32),
                (PrimKind::UnsignedInt, 64) => Some(ScalarKind::U64),
                (PrimKind::Float, 32) => Some(ScalarKind::F32),
                (PrimKind::Float, 64) => Some(ScalarKind::F64),
                _ => None,
            },
            _ => None,
        }
    }

    /// Complex type over a float kind
    pub fn complex(elem: ScalarKind) -> Type {
        Type::Complex(Box::new(Type::from_scalar(elem)))
    }

    /// Float kind of a complex type
    pub fn complex_elem(&self) -> Option<ScalarKind> {
        match self {
            Type::Complex(e) => e.scalar_kind().filter(|k| k.is_float()),
            _ => None,
        }
    }

    /// Integer primitive (signed or unsigned)
    pub fn is_int(&self) -> bool {
        self.scalar_kind().map_or(false, |k| k.is_int())
    }

    /// Float primitive
    pub fn is_float(&self) -> bool {
        self.scalar_kind().map_or(false, |k| k.is_float())
    }

    /// Bool primitive
    pub fn is_bool(&self) -> bool {
        self.scalar_kind() == Some(ScalarKind::Bool)
    }

    /// Integer or float primitive
    pub fn is_numeric(&self) -> bool {
        self.is_int() || self.is_float()
    }

    /// Vector or tensor
    pub fn is_container(&self) -> bool {
        matches!(self, Type::Vector(..) | Type::Tensor(..))
    }

    /// Element type of a vector or tensor
    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Vector(e, _) | Type::Tensor(e, _) => Some(e),
            _ => None,
        }
    }

    /// Storage kind of a vector/tensor element type
    pub fn elem_kind(&self) -> Option<ElemKind> {
        let elem = self.element()?;
        elem_kind_of(elem)
    }

    /// Shape of a vector or tensor (vectors are rank 1)
    pub fn dims(&self) -> Option<Vec<Dim>> {
        match self {
            Type::Vector(_, n) => Some(vec![Dim::Fixed(*n)]),
            Type::Tensor(_, dims) => Some(dims.clone()),
            _ => None,
        }
    }

    /// Shape with `None` for dynamic dimensions
    pub fn declared_shape(&self) -> Option<Vec<Option<usize>>> {
        self.dims().map(|dims| {
            dims.iter()
                .map(|d| match d {
                    Dim::Fixed(n) => Some(*n),
                    Dim::Dynamic => None,
                })
                .collect()
        })
    }

    /// Fully fixed shape, if every dimension is known
    pub fn fixed_shape(&self) -> Option<Vec<usize>> {
        self.declared_shape()?.into_iter().collect()
    }

    /// True for a tensor with at least one dynamic dimension
    pub fn has_dynamic_dims(&self) -> bool {
        matches!(self, Type::Tensor(_, dims) if dims.iter().any(|d| *d == Dim::Dynamic))
    }

    /// Check the well-formedness rules: element types, and a size that a
    /// layout can describe
    pub fn validate(&self) -> std::result::Result<(), TypeError> {
        self.validate_elements()?;
        if crate::compiler::layout::checked_size(self).is_none() {
            return Err(TypeError::new(
                TypeErrorKind::ShapeMismatch,
                format!("{} is too large to lay out", self),
            ));
        }
        Ok(())
    }

    fn validate_elements(&self) -> std::result::Result<(), TypeError> {
        match self {
            Type::Primitive { .. } => {
                if self.scalar_kind().is_none() {
                    return Err(TypeError::mismatch(format!("invalid primitive {:?}", self)));
                }
                Ok(())
            }
            Type::Vector(elem, _) | Type::Tensor(elem, _) => {
                if elem_kind_of(elem).is_none() {
                    return Err(TypeError::mismatch(format!(
                        "element type {} must be numeric or complex",
                        elem
                    )));
                }
                Ok(())
            }
            Type::Complex(elem) => {
                if !elem.is_float() {
                    return Err(TypeError::mismatch(format!(
                        "complex element type {} must be a float",
                        elem
                    )));
                }
                Ok(())
            }
            Type::Struct(fields) => fields.iter().try_for_each(|f| f.ty.validate_elements()),
            Type::Function(params, ret) => {
                params.iter().try_for_each(|p| p.validate())?;
                ret.validate()
            }
            Type::Reference(target, _) => target.validate(),
        }
    }

    /// True when the type (transitively) contains a reference
    pub fn contains_reference(&self) -> bool {
        match self {
            Type::Reference(..) => true,
            Type::Struct(fields) => fields.iter().any(|f| f.ty.contains_reference()),
            Type::Function(..) | Type::Primitive { .. } | Type::Complex(_) => false,
            Type::Vector(..) | Type::Tensor(..) => false,
        }
    }
}

/// Element storage kind for a numeric or complex element type
pub fn elem_kind_of(elem: &Type) -> Option<ElemKind> {
    if let Some(k) = elem.scalar_kind() {
        if k != ScalarKind::Bool {
            return Some(ElemKind::Scalar(k));
        }
        return None;
    }
    elem.complex_elem().map(ElemKind::Complex)
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Primitive { .. } => match self.scalar_kind() {
                Some(k) => write!(f, "{}", k),
                None => write!(f, "<invalid primitive>"),
            },
            Type::Vector(elem, n) => write!(f, "vec<{}, {}>", elem, n),
            Type::Tensor(elem, dims) => {
                write!(f, "tensor<{}, [", elem)?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match d {
                        Dim::Fixed(n) => write!(f, "{}", n)?,
                        Dim::Dynamic => write!(f, "?")?,
                    }
                }
                write!(f, "]>")
            }
            Type::Complex(elem) => write!(f, "complex<{}>", elem),
            Type::Struct(fields) if fields.is_empty() => write!(f, "()"),
            Type::Struct(fields) => {
                write!(f, "{{ ")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.ty)?;
                }
                write!(f, " }}")
            }
            Type::Function(params, ret) => {
                write!(f, "fn(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}", ret)
            }
            Type::Reference(target, Mutability::Shared) => write!(f, "&{}", target),
            Type::Reference(target, Mutability::Mutable) => write!(f, "&mut {}", target),
        }
    }
}

/// Category of a type error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeErrorKind {
    /// Operand or value type disagrees with what the context needs
    Mismatch,
    /// Name not bound in scope
    UnknownSymbol,
    /// Wrong number of call arguments
    ArityMismatch,
    /// Statically known tensor shapes disagree
    ShapeMismatch,
}

/// Type checking failure
#[derive(Debug, Clone, PartialEq)]
pub struct TypeError {
    /// Failure category
    pub kind: TypeErrorKind,
    /// Human-readable description
    pub message: String,
    /// Source location when known
    pub location: Option<Span>,
}

impl TypeError {
    /// Create a type error
    pub fn new(kind: TypeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
        }
    }

    /// `Mismatch` error
    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::new(TypeErrorKind::Mismatch, message)
    }

    /// Attach a location unless one is already set
    pub fn at(mut self, span: Span) -> Self {
        if self.location.is_none() {
            self.location = Some(span);
        }
        self
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(loc) = &self.location {
            write!(f, " at {}", loc)?;
        }
        Ok(())
    }
}

impl std::error::Error for TypeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_kind_roundtrip() {
        for kind in ScalarKind::ALL {
            assert_eq!(Type::from_scalar(kind).scalar_kind(), Some(kind));
        }
    }

    #[test]
    fn test_unit_is_empty_struct() {
        assert!(Type::unit().is_unit());
        assert_eq!(Type::unit().to_string(), "()");
    }

    #[test]
    fn test_validate_element_rules() {
        assert!(Type::Vector(Box::new(Type::F64), 3).validate().is_ok());
        assert!(Type::Vector(Box::new(Type::BOOL), 3).validate().is_err());
        assert!(Type::Complex(Box::new(Type::I32)).validate().is_err());
        assert!(Type::Tensor(Box::new(Type::complex(ScalarKind::F32)), vec![Dim::Dynamic])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_validate_rejects_unlayoutable_sizes() {
        let huge = Type::Vector(Box::new(Type::F64), usize::MAX / 4);
        assert_eq!(huge.validate().unwrap_err().kind, TypeErrorKind::ShapeMismatch);

        let square = Type::Tensor(Box::new(Type::I32), vec![Dim::Fixed(1 << 32), Dim::Fixed(1 << 32)]);
        assert_eq!(square.validate().unwrap_err().kind, TypeErrorKind::ShapeMismatch);

        let inside = Type::Reference(Box::new(huge), Mutability::Shared);
        assert!(inside.validate().is_err());
        assert!(Type::Tensor(Box::new(Type::I32), vec![Dim::Fixed(1 << 20), Dim::Dynamic])
            .validate()
            .is_ok());
    }

    #[test]
    fn test_display() {
        let t = Type::Tensor(Box::new(Type::F64), vec![Dim::Fixed(2), Dim::Dynamic]);
        assert_eq!(t.to_string(), "tensor<f64, [2, ?]>");
        let f = Type::Function(vec![Type::I32], Box::new(Type::BOOL));
        assert_eq!(f.to_string(), "fn(i32) -> bool");
    }

    #[test]
    fn test_shape_queries() {
        let t = Type::Tensor(Box::new(Type::F64), vec![Dim::Fixed(2), Dim::Dynamic]);
        assert!(t.has_dynamic_dims());
        assert_eq!(t.fixed_shape(), None);
        assert_eq!(Type::Vector(Box::new(Type::I8), 4).fixed_shape(), Some(vec![4]));
    }
}
