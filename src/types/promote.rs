//! Implicit numeric promotion
//!
//! The rules are fixed and total over numeric primitives and complex types:
//!
//! | operands | result |
//! |---|---|
//! | int, int | the wider operand's type |
//! | int, int of equal width, different signedness | the unsigned type |
//! | int, float | float of `max(float width, int width rounded up to 32)` |
//! | float, float | wider |
//! | real, `Complex(e)` | `Complex(promote(real, e))` |
//!
//! Operands are converted to the common type with the usual wrapping
//! conversions. Implicit conversion at assignments and call arguments
//! ([`widens_to`]) is stricter: a signed integer never widens to an
//! unsigned one.

use super::{PrimKind, Type, TypeError};

fn round_up_32(width: u8) -> u8 {
    if width <= 32 {
        32
    } else {
        64
    }
}

fn float(width: u8) -> Type {
    Type::Primitive {
        kind: PrimKind::Float,
        width,
    }
}

fn promote_primitive(a: &Type, b: &Type) -> Result<Type, TypeError> {
    let (Type::Primitive { kind: ka, width: wa }, Type::Primitive { kind: kb, width: wb }) = (a, b) else {
        return Err(mismatch(a, b));
    };
    use PrimKind::*;
    match (ka, kb) {
        (Bool, Bool) => Ok(Type::BOOL),
        (Bool, _) | (_, Bool) => Err(mismatch(a, b)),
        (Float, Float) => Ok(float((*wa).max(*wb))),
        (Float, _) => Ok(float((*wa).max(round_up_32(*wb)))),
        (_, Float) => Ok(float((*wb).max(round_up_32(*wa)))),
        _ if wa > wb => Ok(a.clone()),
        _ if wb > wa => Ok(b.clone()),
        (UnsignedInt, _) => Ok(a.clone()),
        _ => Ok(b.clone()),
    }
}

fn mismatch(a: &Type, b: &Type) -> TypeError {
    TypeError::mismatch(format!("no implicit promotion between {} and {}", a, b))
}

/// Common type of two numeric operands
pub fn promote(a: &Type, b: &Type) -> Result<Type, TypeError> {
    if a == b {
        return match a {
            Type::Primitive { .. } | Type::Complex(_) => Ok(a.clone()),
            _ => Err(mismatch(a, b)),
        };
    }
    match (a, b) {
        (Type::Complex(ea), Type::Complex(eb)) => Ok(Type::Complex(Box::new(promote_primitive(ea, eb)?))),
        (Type::Complex(e), real) | (real, Type::Complex(e)) => {
            if !real.is_numeric() {
                return Err(mismatch(a, b));
            }
            let elem = promote_primitive(real, e)?;
            Ok(Type::Complex(Box::new(elem)))
        }
        _ => promote_primitive(a, b),
    }
}

/// True when `from` converts to `to` implicitly: promotion yields `to` and
/// no signed integer turns unsigned
pub fn widens_to(from: &Type, to: &Type) -> bool {
    let signed_to_unsigned = matches!(
        (from, to),
        (
            Type::Primitive {
                kind: PrimKind::SignedInt,
                ..
            },
            Type::Primitive {
                kind: PrimKind::UnsignedInt,
                ..
            }
        )
    );
    from == to || (!signed_to_unsigned && promote(from, to).map_or(false, |t| &t == to))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_int() {
        assert_eq!(promote(&Type::I8, &Type::I32).unwrap(), Type::I32);
        assert_eq!(promote(&Type::U16, &Type::U64).unwrap(), Type::U64);
        assert_eq!(promote(&Type::U8, &Type::I16).unwrap(), Type::I16);
    }

    #[test]
    fn test_mixed_signedness_promotes() {
        assert_eq!(promote(&Type::I8, &Type::U64).unwrap(), Type::U64);
        assert_eq!(promote(&Type::U64, &Type::I8).unwrap(), Type::U64);
        assert_eq!(promote(&Type::I32, &Type::U32).unwrap(), Type::U32);
        assert_eq!(promote(&Type::U16, &Type::I16).unwrap(), Type::U16);
        assert_eq!(promote(&Type::I64, &Type::U8).unwrap(), Type::I64);
    }

    #[test]
    fn test_int_promotion_is_total() {
        let ints = [
            Type::I8, Type::I16, Type::I32, Type::I64,
            Type::U8, Type::U16, Type::U32, Type::U64,
        ];
        for a in &ints {
            for b in &ints {
                let common = promote(a, b).unwrap();
                assert_eq!(promote(b, a).unwrap(), common);
                let width = |t: &Type| t.scalar_kind().map(|k| k.byte_size());
                assert_eq!(width(&common), width(a).max(width(b)));
            }
        }
    }

    #[test]
    fn test_int_float() {
        assert_eq!(promote(&Type::I64, &Type::F32).unwrap(), Type::F64);
        assert_eq!(promote(&Type::I16, &Type::F32).unwrap(), Type::F32);
        assert_eq!(promote(&Type::F32, &Type::U32).unwrap(), Type::F32);
    }

    #[test]
    fn test_complex() {
        let c32 = Type::Complex(Box::new(Type::F32));
        let c64 = Type::Complex(Box::new(Type::F64));
        assert_eq!(promote(&Type::I64, &c32).unwrap(), c64);
        assert_eq!(promote(&c32, &Type::F32).unwrap(), c32);
        assert_eq!(promote(&c32, &c64).unwrap(), c64);
    }

    #[test]
    fn test_bool_rejected() {
        assert!(promote(&Type::BOOL, &Type::I32).is_err());
        assert_eq!(promote(&Type::BOOL, &Type::BOOL).unwrap(), Type::BOOL);
    }

    #[test]
    fn test_widens_to() {
        assert!(widens_to(&Type::I8, &Type::I64));
        assert!(!widens_to(&Type::I64, &Type::I8));
        assert!(widens_to(&Type::F32, &Type::F64));
        assert!(widens_to(&Type::U8, &Type::I16));
        assert!(!widens_to(&Type::I32, &Type::U32));
        assert!(!widens_to(&Type::I8, &Type::U64));
    }
}
