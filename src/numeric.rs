//! # Scalar Numeric Kernel
//!
//! Every scalar arithmetic, comparison and conversion rule of the engine lives
//! here, operating on canonical 64-bit bit patterns. The interpreter and the
//! native machine both call into this module, so the two execution modes agree
//! bit-for-bit on overflow, rounding and division behavior.
//!
//! ## Canonical form
//!
//! - Signed integers are sign-extended to 64 bits
//! - Unsigned integers are zero-extended to 64 bits
//! - `f32` occupies the low 32 bits (upper bits zero), `f64` all 64 bits
//! - `bool` is `0` or `1`

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar machine kinds (primitive type + width)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScalarKind {
    /// Boolean (1 byte in memory)
    Bool = 0x01,
    /// Signed 8-bit integer
    I8 = 0x10,
    /// Signed 16-bit integer
    I16 = 0x11,
    /// Signed 32-bit integer
    I32 = 0x12,
    /// Signed 64-bit integer
    I64 = 0x13,
    /// Unsigned 8-bit integer
    U8 = 0x20,
    /// Unsigned 16-bit integer
    U16 = 0x21,
    /// Unsigned 32-bit integer
    U32 = 0x22,
    /// Unsigned 64-bit integer
    U64 = 0x23,
    /// IEEE-754 binary32
    F32 = 0x30,
    /// IEEE-754 binary64
    F64 = 0x31,
}

impl ScalarKind {
    /// All kinds, in code order
    pub const ALL: [ScalarKind; 11] = [
        ScalarKind::Bool,
        ScalarKind::I8,
        ScalarKind::I16,
        ScalarKind::I32,
        ScalarKind::I64,
        ScalarKind::U8,
        ScalarKind::U16,
        ScalarKind::U32,
        ScalarKind::U64,
        ScalarKind::F32,
        ScalarKind::F64,
    ];

    /// Stable one-byte code used by the binary IR format and native encoding
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Inverse of [`ScalarKind::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.code() == code)
    }

    /// Width in bits (bool reports 1)
    pub fn bits(self) -> u32 {
        match self {
            ScalarKind::Bool => 1,
            ScalarKind::I8 | ScalarKind::U8 => 8,
            ScalarKind::I16 | ScalarKind::U16 => 16,
            ScalarKind::I32 | ScalarKind::U32 | ScalarKind::F32 => 32,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 => 64,
        }
    }

    /// Size in bytes when stored in memory
    pub fn byte_size(self) -> usize {
        match self {
            ScalarKind::Bool => 1,
            _ => (self.bits() / 8) as usize,
        }
    }

    /// Signed integer kinds
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarKind::I8 | ScalarKind::I16 | ScalarKind::I32 | ScalarKind::I64
        )
    }

    /// Any integer kind (signed or unsigned)
    pub fn is_int(self) -> bool {
        matches!(
            self,
            ScalarKind::I8
                | ScalarKind::I16
                | ScalarKind::I32
                | ScalarKind::I64
                | ScalarKind::U8
                | ScalarKind::U16
                | ScalarKind::U32
                | ScalarKind::U64
        )
    }

    /// Floating-point kinds
    pub fn is_float(self) -> bool {
        matches!(self, ScalarKind::F32 | ScalarKind::F64)
    }

    /// Smallest representable value as i128 (integers only)
    pub fn int_min(self) -> i128 {
        if self.is_signed() {
            -(1i128 << (self.bits() - 1))
        } else {
            0
        }
    }

    /// Largest representable value as i128 (integers only)
    pub fn int_max(self) -> i128 {
        if self.is_signed() {
            (1i128 << (self.bits() - 1)) - 1
        } else if self == ScalarKind::Bool {
            1
        } else {
            (1i128 << self.bits()) - 1
        }
    }

    /// Bring an arbitrary 64-bit pattern into canonical form for this kind
    pub fn normalize(self, raw: u64) -> u64 {
        match self {
            ScalarKind::Bool => (raw != 0) as u64,
            ScalarKind::I8 => raw as i8 as i64 as u64,
            ScalarKind::I16 => raw as i16 as i64 as u64,
            ScalarKind::I32 => raw as i32 as i64 as u64,
            ScalarKind::U8 => raw as u8 as u64,
            ScalarKind::U16 => raw as u16 as u64,
            ScalarKind::U32 | ScalarKind::F32 => raw as u32 as u64,
            ScalarKind::I64 | ScalarKind::U64 | ScalarKind::F64 => raw,
        }
    }

    /// Encode an exact integer value, returning `None` when it does not fit
    pub fn encode_int(self, value: i128) -> Option<u64> {
        if !self.is_int() && self != ScalarKind::Bool {
            return None;
        }
        if value < self.int_min() || value > self.int_max() {
            return None;
        }
        Some(self.normalize(value as u64))
    }

    /// Decode a canonical integer pattern to an exact value
    pub fn decode_int(self, bits: u64) -> i128 {
        if self.is_signed() {
            bits as i64 as i128
        } else {
            bits as i128
        }
    }

    /// Encode a float value (rounding to f32 when needed)
    pub fn encode_float(self, value: f64) -> Option<u64> {
        match self {
            ScalarKind::F32 => Some((value as f32).to_bits() as u64),
            ScalarKind::F64 => Some(value.to_bits()),
            _ => None,
        }
    }

    /// Decode a canonical float pattern
    pub fn decode_float(self, bits: u64) -> f64 {
        match self {
            ScalarKind::F32 => f32::from_bits(bits as u32) as f64,
            _ => f64::from_bits(bits),
        }
    }

    /// Additive identity
    pub fn zero(self) -> u64 {
        0
    }

    /// Read a little-endian value of this kind from memory and canonicalize it
    pub fn read_le(self, bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        let n = self.byte_size().min(bytes.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        self.normalize(u64::from_le_bytes(buf))
    }

    /// Write the low `byte_size` bytes of a canonical value
    pub fn write_le(self, bits: u64, out: &mut [u8]) {
        let n = self.byte_size().min(out.len());
        out[..n].copy_from_slice(&bits.to_le_bytes()[..n]);
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarKind::Bool => "bool",
            ScalarKind::I8 => "i8",
            ScalarKind::I16 => "i16",
            ScalarKind::I32 => "i32",
            ScalarKind::I64 => "i64",
            ScalarKind::U8 => "u8",
            ScalarKind::U16 => "u16",
            ScalarKind::U32 => "u32",
            ScalarKind::U64 => "u64",
            ScalarKind::F32 => "f32",
            ScalarKind::F64 => "f64",
        };
        write!(f, "{}", name)
    }
}

/// Binary arithmetic and bitwise operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Division (truncating for integers)
    Div,
    /// Remainder (sign of dividend for integers, fmod for floats)
    Rem,
    /// Bitwise / logical and
    And,
    /// Bitwise / logical or
    Or,
    /// Bitwise / logical xor
    Xor,
    /// Shift left
    Shl,
    /// Shift right (arithmetic for signed kinds)
    Shr,
}

impl ArithOp {
    /// Operators valid on floats
    pub fn is_float_op(self) -> bool {
        matches!(
            self,
            ArithOp::Add | ArithOp::Sub | ArithOp::Mul | ArithOp::Div | ArithOp::Rem
        )
    }

    /// Operators that can fail with division by zero
    pub fn can_divide(self) -> bool {
        matches!(self, ArithOp::Div | ArithOp::Rem)
    }

    /// Source-like symbol for dumps
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Rem => "%",
            ArithOp::And => "&",
            ArithOp::Or => "|",
            ArithOp::Xor => "^",
            ArithOp::Shl => "<<",
            ArithOp::Shr => ">>",
        }
    }
}

/// Comparison operators (result is a bool)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    /// Equal
    Eq,
    /// Not equal
    Ne,
    /// Less than
    Lt,
    /// Less than or equal
    Le,
    /// Greater than
    Gt,
    /// Greater than or equal
    Ge,
}

impl CmpOp {
    /// Source-like symbol for dumps
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// Unary scalar operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Arithmetic negation
    Neg,
    /// Logical not (bool) / bitwise not (integers)
    Not,
    /// Absolute value
    Abs,
    /// Square root (floats only)
    Sqrt,
}

/// Failures raised by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithError {
    /// Checked operation left the representable range
    Overflow,
    /// Integer division or remainder by zero
    DivisionByZero,
    /// Operator is not defined for the kind (rejected by the type checker)
    Unsupported,
}

macro_rules! float_binop {
    ($ty:ty, $op:expr, $a:expr, $b:expr) => {{
        let a = <$ty>::from_bits($a as _);
        let b = <$ty>::from_bits($b as _);
        let r: $ty = match $op {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::Rem => a % b,
            _ => return Err(ArithError::Unsupported),
        };
        r.to_bits() as u64
    }};
}

/// Apply a binary operator to two canonical operands of `kind`.
///
/// Unchecked integer operations wrap in two's complement at the kind's width.
/// Checked operations fail with [`ArithError::Overflow`] instead. Integer
/// division and remainder by zero always fail, checked or not.
pub fn binary(op: ArithOp, kind: ScalarKind, a: u64, b: u64, checked: bool) -> Result<u64, ArithError> {
    if kind.is_float() {
        let bits = match kind {
            ScalarKind::F32 => float_binop!(f32, op, a as u32, b as u32),
            _ => float_binop!(f64, op, a, b),
        };
        return Ok(kind.normalize(bits));
    }

    if kind == ScalarKind::Bool {
        let r = match op {
            ArithOp::And => a & b,
            ArithOp::Or => a | b,
            ArithOp::Xor => a ^ b,
            _ => return Err(ArithError::Unsupported),
        };
        return Ok(r & 1);
    }

    let width = kind.bits();
    match op {
        ArithOp::And => return Ok(kind.normalize(a & b)),
        ArithOp::Or => return Ok(kind.normalize(a | b)),
        ArithOp::Xor => return Ok(kind.normalize(a ^ b)),
        ArithOp::Shl | ArithOp::Shr => {
            let amount = kind.decode_int(b);
            if checked && (amount < 0 || amount >= width as i128) {
                return Err(ArithError::Overflow);
            }
            let shift = (b as u32) & (width - 1);
            let r = if op == ArithOp::Shl {
                a.wrapping_shl(shift)
            } else if kind.is_signed() {
                ((a as i64) >> shift) as u64
            } else {
                a >> shift
            };
            return Ok(kind.normalize(r));
        }
        _ => {}
    }

    let x = kind.decode_int(a);
    let y = kind.decode_int(b);
    if op.can_divide() && y == 0 {
        return Err(ArithError::DivisionByZero);
    }

    // i128 holds every exact result of two 64-bit operands except u64*u64,
    // which is handled by wrapping_mul before the range check below.
    let exact: Option<i128> = match op {
        ArithOp::Add => x.checked_add(y),
        ArithOp::Sub => x.checked_sub(y),
        ArithOp::Mul => x.checked_mul(y),
        ArithOp::Div => x.checked_div(y),
        ArithOp::Rem => x.checked_rem(y),
        _ => return Err(ArithError::Unsupported),
    };

    match exact {
        Some(v) if v >= kind.int_min() && v <= kind.int_max() => Ok(kind.normalize(v as u64)),
        _ if checked => Err(ArithError::Overflow),
        Some(v) => Ok(kind.normalize(v as u64)),
        None => {
            let r = match op {
                ArithOp::Mul => a.wrapping_mul(b),
                _ => return Err(ArithError::Overflow),
            };
            Ok(kind.normalize(r))
        }
    }
}

/// Compare two canonical operands of `kind`
pub fn compare(op: CmpOp, kind: ScalarKind, a: u64, b: u64) -> bool {
    if kind.is_float() {
        let x = kind.decode_float(a);
        let y = kind.decode_float(b);
        return match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
        };
    }
    let x = kind.decode_int(a);
    let y = kind.decode_int(b);
    match op {
        CmpOp::Eq => x == y,
        CmpOp::Ne => x != y,
        CmpOp::Lt => x < y,
        CmpOp::Le => x <= y,
        CmpOp::Gt => x > y,
        CmpOp::Ge => x >= y,
    }
}

/// Apply a unary operator to a canonical operand
pub fn unary(op: UnaryOp, kind: ScalarKind, a: u64, checked: bool) -> Result<u64, ArithError> {
    match (op, kind) {
        (UnaryOp::Not, ScalarKind::Bool) => Ok(a ^ 1),
        (UnaryOp::Not, k) if k.is_int() => Ok(k.normalize(!a)),
        (UnaryOp::Neg, ScalarKind::F32) => Ok((a as u32 ^ 0x8000_0000) as u64),
        (UnaryOp::Neg, ScalarKind::F64) => Ok(a ^ 0x8000_0000_0000_0000),
        (UnaryOp::Abs, ScalarKind::F32) => Ok((a as u32 & 0x7fff_ffff) as u64),
        (UnaryOp::Abs, ScalarKind::F64) => Ok(a & 0x7fff_ffff_ffff_ffff),
        (UnaryOp::Sqrt, ScalarKind::F32) => Ok(f32::from_bits(a as u32).sqrt().to_bits() as u64),
        (UnaryOp::Sqrt, ScalarKind::F64) => Ok(f64::from_bits(a).sqrt().to_bits()),
        (UnaryOp::Neg, k) if k.is_int() => binary(ArithOp::Sub, k, 0, a, checked),
        (UnaryOp::Abs, k) if k.is_int() => {
            if k.is_signed() && (a as i64) < 0 {
                binary(ArithOp::Sub, k, 0, a, checked)
            } else {
                Ok(a)
            }
        }
        _ => Err(ArithError::Unsupported),
    }
}

/// Convert a canonical value between kinds with Rust `as` semantics:
/// integer truncation / extension, IEEE round-to-nearest for int→float and
/// float→float, saturation (NaN → 0) for float→int.
pub fn convert(from: ScalarKind, to: ScalarKind, bits: u64) -> u64 {
    if from == to {
        return bits;
    }
    if to == ScalarKind::Bool {
        return if from.is_float() {
            (from.decode_float(bits) != 0.0) as u64
        } else {
            (bits != 0) as u64
        };
    }

    if from.is_float() {
        let v = from.decode_float(bits);
        return match to {
            ScalarKind::F32 => (v as f32).to_bits() as u64,
            ScalarKind::F64 => v.to_bits(),
            ScalarKind::I8 => v as i8 as i64 as u64,
            ScalarKind::I16 => v as i16 as i64 as u64,
            ScalarKind::I32 => v as i32 as i64 as u64,
            ScalarKind::I64 => v as i64 as u64,
            ScalarKind::U8 => v as u8 as u64,
            ScalarKind::U16 => v as u16 as u64,
            ScalarKind::U32 => v as u32 as u64,
            ScalarKind::U64 => v as u64,
            ScalarKind::Bool => (v != 0.0) as u64,
        };
    }

    // integer or bool source
    match to {
        ScalarKind::F32 => {
            let v = if from.is_signed() {
                bits as i64 as f32
            } else {
                bits as f32
            };
            v.to_bits() as u64
        }
        ScalarKind::F64 => {
            let v = if from.is_signed() {
                bits as i64 as f64
            } else {
                bits as f64
            };
            v.to_bits()
        }
        _ => to.normalize(bits),
    }
}

macro_rules! complex_arith {
    ($ty:ty, $op:expr, $a:expr, $b:expr) => {{
        let (ar, ai) = (<$ty>::from_bits($a.0 as _), <$ty>::from_bits($a.1 as _));
        let (br, bi) = (<$ty>::from_bits($b.0 as _), <$ty>::from_bits($b.1 as _));
        let (re, im): ($ty, $ty) = match $op {
            ArithOp::Add => (ar + br, ai + bi),
            ArithOp::Sub => (ar - br, ai - bi),
            ArithOp::Mul => (ar * br - ai * bi, ar * bi + ai * br),
            ArithOp::Div => {
                let denom = br * br + bi * bi;
                ((ar * br + ai * bi) / denom, (ai * br - ar * bi) / denom)
            }
            _ => return Err(ArithError::Unsupported),
        };
        (re.to_bits() as u64, im.to_bits() as u64)
    }};
}

/// Complex arithmetic on (re, im) pairs of a float element kind.
///
/// Division uses the textbook formula without scaling; results follow IEEE
/// (division by zero yields infinities / NaN, never an error).
pub fn complex_binary(
    op: ArithOp,
    elem: ScalarKind,
    a: (u64, u64),
    b: (u64, u64),
) -> Result<(u64, u64), ArithError> {
    Ok(match elem {
        ScalarKind::F32 => complex_arith!(f32, op, (a.0 as u32, a.1 as u32), (b.0 as u32, b.1 as u32)),
        ScalarKind::F64 => complex_arith!(f64, op, a, b),
        _ => return Err(ArithError::Unsupported),
    })
}

/// Complex equality comparison (`Eq` / `Ne` only)
pub fn complex_compare(op: CmpOp, elem: ScalarKind, a: (u64, u64), b: (u64, u64)) -> Result<bool, ArithError> {
    let eq = compare(CmpOp::Eq, elem, a.0, b.0) && compare(CmpOp::Eq, elem, a.1, b.1);
    match op {
        CmpOp::Eq => Ok(eq),
        CmpOp::Ne => Ok(!eq),
        _ => Err(ArithError::Unsupported),
    }
}

/// Complex negation
pub fn complex_neg(elem: ScalarKind, a: (u64, u64)) -> Result<(u64, u64), ArithError> {
    Ok((
        unary(UnaryOp::Neg, elem, a.0, false)?,
        unary(UnaryOp::Neg, elem, a.1, false)?,
    ))
}

/// Complex conjugate
pub fn complex_conj(elem: ScalarKind, a: (u64, u64)) -> Result<(u64, u64), ArithError> {
    Ok((a.0, unary(UnaryOp::Neg, elem, a.1, false)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i32_add_wraps() {
        let max = ScalarKind::I32.encode_int(i32::MAX as i128).unwrap();
        let one = ScalarKind::I32.encode_int(1).unwrap();
        let r = binary(ArithOp::Add, ScalarKind::I32, max, one, false).unwrap();
        assert_eq!(r as i64, i32::MIN as i64);
    }

    #[test]
    fn test_i32_checked_add_overflows() {
        let max = ScalarKind::I32.encode_int(i32::MAX as i128).unwrap();
        let one = ScalarKind::I32.encode_int(1).unwrap();
        assert_eq!(
            binary(ArithOp::Add, ScalarKind::I32, max, one, true),
            Err(ArithError::Overflow)
        );
    }

    #[test]
    fn test_u64_mul_wraps_and_checks() {
        let r = binary(ArithOp::Mul, ScalarKind::U64, u64::MAX, 2, false).unwrap();
        assert_eq!(r, u64::MAX.wrapping_mul(2));
        assert_eq!(
            binary(ArithOp::Mul, ScalarKind::U64, u64::MAX, 2, true),
            Err(ArithError::Overflow)
        );
    }

    #[test]
    fn test_signed_min_div_minus_one() {
        let min = ScalarKind::I64.encode_int(i64::MIN as i128).unwrap();
        let neg1 = ScalarKind::I64.encode_int(-1).unwrap();
        assert_eq!(
            binary(ArithOp::Div, ScalarKind::I64, min, neg1, false).unwrap(),
            min
        );
        assert_eq!(
            binary(ArithOp::Div, ScalarKind::I64, min, neg1, true),
            Err(ArithError::Overflow)
        );
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(
            binary(ArithOp::Div, ScalarKind::I32, 5, 0, false),
            Err(ArithError::DivisionByZero)
        );
        assert_eq!(
            binary(ArithOp::Rem, ScalarKind::U8, 5, 0, true),
            Err(ArithError::DivisionByZero)
        );
        // floats follow IEEE
        let r = binary(ArithOp::Div, ScalarKind::F64, 1.0f64.to_bits(), 0.0f64.to_bits(), true).unwrap();
        assert!(f64::from_bits(r).is_infinite());
    }

    #[test]
    fn test_u8_sub_wraps() {
        let r = binary(ArithOp::Sub, ScalarKind::U8, 0, 1, false).unwrap();
        assert_eq!(r, 255);
    }

    #[test]
    fn test_signed_compare_uses_sign() {
        let neg = ScalarKind::I16.encode_int(-3).unwrap();
        assert!(compare(CmpOp::Lt, ScalarKind::I16, neg, 2));
        assert!(!compare(CmpOp::Lt, ScalarKind::U64, u64::MAX, 2));
    }

    #[test]
    fn test_nan_comparisons() {
        let nan = f64::NAN.to_bits();
        assert!(!compare(CmpOp::Eq, ScalarKind::F64, nan, nan));
        assert!(compare(CmpOp::Ne, ScalarKind::F64, nan, nan));
    }

    #[test]
    fn test_convert_matches_rust_as() {
        let v = ScalarKind::F64.encode_float(-1.5).unwrap();
        assert_eq!(convert(ScalarKind::F64, ScalarKind::U8, v), 0);
        assert_eq!(convert(ScalarKind::F64, ScalarKind::I32, v) as i64, -1);
        let big = ScalarKind::I64.encode_int(300).unwrap();
        assert_eq!(convert(ScalarKind::I64, ScalarKind::U8, big), 44);
        let neg = ScalarKind::I8.encode_int(-1).unwrap();
        assert_eq!(convert(ScalarKind::I8, ScalarKind::U16, neg), 0xffff);
        let f = convert(ScalarKind::I32, ScalarKind::F32, 7);
        assert_eq!(f32::from_bits(f as u32), 7.0);
    }

    #[test]
    fn test_checked_neg_min() {
        let min = ScalarKind::I8.encode_int(-128).unwrap();
        assert_eq!(unary(UnaryOp::Neg, ScalarKind::I8, min, false).unwrap(), min);
        assert_eq!(
            unary(UnaryOp::Neg, ScalarKind::I8, min, true),
            Err(ArithError::Overflow)
        );
    }

    #[test]
    fn test_complex_mul() {
        let one = 1.0f64.to_bits();
        let two = 2.0f64.to_bits();
        // (1 + 2i)(2 + 1i) = 0 + 5i
        let (re, im) = complex_binary(ArithOp::Mul, ScalarKind::F64, (one, two), (two, one)).unwrap();
        assert_eq!(f64::from_bits(re), 0.0);
        assert_eq!(f64::from_bits(im), 5.0);
    }

    #[test]
    fn test_kind_code_roundtrip() {
        for kind in ScalarKind::ALL {
            assert_eq!(ScalarKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(ScalarKind::from_code(0xff), None);
    }

    #[test]
    fn test_shift_masks_amount() {
        assert_eq!(binary(ArithOp::Shl, ScalarKind::U8, 1, 9, false).unwrap(), 2);
        assert_eq!(
            binary(ArithOp::Shl, ScalarKind::U8, 1, 9, true),
            Err(ArithError::Overflow)
        );
    }
}
