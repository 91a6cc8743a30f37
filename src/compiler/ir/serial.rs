//! Versioned binary encoding of an [`IrModule`]
//!
//! ```text
//! module   := "TSIR" version:u16 types constants functions
//! types    := count:u32 type*
//! constants:= count:u32 (type value)*
//! function := id:u32 name params ret:u32 reg_types slot_types blocks
//! block    := id:u32 label count:u32 instruction* terminator
//! ```
//!
//! Integers are little-endian, strings are `len:u32` plus UTF-8 bytes and
//! every enum is a one-byte tag. Decoding rebuilds the constant pool and the
//! type table, checks every id against its table and validates each
//! constant with [`TypedValue::check_invariants`].

use super::instruction::{BlockId, ComplexUnaryOp, ConstId, FunctionId, Instruction, IrReg, Terminator};
use super::program::{BasicBlock, IrFunction, IrModule};
use crate::compiler::constants::ConstantPool;
use crate::error::DecodeError;
use crate::numeric::{ArithOp, CmpOp, ScalarKind, UnaryOp};
use crate::runtime::{Repr, TypedValue};
use crate::types::{self, Mutability, PrimKind, StructField, Type, TypeId, TypeTable};

/// Leading bytes of every encoded module
pub const MAGIC: &[u8; 4] = b"TSIR";

/// Format version written by this build
pub const FORMAT_VERSION: u16 = 1;

type DecodeResult<T> = std::result::Result<T, DecodeError>;

const ARITH_OPS: [ArithOp; 10] = [
    ArithOp::Add,
    ArithOp::Sub,
    ArithOp::Mul,
    ArithOp::Div,
    ArithOp::Rem,
    ArithOp::And,
    ArithOp::Or,
    ArithOp::Xor,
    ArithOp::Shl,
    ArithOp::Shr,
];
const CMP_OPS: [CmpOp; 6] = [CmpOp::Eq, CmpOp::Ne, CmpOp::Lt, CmpOp::Le, CmpOp::Gt, CmpOp::Ge];
const UNARY_OPS: [UnaryOp; 4] = [UnaryOp::Neg, UnaryOp::Not, UnaryOp::Abs, UnaryOp::Sqrt];
const PRIM_KINDS: [PrimKind; 4] = [
    PrimKind::SignedInt,
    PrimKind::UnsignedInt,
    PrimKind::Float,
    PrimKind::Bool,
];

fn code_of<T: PartialEq>(table: &[T], value: &T) -> u8 {
    table.iter().position(|v| v == value).unwrap_or(0) as u8
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a module into the binary format
pub fn encode_module(module: &IrModule) -> Vec<u8> {
    let mut w = Writer::default();
    w.bytes(MAGIC);
    w.u16(FORMAT_VERSION);

    w.u32(module.types.len() as u32);
    for (_, ty) in module.types.iter() {
        w.ty(ty);
    }

    w.u32(module.constants.len() as u32);
    for value in module.constants.values() {
        w.ty(value.ty());
        w.repr(value.repr());
    }

    w.u32(module.functions.len() as u32);
    for func in &module.functions {
        w.function(func);
    }
    w.buf
}

#[derive(Default)]
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn str(&mut self, s: &str) {
        self.u32(s.len() as u32);
        self.bytes(s.as_bytes());
    }

    fn reg(&mut self, r: IrReg) {
        self.u32(r.0);
    }

    fn regs(&mut self, regs: &[IrReg]) {
        self.u32(regs.len() as u32);
        for r in regs {
            self.reg(*r);
        }
    }

    fn ty(&mut self, ty: &Type) {
        match ty {
            Type::Primitive { kind, width } => {
                self.u8(0);
                self.u8(code_of(&PRIM_KINDS, kind));
                self.u8(*width);
            }
            Type::Vector(elem, len) => {
                self.u8(1);
                self.ty(elem);
                self.u64(*len as u64);
            }
            Type::Tensor(elem, dims) => {
                self.u8(2);
                self.ty(elem);
                self.u32(dims.len() as u32);
                for d in dims {
                    match d {
                        types::Dim::Fixed(n) => {
                            self.u8(0);
                            self.u64(*n as u64);
                        }
                        types::Dim::Dynamic => self.u8(1),
                    }
                }
            }
            Type::Complex(elem) => {
                self.u8(3);
                self.ty(elem);
            }
            Type::Struct(fields) => {
                self.u8(4);
                self.u32(fields.len() as u32);
                for f in fields {
                    self.str(&f.name);
                    self.ty(&f.ty);
                }
            }
            Type::Function(params, ret) => {
                self.u8(5);
                self.u32(params.len() as u32);
                for p in params {
                    self.ty(p);
                }
                self.ty(ret);
            }
            Type::Reference(target, mutability) => {
                self.u8(6);
                self.ty(target);
                self.u8(matches!(mutability, Mutability::Mutable) as u8);
            }
        }
    }

    fn repr(&mut self, repr: &Repr) {
        match repr {
            Repr::Scalar(bits) => {
                self.u8(0);
                self.u64(*bits);
            }
            Repr::Complex(re, im) => {
                self.u8(1);
                self.u64(*re);
                self.u64(*im);
            }
            Repr::Tensor { shape, data } => {
                self.u8(2);
                self.u32(shape.len() as u32);
                for d in shape {
                    self.u64(*d as u64);
                }
                self.u32(data.len() as u32);
                self.bytes(data);
            }
            Repr::Struct(fields) => {
                self.u8(3);
                self.u32(fields.len() as u32);
                for f in fields {
                    self.ty(f.ty());
                    self.repr(f.repr());
                }
            }
            Repr::Function(id) => {
                self.u8(4);
                self.u32(id.0);
            }
            Repr::Ref(slot) => {
                self.u8(5);
                self.u32(*slot);
            }
        }
    }

    fn function(&mut self, func: &IrFunction) {
        self.u32(func.id.0);
        self.str(&func.name);
        self.regs(&func.params);
        self.u32(func.ret_type.0);
        self.u32(func.reg_types.len() as u32);
        for t in &func.reg_types {
            self.u32(t.0);
        }
        self.u32(func.slot_types.len() as u32);
        for t in &func.slot_types {
            self.u32(t.0);
        }
        self.u32(func.blocks.len() as u32);
        for block in &func.blocks {
            self.u32(block.id.0);
            self.str(&block.label);
            self.u32(block.instructions.len() as u32);
            for instr in &block.instructions {
                self.instruction(instr);
            }
            self.terminator(&block.terminator);
        }
    }

    fn instruction(&mut self, instr: &Instruction) {
        use Instruction::*;
        match instr {
            Const { dst, value } => {
                self.u8(0);
                self.reg(*dst);
                self.u32(value.0);
            }
            Binary {
                dst,
                op,
                kind,
                lhs,
                rhs,
                checked,
            } => {
                self.u8(1);
                self.reg(*dst);
                self.u8(code_of(&ARITH_OPS, op));
                self.u8(kind.code());
                self.reg(*lhs);
                self.reg(*rhs);
                self.u8(*checked as u8);
            }
            Compare {
                dst,
                op,
                kind,
                lhs,
                rhs,
            } => {
                self.u8(2);
                self.reg(*dst);
                self.u8(code_of(&CMP_OPS, op));
                self.u8(kind.code());
                self.reg(*lhs);
                self.reg(*rhs);
            }
            Unary {
                dst,
                op,
                kind,
                src,
                checked,
            } => {
                self.u8(3);
                self.reg(*dst);
                self.u8(code_of(&UNARY_OPS, op));
                self.u8(kind.code());
                self.reg(*src);
                self.u8(*checked as u8);
            }
            Convert { dst, from, to, src } => {
                self.u8(4);
                self.reg(*dst);
                self.u8(from.code());
                self.u8(to.code());
                self.reg(*src);
            }
            ComplexBinary {
                dst,
                op,
                elem,
                lhs,
                rhs,
            } => {
                self.u8(5);
                self.reg(*dst);
                self.u8(code_of(&ARITH_OPS, op));
                self.u8(elem.code());
                self.reg(*lhs);
                self.reg(*rhs);
            }
            ComplexCompare {
                dst,
                op,
                elem,
                lhs,
                rhs,
            } => {
                self.u8(6);
                self.reg(*dst);
                self.u8(code_of(&CMP_OPS, op));
                self.u8(elem.code());
                self.reg(*lhs);
                self.reg(*rhs);
            }
            ComplexUnary { dst, op, elem, src } => {
                self.u8(7);
                self.reg(*dst);
                self.u8(matches!(op, ComplexUnaryOp::Conj) as u8);
                self.u8(elem.code());
                self.reg(*src);
            }
            ComplexPart {
                dst,
                part,
                elem,
                src,
            } => {
                self.u8(8);
                self.reg(*dst);
                self.u8(matches!(part, super::instruction::ComplexPart::Im) as u8);
                self.u8(elem.code());
                self.reg(*src);
            }
            MakeComplex { dst, elem, re, im } => {
                self.u8(9);
                self.reg(*dst);
                self.u8(elem.code());
                self.reg(*re);
                self.reg(*im);
            }
            MakeStruct { dst, fields } => {
                self.u8(10);
                self.reg(*dst);
                self.regs(fields);
            }
            ExtractField { dst, src, index } => {
                self.u8(11);
                self.reg(*dst);
                self.reg(*src);
                self.u32(*index);
            }
            InsertField {
                dst,
                src,
                index,
                value,
            } => {
                self.u8(12);
                self.reg(*dst);
                self.reg(*src);
                self.u32(*index);
                self.reg(*value);
            }
            StackSlot { dst, slot } => {
                self.u8(13);
                self.reg(*dst);
                self.u32(*slot);
            }
            Load { dst, addr } => {
                self.u8(14);
                self.reg(*dst);
                self.reg(*addr);
            }
            Store { addr, value } => {
                self.u8(15);
                self.reg(*addr);
                self.reg(*value);
            }
            Call { dst, func, args } => {
                self.u8(16);
                self.reg(*dst);
                self.u32(func.0);
                self.regs(args);
            }
            FuncRef { dst, func } => {
                self.u8(17);
                self.reg(*dst);
                self.u32(func.0);
            }
            CallIndirect { dst, callee, args } => {
                self.u8(18);
                self.reg(*dst);
                self.reg(*callee);
                self.regs(args);
            }
            Phi { dst, incoming } => {
                self.u8(19);
                self.reg(*dst);
                self.u32(incoming.len() as u32);
                for (block, reg) in incoming {
                    self.u32(block.0);
                    self.reg(*reg);
                }
            }
            MakeTensor { dst, elements } => {
                self.u8(20);
                self.reg(*dst);
                self.regs(elements);
            }
            TensorBinary {
                dst,
                op,
                lhs,
                rhs,
                checked,
            } => {
                self.u8(21);
                self.reg(*dst);
                self.u8(code_of(&ARITH_OPS, op));
                self.reg(*lhs);
                self.reg(*rhs);
                self.u8(*checked as u8);
            }
            TensorScale {
                dst,
                tensor,
                factor,
                checked,
            } => {
                self.u8(22);
                self.reg(*dst);
                self.reg(*tensor);
                self.reg(*factor);
                self.u8(*checked as u8);
            }
            Dot { dst, lhs, rhs } => {
                self.u8(23);
                self.reg(*dst);
                self.reg(*lhs);
                self.reg(*rhs);
            }
            MatMul { dst, lhs, rhs } => {
                self.u8(24);
                self.reg(*dst);
                self.reg(*lhs);
                self.reg(*rhs);
            }
            Sum { dst, src } => {
                self.u8(25);
                self.reg(*dst);
                self.reg(*src);
            }
            ExtractElement { dst, src, indices } => {
                self.u8(26);
                self.reg(*dst);
                self.reg(*src);
                self.regs(indices);
            }
            Dim { dst, src, axis } => {
                self.u8(27);
                self.reg(*dst);
                self.reg(*src);
                self.u32(*axis);
            }
            TensorCast { dst, src } => {
                self.u8(28);
                self.reg(*dst);
                self.reg(*src);
            }
        }
    }

    fn terminator(&mut self, t: &Terminator) {
        match t {
            Terminator::Jump(b) => {
                self.u8(0);
                self.u32(b.0);
            }
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => {
                self.u8(1);
                self.reg(*cond);
                self.u32(then_block.0);
                self.u32(else_block.0);
            }
            Terminator::Return(r) => {
                self.u8(2);
                self.reg(*r);
            }
        }
    }
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a module; the inverse of [`encode_module`]
pub fn decode_module(bytes: &[u8]) -> DecodeResult<IrModule> {
    let mut r = Reader { bytes, pos: 0 };
    if r.take(MAGIC.len())? != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    let version = r.u16()?;
    if version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let count = r.count()?;
    let mut types = Vec::with_capacity(count);
    for _ in 0..count {
        types.push(r.ty()?);
    }
    let types = TypeTable::from_types(types);

    let count = r.count()?;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(r.value()?);
    }
    let constants = ConstantPool::from_values(values);

    let count = r.count()?;
    let mut functions = Vec::with_capacity(count);
    for index in 0..count {
        let func = r.function()?;
        if func.id.0 as usize != index {
            return Err(DecodeError::Malformed(format!(
                "function `{}` has id {} at index {}",
                func.name, func.id, index
            )));
        }
        functions.push(func);
    }
    if r.pos != bytes.len() {
        return Err(DecodeError::Malformed(format!(
            "{} trailing bytes",
            bytes.len() - r.pos
        )));
    }

    let module = IrModule {
        types,
        constants,
        functions,
    };
    check_ids(&module)?;
    Ok(module)
}

/// Every type, constant, block and function id must resolve
fn check_ids(module: &IrModule) -> DecodeResult<()> {
    let type_ok = |t: &TypeId| (t.0 as usize) < module.types.len();
    for func in &module.functions {
        let bad = |what: &str| {
            Err(DecodeError::Malformed(format!(
                "`{}` refers to an unknown {}",
                func.name, what
            )))
        };
        if !type_ok(&func.ret_type) || !func.reg_types.iter().all(type_ok) || !func.slot_types.iter().all(type_ok) {
            return bad("type");
        }
        for (i, block) in func.blocks.iter().enumerate() {
            if block.id.0 as usize != i {
                return bad("block order");
            }
            if block
                .terminator
                .successors()
                .iter()
                .any(|b| b.0 as usize >= func.blocks.len())
            {
                return bad("block");
            }
            for instr in &block.instructions {
                match instr {
                    Instruction::Const { value, .. } if module.constants.get(*value).is_none() => {
                        return bad("constant")
                    }
                    Instruction::Call { func: callee, .. } | Instruction::FuncRef { func: callee, .. }
                        if module.function(*callee).is_none() =>
                    {
                        return bad("function")
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> DecodeResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(DecodeError::UnexpectedEof(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> DecodeResult<u16> {
        let mut b = [0u8; 2];
        b.copy_from_slice(self.take(2)?);
        Ok(u16::from_le_bytes(b))
    }

    fn u32(&mut self) -> DecodeResult<u32> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> DecodeResult<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn bool(&mut self) -> DecodeResult<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::InvalidTag { what: "bool", tag }),
        }
    }

    /// A length prefix, bounded by the remaining input so a corrupt count
    /// cannot trigger a huge allocation
    fn count(&mut self) -> DecodeResult<usize> {
        let n = self.u32()? as usize;
        if n > self.bytes.len() - self.pos {
            return Err(DecodeError::UnexpectedEof(self.pos));
        }
        Ok(n)
    }

    fn str(&mut self) -> DecodeResult<String> {
        let n = self.count()?;
        let bytes = self.take(n)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn table<T: Copy>(&mut self, table: &[T], what: &'static str) -> DecodeResult<T> {
        let tag = self.u8()?;
        table
            .get(tag as usize)
            .copied()
            .ok_or(DecodeError::InvalidTag { what, tag })
    }

    fn kind(&mut self) -> DecodeResult<ScalarKind> {
        let tag = self.u8()?;
        ScalarKind::from_code(tag).ok_or(DecodeError::InvalidTag {
            what: "scalar kind",
            tag,
        })
    }

    fn reg(&mut self) -> DecodeResult<IrReg> {
        Ok(IrReg(self.u32()?))
    }

    fn regs(&mut self) -> DecodeResult<Vec<IrReg>> {
        let n = self.count()?;
        (0..n).map(|_| self.reg()).collect()
    }

    fn ty(&mut self) -> DecodeResult<Type> {
        let tag = self.u8()?;
        Ok(match tag {
            0 => {
                let kind = self.table(&PRIM_KINDS, "primitive kind")?;
                let width = self.u8()?;
                let ty = Type::Primitive { kind, width };
                if ty.scalar_kind().is_none() {
                    return Err(DecodeError::Malformed(format!("primitive width {}", width)));
                }
                ty
            }
            1 => {
                let elem = self.ty()?;
                Type::Vector(Box::new(elem), self.u64()? as usize)
            }
            2 => {
                let elem = self.ty()?;
                let rank = self.count()?;
                let mut dims = Vec::with_capacity(rank);
                for _ in 0..rank {
                    dims.push(match self.u8()? {
                        0 => types::Dim::Fixed(self.u64()? as usize),
                        1 => types::Dim::Dynamic,
                        tag => return Err(DecodeError::InvalidTag { what: "dim", tag }),
                    });
                }
                Type::Tensor(Box::new(elem), dims)
            }
            3 => Type::Complex(Box::new(self.ty()?)),
            4 => {
                let n = self.count()?;
                let mut fields = Vec::with_capacity(n);
                for _ in 0..n {
                    let name = self.str()?;
                    let ty = self.ty()?;
                    fields.push(StructField { name, ty });
                }
                Type::Struct(fields)
            }
            5 => {
                let n = self.count()?;
                let params = (0..n).map(|_| self.ty()).collect::<DecodeResult<Vec<_>>>()?;
                Type::Function(params, Box::new(self.ty()?))
            }
            6 => {
                let target = self.ty()?;
                let mutability = if self.bool()? {
                    Mutability::Mutable
                } else {
                    Mutability::Shared
                };
                Type::Reference(Box::new(target), mutability)
            }
            tag => return Err(DecodeError::InvalidTag { what: "type", tag }),
        })
    }

    fn value(&mut self) -> DecodeResult<TypedValue> {
        let ty = self.ty()?;
        let repr = self.repr()?;
        TypedValue::from_parts(ty, repr).map_err(|e| DecodeError::Malformed(e.to_string()))
    }

    fn repr(&mut self) -> DecodeResult<Repr> {
        let tag = self.u8()?;
        Ok(match tag {
            0 => Repr::Scalar(self.u64()?),
            1 => Repr::Complex(self.u64()?, self.u64()?),
            2 => {
                let rank = self.count()?;
                let shape = (0..rank)
                    .map(|_| self.u64().map(|d| d as usize))
                    .collect::<DecodeResult<Vec<_>>>()?;
                let n = self.count()?;
                let data = self.take(n)?.to_vec();
                Repr::Tensor { shape, data }
            }
            3 => {
                let n = self.count()?;
                Repr::Struct((0..n).map(|_| self.value()).collect::<DecodeResult<Vec<_>>>()?)
            }
            4 => Repr::Function(FunctionId(self.u32()?)),
            5 => Repr::Ref(self.u32()?),
            tag => return Err(DecodeError::InvalidTag { what: "value", tag }),
        })
    }

    fn type_ids(&mut self) -> DecodeResult<Vec<TypeId>> {
        let n = self.count()?;
        (0..n).map(|_| self.u32().map(TypeId)).collect()
    }

    fn function(&mut self) -> DecodeResult<IrFunction> {
        let id = FunctionId(self.u32()?);
        let name = self.str()?;
        let params = self.regs()?;
        let ret_type = TypeId(self.u32()?);
        let reg_types = self.type_ids()?;
        let slot_types = self.type_ids()?;
        let n = self.count()?;
        let mut blocks = Vec::with_capacity(n);
        for _ in 0..n {
            let id = BlockId(self.u32()?);
            let label = self.str()?;
            let count = self.count()?;
            let instructions = (0..count)
                .map(|_| self.instruction())
                .collect::<DecodeResult<Vec<_>>>()?;
            let terminator = self.terminator()?;
            blocks.push(BasicBlock {
                id,
                label,
                instructions,
                terminator,
            });
        }
        Ok(IrFunction {
            id,
            name,
            params,
            ret_type,
            blocks,
            reg_types,
            slot_types,
        })
    }

    fn instruction(&mut self) -> DecodeResult<Instruction> {
        use Instruction::*;
        let tag = self.u8()?;
        Ok(match tag {
            0 => Const {
                dst: self.reg()?,
                value: ConstId(self.u32()?),
            },
            1 => Binary {
                dst: self.reg()?,
                op: self.table(&ARITH_OPS, "arith op")?,
                kind: self.kind()?,
                lhs: self.reg()?,
                rhs: self.reg()?,
                checked: self.bool()?,
            },
            2 => Compare {
                dst: self.reg()?,
                op: self.table(&CMP_OPS, "compare op")?,
                kind: self.kind()?,
                lhs: self.reg()?,
                rhs: self.reg()?,
            },
            3 => Unary {
                dst: self.reg()?,
                op: self.table(&UNARY_OPS, "unary op")?,
                kind: self.kind()?,
                src: self.reg()?,
                checked: self.bool()?,
            },
            4 => Convert {
                dst: self.reg()?,
                from: self.kind()?,
                to: self.kind()?,
                src: self.reg()?,
            },
            5 => ComplexBinary {
                dst: self.reg()?,
                op: self.table(&ARITH_OPS, "arith op")?,
                elem: self.kind()?,
                lhs: self.reg()?,
                rhs: self.reg()?,
            },
            6 => ComplexCompare {
                dst: self.reg()?,
                op: self.table(&CMP_OPS, "compare op")?,
                elem: self.kind()?,
                lhs: self.reg()?,
                rhs: self.reg()?,
            },
            7 => ComplexUnary {
                dst: self.reg()?,
                op: self.table(&[ComplexUnaryOp::Neg, ComplexUnaryOp::Conj], "complex op")?,
                elem: self.kind()?,
                src: self.reg()?,
            },
            8 => ComplexPart {
                dst: self.reg()?,
                part: self.table(
                    &[super::instruction::ComplexPart::Re, super::instruction::ComplexPart::Im],
                    "complex part",
                )?,
                elem: self.kind()?,
                src: self.reg()?,
            },
            9 => MakeComplex {
                dst: self.reg()?,
                elem: self.kind()?,
                re: self.reg()?,
                im: self.reg()?,
            },
            10 => MakeStruct {
                dst: self.reg()?,
                fields: self.regs()?,
            },
            11 => ExtractField {
                dst: self.reg()?,
                src: self.reg()?,
                index: self.u32()?,
            },
            12 => InsertField {
                dst: self.reg()?,
                src: self.reg()?,
                index: self.u32()?,
                value: self.reg()?,
            },
            13 => StackSlot {
                dst: self.reg()?,
                slot: self.u32()?,
            },
            14 => Load {
                dst: self.reg()?,
                addr: self.reg()?,
            },
            15 => Store {
                addr: self.reg()?,
                value: self.reg()?,
            },
            16 => Call {
                dst: self.reg()?,
                func: FunctionId(self.u32()?),
                args: self.regs()?,
            },
            17 => FuncRef {
                dst: self.reg()?,
                func: FunctionId(self.u32()?),
            },
            18 => CallIndirect {
                dst: self.reg()?,
                callee: self.reg()?,
                args: self.regs()?,
            },
            19 => {
                let dst = self.reg()?;
                let n = self.count()?;
                let mut incoming = Vec::with_capacity(n);
                for _ in 0..n {
                    incoming.push((BlockId(self.u32()?), self.reg()?));
                }
                Phi { dst, incoming }
            }
            20 => MakeTensor {
                dst: self.reg()?,
                elements: self.regs()?,
            },
            21 => TensorBinary {
                dst: self.reg()?,
                op: self.table(&ARITH_OPS, "arith op")?,
                lhs: self.reg()?,
                rhs: self.reg()?,
                checked: self.bool()?,
            },
            22 => TensorScale {
                dst: self.reg()?,
                tensor: self.reg()?,
                factor: self.reg()?,
                checked: self.bool()?,
            },
            23 => Dot {
                dst: self.reg()?,
                lhs: self.reg()?,
                rhs: self.reg()?,
            },
            24 => MatMul {
                dst: self.reg()?,
                lhs: self.reg()?,
                rhs: self.reg()?,
            },
            25 => Sum {
                dst: self.reg()?,
                src: self.reg()?,
            },
            26 => ExtractElement {
                dst: self.reg()?,
                src: self.reg()?,
                indices: self.regs()?,
            },
            27 => Dim {
                dst: self.reg()?,
                src: self.reg()?,
                axis: self.u32()?,
            },
            28 => TensorCast {
                dst: self.reg()?,
                src: self.reg()?,
            },
            tag => return Err(DecodeError::InvalidTag { what: "instruction", tag }),
        })
    }

    fn terminator(&mut self) -> DecodeResult<Terminator> {
        let tag = self.u8()?;
        Ok(match tag {
            0 => Terminator::Jump(BlockId(self.u32()?)),
            1 => Terminator::Branch {
                cond: self.reg()?,
                then_block: BlockId(self.u32()?),
                else_block: BlockId(self.u32()?),
            },
            2 => Terminator::Return(self.reg()?),
            tag => return Err(DecodeError::InvalidTag { what: "terminator", tag }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::compiler::ir::lower_module;
    use crate::types::TypeChecker;

    fn sample() -> IrModule {
        let module = module(vec![
            func(
                "norm",
                vec![param("z", Type::complex(ScalarKind::F64))],
                Type::F64,
                vec![ret(intrinsic(
                    crate::ast::Intrinsic::Sqrt,
                    vec![add(
                        mul(
                            intrinsic(crate::ast::Intrinsic::Re, vec![var("z")]),
                            intrinsic(crate::ast::Intrinsic::Re, vec![var("z")]),
                        ),
                        mul(
                            intrinsic(crate::ast::Intrinsic::Im, vec![var("z")]),
                            intrinsic(crate::ast::Intrinsic::Im, vec![var("z")]),
                        ),
                    )],
                ))],
            ),
            func(
                "loop_sum",
                vec![param("n", Type::I32)],
                Type::I32,
                vec![
                    let_mut_typed("i", Type::I32, int(0)),
                    let_mut_typed("acc", Type::I32, int(0)),
                    while_(
                        lt(var("i"), var("n")),
                        vec![
                            assign("acc", add(var("acc"), var("i"))),
                            assign("i", add(var("i"), int(1))),
                        ],
                    ),
                    ret(var("acc")),
                ],
            ),
            func(
                "total",
                vec![],
                Type::F64,
                vec![ret(intrinsic(
                    crate::ast::Intrinsic::Sum,
                    vec![vector(vec![float(1.5), float(2.5)])],
                ))],
            ),
        ]);
        lower_module(&TypeChecker::check_module(&module).unwrap()).unwrap()
    }

    #[test]
    fn test_round_trip_is_identical() {
        let m = sample();
        let bytes = encode_module(&m);
        let decoded = decode_module(&bytes).unwrap();
        assert_eq!(decoded, m);
        assert_eq!(encode_module(&decoded), bytes);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode_module(&sample());
        bytes[0] = b'X';
        assert_eq!(decode_module(&bytes).unwrap_err(), DecodeError::BadMagic);
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = encode_module(&sample());
        bytes[4] = 9;
        assert_eq!(
            decode_module(&bytes).unwrap_err(),
            DecodeError::UnsupportedVersion(9)
        );
    }

    #[test]
    fn test_truncated_input() {
        let bytes = encode_module(&sample());
        let err = decode_module(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof(_)));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_module(&sample());
        bytes.push(0);
        assert!(matches!(decode_module(&bytes), Err(DecodeError::Malformed(_))));
    }
}
