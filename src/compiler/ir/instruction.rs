//! IR instruction definitions

use crate::numeric::{ArithOp, CmpOp, ScalarKind, UnaryOp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Virtual register (SSA value; each is defined exactly once)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IrReg(pub u32);

impl IrReg {
    /// Creates a new virtual register with the given ID
    pub fn new(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for IrReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Basic block handle (index into the function's block list)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Constant pool handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConstId(pub u32);

/// Function handle (declaration order within the module)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Complex part selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComplexPart {
    /// Real part
    Re,
    /// Imaginary part
    Im,
}

/// Unary complex operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComplexUnaryOp {
    /// Negate both parts
    Neg,
    /// Negate the imaginary part
    Conj,
}

/// Typed IR instruction.
///
/// Scalar operations carry their [`ScalarKind`]; aggregate and tensor
/// operations take operand and result types from the function's register
/// type table. The verifier checks that the two agree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    // Constants
    /// Load a pooled constant
    Const {
        /// Destination
        dst: IrReg,
        /// Pool entry
        value: ConstId,
    },

    // Scalar arithmetic
    /// `dst = lhs op rhs`; wraps unless `checked`
    Binary {
        /// Destination
        dst: IrReg,
        /// Operator
        op: ArithOp,
        /// Operand and result kind
        kind: ScalarKind,
        /// Left operand
        lhs: IrReg,
        /// Right operand
        rhs: IrReg,
        /// Trap with `Overflow` instead of wrapping
        checked: bool,
    },
    /// `dst = lhs op rhs` as bool
    Compare {
        /// Destination (bool)
        dst: IrReg,
        /// Operator
        op: CmpOp,
        /// Operand kind
        kind: ScalarKind,
        /// Left operand
        lhs: IrReg,
        /// Right operand
        rhs: IrReg,
    },
    /// `dst = op src`
    Unary {
        /// Destination
        dst: IrReg,
        /// Operator
        op: UnaryOp,
        /// Operand and result kind
        kind: ScalarKind,
        /// Operand
        src: IrReg,
        /// Trap with `Overflow` instead of wrapping
        checked: bool,
    },
    /// `dst = src as to`
    Convert {
        /// Destination
        dst: IrReg,
        /// Source kind
        from: ScalarKind,
        /// Target kind
        to: ScalarKind,
        /// Operand
        src: IrReg,
    },

    // Complex numbers
    /// Complex `+ - * /`
    ComplexBinary {
        /// Destination
        dst: IrReg,
        /// Operator
        op: ArithOp,
        /// Component kind
        elem: ScalarKind,
        /// Left operand
        lhs: IrReg,
        /// Right operand
        rhs: IrReg,
    },
    /// Complex `==` / `!=`
    ComplexCompare {
        /// Destination (bool)
        dst: IrReg,
        /// Operator
        op: CmpOp,
        /// Component kind
        elem: ScalarKind,
        /// Left operand
        lhs: IrReg,
        /// Right operand
        rhs: IrReg,
    },
    /// Complex negation / conjugate
    ComplexUnary {
        /// Destination
        dst: IrReg,
        /// Operation
        op: ComplexUnaryOp,
        /// Component kind
        elem: ScalarKind,
        /// Operand
        src: IrReg,
    },
    /// Extract the real or imaginary part
    ComplexPart {
        /// Destination (component kind)
        dst: IrReg,
        /// Which part
        part: ComplexPart,
        /// Component kind
        elem: ScalarKind,
        /// Operand
        src: IrReg,
    },
    /// Build a complex value
    MakeComplex {
        /// Destination
        dst: IrReg,
        /// Component kind
        elem: ScalarKind,
        /// Real part
        re: IrReg,
        /// Imaginary part
        im: IrReg,
    },

    // Structs
    /// Build a struct from field values in declaration order
    MakeStruct {
        /// Destination (struct type from the register table)
        dst: IrReg,
        /// Field values
        fields: Vec<IrReg>,
    },
    /// Read a field
    ExtractField {
        /// Destination
        dst: IrReg,
        /// Struct operand
        src: IrReg,
        /// Field index
        index: u32,
    },
    /// Copy a struct with one field replaced
    InsertField {
        /// Destination
        dst: IrReg,
        /// Struct operand
        src: IrReg,
        /// Field index
        index: u32,
        /// New field value
        value: IrReg,
    },

    // Memory
    /// Address of the frame's stack slot `slot` (reference-typed)
    StackSlot {
        /// Destination (reference)
        dst: IrReg,
        /// Slot index within the frame
        slot: u32,
    },
    /// Read through a reference
    Load {
        /// Destination
        dst: IrReg,
        /// Reference operand
        addr: IrReg,
    },
    /// Write through a reference
    Store {
        /// Reference operand
        addr: IrReg,
        /// Value to write
        value: IrReg,
    },

    // Calls
    /// Direct call
    Call {
        /// Destination
        dst: IrReg,
        /// Callee
        func: FunctionId,
        /// Arguments
        args: Vec<IrReg>,
    },
    /// Function value
    FuncRef {
        /// Destination
        dst: IrReg,
        /// Function
        func: FunctionId,
    },
    /// Call through a function value
    CallIndirect {
        /// Destination
        dst: IrReg,
        /// Function value operand
        callee: IrReg,
        /// Arguments
        args: Vec<IrReg>,
    },

    // SSA
    /// Merge of values flowing in from predecessors
    Phi {
        /// Destination
        dst: IrReg,
        /// `(predecessor, value)` pairs
        incoming: Vec<(BlockId, IrReg)>,
    },

    // Tensors
    /// Build a fixed-shape vector/tensor from row-major elements
    MakeTensor {
        /// Destination
        dst: IrReg,
        /// Elements
        elements: Vec<IrReg>,
    },
    /// Elementwise `lhs op rhs`; runtime shapes must agree
    TensorBinary {
        /// Destination
        dst: IrReg,
        /// Operator
        op: ArithOp,
        /// Left operand
        lhs: IrReg,
        /// Right operand
        rhs: IrReg,
        /// Trap with `Overflow` instead of wrapping
        checked: bool,
    },
    /// Multiply every element by a scalar
    TensorScale {
        /// Destination
        dst: IrReg,
        /// Tensor operand
        tensor: IrReg,
        /// Scalar factor (element type)
        factor: IrReg,
        /// Trap with `Overflow` instead of wrapping
        checked: bool,
    },
    /// Inner product of rank-1 operands
    Dot {
        /// Destination (element type)
        dst: IrReg,
        /// Left operand
        lhs: IrReg,
        /// Right operand
        rhs: IrReg,
    },
    /// Matrix product of rank-2 operands
    MatMul {
        /// Destination
        dst: IrReg,
        /// Left operand
        lhs: IrReg,
        /// Right operand
        rhs: IrReg,
    },
    /// Sum of all elements
    Sum {
        /// Destination (element type)
        dst: IrReg,
        /// Operand
        src: IrReg,
    },
    /// Element read with bounds checks
    ExtractElement {
        /// Destination (element type)
        dst: IrReg,
        /// Tensor operand
        src: IrReg,
        /// `i64` index per axis
        indices: Vec<IrReg>,
    },
    /// Axis extent as `i64`
    Dim {
        /// Destination
        dst: IrReg,
        /// Tensor operand
        src: IrReg,
        /// Axis
        axis: u32,
    },
    /// Change the static shape between fixed and dynamic dims; traps with
    /// `ShapeMismatch` when a fixed target dim disagrees
    TensorCast {
        /// Destination
        dst: IrReg,
        /// Operand
        src: IrReg,
    },
}

impl Instruction {
    /// Register defined by this instruction
    pub fn dst(&self) -> Option<IrReg> {
        use Instruction::*;
        match self {
            Store { .. } => None,
            Const { dst, .. }
            | Binary { dst, .. }
            | Compare { dst, .. }
            | Unary { dst, .. }
            | Convert { dst, .. }
            | ComplexBinary { dst, .. }
            | ComplexCompare { dst, .. }
            | ComplexUnary { dst, .. }
            | Instruction::ComplexPart { dst, .. }
            | MakeComplex { dst, .. }
            | MakeStruct { dst, .. }
            | ExtractField { dst, .. }
            | InsertField { dst, .. }
            | StackSlot { dst, .. }
            | Load { dst, .. }
            | Call { dst, .. }
            | FuncRef { dst, .. }
            | CallIndirect { dst, .. }
            | Phi { dst, .. }
            | MakeTensor { dst, .. }
            | TensorBinary { dst, .. }
            | TensorScale { dst, .. }
            | Dot { dst, .. }
            | MatMul { dst, .. }
            | Sum { dst, .. }
            | ExtractElement { dst, .. }
            | Dim { dst, .. }
            | TensorCast { dst, .. } => Some(*dst),
        }
    }

    /// Registers read by this instruction (phi inputs included)
    pub fn uses(&self) -> Vec<IrReg> {
        use Instruction::*;
        match self {
            Const { .. } | StackSlot { .. } | FuncRef { .. } => vec![],
            Binary { lhs, rhs, .. }
            | Compare { lhs, rhs, .. }
            | ComplexBinary { lhs, rhs, .. }
            | ComplexCompare { lhs, rhs, .. }
            | TensorBinary { lhs, rhs, .. }
            | Dot { lhs, rhs, .. }
            | MatMul { lhs, rhs, .. } => vec![*lhs, *rhs],
            Unary { src, .. }
            | Convert { src, .. }
            | ComplexUnary { src, .. }
            | Instruction::ComplexPart { src, .. }
            | ExtractField { src, .. }
            | Sum { src, .. }
            | Dim { src, .. }
            | TensorCast { src, .. } => vec![*src],
            MakeComplex { re, im, .. } => vec![*re, *im],
            MakeStruct { fields, .. } => fields.clone(),
            InsertField { src, value, .. } => vec![*src, *value],
            Load { addr, .. } => vec![*addr],
            Store { addr, value } => vec![*addr, *value],
            Call { args, .. } => args.clone(),
            CallIndirect { callee, args, .. } => {
                let mut v = vec![*callee];
                v.extend(args);
                v
            }
            Phi { incoming, .. } => incoming.iter().map(|(_, r)| *r).collect(),
            MakeTensor { elements, .. } => elements.clone(),
            TensorScale { tensor, factor, .. } => vec![*tensor, *factor],
            ExtractElement { src, indices, .. } => {
                let mut v = vec![*src];
                v.extend(indices);
                v
            }
        }
    }

    /// Rewrite every operand register (not the destination)
    pub fn map_uses(&mut self, mut f: impl FnMut(IrReg) -> IrReg) {
        use Instruction::*;
        match self {
            Const { .. } | StackSlot { .. } | FuncRef { .. } => {}
            Binary { lhs, rhs, .. }
            | Compare { lhs, rhs, .. }
            | ComplexBinary { lhs, rhs, .. }
            | ComplexCompare { lhs, rhs, .. }
            | TensorBinary { lhs, rhs, .. }
            | Dot { lhs, rhs, .. }
            | MatMul { lhs, rhs, .. } => {
                *lhs = f(*lhs);
                *rhs = f(*rhs);
            }
            Unary { src, .. }
            | Convert { src, .. }
            | ComplexUnary { src, .. }
            | Instruction::ComplexPart { src, .. }
            | ExtractField { src, .. }
            | Sum { src, .. }
            | Dim { src, .. }
            | TensorCast { src, .. } => *src = f(*src),
            MakeComplex { re, im, .. } => {
                *re = f(*re);
                *im = f(*im);
            }
            MakeStruct { fields: regs, .. } | MakeTensor { elements: regs, .. } | Call { args: regs, .. } => {
                regs.iter_mut().for_each(|r| *r = f(*r))
            }
            InsertField { src, value, .. } => {
                *src = f(*src);
                *value = f(*value);
            }
            Load { addr, .. } => *addr = f(*addr),
            Store { addr, value } => {
                *addr = f(*addr);
                *value = f(*value);
            }
            CallIndirect { callee, args, .. } => {
                *callee = f(*callee);
                args.iter_mut().for_each(|r| *r = f(*r));
            }
            Phi { incoming, .. } => incoming.iter_mut().for_each(|(_, r)| *r = f(*r)),
            TensorScale { tensor, factor, .. } => {
                *tensor = f(*tensor);
                *factor = f(*factor);
            }
            ExtractElement { src, indices, .. } => {
                *src = f(*src);
                indices.iter_mut().for_each(|r| *r = f(*r));
            }
        }
    }

    /// True when removing an unused instance cannot change observable
    /// behavior (no side effects, cannot trap)
    pub fn is_removable(&self) -> bool {
        use Instruction::*;
        match self {
            Const { .. }
            | Compare { .. }
            | Convert { .. }
            | ComplexUnary { .. }
            | Instruction::ComplexPart { .. }
            | MakeComplex { .. }
            | MakeStruct { .. }
            | ExtractField { .. }
            | InsertField { .. }
            | FuncRef { .. }
            | Phi { .. }
            | MakeTensor { .. }
            | Dim { .. }
            | Load { .. } => true,
            Binary { op, checked, .. } => !*checked && !op.can_divide(),
            Unary { checked, .. } => !*checked,
            ComplexBinary { .. } | ComplexCompare { .. } => true,
            _ => false,
        }
    }

    /// Mnemonic used by the text dump and the binary encoder
    pub fn mnemonic(&self) -> &'static str {
        use Instruction::*;
        match self {
            Const { .. } => "const",
            Binary { .. } => "binary",
            Compare { .. } => "cmp",
            Unary { .. } => "unary",
            Convert { .. } => "convert",
            ComplexBinary { .. } => "cbinary",
            ComplexCompare { .. } => "ccmp",
            ComplexUnary { .. } => "cunary",
            Instruction::ComplexPart { .. } => "cpart",
            MakeComplex { .. } => "mkcomplex",
            MakeStruct { .. } => "mkstruct",
            ExtractField { .. } => "extract",
            InsertField { .. } => "insert",
            StackSlot { .. } => "slot",
            Load { .. } => "load",
            Store { .. } => "store",
            Call { .. } => "call",
            FuncRef { .. } => "funcref",
            CallIndirect { .. } => "callind",
            Phi { .. } => "phi",
            MakeTensor { .. } => "mktensor",
            TensorBinary { .. } => "tbinary",
            TensorScale { .. } => "tscale",
            Dot { .. } => "dot",
            MatMul { .. } => "matmul",
            Sum { .. } => "sum",
            ExtractElement { .. } => "element",
            Dim { .. } => "dim",
            TensorCast { .. } => "tcast",
        }
    }
}

/// Block terminator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Terminator {
    /// Unconditional jump
    Jump(BlockId),
    /// Two-way branch on a bool register
    Branch {
        /// Condition
        cond: IrReg,
        /// Target when true
        then_block: BlockId,
        /// Target when false
        else_block: BlockId,
    },
    /// Return a value
    Return(IrReg),
}

impl Terminator {
    /// Successor blocks in order
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(b) => vec![*b],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => vec![*then_block, *else_block],
            Terminator::Return(_) => vec![],
        }
    }

    /// Registers read by the terminator
    pub fn uses(&self) -> Vec<IrReg> {
        match self {
            Terminator::Jump(_) => vec![],
            Terminator::Branch { cond, .. } => vec![*cond],
            Terminator::Return(r) => vec![*r],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dst_and_uses() {
        let i = Instruction::Binary {
            dst: IrReg(2),
            op: ArithOp::Add,
            kind: ScalarKind::I32,
            lhs: IrReg(0),
            rhs: IrReg(1),
            checked: false,
        };
        assert_eq!(i.dst(), Some(IrReg(2)));
        assert_eq!(i.uses(), vec![IrReg(0), IrReg(1)]);
        let s = Instruction::Store {
            addr: IrReg(3),
            value: IrReg(4),
        };
        assert_eq!(s.dst(), None);
    }

    #[test]
    fn test_removability() {
        let div = Instruction::Binary {
            dst: IrReg(2),
            op: ArithOp::Div,
            kind: ScalarKind::I32,
            lhs: IrReg(0),
            rhs: IrReg(1),
            checked: false,
        };
        assert!(!div.is_removable());
        let call = Instruction::Call {
            dst: IrReg(0),
            func: FunctionId(0),
            args: vec![],
        };
        assert!(!call.is_removable());
    }

    #[test]
    fn test_map_uses_phi() {
        let mut phi = Instruction::Phi {
            dst: IrReg(9),
            incoming: vec![(BlockId(0), IrReg(1)), (BlockId(1), IrReg(2))],
        };
        phi.map_uses(|r| IrReg(r.0 + 10));
        assert_eq!(phi.uses(), vec![IrReg(11), IrReg(12)]);
        assert_eq!(phi.dst(), Some(IrReg(9)));
    }
}
