//! Typed tree produced by the checker
//!
//! Every node carries its resolved [`Type`]. Implicit promotions appear as
//! explicit [`TExprKind::Convert`] nodes, literals are already typed
//! constants, and every binding is a unique [`LocalId`] (shadowing and block
//! scoping are resolved). Lowering never has to re-derive a type.

use super::Type;
use crate::ast::Span;
pub use crate::compiler::ir::ComplexPart;
use crate::compiler::ir::FunctionId;
use crate::numeric::{ArithOp, CmpOp};
use crate::runtime::TypedValue;

/// Unique binding within one function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

/// Binding metadata
#[derive(Debug, Clone, PartialEq)]
pub struct LocalInfo {
    /// Source name
    pub name: String,
    /// Declared or inferred type
    pub ty: Type,
    /// May be reassigned
    pub mutable: bool,
    /// A reference to it is taken somewhere; it lives in a stack slot
    pub address_taken: bool,
}

/// Checked function
#[derive(Debug, Clone, PartialEq)]
pub struct TFunction {
    /// Function id (declaration order)
    pub id: FunctionId,
    /// Function name
    pub name: String,
    /// Parameter bindings in order
    pub params: Vec<LocalId>,
    /// Return type
    pub ret: Type,
    /// All bindings; parameters first
    pub locals: Vec<LocalInfo>,
    /// Body
    pub body: Vec<TStmt>,
    /// Declaration site
    pub span: Span,
}

impl TFunction {
    /// Binding metadata
    pub fn local(&self, id: LocalId) -> &LocalInfo {
        &self.locals[id.0 as usize]
    }
}

/// Typed statement
#[derive(Debug, Clone, PartialEq)]
pub struct TStmt {
    /// Statement kind
    pub kind: TStmtKind,
    /// Source location
    pub span: Span,
}

/// Typed statements
#[derive(Debug, Clone, PartialEq)]
pub enum TStmtKind {
    /// Introduce a binding
    Let {
        /// Binding
        local: LocalId,
        /// Initializer (already of the binding's type)
        value: TExpr,
    },
    /// Reassign a binding
    Assign {
        /// Binding
        local: LocalId,
        /// New value
        value: TExpr,
    },
    /// Replace one field of a struct binding
    AssignField {
        /// Struct binding
        local: LocalId,
        /// Field index
        index: u32,
        /// New field value
        value: TExpr,
    },
    /// Write through a mutable reference
    Store {
        /// Reference
        target: TExpr,
        /// Value
        value: TExpr,
    },
    /// Conditional
    If {
        /// Condition
        cond: TExpr,
        /// Then branch
        then_body: Vec<TStmt>,
        /// Else branch
        else_body: Vec<TStmt>,
    },
    /// Loop
    While {
        /// Condition
        cond: TExpr,
        /// Body
        body: Vec<TStmt>,
    },
    /// Leave the innermost loop
    Break,
    /// Restart the innermost loop
    Continue,
    /// Return (value already of the return type)
    Return(TExpr),
    /// Evaluate for effects
    Expr(TExpr),
}

/// Typed expression
#[derive(Debug, Clone, PartialEq)]
pub struct TExpr {
    /// Resolved type
    pub ty: Type,
    /// Node
    pub kind: TExprKind,
    /// Source location
    pub span: Span,
}

/// Typed expressions
#[derive(Debug, Clone, PartialEq)]
pub enum TExprKind {
    /// Typed constant
    Const(TypedValue),
    /// Read a binding
    Local(LocalId),
    /// Function value
    FuncRef(FunctionId),
    /// Arithmetic on scalars, complex values or elementwise on tensors
    Arith {
        /// Operator
        op: ArithOp,
        /// Left (already of the result type)
        lhs: Box<TExpr>,
        /// Right (already of the result type)
        rhs: Box<TExpr>,
        /// Trap on overflow
        checked: bool,
    },
    /// Tensor times element-typed scalar
    Scale {
        /// Tensor operand
        tensor: Box<TExpr>,
        /// Scalar factor
        factor: Box<TExpr>,
        /// Trap on overflow
        checked: bool,
    },
    /// Comparison; operands share one type
    Compare {
        /// Operator
        op: CmpOp,
        /// Left
        lhs: Box<TExpr>,
        /// Right
        rhs: Box<TExpr>,
    },
    /// Short-circuit `&&` (`is_and`) or `||`
    Logical {
        /// `&&` when true
        is_and: bool,
        /// Left
        lhs: Box<TExpr>,
        /// Right (evaluated only when needed)
        rhs: Box<TExpr>,
    },
    /// Negation (numeric or complex)
    Neg {
        /// Operand
        operand: Box<TExpr>,
        /// Trap on overflow
        checked: bool,
    },
    /// Logical / bitwise not
    Not(Box<TExpr>),
    /// Float square root
    Sqrt(Box<TExpr>),
    /// Absolute value
    Abs(Box<TExpr>),
    /// Complex part
    Part {
        /// Which part
        part: ComplexPart,
        /// Complex operand
        operand: Box<TExpr>,
    },
    /// Complex conjugate
    Conj(Box<TExpr>),
    /// Numeric conversion to the node's type (scalar to scalar, real to
    /// complex, complex to complex)
    Convert(Box<TExpr>),
    /// Tensor shape conversion between fixed and dynamic dims
    TensorCast(Box<TExpr>),
    /// Complex from parts (already of the element type)
    MakeComplex {
        /// Real part
        re: Box<TExpr>,
        /// Imaginary part
        im: Box<TExpr>,
    },
    /// Direct call
    Call {
        /// Callee
        func: FunctionId,
        /// Arguments (already of the parameter types)
        args: Vec<TExpr>,
    },
    /// Call through a function value
    CallIndirect {
        /// Function value
        callee: Box<TExpr>,
        /// Arguments
        args: Vec<TExpr>,
    },
    /// Conditional expression
    If {
        /// Condition
        cond: Box<TExpr>,
        /// Value when true
        then_expr: Box<TExpr>,
        /// Value when false
        else_expr: Box<TExpr>,
    },
    /// Vector/tensor literal (row-major elements of the element type)
    MakeTensor(Vec<TExpr>),
    /// Struct literal (declaration order)
    MakeStruct(Vec<TExpr>),
    /// Field read
    Field {
        /// Struct value
        base: Box<TExpr>,
        /// Field index
        index: u32,
    },
    /// Element read (indices already `i64`)
    Index {
        /// Vector/tensor
        base: Box<TExpr>,
        /// One per axis
        indices: Vec<TExpr>,
    },
    /// Sum of elements
    Sum(Box<TExpr>),
    /// Inner product
    Dot(Box<TExpr>, Box<TExpr>),
    /// Matrix product
    MatMul(Box<TExpr>, Box<TExpr>),
    /// Axis extent (`i64`)
    Dim {
        /// Vector/tensor
        operand: Box<TExpr>,
        /// Axis
        axis: u32,
    },
    /// Reference to a binding
    Ref(LocalId),
    /// Read through a reference
    Deref(Box<TExpr>),
}

impl TExpr {
    /// Build a node
    pub fn new(ty: Type, kind: TExprKind, span: Span) -> Self {
        Self { ty, kind, span }
    }

    /// Visit every binding assigned (directly) by statements in `stmts`
    pub fn collect_assigned(stmts: &[TStmt], out: &mut Vec<LocalId>) {
        for stmt in stmts {
            match &stmt.kind {
                TStmtKind::Assign { local, .. } | TStmtKind::AssignField { local, .. } => {
                    if !out.contains(local) {
                        out.push(*local);
                    }
                }
                TStmtKind::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    Self::collect_assigned(then_body, out);
                    Self::collect_assigned(else_body, out);
                }
                TStmtKind::While { body, .. } => Self::collect_assigned(body, out),
                _ => {}
            }
        }
    }
}
