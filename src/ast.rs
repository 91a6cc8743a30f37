//! # Input AST
//!
//! The already-parsed, type-annotated program handed to the engine by the
//! front end. Function signatures and `let` annotations carry [`Type`]s
//! directly; numeric literals are untyped and resolved by the checker.
//!
//! The [`build`] module offers terse constructors for hosts and tests that
//! assemble trees by hand.

use crate::types::Type;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Source position (1-based; `0:0` when synthesized)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// Line number
    pub line: u32,
    /// Column number
    pub col: u32,
}

impl Span {
    /// Create a span
    pub fn new(line: u32, col: u32) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// A compilation unit: functions in declaration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Function declarations
    pub functions: Vec<FunctionDecl>,
}

/// Function declaration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDecl {
    /// Function name (unique within the module)
    pub name: String,
    /// Parameters in order
    pub params: Vec<Param>,
    /// Declared return type (the empty struct for unit)
    pub ret: Type,
    /// Body statements
    pub body: Vec<Stmt>,
    /// Declaration site
    pub span: Span,
}

/// Function parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name
    pub name: String,
    /// Declared type
    pub ty: Type,
    /// Declaration site
    pub span: Span,
}

/// Statement with its location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stmt {
    /// Statement kind
    pub kind: StmtKind,
    /// Source location
    pub span: Span,
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StmtKind {
    /// `let [mut] name[: ty] = value`
    Let {
        /// Binding name
        name: String,
        /// Optional annotation
        ty: Option<Type>,
        /// Whether the binding may be reassigned
        mutable: bool,
        /// Initializer
        value: Expr,
    },
    /// `name = value`
    Assign {
        /// Target variable
        name: String,
        /// New value
        value: Expr,
    },
    /// `name.field = value`
    AssignField {
        /// Struct variable
        name: String,
        /// Field name
        field: String,
        /// New field value
        value: Expr,
    },
    /// `*target = value`
    Store {
        /// Mutable reference expression
        target: Expr,
        /// Value to write
        value: Expr,
    },
    /// `if cond { .. } else { .. }`
    If {
        /// Condition (bool)
        cond: Expr,
        /// Then branch
        then_body: Vec<Stmt>,
        /// Else branch (possibly empty)
        else_body: Vec<Stmt>,
    },
    /// `while cond { .. }`
    While {
        /// Loop condition (bool)
        cond: Expr,
        /// Loop body
        body: Vec<Stmt>,
    },
    /// Exit the innermost loop
    Break,
    /// Jump to the innermost loop header
    Continue,
    /// Return from the function (`None` returns unit)
    Return(Option<Expr>),
    /// Expression evaluated for its effects
    Expr(Expr),
}

/// Expression with its location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    /// Expression kind
    pub kind: ExprKind,
    /// Source location
    pub span: Span,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Rem,
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    Shl,
    /// `>>`
    Shr,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&&` (short-circuit)
    And,
    /// `||` (short-circuit)
    Or,
}

impl BinaryOp {
    /// Source symbol
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Arithmetic negation
    Neg,
    /// Logical (bool) or bitwise (int) not
    Not,
}

/// Built-in numeric operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Intrinsic {
    /// Float square root
    Sqrt,
    /// Absolute value (wrapping for ints)
    Abs,
    /// Real part of a complex number
    Re,
    /// Imaginary part of a complex number
    Im,
    /// Complex conjugate
    Conj,
    /// Sum of all vector/tensor elements
    Sum,
    /// Inner product of two rank-1 operands
    Dot,
    /// Matrix product of two rank-2 tensors
    MatMul,
    /// Extent of the given axis
    Dim(u32),
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// Untyped integer literal (negative values via `Unary::Neg`)
    Int(u64),
    /// Untyped float literal
    Float(f64),
    /// Boolean literal
    Bool(bool),
    /// Variable or function name
    Var(String),
    /// Binary operation; `checked` traps on integer overflow
    Binary {
        /// Operator
        op: BinaryOp,
        /// Left operand
        lhs: Box<Expr>,
        /// Right operand
        rhs: Box<Expr>,
        /// Trap instead of wrapping
        checked: bool,
    },
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: Box<Expr>,
        /// Trap instead of wrapping
        checked: bool,
    },
    /// Direct call by function name, or indirect call through a
    /// function-typed local
    Call {
        /// Callee name
        callee: String,
        /// Arguments
        args: Vec<Expr>,
    },
    /// Conditional expression
    If {
        /// Condition (bool)
        cond: Box<Expr>,
        /// Value when true
        then_expr: Box<Expr>,
        /// Value when false
        else_expr: Box<Expr>,
    },
    /// Explicit conversion
    Cast {
        /// Value to convert
        expr: Box<Expr>,
        /// Target type
        ty: Type,
    },
    /// Complex number from real and imaginary parts
    Complex {
        /// Real part
        re: Box<Expr>,
        /// Imaginary part
        im: Box<Expr>,
    },
    /// Vector literal
    Vector(Vec<Expr>),
    /// Fixed-shape tensor literal (row-major elements)
    Tensor {
        /// Shape
        shape: Vec<usize>,
        /// Elements in row-major order
        elements: Vec<Expr>,
    },
    /// Struct literal (declaration order)
    Struct(Vec<(String, Expr)>),
    /// Field access
    Field {
        /// Struct value
        base: Box<Expr>,
        /// Field name
        name: String,
    },
    /// Element access
    Index {
        /// Vector or tensor value
        base: Box<Expr>,
        /// One index per axis
        indices: Vec<Expr>,
    },
    /// Built-in numeric operation
    Intrinsic {
        /// Operation
        op: Intrinsic,
        /// Operands
        args: Vec<Expr>,
    },
    /// Reference to a local variable
    Ref {
        /// Variable name
        name: String,
        /// Mutable reference
        mutable: bool,
    },
    /// Read through a reference
    Deref(Box<Expr>),
}

/// Terse constructors for building trees by hand
pub mod build {
    use super::*;

    fn e(kind: ExprKind) -> Expr {
        Expr {
            kind,
            span: Span::default(),
        }
    }

    fn s(kind: StmtKind) -> Stmt {
        Stmt {
            kind,
            span: Span::default(),
        }
    }

    /// Module from functions
    pub fn module(functions: Vec<FunctionDecl>) -> Module {
        Module { functions }
    }

    /// Function declaration
    pub fn func(name: &str, params: Vec<Param>, ret: Type, body: Vec<Stmt>) -> FunctionDecl {
        FunctionDecl {
            name: name.to_string(),
            params,
            ret,
            body,
            span: Span::default(),
        }
    }

    /// Parameter
    pub fn param(name: &str, ty: Type) -> Param {
        Param {
            name: name.to_string(),
            ty,
            span: Span::default(),
        }
    }

    /// Integer literal
    pub fn int(v: u64) -> Expr {
        e(ExprKind::Int(v))
    }

    /// Possibly negative integer literal
    pub fn sint(v: i64) -> Expr {
        if v < 0 {
            neg(int(v.unsigned_abs()))
        } else {
            int(v as u64)
        }
    }

    /// Float literal
    pub fn float(v: f64) -> Expr {
        e(ExprKind::Float(v))
    }

    /// Bool literal
    pub fn boolean(v: bool) -> Expr {
        e(ExprKind::Bool(v))
    }

    /// Variable reference
    pub fn var(name: &str) -> Expr {
        e(ExprKind::Var(name.to_string()))
    }

    /// Wrapping binary operation
    pub fn bin(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        e(ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            checked: false,
        })
    }

    /// Checked binary operation
    pub fn checked(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        e(ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            checked: true,
        })
    }

    /// `lhs + rhs`
    pub fn add(lhs: Expr, rhs: Expr) -> Expr {
        bin(BinaryOp::Add, lhs, rhs)
    }

    /// `lhs - rhs`
    pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
        bin(BinaryOp::Sub, lhs, rhs)
    }

    /// `lhs * rhs`
    pub fn mul(lhs: Expr, rhs: Expr) -> Expr {
        bin(BinaryOp::Mul, lhs, rhs)
    }

    /// `lhs / rhs`
    pub fn div(lhs: Expr, rhs: Expr) -> Expr {
        bin(BinaryOp::Div, lhs, rhs)
    }

    /// `lhs < rhs`
    pub fn lt(lhs: Expr, rhs: Expr) -> Expr {
        bin(BinaryOp::Lt, lhs, rhs)
    }

    /// `lhs > rhs`
    pub fn gt(lhs: Expr, rhs: Expr) -> Expr {
        bin(BinaryOp::Gt, lhs, rhs)
    }

    /// `lhs == rhs`
    pub fn eq(lhs: Expr, rhs: Expr) -> Expr {
        bin(BinaryOp::Eq, lhs, rhs)
    }

    /// `lhs && rhs`
    pub fn and(lhs: Expr, rhs: Expr) -> Expr {
        bin(BinaryOp::And, lhs, rhs)
    }

    /// `lhs || rhs`
    pub fn or(lhs: Expr, rhs: Expr) -> Expr {
        bin(BinaryOp::Or, lhs, rhs)
    }

    /// `-operand`
    pub fn neg(operand: Expr) -> Expr {
        e(ExprKind::Unary {
            op: UnaryOp::Neg,
            operand: Box::new(operand),
            checked: false,
        })
    }

    /// `!operand`
    pub fn not(operand: Expr) -> Expr {
        e(ExprKind::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
            checked: false,
        })
    }

    /// Function call
    pub fn call(callee: &str, args: Vec<Expr>) -> Expr {
        e(ExprKind::Call {
            callee: callee.to_string(),
            args,
        })
    }

    /// Conditional expression
    pub fn cond(c: Expr, then_expr: Expr, else_expr: Expr) -> Expr {
        e(ExprKind::If {
            cond: Box::new(c),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        })
    }

    /// Explicit conversion
    pub fn cast(expr: Expr, ty: Type) -> Expr {
        e(ExprKind::Cast {
            expr: Box::new(expr),
            ty,
        })
    }

    /// Complex literal
    pub fn complex(re: Expr, im: Expr) -> Expr {
        e(ExprKind::Complex {
            re: Box::new(re),
            im: Box::new(im),
        })
    }

    /// Vector literal
    pub fn vector(elements: Vec<Expr>) -> Expr {
        e(ExprKind::Vector(elements))
    }

    /// Tensor literal
    pub fn tensor(shape: Vec<usize>, elements: Vec<Expr>) -> Expr {
        e(ExprKind::Tensor { shape, elements })
    }

    /// Struct literal
    pub fn struct_lit(fields: Vec<(&str, Expr)>) -> Expr {
        e(ExprKind::Struct(
            fields.into_iter().map(|(n, v)| (n.to_string(), v)).collect(),
        ))
    }

    /// Field access
    pub fn field(base: Expr, name: &str) -> Expr {
        e(ExprKind::Field {
            base: Box::new(base),
            name: name.to_string(),
        })
    }

    /// Element access
    pub fn index(base: Expr, indices: Vec<Expr>) -> Expr {
        e(ExprKind::Index {
            base: Box::new(base),
            indices,
        })
    }

    /// Intrinsic call
    pub fn intrinsic(op: Intrinsic, args: Vec<Expr>) -> Expr {
        e(ExprKind::Intrinsic { op, args })
    }

    /// `&name` / `&mut name`
    pub fn reference(name: &str, mutable: bool) -> Expr {
        e(ExprKind::Ref {
            name: name.to_string(),
            mutable,
        })
    }

    /// `*expr`
    pub fn deref(expr: Expr) -> Expr {
        e(ExprKind::Deref(Box::new(expr)))
    }

    /// `let name = value`
    pub fn let_(name: &str, value: Expr) -> Stmt {
        s(StmtKind::Let {
            name: name.to_string(),
            ty: None,
            mutable: false,
            value,
        })
    }

    /// `let name: ty = value`
    pub fn let_typed(name: &str, ty: Type, value: Expr) -> Stmt {
        s(StmtKind::Let {
            name: name.to_string(),
            ty: Some(ty),
            mutable: false,
            value,
        })
    }

    /// `let mut name = value`
    pub fn let_mut(name: &str, value: Expr) -> Stmt {
        s(StmtKind::Let {
            name: name.to_string(),
            ty: None,
            mutable: true,
            value,
        })
    }

    /// `let mut name: ty = value`
    pub fn let_mut_typed(name: &str, ty: Type, value: Expr) -> Stmt {
        s(StmtKind::Let {
            name: name.to_string(),
            ty: Some(ty),
            mutable: true,
            value,
        })
    }

    /// `name = value`
    pub fn assign(name: &str, value: Expr) -> Stmt {
        s(StmtKind::Assign {
            name: name.to_string(),
            value,
        })
    }

    /// `name.field = value`
    pub fn assign_field(name: &str, field: &str, value: Expr) -> Stmt {
        s(StmtKind::AssignField {
            name: name.to_string(),
            field: field.to_string(),
            value,
        })
    }

    /// `*target = value`
    pub fn store(target: Expr, value: Expr) -> Stmt {
        s(StmtKind::Store { target, value })
    }

    /// `if` statement
    pub fn if_(cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt>) -> Stmt {
        s(StmtKind::If {
            cond,
            then_body,
            else_body,
        })
    }

    /// `while` loop
    pub fn while_(cond: Expr, body: Vec<Stmt>) -> Stmt {
        s(StmtKind::While { cond, body })
    }

    /// `break`
    pub fn brk() -> Stmt {
        s(StmtKind::Break)
    }

    /// `continue`
    pub fn cont() -> Stmt {
        s(StmtKind::Continue)
    }

    /// `return value`
    pub fn ret(value: Expr) -> Stmt {
        s(StmtKind::Return(Some(value)))
    }

    /// `return`
    pub fn ret_unit() -> Stmt {
        s(StmtKind::Return(None))
    }

    /// Expression statement
    pub fn expr(value: Expr) -> Stmt {
        s(StmtKind::Expr(value))
    }
}
