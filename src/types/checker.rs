//! # Bidirectional Type Checker
//!
//! Turns the input AST into the typed tree of [`super::typed`].
//!
//! **Synthesis (↑)**: variables, calls and most operators synthesize a type
//! from their operands.
//!
//! **Checking (↓)**: an expected type flows down as a hint into literals,
//! vector/tensor/struct literals and conditional expressions.
//!
//! ## Literals
//!
//! Numeric literals are untyped placeholders. With an integer, float or
//! complex hint they take that type (integer literals are range-checked);
//! without one they default to `i64` / `f64`. In `1 + x` the non-literal
//! operand is synthesized first and its type becomes the literal's hint, so
//! `x: u8` makes `1` a `u8`. Placeholders never survive checking.
//!
//! ## Coercion
//!
//! Wherever a value flows into a typed position (annotated `let`, assignment,
//! call argument, return) it is coerced: identical types pass, numeric values
//! widen along the promotion rules, and fixed-shape tensors widen to
//! compatible dynamic shapes. Everything else is a `Mismatch`.

use super::promote::{promote, widens_to};
use super::typed::{ComplexPart, LocalId, LocalInfo, TExpr, TExprKind, TFunction, TStmt, TStmtKind};
use super::{elem_kind_of, Dim, Mutability, StructField, Type, TypeError, TypeErrorKind};
use crate::ast::{self, BinaryOp, Expr, ExprKind, FunctionDecl, Intrinsic, Span, Stmt, StmtKind, UnaryOp};
use crate::compiler::ir::FunctionId;
use crate::numeric::{ArithOp, CmpOp, ScalarKind};
use crate::runtime::TypedValue;
use std::collections::HashMap;
use tracing::debug;

type CheckResult<T> = std::result::Result<T, TypeError>;

/// Signature of a module-level function
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionSig {
    /// Function id (declaration order)
    pub id: FunctionId,
    /// Function name
    pub name: String,
    /// Parameter types
    pub params: Vec<Type>,
    /// Return type
    pub ret: Type,
}

impl FunctionSig {
    /// The function's value type
    pub fn fn_type(&self) -> Type {
        Type::Function(self.params.clone(), Box::new(self.ret.clone()))
    }
}

/// Checking environment for one function body
#[derive(Debug, Clone)]
pub struct TypeEnv {
    functions: HashMap<String, FunctionSig>,
    scopes: Vec<HashMap<String, LocalId>>,
    locals: Vec<LocalInfo>,
    ret: Type,
    loop_depth: usize,
}

enum Literal {
    Int(i128),
    Float(f64),
}

fn literal_value(expr: &Expr) -> Option<Literal> {
    match &expr.kind {
        ExprKind::Int(v) => Some(Literal::Int(*v as i128)),
        ExprKind::Float(v) => Some(Literal::Float(*v)),
        ExprKind::Unary {
            op: UnaryOp::Neg,
            operand,
            ..
        } => match literal_value(operand)? {
            Literal::Int(v) => Some(Literal::Int(-v)),
            Literal::Float(v) => Some(Literal::Float(-v)),
        },
        _ => None,
    }
}

fn arith_op(op: BinaryOp) -> Option<ArithOp> {
    Some(match op {
        BinaryOp::Add => ArithOp::Add,
        BinaryOp::Sub => ArithOp::Sub,
        BinaryOp::Mul => ArithOp::Mul,
        BinaryOp::Div => ArithOp::Div,
        BinaryOp::Rem => ArithOp::Rem,
        BinaryOp::BitAnd => ArithOp::And,
        BinaryOp::BitOr => ArithOp::Or,
        BinaryOp::BitXor => ArithOp::Xor,
        BinaryOp::Shl => ArithOp::Shl,
        BinaryOp::Shr => ArithOp::Shr,
        _ => return None,
    })
}

fn cmp_op(op: BinaryOp) -> Option<CmpOp> {
    Some(match op {
        BinaryOp::Eq => CmpOp::Eq,
        BinaryOp::Ne => CmpOp::Ne,
        BinaryOp::Lt => CmpOp::Lt,
        BinaryOp::Le => CmpOp::Le,
        BinaryOp::Gt => CmpOp::Gt,
        BinaryOp::Ge => CmpOp::Ge,
        _ => return None,
    })
}

fn boxed(e: TExpr) -> Box<TExpr> {
    Box::new(e)
}

/// Hint for the other operand of a binary operator
fn operand_hint(ty: &Type) -> Type {
    match ty.element() {
        Some(elem) => elem.clone(),
        None => ty.clone(),
    }
}

fn shape_mismatch(message: String) -> TypeError {
    TypeError::new(TypeErrorKind::ShapeMismatch, message)
}

/// Merge two static shapes for an elementwise operation
fn merge_dims(a: &[Dim], b: &[Dim]) -> CheckResult<Vec<Dim>> {
    if a.len() != b.len() {
        return Err(shape_mismatch(format!(
            "rank {} does not match rank {}",
            a.len(),
            b.len()
        )));
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| match (x, y) {
            (Dim::Fixed(m), Dim::Fixed(n)) if m != n => {
                Err(shape_mismatch(format!("dimension {} does not match {}", m, n)))
            }
            (Dim::Fixed(m), _) | (_, Dim::Fixed(m)) => Ok(Dim::Fixed(*m)),
            _ => Ok(Dim::Dynamic),
        })
        .collect()
}

/// Whether a value of shape `from` may flow into `to` without a cast
fn dims_widen(from: &[Dim], to: &[Dim]) -> bool {
    from.len() == to.len()
        && from.iter().zip(to).all(|(f, t)| match (f, t) {
            (_, Dim::Dynamic) => true,
            (Dim::Fixed(m), Dim::Fixed(n)) => m == n,
            (Dim::Dynamic, Dim::Fixed(_)) => false,
        })
}

/// Whether `from` may be explicitly cast to `to` (shape-wise)
fn dims_castable(from: &[Dim], to: &[Dim]) -> bool {
    from.len() == to.len()
        && from.iter().zip(to).all(|(f, t)| match (f, t) {
            (Dim::Fixed(m), Dim::Fixed(n)) => m == n,
            _ => true,
        })
}

impl TypeEnv {
    /// Create an environment for a body returning `ret`
    pub fn new(functions: HashMap<String, FunctionSig>, ret: Type) -> Self {
        Self {
            functions,
            scopes: vec![HashMap::new()],
            locals: Vec::new(),
            ret,
            loop_depth: 0,
        }
    }

    /// Bind a new local in the innermost scope
    pub fn bind(&mut self, name: &str, ty: Type, mutable: bool) -> LocalId {
        let id = LocalId(self.locals.len() as u32);
        self.locals.push(LocalInfo {
            name: name.to_string(),
            ty,
            mutable,
            address_taken: false,
        });
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name.to_string(), id);
        }
        id
    }

    /// Resolve a name to the innermost binding
    pub fn lookup(&self, name: &str) -> Option<LocalId> {
        self.scopes.iter().rev().find_map(|s| s.get(name).copied())
    }

    /// Binding metadata
    pub fn local(&self, id: LocalId) -> &LocalInfo {
        &self.locals[id.0 as usize]
    }

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    // =========================================================================
    // Literals and coercion
    // =========================================================================

    fn typed_literal(&self, lit: Literal, hint: Option<&Type>, span: Span) -> CheckResult<TExpr> {
        let hint_kind = hint.and_then(|h| h.scalar_kind());
        let complex_elem = hint.and_then(|h| h.complex_elem());
        let value = match lit {
            Literal::Int(v) => match (hint_kind, complex_elem) {
                (Some(k), _) if k.is_int() => {
                    let bits = k.encode_int(v).ok_or_else(|| {
                        TypeError::mismatch(format!("literal {} out of range for {}", v, k))
                    })?;
                    TypedValue::scalar(k, bits)
                }
                (Some(k), _) if k.is_float() => TypedValue::scalar(k, k.encode_float(v as f64).unwrap_or(0)),
                (_, Some(e)) => complex_const(e, v as f64, 0.0),
                _ => {
                    let bits = ScalarKind::I64.encode_int(v).ok_or_else(|| {
                        TypeError::mismatch(format!("literal {} out of range for i64", v))
                    })?;
                    TypedValue::scalar(ScalarKind::I64, bits)
                }
            },
            Literal::Float(v) => match (hint_kind, complex_elem) {
                (Some(k), _) if k.is_float() => TypedValue::scalar(k, k.encode_float(v).unwrap_or(0)),
                (_, Some(e)) => complex_const(e, v, 0.0),
                _ => TypedValue::f64(v),
            },
        };
        Ok(TExpr::new(value.ty().clone(), TExprKind::Const(value), span))
    }

    /// Coerce a typed expression to `target`
    pub fn coerce(&self, expr: TExpr, target: &Type) -> CheckResult<TExpr> {
        if &expr.ty == target {
            return Ok(expr);
        }
        let span = expr.span;
        let scalarish = |t: &Type| t.is_numeric() || t.complex_elem().is_some();
        if scalarish(&expr.ty) && scalarish(target) && widens_to(&expr.ty, target) {
            return Ok(TExpr::new(target.clone(), TExprKind::Convert(boxed(expr)), span));
        }
        if let (Some(from), Some(to)) = (expr.ty.dims(), target.dims()) {
            if expr.ty.element() == target.element() && dims_widen(&from, &to) {
                return Ok(TExpr::new(target.clone(), TExprKind::TensorCast(boxed(expr)), span));
            }
        }
        Err(TypeError::mismatch(format!("expected {}, found {}", target, expr.ty)).at(span))
    }

    fn convert_to(&self, expr: TExpr, target: &Type) -> TExpr {
        if &expr.ty == target {
            return expr;
        }
        let span = expr.span;
        TExpr::new(target.clone(), TExprKind::Convert(boxed(expr)), span)
    }

    fn check_bool(&mut self, expr: &Expr) -> CheckResult<TExpr> {
        let e = self.synth(expr, Some(&Type::BOOL))?;
        if !e.ty.is_bool() {
            return Err(TypeError::mismatch(format!("expected bool, found {}", e.ty)).at(expr.span));
        }
        Ok(e)
    }

    // =========================================================================
    // SYNTHESIS
    // =========================================================================

    /// Synthesize a typed expression, using `hint` for placeholders
    pub fn synth(&mut self, expr: &Expr, hint: Option<&Type>) -> CheckResult<TExpr> {
        self.synth_inner(expr, hint).map_err(|e| e.at(expr.span))
    }

    fn synth_inner(&mut self, expr: &Expr, hint: Option<&Type>) -> CheckResult<TExpr> {
        let span = expr.span;
        if let Some(lit) = literal_value(expr) {
            return self.typed_literal(lit, hint, span);
        }
        match &expr.kind {
            ExprKind::Int(_) | ExprKind::Float(_) => Err(TypeError::mismatch("unreachable literal form")),
            ExprKind::Bool(b) => Ok(TExpr::new(
                Type::BOOL,
                TExprKind::Const(TypedValue::boolean(*b)),
                span,
            )),
            ExprKind::Var(name) => {
                if let Some(id) = self.lookup(name) {
                    return Ok(TExpr::new(self.local(id).ty.clone(), TExprKind::Local(id), span));
                }
                if let Some(sig) = self.functions.get(name) {
                    return Ok(TExpr::new(sig.fn_type(), TExprKind::FuncRef(sig.id), span));
                }
                Err(TypeError::new(
                    TypeErrorKind::UnknownSymbol,
                    format!("unknown symbol `{}`", name),
                ))
            }
            ExprKind::Binary {
                op,
                lhs,
                rhs,
                checked,
            } => self.synth_binary(*op, lhs, rhs, *checked, hint, span),
            ExprKind::Unary {
                op,
                operand,
                checked,
            } => {
                let e = self.synth(operand, hint)?;
                match op {
                    UnaryOp::Neg if e.ty.is_numeric() || e.ty.complex_elem().is_some() => Ok(TExpr::new(
                        e.ty.clone(),
                        TExprKind::Neg {
                            operand: boxed(e),
                            checked: *checked,
                        },
                        span,
                    )),
                    UnaryOp::Not if e.ty.is_bool() || e.ty.is_int() => {
                        Ok(TExpr::new(e.ty.clone(), TExprKind::Not(boxed(e)), span))
                    }
                    _ => Err(TypeError::mismatch(format!("operator {:?} not defined for {}", op, e.ty))),
                }
            }
            ExprKind::Call { callee, args } => self.synth_call(callee, args, span),
            ExprKind::If {
                cond,
                then_expr,
                else_expr,
            } => {
                let c = self.check_bool(cond)?;
                let t = self.synth(then_expr, hint)?;
                let else_hint = hint.cloned().unwrap_or_else(|| t.ty.clone());
                let e = self.synth(else_expr, Some(&else_hint))?;
                let target = if t.ty == e.ty {
                    t.ty.clone()
                } else {
                    promote(&t.ty, &e.ty)?
                };
                let t = self.coerce(t, &target)?;
                let e = self.coerce(e, &target)?;
                Ok(TExpr::new(
                    target,
                    TExprKind::If {
                        cond: boxed(c),
                        then_expr: boxed(t),
                        else_expr: boxed(e),
                    },
                    span,
                ))
            }
            ExprKind::Cast { expr: inner, ty } => self.synth_cast(inner, ty, span),
            ExprKind::Complex { re, im } => {
                let hint_elem = hint.and_then(|h| h.complex_elem()).map(Type::from_scalar);
                let r = self.synth(re, hint_elem.as_ref())?;
                let i = self.synth(im, hint_elem.as_ref())?;
                let mut elem = promote(&r.ty, &i.ty)?;
                if elem.is_int() {
                    elem = promote(&elem, &Type::F32)?;
                }
                if !elem.is_float() {
                    return Err(TypeError::mismatch(format!("complex part of type {}", elem)));
                }
                if let Some(h) = &hint_elem {
                    if widens_to(&elem, h) {
                        elem = h.clone();
                    }
                }
                let r = self.convert_to(r, &elem);
                let i = self.convert_to(i, &elem);
                Ok(TExpr::new(
                    Type::Complex(Box::new(elem)),
                    TExprKind::MakeComplex {
                        re: boxed(r),
                        im: boxed(i),
                    },
                    span,
                ))
            }
            ExprKind::Vector(elements) => {
                let elem_hint = hint.and_then(|h| h.element()).cloned();
                let (elem, values) = self.synth_elements(elements, elem_hint)?;
                Ok(TExpr::new(
                    Type::Vector(Box::new(elem), values.len()),
                    TExprKind::MakeTensor(values),
                    span,
                ))
            }
            ExprKind::Tensor { shape, elements } => {
                let count: usize = shape.iter().product();
                if count != elements.len() {
                    return Err(shape_mismatch(format!(
                        "shape {:?} needs {} elements, found {}",
                        shape,
                        count,
                        elements.len()
                    )));
                }
                let elem_hint = hint.and_then(|h| h.element()).cloned();
                let (elem, values) = self.synth_elements(elements, elem_hint)?;
                let dims = shape.iter().map(|n| Dim::Fixed(*n)).collect();
                Ok(TExpr::new(
                    Type::Tensor(Box::new(elem), dims),
                    TExprKind::MakeTensor(values),
                    span,
                ))
            }
            ExprKind::Struct(fields) => self.synth_struct(fields, hint, span),
            ExprKind::Field { base, name } => {
                let b = self.synth(base, None)?;
                let Type::Struct(decl) = &b.ty else {
                    return Err(TypeError::mismatch(format!("field access on {}", b.ty)));
                };
                let Some(index) = decl.iter().position(|f| &f.name == name) else {
                    return Err(TypeError::new(
                        TypeErrorKind::UnknownSymbol,
                        format!("no field `{}` in {}", name, b.ty),
                    ));
                };
                let ty = decl[index].ty.clone();
                Ok(TExpr::new(
                    ty,
                    TExprKind::Field {
                        base: boxed(b),
                        index: index as u32,
                    },
                    span,
                ))
            }
            ExprKind::Index { base, indices } => {
                let b = self.synth(base, None)?;
                let (Some(dims), Some(elem)) = (b.ty.dims(), b.ty.element().cloned()) else {
                    return Err(TypeError::mismatch(format!("indexing into {}", b.ty)));
                };
                if dims.len() != indices.len() {
                    return Err(shape_mismatch(format!(
                        "{} indices for rank-{} operand",
                        indices.len(),
                        dims.len()
                    )));
                }
                let mut idx = Vec::with_capacity(indices.len());
                for i in indices {
                    let e = self.synth(i, Some(&Type::I64))?;
                    if !e.ty.is_int() {
                        return Err(TypeError::mismatch(format!("index of type {}", e.ty)).at(i.span));
                    }
                    idx.push(self.convert_to(e, &Type::I64));
                }
                Ok(TExpr::new(
                    elem,
                    TExprKind::Index {
                        base: boxed(b),
                        indices: idx,
                    },
                    span,
                ))
            }
            ExprKind::Intrinsic { op, args } => self.synth_intrinsic(*op, args, hint, span),
            ExprKind::Ref { name, mutable } => {
                let Some(id) = self.lookup(name) else {
                    return Err(TypeError::new(
                        TypeErrorKind::UnknownSymbol,
                        format!("unknown symbol `{}`", name),
                    ));
                };
                let info = &mut self.locals[id.0 as usize];
                if *mutable && !info.mutable {
                    return Err(TypeError::mismatch(format!(
                        "cannot take a mutable reference to immutable `{}`",
                        name
                    )));
                }
                if info.ty.contains_reference() {
                    return Err(TypeError::mismatch("references to references are not supported"));
                }
                info.address_taken = true;
                let mutability = if *mutable {
                    Mutability::Mutable
                } else {
                    Mutability::Shared
                };
                Ok(TExpr::new(
                    Type::Reference(Box::new(info.ty.clone()), mutability),
                    TExprKind::Ref(id),
                    span,
                ))
            }
            ExprKind::Deref(inner) => {
                let r = self.synth(inner, None)?;
                let Type::Reference(target, _) = &r.ty else {
                    return Err(TypeError::mismatch(format!("dereference of {}", r.ty)));
                };
                let ty = (**target).clone();
                Ok(TExpr::new(ty, TExprKind::Deref(boxed(r)), span))
            }
        }
    }

    fn synth_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        checked: bool,
        hint: Option<&Type>,
        span: Span,
    ) -> CheckResult<TExpr> {
        if matches!(op, BinaryOp::And | BinaryOp::Or) {
            let l = self.check_bool(lhs)?;
            let r = self.check_bool(rhs)?;
            return Ok(TExpr::new(
                Type::BOOL,
                TExprKind::Logical {
                    is_and: op == BinaryOp::And,
                    lhs: boxed(l),
                    rhs: boxed(r),
                },
                span,
            ));
        }

        let cmp = cmp_op(op);
        let outer = if cmp.is_some() { None } else { hint };
        let (l, r) = if literal_value(lhs).is_some() && literal_value(rhs).is_none() {
            let r = self.synth(rhs, outer)?;
            let l = self.synth(lhs, Some(&operand_hint(&r.ty)))?;
            (l, r)
        } else {
            let l = self.synth(lhs, outer)?;
            let r = self.synth(rhs, Some(&operand_hint(&l.ty)))?;
            (l, r)
        };

        if let Some(cop) = cmp {
            return self.compare(cop, l, r, span);
        }
        let aop = arith_op(op).ok_or_else(|| TypeError::mismatch(format!("operator {}", op.symbol())))?;
        match (l.ty.is_container(), r.ty.is_container()) {
            (true, true) => self.elementwise(aop, l, r, checked, span),
            (true, false) if aop == ArithOp::Mul => self.scale(l, r, checked, span),
            (false, true) if aop == ArithOp::Mul => self.scale(r, l, checked, span),
            (false, false) => self.scalar_arith(aop, l, r, checked, span),
            _ => Err(TypeError::mismatch(format!(
                "operator {} not defined for {} and {}",
                op.symbol(),
                l.ty,
                r.ty
            ))),
        }
    }

    fn scalar_arith(&self, op: ArithOp, l: TExpr, r: TExpr, checked: bool, span: Span) -> CheckResult<TExpr> {
        let ty = match op {
            ArithOp::Shl | ArithOp::Shr => {
                if !l.ty.is_int() || !r.ty.is_int() {
                    return Err(TypeError::mismatch(format!("shift of {} by {}", l.ty, r.ty)));
                }
                l.ty.clone()
            }
            ArithOp::And | ArithOp::Or | ArithOp::Xor => {
                let ty = promote(&l.ty, &r.ty)?;
                if !ty.is_int() && !ty.is_bool() {
                    return Err(TypeError::mismatch(format!("bitwise operator on {}", ty)));
                }
                ty
            }
            _ => {
                let ty = promote(&l.ty, &r.ty)?;
                let complex = ty.complex_elem().is_some();
                if ty.is_bool() || (complex && op == ArithOp::Rem) {
                    return Err(TypeError::mismatch(format!("operator {} not defined for {}", op.symbol(), ty)));
                }
                ty
            }
        };
        let l = self.convert_to(l, &ty);
        let r = self.convert_to(r, &ty);
        Ok(TExpr::new(
            ty,
            TExprKind::Arith {
                op,
                lhs: boxed(l),
                rhs: boxed(r),
                checked,
            },
            span,
        ))
    }

    fn elementwise(&self, op: ArithOp, l: TExpr, r: TExpr, checked: bool, span: Span) -> CheckResult<TExpr> {
        if !matches!(op, ArithOp::Add | ArithOp::Sub | ArithOp::Mul | ArithOp::Div | ArithOp::Rem) {
            return Err(TypeError::mismatch(format!("operator {} on tensors", op.symbol())));
        }
        if l.ty.element() != r.ty.element() {
            return Err(TypeError::mismatch(format!(
                "element types differ: {} and {}",
                l.ty, r.ty
            )));
        }
        let elem = l.ty.element().cloned().unwrap_or(Type::F64);
        if op == ArithOp::Rem && elem.complex_elem().is_some() {
            return Err(TypeError::mismatch("remainder on complex elements"));
        }
        let ty = match (&l.ty, &r.ty) {
            (Type::Vector(_, m), Type::Vector(_, n)) => {
                if m != n {
                    return Err(shape_mismatch(format!("vector length {} does not match {}", m, n)));
                }
                l.ty.clone()
            }
            (Type::Tensor(_, a), Type::Tensor(_, b)) => Type::Tensor(Box::new(elem), merge_dims(a, b)?),
            _ => {
                return Err(TypeError::mismatch(format!(
                    "cannot mix {} and {}; cast one operand",
                    l.ty, r.ty
                )))
            }
        };
        Ok(TExpr::new(
            ty,
            TExprKind::Arith {
                op,
                lhs: boxed(l),
                rhs: boxed(r),
                checked,
            },
            span,
        ))
    }

    fn scale(&self, tensor: TExpr, factor: TExpr, checked: bool, span: Span) -> CheckResult<TExpr> {
        let elem = tensor.ty.element().cloned().unwrap_or(Type::F64);
        let factor = self.coerce(factor, &elem)?;
        Ok(TExpr::new(
            tensor.ty.clone(),
            TExprKind::Scale {
                tensor: boxed(tensor),
                factor: boxed(factor),
                checked,
            },
            span,
        ))
    }

    fn compare(&self, op: CmpOp, l: TExpr, r: TExpr, span: Span) -> CheckResult<TExpr> {
        let ty = promote(&l.ty, &r.ty)?;
        let ordering = !matches!(op, CmpOp::Eq | CmpOp::Ne);
        if ordering && !ty.is_numeric() {
            return Err(TypeError::mismatch(format!("ordering comparison on {}", ty)));
        }
        let l = self.convert_to(l, &ty);
        let r = self.convert_to(r, &ty);
        Ok(TExpr::new(
            Type::BOOL,
            TExprKind::Compare {
                op,
                lhs: boxed(l),
                rhs: boxed(r),
            },
            span,
        ))
    }

    fn synth_call(&mut self, callee: &str, args: &[Expr], span: Span) -> CheckResult<TExpr> {
        let (params, ret, target) = if let Some(id) = self.lookup(callee) {
            let ty = self.local(id).ty.clone();
            let Type::Function(params, ret) = &ty else {
                return Err(TypeError::mismatch(format!("`{}` of type {} is not callable", callee, ty)));
            };
            let value = TExpr::new(ty.clone(), TExprKind::Local(id), span);
            (params.clone(), (**ret).clone(), Err(value))
        } else if let Some(sig) = self.functions.get(callee) {
            (sig.params.clone(), sig.ret.clone(), Ok(sig.id))
        } else {
            return Err(TypeError::new(
                TypeErrorKind::UnknownSymbol,
                format!("unknown function `{}`", callee),
            ));
        };

        if params.len() != args.len() {
            return Err(TypeError::new(
                TypeErrorKind::ArityMismatch,
                format!("`{}` takes {} arguments, {} given", callee, params.len(), args.len()),
            ));
        }
        let mut typed = Vec::with_capacity(args.len());
        for (arg, param) in args.iter().zip(&params) {
            let e = self.synth(arg, Some(param))?;
            typed.push(self.coerce(e, param)?);
        }
        let kind = match target {
            Ok(func) => TExprKind::Call { func, args: typed },
            Err(value) => TExprKind::CallIndirect {
                callee: boxed(value),
                args: typed,
            },
        };
        Ok(TExpr::new(ret, kind, span))
    }

    fn synth_cast(&mut self, inner: &Expr, target: &Type, span: Span) -> CheckResult<TExpr> {
        target.validate()?;
        let e = self.synth(inner, None)?;
        if &e.ty == target {
            return Ok(e);
        }
        let scalar = |t: &Type| t.scalar_kind().is_some();
        let ok = match (&e.ty, target) {
            (from, to) if scalar(from) && scalar(to) => true,
            (from, Type::Complex(_)) => from.is_numeric() || from.complex_elem().is_some(),
            _ => false,
        };
        if ok {
            return Ok(TExpr::new(target.clone(), TExprKind::Convert(boxed(e)), span));
        }
        if let (Some(from), Some(to)) = (e.ty.dims(), target.dims()) {
            if e.ty.element() == target.element() && dims_castable(&from, &to) {
                return Ok(TExpr::new(target.clone(), TExprKind::TensorCast(boxed(e)), span));
            }
        }
        Err(TypeError::mismatch(format!("cannot cast {} to {}", e.ty, target)))
    }

    fn synth_elements(&mut self, elements: &[Expr], hint: Option<Type>) -> CheckResult<(Type, Vec<TExpr>)> {
        let mut typed = Vec::with_capacity(elements.len());
        for e in elements {
            typed.push(self.synth(e, hint.as_ref())?);
        }
        let elem = match &hint {
            Some(h) if typed.iter().all(|t| widens_to(&t.ty, h)) => h.clone(),
            _ => {
                let mut iter = typed.iter();
                let Some(first) = iter.next() else {
                    return Err(TypeError::mismatch("cannot infer the element type of an empty literal"));
                };
                iter.try_fold(first.ty.clone(), |acc, t| promote(&acc, &t.ty))?
            }
        };
        if elem_kind_of(&elem).is_none() {
            return Err(TypeError::mismatch(format!("element type {} must be numeric or complex", elem)));
        }
        let values = typed
            .into_iter()
            .map(|t| self.coerce(t, &elem))
            .collect::<CheckResult<Vec<_>>>()?;
        Ok((elem, values))
    }

    fn synth_struct(&mut self, fields: &[(String, Expr)], hint: Option<&Type>, span: Span) -> CheckResult<TExpr> {
        let hint_fields = match hint {
            Some(Type::Struct(decl)) if decl.len() == fields.len() => Some(decl.clone()),
            _ => None,
        };
        let mut decl = Vec::with_capacity(fields.len());
        let mut values = Vec::with_capacity(fields.len());
        for (i, (name, expr)) in fields.iter().enumerate() {
            if decl.iter().any(|f: &StructField| &f.name == name) {
                return Err(TypeError::mismatch(format!("duplicate field `{}`", name)));
            }
            let field_hint = hint_fields
                .as_ref()
                .and_then(|h| h.get(i))
                .filter(|f| &f.name == name)
                .map(|f| f.ty.clone());
            let mut e = self.synth(expr, field_hint.as_ref())?;
            if let Some(h) = &field_hint {
                e = self.coerce(e, h)?;
            }
            if e.ty.contains_reference() {
                return Err(TypeError::mismatch("struct fields cannot hold references").at(expr.span));
            }
            decl.push(StructField {
                name: name.clone(),
                ty: e.ty.clone(),
            });
            values.push(e);
        }
        Ok(TExpr::new(Type::Struct(decl), TExprKind::MakeStruct(values), span))
    }

    fn synth_intrinsic(&mut self, op: Intrinsic, args: &[Expr], hint: Option<&Type>, span: Span) -> CheckResult<TExpr> {
        let arity = match op {
            Intrinsic::Dot | Intrinsic::MatMul => 2,
            _ => 1,
        };
        if args.len() != arity {
            return Err(TypeError::new(
                TypeErrorKind::ArityMismatch,
                format!("{:?} takes {} arguments, {} given", op, arity, args.len()),
            ));
        }
        let scalar_hint = hint.filter(|h| h.is_numeric());
        match op {
            Intrinsic::Sqrt | Intrinsic::Abs => {
                let f64_ty = Type::F64;
                let default_hint = if op == Intrinsic::Sqrt { Some(&f64_ty) } else { None };
                let e = self.synth(&args[0], scalar_hint.or(default_hint))?;
                let ok = if op == Intrinsic::Sqrt {
                    e.ty.is_float()
                } else {
                    e.ty.is_numeric()
                };
                if !ok {
                    return Err(TypeError::mismatch(format!("{:?} not defined for {}", op, e.ty)));
                }
                let ty = e.ty.clone();
                let kind = if op == Intrinsic::Sqrt {
                    TExprKind::Sqrt(boxed(e))
                } else {
                    TExprKind::Abs(boxed(e))
                };
                Ok(TExpr::new(ty, kind, span))
            }
            Intrinsic::Re | Intrinsic::Im | Intrinsic::Conj => {
                let e = self.synth(&args[0], None)?;
                let Some(elem) = e.ty.complex_elem() else {
                    return Err(TypeError::mismatch(format!("{:?} of non-complex {}", op, e.ty)));
                };
                Ok(match op {
                    Intrinsic::Conj => TExpr::new(e.ty.clone(), TExprKind::Conj(boxed(e)), span),
                    _ => {
                        let part = if op == Intrinsic::Re {
                            ComplexPart::Re
                        } else {
                            ComplexPart::Im
                        };
                        TExpr::new(
                            Type::from_scalar(elem),
                            TExprKind::Part {
                                part,
                                operand: boxed(e),
                            },
                            span,
                        )
                    }
                })
            }
            Intrinsic::Sum => {
                let e = self.synth(&args[0], None)?;
                let Some(elem) = e.ty.element().cloned() else {
                    return Err(TypeError::mismatch(format!("sum of non-tensor {}", e.ty)));
                };
                Ok(TExpr::new(elem, TExprKind::Sum(boxed(e)), span))
            }
            Intrinsic::Dim(axis) => {
                let e = self.synth(&args[0], None)?;
                let Some(dims) = e.ty.dims() else {
                    return Err(TypeError::mismatch(format!("dim of non-tensor {}", e.ty)));
                };
                if axis as usize >= dims.len() {
                    return Err(shape_mismatch(format!(
                        "axis {} out of range for rank {}",
                        axis,
                        dims.len()
                    )));
                }
                Ok(TExpr::new(
                    Type::I64,
                    TExprKind::Dim {
                        operand: boxed(e),
                        axis,
                    },
                    span,
                ))
            }
            Intrinsic::Dot => {
                let a = self.synth(&args[0], None)?;
                let b = self.synth(&args[1], None)?;
                let (Some(da), Some(db)) = (a.ty.dims(), b.ty.dims()) else {
                    return Err(TypeError::mismatch(format!("dot of {} and {}", a.ty, b.ty)));
                };
                if da.len() != 1 || db.len() != 1 {
                    return Err(shape_mismatch("dot needs rank-1 operands".to_string()));
                }
                merge_dims(&da, &db)?;
                if a.ty.element() != b.ty.element() {
                    return Err(TypeError::mismatch(format!("element types differ: {} and {}", a.ty, b.ty)));
                }
                let elem = a.ty.element().cloned().unwrap_or(Type::F64);
                Ok(TExpr::new(elem, TExprKind::Dot(boxed(a), boxed(b)), span))
            }
            Intrinsic::MatMul => {
                let a = self.synth(&args[0], None)?;
                let b = self.synth(&args[1], None)?;
                let (Type::Tensor(ea, da), Type::Tensor(eb, db)) = (&a.ty, &b.ty) else {
                    return Err(TypeError::mismatch(format!("matmul of {} and {}", a.ty, b.ty)));
                };
                if ea != eb {
                    return Err(TypeError::mismatch(format!("element types differ: {} and {}", a.ty, b.ty)));
                }
                if da.len() != 2 || db.len() != 2 {
                    return Err(shape_mismatch("matmul needs rank-2 operands".to_string()));
                }
                merge_dims(&da[1..], &db[..1])?;
                let ty = Type::Tensor(ea.clone(), vec![da[0], db[1]]);
                ty.validate()?;
                Ok(TExpr::new(ty, TExprKind::MatMul(boxed(a), boxed(b)), span))
            }
        }
    }

    // =========================================================================
    // STATEMENTS
    // =========================================================================

    fn check_block(&mut self, stmts: &[Stmt]) -> CheckResult<Vec<TStmt>> {
        self.push_scope();
        let result = stmts.iter().map(|s| self.check_stmt(s)).collect();
        self.pop_scope();
        result
    }

    fn mutable_local(&self, name: &str) -> CheckResult<LocalId> {
        let id = self.lookup(name).ok_or_else(|| {
            TypeError::new(TypeErrorKind::UnknownSymbol, format!("unknown symbol `{}`", name))
        })?;
        if !self.local(id).mutable {
            return Err(TypeError::mismatch(format!("cannot assign to immutable `{}`", name)));
        }
        Ok(id)
    }

    /// Check one statement
    pub fn check_stmt(&mut self, stmt: &Stmt) -> CheckResult<TStmt> {
        let kind = self.check_stmt_kind(&stmt.kind).map_err(|e| e.at(stmt.span))?;
        Ok(TStmt { kind, span: stmt.span })
    }

    fn check_stmt_kind(&mut self, kind: &StmtKind) -> CheckResult<TStmtKind> {
        Ok(match kind {
            StmtKind::Let {
                name,
                ty,
                mutable,
                value,
            } => {
                if let Some(t) = ty {
                    t.validate()?;
                }
                let v = self.synth(value, ty.as_ref())?;
                let v = match ty {
                    Some(t) => self.coerce(v, t)?,
                    None => v,
                };
                let local = self.bind(name, v.ty.clone(), *mutable);
                TStmtKind::Let { local, value: v }
            }
            StmtKind::Assign { name, value } => {
                let local = self.mutable_local(name)?;
                let ty = self.local(local).ty.clone();
                let v = self.synth(value, Some(&ty))?;
                let value = self.coerce(v, &ty)?;
                TStmtKind::Assign { local, value }
            }
            StmtKind::AssignField { name, field, value } => {
                let local = self.mutable_local(name)?;
                let Type::Struct(decl) = self.local(local).ty.clone() else {
                    return Err(TypeError::mismatch(format!("`{}` is not a struct", name)));
                };
                let Some(index) = decl.iter().position(|f| &f.name == field) else {
                    return Err(TypeError::new(
                        TypeErrorKind::UnknownSymbol,
                        format!("no field `{}` in `{}`", field, name),
                    ));
                };
                let v = self.synth(value, Some(&decl[index].ty))?;
                let value = self.coerce(v, &decl[index].ty)?;
                TStmtKind::AssignField {
                    local,
                    index: index as u32,
                    value,
                }
            }
            StmtKind::Store { target, value } => {
                let t = self.synth(target, None)?;
                let Type::Reference(inner, Mutability::Mutable) = &t.ty else {
                    return Err(TypeError::mismatch(format!("store through {}", t.ty)));
                };
                let inner = (**inner).clone();
                let v = self.synth(value, Some(&inner))?;
                let value = self.coerce(v, &inner)?;
                TStmtKind::Store { target: t, value }
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let cond = self.check_bool(cond)?;
                let then_body = self.check_block(then_body)?;
                let else_body = self.check_block(else_body)?;
                TStmtKind::If {
                    cond,
                    then_body,
                    else_body,
                }
            }
            StmtKind::While { cond, body } => {
                let cond = self.check_bool(cond)?;
                self.loop_depth += 1;
                let body = self.check_block(body);
                self.loop_depth -= 1;
                TStmtKind::While { cond, body: body? }
            }
            StmtKind::Break | StmtKind::Continue => {
                if self.loop_depth == 0 {
                    return Err(TypeError::mismatch("`break`/`continue` outside of a loop"));
                }
                if matches!(kind, StmtKind::Break) {
                    TStmtKind::Break
                } else {
                    TStmtKind::Continue
                }
            }
            StmtKind::Return(value) => {
                let ret = self.ret.clone();
                let v = match value {
                    Some(e) => {
                        let v = self.synth(e, Some(&ret))?;
                        self.coerce(v, &ret)?
                    }
                    None => {
                        if !ret.is_unit() {
                            return Err(TypeError::mismatch(format!("bare return in function returning {}", ret)));
                        }
                        TExpr::new(Type::unit(), TExprKind::MakeStruct(Vec::new()), Span::default())
                    }
                };
                TStmtKind::Return(v)
            }
            StmtKind::Expr(e) => TStmtKind::Expr(self.synth(e, None)?),
        })
    }
}

fn complex_const(elem: ScalarKind, re: f64, im: f64) -> TypedValue {
    match elem {
        ScalarKind::F32 => TypedValue::complex32(re as f32, im as f32),
        _ => TypedValue::complex64(re, im),
    }
}

/// Synthesize the type of an expression in an environment
pub fn check_expr(expr: &Expr, env: &mut TypeEnv) -> CheckResult<Type> {
    env.synth(expr, None).map(|e| e.ty)
}

/// Module-level checker
#[derive(Debug, Clone, Default)]
pub struct TypeChecker {
    sigs: HashMap<String, FunctionSig>,
}

impl TypeChecker {
    /// Collect and validate every signature of the module
    pub fn new(module: &ast::Module) -> CheckResult<Self> {
        let mut sigs = HashMap::new();
        for (i, f) in module.functions.iter().enumerate() {
            let params: Vec<Type> = f.params.iter().map(|p| p.ty.clone()).collect();
            for (p, ty) in f.params.iter().zip(&params) {
                ty.validate().map_err(|e| e.at(p.span))?;
                if ty.contains_reference() {
                    return Err(TypeError::mismatch("parameters cannot be references").at(p.span));
                }
            }
            f.ret.validate().map_err(|e| e.at(f.span))?;
            if f.ret.contains_reference() {
                return Err(TypeError::mismatch("functions cannot return references").at(f.span));
            }
            let sig = FunctionSig {
                id: FunctionId(i as u32),
                name: f.name.clone(),
                params,
                ret: f.ret.clone(),
            };
            if sigs.insert(f.name.clone(), sig).is_some() {
                return Err(TypeError::mismatch(format!("duplicate function `{}`", f.name)).at(f.span));
            }
        }
        Ok(Self { sigs })
    }

    /// Signature by name
    pub fn signature(&self, name: &str) -> Option<&FunctionSig> {
        self.sigs.get(name)
    }

    /// Fresh environment for a body returning `ret`
    pub fn env(&self, ret: Type) -> TypeEnv {
        TypeEnv::new(self.sigs.clone(), ret)
    }

    /// Check one function
    pub fn check_function(&self, decl: &FunctionDecl) -> CheckResult<TFunction> {
        let sig = self.sigs.get(&decl.name).ok_or_else(|| {
            TypeError::new(TypeErrorKind::UnknownSymbol, format!("unknown function `{}`", decl.name))
        })?;
        let mut env = self.env(decl.ret.clone());
        let params = decl
            .params
            .iter()
            .map(|p| env.bind(&p.name, p.ty.clone(), true))
            .collect();
        let body = decl
            .body
            .iter()
            .map(|s| env.check_stmt(s))
            .collect::<CheckResult<Vec<_>>>()?;
        debug!("Type-checked `{}` ({} locals)", decl.name, env.locals.len());
        Ok(TFunction {
            id: sig.id,
            name: decl.name.clone(),
            params,
            ret: decl.ret.clone(),
            locals: env.locals,
            body,
            span: decl.span,
        })
    }

    /// Check every function in declaration order
    pub fn check_module(module: &ast::Module) -> CheckResult<Vec<TFunction>> {
        let checker = Self::new(module)?;
        module
            .functions
            .iter()
            .map(|f| checker.check_function(f))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;

    fn env_with(locals: &[(&str, Type)]) -> TypeEnv {
        let mut env = TypeEnv::new(HashMap::new(), Type::unit());
        for (name, ty) in locals {
            env.bind(name, ty.clone(), true);
        }
        env
    }

    #[test]
    fn test_literal_defaults() {
        let mut env = env_with(&[]);
        assert_eq!(check_expr(&int(1), &mut env).unwrap(), Type::I64);
        assert_eq!(check_expr(&float(1.0), &mut env).unwrap(), Type::F64);
        assert_eq!(check_expr(&add(int(1), float(2.0)), &mut env).unwrap(), Type::F64);
    }

    #[test]
    fn test_literal_takes_operand_type() {
        let mut env = env_with(&[("x", Type::U8)]);
        assert_eq!(check_expr(&add(var("x"), int(1)), &mut env).unwrap(), Type::U8);
        assert_eq!(check_expr(&add(int(1), var("x")), &mut env).unwrap(), Type::U8);
        let err = check_expr(&add(var("x"), int(300)), &mut env).unwrap_err();
        assert_eq!(err.kind, TypeErrorKind::Mismatch);
    }

    #[test]
    fn test_promotion_in_arith() {
        let mut env = env_with(&[("a", Type::I64), ("b", Type::F32), ("c", Type::U32)]);
        assert_eq!(check_expr(&add(var("a"), var("b")), &mut env).unwrap(), Type::F64);
        let err = check_expr(&add(var("a"), var("c")), &mut env);
        assert!(err.is_ok(), "u32 widens into i64");
        let mut env = env_with(&[("a", Type::I32), ("c", Type::U32), ("s", Type::I8), ("w", Type::U64)]);
        assert_eq!(check_expr(&add(var("a"), var("c")), &mut env).unwrap(), Type::U32);
        assert_eq!(check_expr(&mul(var("s"), var("w")), &mut env).unwrap(), Type::U64);
        assert_eq!(check_expr(&lt(var("s"), var("w")), &mut env).unwrap(), Type::BOOL);
    }

    #[test]
    fn test_oversized_types_rejected() {
        let huge = Type::Vector(Box::new(Type::F64), usize::MAX / 4);
        let m = module(vec![func("f", vec![param("v", huge)], Type::I64, vec![ret(sint(0))])]);
        assert_eq!(
            TypeChecker::check_module(&m).unwrap_err().kind,
            TypeErrorKind::ShapeMismatch
        );

        let tall = Type::Tensor(Box::new(Type::F64), vec![Dim::Fixed(1 << 33), Dim::Fixed(1)]);
        let wide = Type::Tensor(Box::new(Type::F64), vec![Dim::Fixed(1), Dim::Fixed(1 << 33)]);
        let mut env = env_with(&[("a", tall), ("b", wide)]);
        let err = check_expr(&intrinsic(Intrinsic::MatMul, vec![var("a"), var("b")]), &mut env).unwrap_err();
        assert_eq!(err.kind, TypeErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_unknown_symbol_has_location() {
        let mut env = env_with(&[]);
        let mut e = var("nope");
        e.span = Span::new(4, 2);
        let err = check_expr(&e, &mut env).unwrap_err();
        assert_eq!(err.kind, TypeErrorKind::UnknownSymbol);
        assert_eq!(err.location, Some(Span::new(4, 2)));
    }

    #[test]
    fn test_static_shape_mismatch() {
        let v3 = Type::Vector(Box::new(Type::F64), 3);
        let v4 = Type::Vector(Box::new(Type::F64), 4);
        let mut env = env_with(&[("a", v3.clone()), ("b", v4)]);
        let err = check_expr(&add(var("a"), var("b")), &mut env).unwrap_err();
        assert_eq!(err.kind, TypeErrorKind::ShapeMismatch);

        let t_fixed = Type::Tensor(Box::new(Type::F64), vec![Dim::Fixed(3)]);
        let t_dyn = Type::Tensor(Box::new(Type::F64), vec![Dim::Dynamic]);
        let mut env = env_with(&[("a", t_fixed.clone()), ("b", t_dyn)]);
        assert_eq!(check_expr(&add(var("a"), var("b")), &mut env).unwrap(), t_fixed);
    }

    #[test]
    fn test_scale_and_intrinsics() {
        let v3 = Type::Vector(Box::new(Type::F64), 3);
        let mut env = env_with(&[("v", v3.clone())]);
        assert_eq!(check_expr(&mul(int(2), var("v")), &mut env).unwrap(), v3);
        assert_eq!(
            check_expr(&intrinsic(Intrinsic::Sum, vec![var("v")]), &mut env).unwrap(),
            Type::F64
        );
        assert_eq!(
            check_expr(&intrinsic(Intrinsic::Dim(0), vec![var("v")]), &mut env).unwrap(),
            Type::I64
        );
        assert_eq!(
            check_expr(&intrinsic(Intrinsic::Dim(1), vec![var("v")]), &mut env)
                .unwrap_err()
                .kind,
            TypeErrorKind::ShapeMismatch
        );
    }

    #[test]
    fn test_complex_promotion() {
        let c32 = Type::complex(ScalarKind::F32);
        let mut env = env_with(&[("z", c32.clone()), ("n", Type::I64)]);
        assert_eq!(check_expr(&add(var("z"), float(1.0)), &mut env).unwrap(), c32);
        assert_eq!(
            check_expr(&add(var("z"), var("n")), &mut env).unwrap(),
            Type::complex(ScalarKind::F64)
        );
        assert_eq!(
            check_expr(&intrinsic(Intrinsic::Re, vec![var("z")]), &mut env).unwrap(),
            Type::F32
        );
    }

    #[test]
    fn test_arity_mismatch() {
        let m = module(vec![
            func("f", vec![param("a", Type::I32)], Type::I32, vec![ret(var("a"))]),
            func("g", vec![], Type::I32, vec![ret(call("f", vec![]))]),
        ]);
        let err = TypeChecker::check_module(&m).unwrap_err();
        assert_eq!(err.kind, TypeErrorKind::ArityMismatch);
    }

    #[test]
    fn test_assign_to_immutable_rejected() {
        let m = module(vec![func(
            "f",
            vec![],
            Type::I32,
            vec![let_("x", int(1)), assign("x", int(2)), ret(int(0))],
        )]);
        assert!(TypeChecker::check_module(&m).is_err());
    }

    #[test]
    fn test_reference_param_rejected() {
        let r = Type::Reference(Box::new(Type::I32), Mutability::Mutable);
        let m = module(vec![func("f", vec![param("r", r)], Type::unit(), vec![])]);
        assert!(TypeChecker::check_module(&m).is_err());
    }

    #[test]
    fn test_shadowing_gets_fresh_local() {
        let m = module(vec![func(
            "f",
            vec![],
            Type::F64,
            vec![let_("x", int(1)), let_("x", float(2.0)), ret(var("x"))],
        )]);
        let funcs = TypeChecker::check_module(&m).unwrap();
        assert_eq!(funcs[0].locals.len(), 2);
        assert_eq!(funcs[0].locals[1].ty, Type::F64);
    }

    #[test]
    fn test_break_outside_loop() {
        let m = module(vec![func("f", vec![], Type::unit(), vec![brk()])]);
        assert!(TypeChecker::check_module(&m).is_err());
    }
}
