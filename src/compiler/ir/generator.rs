//! IR Generator - lowers the typed tree to SSA
//!
//! ## Strategy
//!
//! The checker already gave every binding a unique [`LocalId`], so lowering
//! keeps one map from binding to its current SSA register and threads it
//! through control flow:
//!
//! | Construct | Lowering |
//! |-----------|----------|
//! | `if` statement | `then`/`else` blocks; a join block only when a branch falls through, with phis for bindings whose values differ |
//! | `while` | header block with phis for bindings assigned in the body, body block, exit block merging the false edge and every `break` |
//! | `&&` / `\|\|` | branch around the right operand plus a bool phi |
//! | `if` expression | two arms joined by one phi |
//! | address-taken binding | a stack slot with `Load`/`Store` instead of SSA values |
//!
//! Block ids are allocated in creation order, so a loop header always has a
//! smaller id than its body and every back edge jumps to a block id `<=` its
//! source. Statements after `return`, `break` or `continue` are unreachable
//! and are not lowered.

use super::instruction::{BlockId, ComplexPart, ComplexUnaryOp, Instruction, IrReg, Terminator};
use super::program::{BasicBlock, IrFunction, IrModule};
use crate::compiler::constants::ConstantPool;
use crate::error::{LoweringError, LoweringErrorKind};
use crate::numeric::{ScalarKind, UnaryOp};
use crate::runtime::TypedValue;
use crate::types::typed::{LocalId, TExpr, TExprKind, TFunction, TStmt, TStmtKind};
use crate::types::{Mutability, Type, TypeId, TypeTable};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

type LowerResult<T> = std::result::Result<T, LoweringError>;

/// Binding to current SSA value (ordered so phi creation is deterministic)
type ValueMap = BTreeMap<LocalId, IrReg>;

/// Lower every checked function into one module sharing a type table and a
/// constant pool
pub fn lower_module(functions: &[TFunction]) -> LowerResult<IrModule> {
    let mut types = TypeTable::new();
    let mut constants = ConstantPool::new();
    let mut lowered = Vec::with_capacity(functions.len());
    for func in functions {
        lowered.push(IrGenerator::new(&mut types, &mut constants, func).lower()?);
    }
    Ok(IrModule {
        types,
        constants,
        functions: lowered,
    })
}

struct PendingBlock {
    label: String,
    instructions: Vec<Instruction>,
    terminator: Option<Terminator>,
}

struct LoopContext {
    header: BlockId,
    exit: BlockId,
    /// Edges back to the header with the values live on each
    continues: Vec<(BlockId, ValueMap)>,
    /// Edges into the exit block with the values live on each
    breaks: Vec<(BlockId, ValueMap)>,
}

/// Lowers one [`TFunction`] to an [`IrFunction`]
pub struct IrGenerator<'a> {
    types: &'a mut TypeTable,
    constants: &'a mut ConstantPool,
    func: &'a TFunction,
    blocks: Vec<PendingBlock>,
    reg_types: Vec<TypeId>,
    slot_types: Vec<TypeId>,
    /// Block receiving instructions; `None` after a terminator
    current: Option<BlockId>,
    values: ValueMap,
    /// Address-taken bindings and the register holding their slot address
    slots: HashMap<LocalId, IrReg>,
    loops: Vec<LoopContext>,
}

impl<'a> IrGenerator<'a> {
    /// Create a generator writing types and constants into shared tables
    pub fn new(types: &'a mut TypeTable, constants: &'a mut ConstantPool, func: &'a TFunction) -> Self {
        Self {
            types,
            constants,
            func,
            blocks: Vec::new(),
            reg_types: Vec::new(),
            slot_types: Vec::new(),
            current: None,
            values: ValueMap::new(),
            slots: HashMap::new(),
            loops: Vec::new(),
        }
    }

    /// Lower the function
    pub fn lower(mut self) -> LowerResult<IrFunction> {
        let func = self.func;
        let entry = self.new_block("entry");
        self.current = Some(entry);

        let mut params = Vec::with_capacity(func.params.len());
        for &local in &func.params {
            let info = func.local(local);
            let reg = self.new_reg(&info.ty);
            params.push(reg);
            if info.address_taken {
                self.spill(local, reg)?;
            } else {
                self.values.insert(local, reg);
            }
        }

        self.lower_stmts(&func.body)?;

        if let Some(block) = self.current {
            if !func.ret.is_unit() {
                return Err(self
                    .error(
                        LoweringErrorKind::MissingReturn,
                        format!("control can reach the end of a function returning {}", func.ret),
                    )
                    .at(func.span));
            }
            let unit = self.unit_value()?;
            self.terminate(block, Terminator::Return(unit));
            self.current = None;
        }

        let lowered = self.finish(params)?;
        debug!(
            function = %lowered.name,
            blocks = lowered.blocks.len(),
            registers = lowered.reg_count(),
            "lowered function to IR"
        );
        Ok(lowered)
    }

    // ========================================================================
    // Builders
    // ========================================================================

    fn error(&self, kind: LoweringErrorKind, message: impl Into<String>) -> LoweringError {
        LoweringError::new(kind, self.func.name.clone(), message)
    }

    fn internal(&self, message: impl Into<String>) -> LoweringError {
        self.error(LoweringErrorKind::Unsupported, message)
    }

    fn new_block(&mut self, prefix: &str) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        let label = if id.0 == 0 {
            prefix.to_string()
        } else {
            format!("{}{}", prefix, id.0)
        };
        self.blocks.push(PendingBlock {
            label,
            instructions: Vec::new(),
            terminator: None,
        });
        id
    }

    fn new_reg(&mut self, ty: &Type) -> IrReg {
        let reg = IrReg(self.reg_types.len() as u32);
        let id = self.types.intern(ty);
        self.reg_types.push(id);
        reg
    }

    fn current_block(&self) -> LowerResult<BlockId> {
        self.current
            .ok_or_else(|| self.internal("code emitted after a terminator"))
    }

    fn emit(&mut self, instr: Instruction) -> LowerResult<()> {
        let block = self.current_block()?;
        self.blocks[block.0 as usize].instructions.push(instr);
        Ok(())
    }

    /// Allocate a register of `ty` and emit the instruction defining it
    fn define(&mut self, ty: &Type, build: impl FnOnce(IrReg) -> Instruction) -> LowerResult<IrReg> {
        let dst = self.new_reg(ty);
        self.emit(build(dst))?;
        Ok(dst)
    }

    fn terminate(&mut self, block: BlockId, terminator: Terminator) {
        let pending = &mut self.blocks[block.0 as usize];
        if pending.terminator.is_none() {
            pending.terminator = Some(terminator);
        }
    }

    fn finish(self, params: Vec<IrReg>) -> LowerResult<IrFunction> {
        let func = self.func;
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (i, pending) in self.blocks.into_iter().enumerate() {
            let Some(terminator) = pending.terminator else {
                return Err(LoweringError::new(
                    LoweringErrorKind::Unsupported,
                    func.name.clone(),
                    format!("block {} has no terminator", pending.label),
                ));
            };
            blocks.push(BasicBlock {
                id: BlockId(i as u32),
                label: pending.label,
                instructions: pending.instructions,
                terminator,
            });
        }
        Ok(IrFunction {
            id: func.id,
            name: func.name.clone(),
            params,
            ret_type: self.types.intern(&func.ret),
            blocks,
            reg_types: self.reg_types,
            slot_types: self.slot_types,
        })
    }

    fn unit_value(&mut self) -> LowerResult<IrReg> {
        self.define(&Type::unit(), |dst| Instruction::MakeStruct {
            dst,
            fields: Vec::new(),
        })
    }

    // ========================================================================
    // Bindings
    // ========================================================================

    /// Move a binding into a fresh stack slot initialized with `value`
    fn spill(&mut self, local: LocalId, value: IrReg) -> LowerResult<()> {
        let ty = self.func.local(local).ty.clone();
        let slot = self.slot_types.len() as u32;
        let slot_ty = self.types.intern(&ty);
        self.slot_types.push(slot_ty);
        let ref_ty = Type::Reference(Box::new(ty), Mutability::Mutable);
        let addr = self.define(&ref_ty, |dst| Instruction::StackSlot { dst, slot })?;
        self.emit(Instruction::Store { addr, value })?;
        self.slots.insert(local, addr);
        Ok(())
    }

    fn read_local(&mut self, local: LocalId) -> LowerResult<IrReg> {
        if let Some(&addr) = self.slots.get(&local) {
            let ty = self.func.local(local).ty.clone();
            return self.define(&ty, |dst| Instruction::Load { dst, addr });
        }
        match self.values.get(&local) {
            Some(reg) => Ok(*reg),
            None => Err(self.internal(format!(
                "binding `{}` read before it is defined",
                self.func.local(local).name
            ))),
        }
    }

    fn write_local(&mut self, local: LocalId, value: IrReg) -> LowerResult<()> {
        if let Some(&addr) = self.slots.get(&local) {
            return self.emit(Instruction::Store { addr, value });
        }
        self.values.insert(local, value);
        Ok(())
    }

    /// Merge the values live on several edges into the current (join) block.
    /// Only bindings of `scope` survive; phis are emitted before anything else.
    fn merge(&mut self, scope: &ValueMap, exits: &[(BlockId, ValueMap)]) -> LowerResult<()> {
        let mut merged = ValueMap::new();
        for (&local, &base) in scope {
            let incoming: Vec<(BlockId, IrReg)> = exits
                .iter()
                .map(|(block, map)| (*block, map.get(&local).copied().unwrap_or(base)))
                .collect();
            let first = incoming.first().map_or(base, |(_, r)| *r);
            if incoming.iter().all(|(_, r)| *r == first) {
                merged.insert(local, first);
                continue;
            }
            let ty = self.func.local(local).ty.clone();
            let phi = self.define(&ty, |dst| Instruction::Phi { dst, incoming })?;
            merged.insert(local, phi);
        }
        self.values = merged;
        Ok(())
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn lower_stmts(&mut self, stmts: &[TStmt]) -> LowerResult<()> {
        for stmt in stmts {
            if self.current.is_none() {
                break;
            }
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &TStmt) -> LowerResult<()> {
        match &stmt.kind {
            TStmtKind::Let { local, value } => {
                let v = self.lower_expr(value)?;
                if self.func.local(*local).address_taken {
                    self.spill(*local, v)
                } else {
                    self.values.insert(*local, v);
                    Ok(())
                }
            }
            TStmtKind::Assign { local, value } => {
                let v = self.lower_expr(value)?;
                self.write_local(*local, v)
            }
            TStmtKind::AssignField {
                local,
                index,
                value,
            } => {
                let v = self.lower_expr(value)?;
                let src = self.read_local(*local)?;
                let ty = self.func.local(*local).ty.clone();
                let index = *index;
                let updated = self.define(&ty, |dst| Instruction::InsertField {
                    dst,
                    src,
                    index,
                    value: v,
                })?;
                self.write_local(*local, updated)
            }
            TStmtKind::Store { target, value } => {
                let addr = self.lower_expr(target)?;
                let value = self.lower_expr(value)?;
                self.emit(Instruction::Store { addr, value })
            }
            TStmtKind::If {
                cond,
                then_body,
                else_body,
            } => self.lower_if(cond, then_body, else_body),
            TStmtKind::While { cond, body } => self.lower_while(cond, body),
            TStmtKind::Break => {
                let block = self.current_block()?;
                let values = self.values.clone();
                let func = self.func;
                let ctx = self.loops.last_mut().ok_or_else(|| {
                    LoweringError::new(LoweringErrorKind::Unsupported, func.name.clone(), "break outside a loop")
                })?;
                let exit = ctx.exit;
                ctx.breaks.push((block, values));
                self.terminate(block, Terminator::Jump(exit));
                self.current = None;
                Ok(())
            }
            TStmtKind::Continue => {
                let block = self.current_block()?;
                let values = self.values.clone();
                let func = self.func;
                let ctx = self.loops.last_mut().ok_or_else(|| {
                    LoweringError::new(LoweringErrorKind::Unsupported, func.name.clone(), "continue outside a loop")
                })?;
                let header = ctx.header;
                ctx.continues.push((block, values));
                self.terminate(block, Terminator::Jump(header));
                self.current = None;
                Ok(())
            }
            TStmtKind::Return(value) => {
                let v = self.lower_expr(value)?;
                let block = self.current_block()?;
                self.terminate(block, Terminator::Return(v));
                self.current = None;
                Ok(())
            }
            TStmtKind::Expr(value) => self.lower_expr(value).map(|_| ()),
        }
    }

    fn lower_if(&mut self, cond: &TExpr, then_body: &[TStmt], else_body: &[TStmt]) -> LowerResult<()> {
        let c = self.lower_expr(cond)?;
        let from = self.current_block()?;
        let then_block = self.new_block("then");
        let else_block = self.new_block("else");
        self.terminate(
            from,
            Terminator::Branch {
                cond: c,
                then_block,
                else_block,
            },
        );
        let scope = self.values.clone();

        self.current = Some(then_block);
        self.lower_stmts(then_body)?;
        let then_exit = self.current.map(|b| (b, self.values.clone()));

        self.values = scope.clone();
        self.current = Some(else_block);
        self.lower_stmts(else_body)?;
        let else_exit = self.current.map(|b| (b, self.values.clone()));

        let exits: Vec<(BlockId, ValueMap)> = then_exit.into_iter().chain(else_exit).collect();
        if exits.is_empty() {
            self.values = scope;
            self.current = None;
            return Ok(());
        }
        let join = self.new_block("endif");
        for (block, _) in &exits {
            self.terminate(*block, Terminator::Jump(join));
        }
        self.current = Some(join);
        self.merge(&scope, &exits)
    }

    fn lower_while(&mut self, cond: &TExpr, body: &[TStmt]) -> LowerResult<()> {
        let pre = self.current_block()?;
        let header = self.new_block("loop");
        self.terminate(pre, Terminator::Jump(header));
        self.current = Some(header);

        // Header phis for bindings the body reassigns; back-edge inputs are
        // appended once the body is lowered.
        let mut assigned = Vec::new();
        TExpr::collect_assigned(body, &mut assigned);
        assigned.sort();
        let mut header_phis = Vec::new();
        for local in assigned {
            let Some(&init) = self.values.get(&local) else {
                continue;
            };
            let ty = self.func.local(local).ty.clone();
            let index = self.blocks[header.0 as usize].instructions.len();
            let phi = self.define(&ty, |dst| Instruction::Phi {
                dst,
                incoming: vec![(pre, init)],
            })?;
            self.values.insert(local, phi);
            header_phis.push((local, index, phi));
        }

        let c = self.lower_expr(cond)?;
        let cond_end = self.current_block()?;
        let body_block = self.new_block("body");
        let exit = self.new_block("endloop");
        self.terminate(
            cond_end,
            Terminator::Branch {
                cond: c,
                then_block: body_block,
                else_block: exit,
            },
        );
        let at_header = self.values.clone();
        self.loops.push(LoopContext {
            header,
            exit,
            continues: Vec::new(),
            breaks: vec![(cond_end, at_header.clone())],
        });

        self.current = Some(body_block);
        self.lower_stmts(body)?;
        let fallthrough = self.current.map(|b| (b, self.values.clone()));
        let Some(mut ctx) = self.loops.pop() else {
            return Err(self.internal("loop context lost"));
        };
        if let Some((block, values)) = fallthrough {
            self.terminate(block, Terminator::Jump(header));
            ctx.continues.push((block, values));
        }

        for (local, index, phi) in &header_phis {
            let extra: Vec<(BlockId, IrReg)> = ctx
                .continues
                .iter()
                .map(|(block, map)| (*block, map.get(local).copied().unwrap_or(*phi)))
                .collect();
            if let Some(Instruction::Phi { incoming, .. }) =
                self.blocks[header.0 as usize].instructions.get_mut(*index)
            {
                incoming.extend(extra);
            }
        }

        self.current = Some(exit);
        self.merge(&at_header, &ctx.breaks)
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn scalar_kind(&self, ty: &Type) -> LowerResult<ScalarKind> {
        ty.scalar_kind()
            .ok_or_else(|| self.internal(format!("expected a primitive type, found {}", ty)))
    }

    fn complex_elem(&self, ty: &Type) -> LowerResult<ScalarKind> {
        ty.complex_elem()
            .ok_or_else(|| self.internal(format!("expected a complex type, found {}", ty)))
    }

    fn lower_all(&mut self, exprs: &[TExpr]) -> LowerResult<Vec<IrReg>> {
        exprs.iter().map(|e| self.lower_expr(e)).collect()
    }

    fn lower_expr(&mut self, expr: &TExpr) -> LowerResult<IrReg> {
        let ty = &expr.ty;
        match &expr.kind {
            TExprKind::Const(value) => {
                let id = self.constants.intern(value.clone());
                self.define(ty, |dst| Instruction::Const { dst, value: id })
            }
            TExprKind::Local(local) => self.read_local(*local),
            TExprKind::FuncRef(func) => {
                let func = *func;
                self.define(ty, |dst| Instruction::FuncRef { dst, func })
            }
            TExprKind::Arith {
                op,
                lhs,
                rhs,
                checked,
            } => {
                let l = self.lower_expr(lhs)?;
                let r = self.lower_expr(rhs)?;
                let (op, checked) = (*op, *checked);
                if let Some(kind) = ty.scalar_kind() {
                    self.define(ty, |dst| Instruction::Binary {
                        dst,
                        op,
                        kind,
                        lhs: l,
                        rhs: r,
                        checked,
                    })
                } else if let Some(elem) = ty.complex_elem() {
                    self.define(ty, |dst| Instruction::ComplexBinary {
                        dst,
                        op,
                        elem,
                        lhs: l,
                        rhs: r,
                    })
                } else if ty.is_container() {
                    self.define(ty, |dst| Instruction::TensorBinary {
                        dst,
                        op,
                        lhs: l,
                        rhs: r,
                        checked,
                    })
                } else {
                    Err(self
                        .internal(format!("arithmetic on {}", ty))
                        .at(expr.span))
                }
            }
            TExprKind::Scale {
                tensor,
                factor,
                checked,
            } => {
                let t = self.lower_expr(tensor)?;
                let f = self.lower_expr(factor)?;
                let checked = *checked;
                self.define(ty, |dst| Instruction::TensorScale {
                    dst,
                    tensor: t,
                    factor: f,
                    checked,
                })
            }
            TExprKind::Compare { op, lhs, rhs } => {
                let l = self.lower_expr(lhs)?;
                let r = self.lower_expr(rhs)?;
                let op = *op;
                if let Some(kind) = lhs.ty.scalar_kind() {
                    self.define(ty, |dst| Instruction::Compare {
                        dst,
                        op,
                        kind,
                        lhs: l,
                        rhs: r,
                    })
                } else {
                    let elem = self.complex_elem(&lhs.ty)?;
                    self.define(ty, |dst| Instruction::ComplexCompare {
                        dst,
                        op,
                        elem,
                        lhs: l,
                        rhs: r,
                    })
                }
            }
            TExprKind::Logical { is_and, lhs, rhs } => self.lower_logical(*is_and, lhs, rhs),
            TExprKind::Neg { operand, checked } => {
                let src = self.lower_expr(operand)?;
                let checked = *checked;
                if let Some(kind) = ty.scalar_kind() {
                    self.define(ty, |dst| Instruction::Unary {
                        dst,
                        op: UnaryOp::Neg,
                        kind,
                        src,
                        checked,
                    })
                } else {
                    let elem = self.complex_elem(ty)?;
                    self.define(ty, |dst| Instruction::ComplexUnary {
                        dst,
                        op: ComplexUnaryOp::Neg,
                        elem,
                        src,
                    })
                }
            }
            TExprKind::Not(operand) => self.lower_unary(ty, UnaryOp::Not, operand),
            TExprKind::Sqrt(operand) => self.lower_unary(ty, UnaryOp::Sqrt, operand),
            TExprKind::Abs(operand) => self.lower_unary(ty, UnaryOp::Abs, operand),
            TExprKind::Part { part, operand } => {
                let src = self.lower_expr(operand)?;
                let elem = self.complex_elem(&operand.ty)?;
                let part = *part;
                self.define(ty, |dst| Instruction::ComplexPart {
                    dst,
                    part,
                    elem,
                    src,
                })
            }
            TExprKind::Conj(operand) => {
                let src = self.lower_expr(operand)?;
                let elem = self.complex_elem(ty)?;
                self.define(ty, |dst| Instruction::ComplexUnary {
                    dst,
                    op: ComplexUnaryOp::Conj,
                    elem,
                    src,
                })
            }
            TExprKind::Convert(operand) => {
                let src = self.lower_expr(operand)?;
                self.convert(src, &operand.ty, ty)
            }
            TExprKind::TensorCast(operand) => {
                let src = self.lower_expr(operand)?;
                self.define(ty, |dst| Instruction::TensorCast { dst, src })
            }
            TExprKind::MakeComplex { re, im } => {
                let re = self.lower_expr(re)?;
                let im = self.lower_expr(im)?;
                let elem = self.complex_elem(ty)?;
                self.define(ty, |dst| Instruction::MakeComplex { dst, elem, re, im })
            }
            TExprKind::Call { func, args } => {
                let args = self.lower_all(args)?;
                let func = *func;
                self.define(ty, |dst| Instruction::Call { dst, func, args })
            }
            TExprKind::CallIndirect { callee, args } => {
                let callee = self.lower_expr(callee)?;
                let args = self.lower_all(args)?;
                self.define(ty, |dst| Instruction::CallIndirect { dst, callee, args })
            }
            TExprKind::If {
                cond,
                then_expr,
                else_expr,
            } => self.lower_select(ty, cond, then_expr, else_expr),
            TExprKind::MakeTensor(elements) => {
                let elements = self.lower_all(elements)?;
                self.define(ty, |dst| Instruction::MakeTensor { dst, elements })
            }
            TExprKind::MakeStruct(fields) => {
                let fields = self.lower_all(fields)?;
                self.define(ty, |dst| Instruction::MakeStruct { dst, fields })
            }
            TExprKind::Field { base, index } => {
                let src = self.lower_expr(base)?;
                let index = *index;
                self.define(ty, |dst| Instruction::ExtractField { dst, src, index })
            }
            TExprKind::Index { base, indices } => {
                let src = self.lower_expr(base)?;
                let indices = self.lower_all(indices)?;
                self.define(ty, |dst| Instruction::ExtractElement { dst, src, indices })
            }
            TExprKind::Sum(operand) => {
                let src = self.lower_expr(operand)?;
                self.define(ty, |dst| Instruction::Sum { dst, src })
            }
            TExprKind::Dot(a, b) => {
                let lhs = self.lower_expr(a)?;
                let rhs = self.lower_expr(b)?;
                self.define(ty, |dst| Instruction::Dot { dst, lhs, rhs })
            }
            TExprKind::MatMul(a, b) => {
                let lhs = self.lower_expr(a)?;
                let rhs = self.lower_expr(b)?;
                self.define(ty, |dst| Instruction::MatMul { dst, lhs, rhs })
            }
            TExprKind::Dim { operand, axis } => {
                let src = self.lower_expr(operand)?;
                let axis = *axis;
                self.define(ty, |dst| Instruction::Dim { dst, src, axis })
            }
            TExprKind::Ref(local) => match self.slots.get(local) {
                Some(addr) => Ok(*addr),
                None => Err(self
                    .internal(format!(
                        "reference to `{}` which has no stack slot",
                        self.func.local(*local).name
                    ))
                    .at(expr.span)),
            },
            TExprKind::Deref(operand) => {
                let addr = self.lower_expr(operand)?;
                self.define(ty, |dst| Instruction::Load { dst, addr })
            }
        }
    }

    fn lower_unary(&mut self, ty: &Type, op: UnaryOp, operand: &TExpr) -> LowerResult<IrReg> {
        let src = self.lower_expr(operand)?;
        let kind = self.scalar_kind(ty)?;
        self.define(ty, |dst| Instruction::Unary {
            dst,
            op,
            kind,
            src,
            checked: false,
        })
    }

    /// `a && b` branches to `b` only when `a` is true; `a || b` only when false
    fn lower_logical(&mut self, is_and: bool, lhs: &TExpr, rhs: &TExpr) -> LowerResult<IrReg> {
        let a = self.lower_expr(lhs)?;
        let lhs_end = self.current_block()?;
        let rhs_block = self.new_block(if is_and { "and" } else { "or" });
        let join = self.new_block("sc");
        let (then_block, else_block) = if is_and {
            (rhs_block, join)
        } else {
            (join, rhs_block)
        };
        self.terminate(
            lhs_end,
            Terminator::Branch {
                cond: a,
                then_block,
                else_block,
            },
        );
        self.current = Some(rhs_block);
        let b = self.lower_expr(rhs)?;
        let rhs_end = self.current_block()?;
        self.terminate(rhs_end, Terminator::Jump(join));
        self.current = Some(join);
        self.define(&Type::BOOL, |dst| Instruction::Phi {
            dst,
            incoming: vec![(lhs_end, a), (rhs_end, b)],
        })
    }

    fn lower_select(&mut self, ty: &Type, cond: &TExpr, then_expr: &TExpr, else_expr: &TExpr) -> LowerResult<IrReg> {
        let c = self.lower_expr(cond)?;
        let from = self.current_block()?;
        let then_block = self.new_block("then");
        let else_block = self.new_block("else");
        self.terminate(
            from,
            Terminator::Branch {
                cond: c,
                then_block,
                else_block,
            },
        );
        self.current = Some(then_block);
        let t = self.lower_expr(then_expr)?;
        let then_end = self.current_block()?;
        self.current = Some(else_block);
        let e = self.lower_expr(else_expr)?;
        let else_end = self.current_block()?;
        let join = self.new_block("join");
        self.terminate(then_end, Terminator::Jump(join));
        self.terminate(else_end, Terminator::Jump(join));
        self.current = Some(join);
        self.define(ty, |dst| Instruction::Phi {
            dst,
            incoming: vec![(then_end, t), (else_end, e)],
        })
    }

    /// Scalar to scalar, real to complex, or complex to complex
    fn convert(&mut self, src: IrReg, from: &Type, to: &Type) -> LowerResult<IrReg> {
        if from == to {
            return Ok(src);
        }
        if let (Some(f), Some(t)) = (from.scalar_kind(), to.scalar_kind()) {
            return self.define(to, |dst| Instruction::Convert {
                dst,
                from: f,
                to: t,
                src,
            });
        }
        let elem = self.complex_elem(to)?;
        let elem_ty = Type::from_scalar(elem);
        let (re, im) = if from.scalar_kind().is_some() {
            let re = self.convert(src, from, &elem_ty)?;
            let zero = self.constants.intern(TypedValue::scalar(elem, elem.zero()));
            let im = self.define(&elem_ty, |dst| Instruction::Const { dst, value: zero })?;
            (re, im)
        } else {
            let from_elem = self.complex_elem(from)?;
            let from_elem_ty = Type::from_scalar(from_elem);
            let mut parts = [src, src];
            for (slot, part) in parts.iter_mut().zip([ComplexPart::Re, ComplexPart::Im]) {
                let p = self.define(&from_elem_ty, |dst| Instruction::ComplexPart {
                    dst,
                    part,
                    elem: from_elem,
                    src,
                })?;
                *slot = self.convert(p, &from_elem_ty, &elem_ty)?;
            }
            (parts[0], parts[1])
        };
        self.define(to, |dst| Instruction::MakeComplex { dst, elem, re, im })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::types::TypeChecker;

    fn lower(module: crate::ast::Module) -> IrModule {
        let checked = TypeChecker::check_module(&module).unwrap();
        lower_module(&checked).unwrap()
    }

    fn phis(block: &BasicBlock) -> usize {
        block
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Phi { .. }))
            .count()
    }

    #[test]
    fn test_straight_line() {
        let m = lower(module(vec![func(
            "add",
            vec![param("a", Type::I32), param("b", Type::I32)],
            Type::I32,
            vec![ret(add(var("a"), var("b")))],
        )]));
        let f = &m.functions[0];
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.params, vec![IrReg(0), IrReg(1)]);
        assert!(matches!(
            f.blocks[0].instructions[0],
            Instruction::Binary {
                kind: ScalarKind::I32,
                ..
            }
        ));
        assert!(matches!(f.blocks[0].terminator, Terminator::Return(IrReg(2))));
    }

    #[test]
    fn test_if_merges_with_phi() {
        let m = lower(module(vec![func(
            "pick",
            vec![param("c", Type::BOOL)],
            Type::I64,
            vec![
                let_mut("x", int(1)),
                if_(var("c"), vec![assign("x", int(2))], vec![]),
                ret(var("x")),
            ],
        )]));
        let f = &m.functions[0];
        let join = f.blocks.last().unwrap();
        assert_eq!(join.label, "endif3");
        assert_eq!(phis(join), 1);
    }

    #[test]
    fn test_both_branches_return_no_join() {
        let m = lower(module(vec![func(
            "sign",
            vec![param("x", Type::I64)],
            Type::I64,
            vec![if_(
                lt(var("x"), int(0)),
                vec![ret(sint(-1))],
                vec![ret(int(1))],
            )],
        )]));
        assert_eq!(m.functions[0].blocks.len(), 3);
    }

    #[test]
    fn test_loop_header_phis_and_back_edge() {
        let m = lower(module(vec![func(
            "count",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                let_mut("i", int(0)),
                let_mut("acc", int(0)),
                while_(
                    lt(var("i"), var("n")),
                    vec![assign("acc", add(var("acc"), var("i"))), assign("i", add(var("i"), int(1)))],
                ),
                ret(var("acc")),
            ],
        )]));
        let f = &m.functions[0];
        let header = &f.blocks[1];
        assert_eq!(header.label, "loop1");
        assert_eq!(phis(header), 2);
        for instr in &header.instructions {
            if let Instruction::Phi { incoming, .. } = instr {
                assert_eq!(incoming.len(), 2);
            }
        }
        let preds = f.predecessors();
        assert!(preds[1].iter().any(|p| p.0 >= 1));
    }

    #[test]
    fn test_break_merges_at_exit() {
        let m = lower(module(vec![func(
            "first_over",
            vec![param("limit", Type::I64)],
            Type::I64,
            vec![
                let_mut("i", int(0)),
                while_(
                    boolean(true),
                    vec![
                        if_(gt(var("i"), var("limit")), vec![brk()], vec![]),
                        assign("i", add(var("i"), int(1))),
                    ],
                ),
                ret(var("i")),
            ],
        )]));
        let f = &m.functions[0];
        let exit = f.blocks.iter().find(|b| b.label.starts_with("endloop")).unwrap();
        assert_eq!(f.predecessors()[exit.id.0 as usize].len(), 2);
    }

    #[test]
    fn test_short_circuit_shape() {
        let m = lower(module(vec![func(
            "both",
            vec![param("a", Type::BOOL), param("b", Type::BOOL)],
            Type::BOOL,
            vec![ret(and(var("a"), var("b")))],
        )]));
        let f = &m.functions[0];
        assert_eq!(f.blocks.len(), 3);
        match &f.blocks[0].terminator {
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => {
                assert_eq!(*then_block, BlockId(1));
                assert_eq!(*else_block, BlockId(2));
            }
            other => panic!("unexpected terminator {:?}", other),
        }
        assert_eq!(phis(&f.blocks[2]), 1);
    }

    #[test]
    fn test_missing_return_is_reported() {
        let checked = TypeChecker::check_module(&module(vec![func(
            "f",
            vec![param("c", Type::BOOL)],
            Type::I32,
            vec![if_(var("c"), vec![ret(int(1))], vec![])],
        )]))
        .unwrap();
        let err = lower_module(&checked).unwrap_err();
        assert_eq!(err.kind, LoweringErrorKind::MissingReturn);
    }

    #[test]
    fn test_unit_function_gets_implicit_return() {
        let m = lower(module(vec![func("noop", vec![], Type::unit(), vec![])]));
        let f = &m.functions[0];
        assert!(matches!(f.blocks[0].instructions[0], Instruction::MakeStruct { .. }));
    }

    #[test]
    fn test_address_taken_uses_slot() {
        let m = lower(module(vec![func(
            "bump",
            vec![],
            Type::I64,
            vec![
                let_mut("x", int(1)),
                let_("r", reference("x", true)),
                store(var("r"), int(5)),
                ret(var("x")),
            ],
        )]));
        let f = &m.functions[0];
        assert_eq!(f.slot_types.len(), 1);
        let loads = f.blocks[0]
            .instructions
            .iter()
            .filter(|i| matches!(i, Instruction::Load { .. }))
            .count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn test_real_to_complex_conversion() {
        let m = lower(module(vec![func(
            "lift",
            vec![param("x", Type::F32)],
            Type::complex(ScalarKind::F64),
            vec![ret(var("x"))],
        )]));
        let f = &m.functions[0];
        assert!(f.blocks[0]
            .instructions
            .iter()
            .any(|i| matches!(i, Instruction::MakeComplex { elem: ScalarKind::F64, .. })));
    }
}
