//! # IR Verifier
//!
//! Structural and type checks run on lowered (and optimized) IR before any
//! execution mode sees it. A module that passes is safe for both the
//! interpreter and native lowering to consume without re-checking.
//!
//! ## Checks
//!
//! | Check | Error |
//! |-------|-------|
//! | block ids equal their index, targets in range | `BlockIdMismatch`, `TargetOutOfRange` |
//! | phis lead their block and cover each predecessor once | `MisplacedPhi`, `PhiPredecessorMismatch` |
//! | each register defined once, inside the register table | `MultipleDefinitions`, `RegisterOutOfRange` |
//! | every use is dominated by its definition | `UndefinedRegister`, `UseNotDominated` |
//! | operand and result types agree with the instruction | `TypeMismatch` |
//! | callees and constants exist | `UnknownFunction`, `UnknownConstant` |
//! | register and slot types have a layout | `OversizedType` |

use super::ir::{BlockId, FunctionId, Instruction, IrFunction, IrModule, IrReg, Terminator};
use super::layout::checked_size;
use crate::error::{LoweringError, LoweringErrorKind};
use crate::numeric::{ScalarKind, UnaryOp};
use crate::types::{Type, TypeId};

/// Verification result with warnings
#[derive(Debug)]
pub struct VerifyResult {
    /// Module is valid for execution
    pub valid: bool,
    /// Errors that prevent execution
    pub errors: Vec<Diagnostic>,
    /// Warnings (non-fatal)
    pub warnings: Vec<String>,
    /// Statistics
    pub stats: ModuleStats,
}

impl VerifyResult {
    /// First error as a lowering error, if any
    pub fn into_result(self) -> Result<ModuleStats, LoweringError> {
        match self.errors.into_iter().next() {
            None => Ok(self.stats),
            Some(d) => Err(LoweringError::new(
                LoweringErrorKind::Verification,
                d.function,
                d.error.to_string(),
            )),
        }
    }
}

/// Module statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ModuleStats {
    /// Functions verified
    pub function_count: usize,
    /// Total blocks
    pub block_count: usize,
    /// Total instructions (terminators excluded)
    pub instruction_count: usize,
    /// Total phis
    pub phi_count: usize,
}

/// An error located in one function
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// Function name
    pub function: String,
    /// What is wrong
    pub error: VerifyError,
}

/// Verification error types
#[derive(Debug, Clone, PartialEq)]
pub enum VerifyError {
    /// Function has no blocks
    EmptyFunction,
    /// Block stored at one index claims another id
    BlockIdMismatch {
        /// Index in the block list
        index: usize,
        /// Id the block carries
        found: BlockId,
    },
    /// Terminator targets a block that does not exist
    TargetOutOfRange {
        /// Source block
        block: BlockId,
        /// Missing target
        target: BlockId,
    },
    /// Phi after a non-phi instruction
    MisplacedPhi {
        /// Block
        block: BlockId,
    },
    /// Phi inputs do not match the block's predecessors
    PhiPredecessorMismatch {
        /// Block
        block: BlockId,
        /// Phi destination
        reg: IrReg,
    },
    /// Register defined more than once
    MultipleDefinitions {
        /// Register
        reg: IrReg,
    },
    /// Register outside the function's register table
    RegisterOutOfRange {
        /// Block
        block: BlockId,
        /// Register
        reg: IrReg,
    },
    /// Register used but never defined
    UndefinedRegister {
        /// Block
        block: BlockId,
        /// Register
        reg: IrReg,
    },
    /// Use not dominated by the definition
    UseNotDominated {
        /// Block containing the use
        block: BlockId,
        /// Register
        reg: IrReg,
    },
    /// Operand or result type disagrees with the instruction
    TypeMismatch {
        /// Block
        block: BlockId,
        /// Details
        message: String,
    },
    /// Call to a function id outside the module
    UnknownFunction {
        /// Block
        block: BlockId,
        /// Callee
        func: FunctionId,
    },
    /// Constant id outside the pool
    UnknownConstant {
        /// Block
        block: BlockId,
    },
    /// Register or slot type whose size overflows the address space
    OversizedType {
        /// Interned type
        ty: TypeId,
    },
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::EmptyFunction => write!(f, "function has no blocks"),
            VerifyError::BlockIdMismatch { index, found } => {
                write!(f, "block at index {} carries id {}", index, found)
            }
            VerifyError::TargetOutOfRange { block, target } => {
                write!(f, "{} jumps to missing block {}", block, target)
            }
            VerifyError::MisplacedPhi { block } => {
                write!(f, "phi after a non-phi instruction in {}", block)
            }
            VerifyError::PhiPredecessorMismatch { block, reg } => {
                write!(f, "phi {} in {} does not cover its predecessors exactly once", reg, block)
            }
            VerifyError::MultipleDefinitions { reg } => write!(f, "{} is defined more than once", reg),
            VerifyError::RegisterOutOfRange { block, reg } => {
                write!(f, "{} in {} is outside the register table", reg, block)
            }
            VerifyError::UndefinedRegister { block, reg } => {
                write!(f, "{} used in {} is never defined", reg, block)
            }
            VerifyError::UseNotDominated { block, reg } => {
                write!(f, "use of {} in {} is not dominated by its definition", reg, block)
            }
            VerifyError::TypeMismatch { block, message } => {
                write!(f, "type mismatch in {}: {}", block, message)
            }
            VerifyError::UnknownFunction { block, func } => {
                write!(f, "{} calls unknown function {}", block, func)
            }
            VerifyError::UnknownConstant { block } => write!(f, "unknown constant in {}", block),
            VerifyError::OversizedType { ty } => write!(f, "type {} is too large to lay out", ty),
        }
    }
}

/// Verify every function of a module
pub fn verify_module(module: &IrModule) -> VerifyResult {
    IrVerifier::new().verify(module)
}

/// IR verifier
pub struct IrVerifier {
    /// Report unreachable blocks as errors instead of warnings
    strict: bool,
}

impl IrVerifier {
    /// Creates a verifier that only warns about unreachable blocks
    pub fn new() -> Self {
        Self { strict: false }
    }

    /// Enable strict mode
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Verify a module
    pub fn verify(&self, module: &IrModule) -> VerifyResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut stats = ModuleStats {
            function_count: module.functions.len(),
            ..ModuleStats::default()
        };

        for func in &module.functions {
            stats.block_count += func.blocks.len();
            stats.instruction_count += func.instruction_count();
            stats.phi_count += func
                .blocks
                .iter()
                .flat_map(|b| &b.instructions)
                .filter(|i| matches!(i, Instruction::Phi { .. }))
                .count();
            for id in func.reg_types.iter().chain(&func.slot_types) {
                if module.ty(*id).is_some_and(|ty| checked_size(ty).is_none()) {
                    errors.push(Diagnostic {
                        function: func.name.clone(),
                        error: VerifyError::OversizedType { ty: *id },
                    });
                }
            }
            let mut check = FunctionCheck {
                module,
                func,
                errors: Vec::new(),
            };
            let unreachable = check.run();
            for block in unreachable {
                warnings.push(format!("{}: {} is unreachable", func.name, block));
            }
            errors.extend(check.errors.into_iter().map(|error| Diagnostic {
                function: func.name.clone(),
                error,
            }));
        }

        let valid = errors.is_empty() && (!self.strict || warnings.is_empty());
        VerifyResult {
            valid,
            errors,
            warnings,
            stats,
        }
    }
}

impl Default for IrVerifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Definition site: block and position (0 = parameters, instruction i at i + 1)
type Site = (usize, usize);

struct FunctionCheck<'a> {
    module: &'a IrModule,
    func: &'a IrFunction,
    errors: Vec<VerifyError>,
}

impl<'a> FunctionCheck<'a> {
    /// Run every check; returns unreachable blocks
    fn run(&mut self) -> Vec<BlockId> {
        let func = self.func;
        if func.blocks.is_empty() {
            self.errors.push(VerifyError::EmptyFunction);
            return Vec::new();
        }
        let n = func.blocks.len();
        for (index, block) in func.blocks.iter().enumerate() {
            if block.id.0 as usize != index {
                self.errors.push(VerifyError::BlockIdMismatch {
                    index,
                    found: block.id,
                });
            }
            for target in block.terminator.successors() {
                if target.0 as usize >= n {
                    self.errors.push(VerifyError::TargetOutOfRange {
                        block: block.id,
                        target,
                    });
                }
            }
        }
        if !self.errors.is_empty() {
            return Vec::new();
        }

        let defs = self.definitions();
        let preds = func.predecessors();
        let dom = dominators(n, &preds);
        let mut unreachable = Vec::new();

        for (b, block) in func.blocks.iter().enumerate() {
            if dom[b].is_none() {
                unreachable.push(block.id);
                continue;
            }
            let mut seen_non_phi = false;
            for (i, instr) in block.instructions.iter().enumerate() {
                if let Instruction::Phi { dst, incoming } = instr {
                    if seen_non_phi {
                        self.errors.push(VerifyError::MisplacedPhi { block: block.id });
                    }
                    self.check_phi(block.id, *dst, incoming, &preds[b], &defs, &dom);
                } else {
                    seen_non_phi = true;
                    for reg in instr.uses() {
                        self.check_use(block.id, reg, (b, i + 1), &defs, &dom);
                    }
                }
                if let Some(error) = self.unknown_reference(block.id, instr) {
                    self.errors.push(error);
                } else if let Err(message) = self.check_types(instr) {
                    self.errors.push(VerifyError::TypeMismatch {
                        block: block.id,
                        message,
                    });
                }
            }
            let end = block.instructions.len() + 1;
            for reg in block.terminator.uses() {
                self.check_use(block.id, reg, (b, end), &defs, &dom);
            }
            if let Err(message) = self.check_terminator(&block.terminator) {
                self.errors.push(VerifyError::TypeMismatch {
                    block: block.id,
                    message,
                });
            }
        }
        unreachable
    }

    fn definitions(&mut self) -> Vec<Option<Site>> {
        let func = self.func;
        let mut defs: Vec<Option<Site>> = vec![None; func.reg_count()];
        let mut define = |errors: &mut Vec<VerifyError>, block: BlockId, reg: IrReg, site: Site| {
            match defs.get_mut(reg.0 as usize) {
                None => errors.push(VerifyError::RegisterOutOfRange { block, reg }),
                Some(Some(_)) => errors.push(VerifyError::MultipleDefinitions { reg }),
                Some(slot) => *slot = Some(site),
            }
        };
        for &param in &func.params {
            define(&mut self.errors, BlockId(0), param, (0, 0));
        }
        for (b, block) in func.blocks.iter().enumerate() {
            for (i, instr) in block.instructions.iter().enumerate() {
                if let Some(dst) = instr.dst() {
                    define(&mut self.errors, block.id, dst, (b, i + 1));
                }
            }
        }
        defs
    }

    fn check_use(
        &mut self,
        block: BlockId,
        reg: IrReg,
        at: Site,
        defs: &[Option<Site>],
        dom: &[Option<Vec<bool>>],
    ) {
        let Some(def) = defs.get(reg.0 as usize) else {
            self.errors.push(VerifyError::RegisterOutOfRange { block, reg });
            return;
        };
        let Some((db, di)) = *def else {
            self.errors.push(VerifyError::UndefinedRegister { block, reg });
            return;
        };
        let dominated = if db == at.0 {
            di < at.1
        } else {
            dominates(dom, db, at.0)
        };
        if !dominated {
            self.errors.push(VerifyError::UseNotDominated { block, reg });
        }
    }

    fn check_phi(
        &mut self,
        block: BlockId,
        dst: IrReg,
        incoming: &[(BlockId, IrReg)],
        preds: &[BlockId],
        defs: &[Option<Site>],
        dom: &[Option<Vec<bool>>],
    ) {
        let mut sources: Vec<BlockId> = incoming.iter().map(|(b, _)| *b).collect();
        sources.sort();
        let mut expected = preds.to_vec();
        expected.sort();
        if sources != expected {
            self.errors.push(VerifyError::PhiPredecessorMismatch { block, reg: dst });
        }
        for (pred, reg) in incoming {
            // The value must be available at the end of the predecessor.
            let p = pred.0 as usize;
            self.check_use(block, *reg, (p, usize::MAX), defs, dom);
        }
    }

    // ========================================================================
    // Types
    // ========================================================================

    fn ty(&self, reg: IrReg) -> Result<&'a Type, String> {
        self.module
            .reg_ty(self.func, reg)
            .ok_or_else(|| format!("{} has no type", reg))
    }

    fn type_of_id(&self, id: TypeId) -> Result<&'a Type, String> {
        self.module.ty(id).ok_or_else(|| format!("unknown type {}", id))
    }

    fn expect(&self, reg: IrReg, expected: &Type) -> Result<(), String> {
        let found = self.ty(reg)?;
        if same_type(found, expected) {
            Ok(())
        } else {
            Err(format!("{} is {}, expected {}", reg, found, expected))
        }
    }

    fn expect_kind(&self, reg: IrReg, kind: ScalarKind) -> Result<(), String> {
        self.expect(reg, &Type::from_scalar(kind))
    }

    fn expect_complex(&self, reg: IrReg, elem: ScalarKind) -> Result<(), String> {
        self.expect(reg, &Type::complex(elem))
    }

    fn container(&self, reg: IrReg) -> Result<(&'a Type, usize), String> {
        let ty = self.ty(reg)?;
        match (ty.element(), ty.dims()) {
            (Some(elem), Some(dims)) => Ok((elem, dims.len())),
            _ => Err(format!("{} is {}, expected a vector or tensor", reg, ty)),
        }
    }

    fn check_types(&self, instr: &Instruction) -> Result<(), String> {
        use Instruction::*;
        match instr {
            Const { dst, value } => {
                let v = self
                    .module
                    .constants
                    .get(*value)
                    .ok_or_else(|| format!("constant c{} does not exist", value.0))?;
                self.expect(*dst, v.ty())
            }
            Binary {
                dst,
                op,
                kind,
                lhs,
                rhs,
                ..
            } => {
                if kind.is_float() && !op.is_float_op() {
                    return Err(format!("`{}` is not defined on {}", op.symbol(), kind));
                }
                self.expect_kind(*dst, *kind)?;
                self.expect_kind(*lhs, *kind)?;
                self.expect_kind(*rhs, *kind)
            }
            Compare {
                dst, kind, lhs, rhs, ..
            } => {
                self.expect(*dst, &Type::BOOL)?;
                self.expect_kind(*lhs, *kind)?;
                self.expect_kind(*rhs, *kind)
            }
            Unary {
                dst, op, kind, src, ..
            } => {
                let ok = match op {
                    UnaryOp::Neg | UnaryOp::Abs => *kind != ScalarKind::Bool,
                    UnaryOp::Not => !kind.is_float(),
                    UnaryOp::Sqrt => kind.is_float(),
                };
                if !ok {
                    return Err(format!("{:?} is not defined on {}", op, kind));
                }
                self.expect_kind(*dst, *kind)?;
                self.expect_kind(*src, *kind)
            }
            Convert { dst, from, to, src } => {
                self.expect_kind(*dst, *to)?;
                self.expect_kind(*src, *from)
            }
            ComplexBinary {
                dst, elem, lhs, rhs, ..
            } => {
                self.expect_complex(*dst, *elem)?;
                self.expect_complex(*lhs, *elem)?;
                self.expect_complex(*rhs, *elem)
            }
            ComplexCompare {
                dst, elem, lhs, rhs, ..
            } => {
                self.expect(*dst, &Type::BOOL)?;
                self.expect_complex(*lhs, *elem)?;
                self.expect_complex(*rhs, *elem)
            }
            ComplexUnary { dst, elem, src, .. } => {
                self.expect_complex(*dst, *elem)?;
                self.expect_complex(*src, *elem)
            }
            ComplexPart { dst, elem, src, .. } => {
                self.expect_kind(*dst, *elem)?;
                self.expect_complex(*src, *elem)
            }
            MakeComplex { dst, elem, re, im } => {
                self.expect_complex(*dst, *elem)?;
                self.expect_kind(*re, *elem)?;
                self.expect_kind(*im, *elem)
            }
            MakeStruct { dst, fields } => {
                let Type::Struct(decl) = self.ty(*dst)? else {
                    return Err(format!("{} is not a struct", dst));
                };
                if decl.len() != fields.len() {
                    return Err(format!("{} field values for {} fields", fields.len(), decl.len()));
                }
                for (field, reg) in decl.iter().zip(fields) {
                    self.expect(*reg, &field.ty)?;
                }
                Ok(())
            }
            ExtractField { dst, src, index } => {
                let field = self.field(*src, *index)?;
                self.expect(*dst, field)
            }
            InsertField {
                dst,
                src,
                index,
                value,
            } => {
                let field = self.field(*src, *index)?;
                self.expect(*value, field)?;
                self.expect(*dst, self.ty(*src)?)
            }
            StackSlot { dst, slot } => {
                let id = self
                    .func
                    .slot_types
                    .get(*slot as usize)
                    .ok_or_else(|| format!("stack slot {} does not exist", slot))?;
                let content = self.type_of_id(*id)?;
                match self.ty(*dst)? {
                    Type::Reference(target, _) if **target == *content => Ok(()),
                    other => Err(format!("slot address {} is {}", dst, other)),
                }
            }
            Load { dst, addr } => {
                let Type::Reference(target, _) = self.ty(*addr)? else {
                    return Err(format!("load through non-reference {}", addr));
                };
                self.expect(*dst, target)
            }
            Store { addr, value } => {
                let Type::Reference(target, _) = self.ty(*addr)? else {
                    return Err(format!("store through non-reference {}", addr));
                };
                self.expect(*value, target)
            }
            Call { dst, func, args } => {
                let callee = self
                    .module
                    .function(*func)
                    .ok_or_else(|| format!("unknown function {}", func))?;
                let params: Vec<&Type> = callee
                    .param_types()
                    .into_iter()
                    .map(|t| self.type_of_id(t))
                    .collect::<Result<_, _>>()?;
                self.check_args(args, &params)?;
                let ret = self.type_of_id(callee.ret_type)?;
                self.expect(*dst, ret)
            }
            FuncRef { dst, func } => {
                if self.module.function(*func).is_none() {
                    return Err(format!("unknown function {}", func));
                }
                match self.ty(*dst)? {
                    Type::Function(..) => Ok(()),
                    other => Err(format!("function value {} is {}", dst, other)),
                }
            }
            CallIndirect { dst, callee, args } => {
                let Type::Function(params, ret) = self.ty(*callee)? else {
                    return Err(format!("call through non-function {}", callee));
                };
                let params: Vec<&Type> = params.iter().collect();
                self.check_args(args, &params)?;
                self.expect(*dst, ret)
            }
            Phi { dst, incoming } => {
                let ty = self.ty(*dst)?;
                for (_, reg) in incoming {
                    self.expect(*reg, ty)?;
                }
                Ok(())
            }
            MakeTensor { dst, elements } => {
                let (elem, _) = self.container(*dst)?;
                if let Some(shape) = self.ty(*dst)?.fixed_shape() {
                    let count: usize = shape.iter().product();
                    if count != elements.len() {
                        return Err(format!("{} elements for shape {:?}", elements.len(), shape));
                    }
                }
                for reg in elements {
                    self.expect(*reg, elem)?;
                }
                Ok(())
            }
            TensorBinary { dst, lhs, rhs, .. } => {
                let (elem, rank) = self.container(*dst)?;
                for reg in [lhs, rhs] {
                    let (e, r) = self.container(*reg)?;
                    if e != elem || r != rank {
                        return Err(format!("elementwise operand {} does not match {}", reg, dst));
                    }
                }
                Ok(())
            }
            TensorScale {
                dst,
                tensor,
                factor,
                ..
            } => {
                let (elem, rank) = self.container(*dst)?;
                let (e, r) = self.container(*tensor)?;
                if e != elem || r != rank {
                    return Err(format!("scaled operand {} does not match {}", tensor, dst));
                }
                self.expect(*factor, elem)
            }
            Dot { dst, lhs, rhs } => {
                let (a, ra) = self.container(*lhs)?;
                let (b, rb) = self.container(*rhs)?;
                if a != b || ra != 1 || rb != 1 {
                    return Err("dot needs two rank-1 operands of one element type".to_string());
                }
                self.expect(*dst, a)
            }
            MatMul { dst, lhs, rhs } => {
                let (a, ra) = self.container(*lhs)?;
                let (b, rb) = self.container(*rhs)?;
                let (c, rc) = self.container(*dst)?;
                if a != b || a != c || ra != 2 || rb != 2 || rc != 2 {
                    return Err("matmul needs rank-2 operands of one element type".to_string());
                }
                Ok(())
            }
            Sum { dst, src } => {
                let (elem, _) = self.container(*src)?;
                self.expect(*dst, elem)
            }
            ExtractElement { dst, src, indices } => {
                let (elem, rank) = self.container(*src)?;
                if indices.len() != rank {
                    return Err(format!("{} indices for rank {}", indices.len(), rank));
                }
                for reg in indices {
                    self.expect(*reg, &Type::I64)?;
                }
                self.expect(*dst, elem)
            }
            Dim { dst, src, axis } => {
                let (_, rank) = self.container(*src)?;
                if *axis as usize >= rank {
                    return Err(format!("axis {} of a rank-{} value", axis, rank));
                }
                self.expect(*dst, &Type::I64)
            }
            TensorCast { dst, src } => {
                let (a, ra) = self.container(*src)?;
                let (b, rb) = self.container(*dst)?;
                if a != b || ra != rb {
                    return Err(format!("cannot cast {} to {}", self.ty(*src)?, self.ty(*dst)?));
                }
                Ok(())
            }
        }
    }

    fn unknown_reference(&self, block: BlockId, instr: &Instruction) -> Option<VerifyError> {
        match instr {
            Instruction::Call { func, .. } | Instruction::FuncRef { func, .. }
                if self.module.function(*func).is_none() =>
            {
                Some(VerifyError::UnknownFunction { block, func: *func })
            }
            Instruction::Const { value, .. } if self.module.constants.get(*value).is_none() => {
                Some(VerifyError::UnknownConstant { block })
            }
            _ => None,
        }
    }

    fn field(&self, src: IrReg, index: u32) -> Result<&'a Type, String> {
        match self.ty(src)? {
            Type::Struct(decl) => decl
                .get(index as usize)
                .map(|f| &f.ty)
                .ok_or_else(|| format!("field {} out of range", index)),
            other => Err(format!("field access on {}", other)),
        }
    }

    fn check_args(&self, args: &[IrReg], params: &[&Type]) -> Result<(), String> {
        if args.len() != params.len() {
            return Err(format!("{} arguments for {} parameters", args.len(), params.len()));
        }
        for (reg, ty) in args.iter().zip(params) {
            self.expect(*reg, ty)?;
        }
        Ok(())
    }

    fn check_terminator(&self, terminator: &Terminator) -> Result<(), String> {
        match terminator {
            Terminator::Jump(_) => Ok(()),
            Terminator::Branch { cond, .. } => self.expect(*cond, &Type::BOOL),
            Terminator::Return(reg) => self.expect(*reg, self.type_of_id(self.func.ret_type)?),
        }
    }
}

/// Equality that ignores reference mutability (a mutable slot address may
/// flow where a shared reference is expected)
fn same_type(a: &Type, b: &Type) -> bool {
    match (a, b) {
        (Type::Reference(x, _), Type::Reference(y, _)) => x == y,
        _ => a == b,
    }
}

/// Dominator sets per block; `None` for blocks unreachable from the entry
fn dominators(n: usize, preds: &[Vec<BlockId>]) -> Vec<Option<Vec<bool>>> {
    let mut reachable = vec![false; n];
    let mut succs = vec![Vec::new(); n];
    for (b, list) in preds.iter().enumerate() {
        for p in list {
            succs[p.0 as usize].push(b);
        }
    }
    let mut stack = vec![0usize];
    while let Some(b) = stack.pop() {
        if !reachable[b] {
            reachable[b] = true;
            stack.extend(succs[b].iter().copied());
        }
    }

    let mut dom: Vec<Option<Vec<bool>>> = (0..n)
        .map(|b| reachable[b].then(|| vec![true; n]))
        .collect();
    if let Some(Some(entry)) = dom.get_mut(0) {
        entry.iter_mut().for_each(|d| *d = false);
        entry[0] = true;
    }
    let mut changed = true;
    while changed {
        changed = false;
        for b in 1..n {
            if !reachable[b] {
                continue;
            }
            let mut set = vec![true; n];
            for p in &preds[b] {
                if let Some(Some(pd)) = dom.get(p.0 as usize) {
                    set.iter_mut().zip(pd).for_each(|(s, d)| *s &= *d);
                }
            }
            set[b] = true;
            if dom[b].as_ref() != Some(&set) {
                dom[b] = Some(set);
                changed = true;
            }
        }
    }
    dom
}

/// True when block `a` dominates block `b`
fn dominates(dom: &[Option<Vec<bool>>], a: usize, b: usize) -> bool {
    dom.get(b)
        .and_then(|d| d.as_ref())
        .and_then(|d| d.get(a).copied())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::compiler::ir::{lower_module, BasicBlock};
    use crate::types::TypeChecker;

    fn lowered(module: crate::ast::Module) -> IrModule {
        lower_module(&TypeChecker::check_module(&module).unwrap()).unwrap()
    }

    #[test]
    fn test_generated_ir_verifies() {
        let m = lowered(module(vec![func(
            "sum_to",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                let_mut("i", int(0)),
                let_mut("acc", int(0)),
                while_(
                    lt(var("i"), var("n")),
                    vec![
                        if_(eq(var("i"), int(3)), vec![assign("i", add(var("i"), int(1))), cont()], vec![]),
                        assign("acc", add(var("acc"), var("i"))),
                        assign("i", add(var("i"), int(1))),
                    ],
                ),
                ret(var("acc")),
            ],
        )]));
        let result = verify_module(&m);
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.stats.function_count, 1);
        assert!(result.stats.phi_count >= 2);
    }

    #[test]
    fn test_bad_target() {
        let mut m = lowered(module(vec![func("one", vec![], Type::I64, vec![ret(int(1))])]));
        m.functions[0].blocks[0].terminator = Terminator::Jump(BlockId(7));
        let result = verify_module(&m);
        assert!(!result.valid);
        assert!(matches!(result.errors[0].error, VerifyError::TargetOutOfRange { .. }));
    }

    #[test]
    fn test_oversized_register_type() {
        let mut m = lowered(module(vec![func(
            "id",
            vec![param("a", Type::I64)],
            Type::I64,
            vec![ret(var("a"))],
        )]));
        let huge = m.types.intern(&Type::Vector(Box::new(Type::I64), usize::MAX / 8));
        m.functions[0].reg_types[0] = huge;
        let result = verify_module(&m);
        assert!(!result.valid);
        assert!(result
            .errors
            .iter()
            .any(|d| d.error == VerifyError::OversizedType { ty: huge }));
    }

    #[test]
    fn test_double_definition() {
        let mut m = lowered(module(vec![func(
            "two",
            vec![param("a", Type::I64)],
            Type::I64,
            vec![ret(add(var("a"), int(1)))],
        )]));
        let block: &mut BasicBlock = &mut m.functions[0].blocks[0];
        let dup = block.instructions[0].clone();
        block.instructions.push(dup);
        let result = verify_module(&m);
        assert!(result
            .errors
            .iter()
            .any(|d| matches!(d.error, VerifyError::MultipleDefinitions { .. })));
    }

    #[test]
    fn test_type_mismatch_on_return() {
        let mut m = lowered(module(vec![func(
            "flag",
            vec![param("a", Type::I64)],
            Type::I64,
            vec![ret(var("a"))],
        )]));
        let bool_ty = m.types.intern(&Type::BOOL);
        m.functions[0].reg_types[0] = bool_ty;
        let err = verify_module(&m).into_result().unwrap_err();
        assert_eq!(err.kind, LoweringErrorKind::Verification);
    }

    #[test]
    fn test_phi_missing_predecessor() {
        let mut m = lowered(module(vec![func(
            "pick",
            vec![param("c", Type::BOOL)],
            Type::I64,
            vec![
                let_mut("x", int(1)),
                if_(var("c"), vec![assign("x", int(2))], vec![]),
                ret(var("x")),
            ],
        )]));
        let join = m.functions[0].blocks.last_mut().unwrap();
        if let Some(Instruction::Phi { incoming, .. }) = join.instructions.first_mut() {
            incoming.pop();
        }
        let result = verify_module(&m);
        assert!(result
            .errors
            .iter()
            .any(|d| matches!(d.error, VerifyError::PhiPredecessorMismatch { .. })));
    }

    #[test]
    fn test_use_before_definition() {
        let mut m = lowered(module(vec![func(
            "order",
            vec![param("a", Type::I64)],
            Type::I64,
            vec![let_("b", add(var("a"), int(1))), ret(mul(var("b"), int(2)))],
        )]));
        m.functions[0].blocks[0].instructions.swap(1, 3);
        assert!(!verify_module(&m).valid);
    }
}
