//! # Register VM
//!
//! Executes verified IR one instruction at a time. Every instruction is a
//! pure function of its operands, the frame's registers and the read-only
//! constant pool; arithmetic and tensor work is delegated to the shared
//! [`numeric`](crate::numeric) and [`tensor`](crate::tensor) kernels.
//!
//! Phis are not executed in place. When control moves along an edge, every
//! phi of the target block reads its input for that edge first and all of
//! them are written afterwards (a parallel copy), so phis that feed each other
//! around a loop see the values of the previous iteration.
//!
//! The abort flag is polled before each call and on every edge whose target
//! does not come after its source in block order (all loop back-edges).

use super::frame::Frame;
use super::{CallBridge, ChainContext, Repr, TypedValue};
use crate::compiler::ir::{BlockId, ComplexPart as Part, ComplexUnaryOp, Instruction, IrFunction, IrReg, Terminator};
use crate::compiler::CompilationUnit;
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::numeric;
use crate::tensor::{self, ElemValue};
use crate::types::Type;
use tracing::trace;

/// Interpreter over one compilation unit
pub struct Interpreter<'u> {
    unit: &'u CompilationUnit,
}

impl<'u> Interpreter<'u> {
    /// Create an interpreter for a unit
    pub fn new(unit: &'u CompilationUnit) -> Self {
        Self { unit }
    }

    /// Run `func` to completion in a fresh frame.
    ///
    /// Arguments must already match the signature; the dispatcher checks
    /// them. Calls to functions that also run interpreted push a frame on
    /// this run's own stack; every other call leaves through `bridge`.
    pub fn run(
        &self,
        func: &'u IrFunction,
        args: Vec<TypedValue>,
        bridge: &dyn CallBridge,
        chain: &mut ChainContext,
    ) -> Result<TypedValue, RuntimeError> {
        let mut suspended = Vec::new();
        let result = self.execute(Activation::new(func, args)?, &mut suspended, bridge, chain);
        for _ in suspended.drain(..) {
            chain.leave();
        }
        result
    }

    fn execute(
        &self,
        entry: Activation<'u>,
        suspended: &mut Vec<(Activation<'u>, IrReg)>,
        bridge: &dyn CallBridge,
        chain: &mut ChainContext,
    ) -> Result<TypedValue, RuntimeError> {
        let mut act = entry;
        trace!(function = %act.frame.function().name, depth = chain.depth(), "interpreting");
        loop {
            let func = act.frame.function();
            let block = func
                .block(act.block)
                .ok_or_else(|| RuntimeError::internal(format!("missing block {}", act.block)))?;

            if let Some(instr) = block.instructions.get(act.next) {
                act.next += 1;
                let (dst, target, args) = match instr {
                    Instruction::Phi { .. } => continue,
                    Instruction::Call { dst, func, args } => (*dst, *func, args),
                    Instruction::CallIndirect { dst, callee, args } => {
                        let target = act
                            .frame
                            .get(*callee)?
                            .function_id()
                            .ok_or_else(|| RuntimeError::internal("call through a non-function value"))?;
                        (*dst, target, args)
                    }
                    _ => {
                        self.step(&mut act.frame, instr)?;
                        continue;
                    }
                };
                let args = collect(&act.frame, args)?;
                chain.check_abort()?;
                if bridge.runs_interpreted(target)? {
                    let callee = self.unit.function(target).ok_or_else(|| {
                        RuntimeError::new(RuntimeErrorKind::UnknownFunction, format!("no function {}", target))
                    })?;
                    chain.enter()?;
                    let caller = std::mem::replace(&mut act, Activation::new(callee, args)?);
                    suspended.push((caller, dst));
                    trace!(function = %callee.name, depth = chain.depth(), "interpreting");
                } else {
                    let value = bridge.call(target, args, chain)?;
                    act.frame.set(dst, value)?;
                }
                continue;
            }

            match &block.terminator {
                Terminator::Jump(target) => act.transfer_to(*target, chain)?,
                Terminator::Branch {
                    cond,
                    then_block,
                    else_block,
                } => {
                    let taken = if as_bool(act.frame.get(*cond)?)? {
                        *then_block
                    } else {
                        *else_block
                    };
                    act.transfer_to(taken, chain)?;
                }
                Terminator::Return(reg) => {
                    let value = act.frame.take(*reg)?;
                    match suspended.pop() {
                        None => return Ok(value),
                        Some((caller, dst)) => {
                            chain.leave();
                            act = caller;
                            act.frame.set(dst, value)?;
                        }
                    }
                }
            }
        }
    }

    fn reg_type(&self, frame: &Frame<'_>, reg: IrReg) -> Result<Type, RuntimeError> {
        self.unit
            .module
            .reg_ty(frame.function(), reg)
            .cloned()
            .ok_or_else(|| RuntimeError::internal(format!("{} has no type", reg)))
    }

    /// Execute one instruction that neither calls nor is a phi
    fn step(&self, frame: &mut Frame<'_>, instr: &Instruction) -> Result<(), RuntimeError> {
        use Instruction::*;
        let value = match instr {
            Const { value, .. } => self
                .unit
                .module
                .constants
                .get(*value)
                .cloned()
                .ok_or_else(|| RuntimeError::internal("constant out of range"))?,
            Binary {
                op,
                kind,
                lhs,
                rhs,
                checked,
                ..
            } => {
                let bits = numeric::binary(*op, *kind, bits(frame.get(*lhs)?)?, bits(frame.get(*rhs)?)?, *checked)?;
                TypedValue::scalar(*kind, bits)
            }
            Compare {
                op, kind, lhs, rhs, ..
            } => TypedValue::boolean(numeric::compare(
                *op,
                *kind,
                bits(frame.get(*lhs)?)?,
                bits(frame.get(*rhs)?)?,
            )),
            Unary {
                op,
                kind,
                src,
                checked,
                ..
            } => TypedValue::scalar(*kind, numeric::unary(*op, *kind, bits(frame.get(*src)?)?, *checked)?),
            Convert { from, to, src, .. } => {
                TypedValue::scalar(*to, numeric::convert(*from, *to, bits(frame.get(*src)?)?))
            }
            ComplexBinary {
                op, elem, lhs, rhs, ..
            } => {
                let (re, im) = numeric::complex_binary(*op, *elem, parts(frame.get(*lhs)?)?, parts(frame.get(*rhs)?)?)?;
                TypedValue::raw(Type::complex(*elem), Repr::Complex(re, im))
            }
            ComplexCompare {
                op, elem, lhs, rhs, ..
            } => TypedValue::boolean(numeric::complex_compare(
                *op,
                *elem,
                parts(frame.get(*lhs)?)?,
                parts(frame.get(*rhs)?)?,
            )?),
            ComplexUnary { op, elem, src, .. } => {
                let a = parts(frame.get(*src)?)?;
                let (re, im) = match op {
                    ComplexUnaryOp::Neg => numeric::complex_neg(*elem, a)?,
                    ComplexUnaryOp::Conj => numeric::complex_conj(*elem, a)?,
                };
                TypedValue::raw(Type::complex(*elem), Repr::Complex(re, im))
            }
            Instruction::ComplexPart { part, elem, src, .. } => {
                let (re, im) = parts(frame.get(*src)?)?;
                match part {
                    Part::Re => TypedValue::scalar(*elem, re),
                    Part::Im => TypedValue::scalar(*elem, im),
                }
            }
            MakeComplex { elem, re, im, .. } => TypedValue::raw(
                Type::complex(*elem),
                Repr::Complex(bits(frame.get(*re)?)?, bits(frame.get(*im)?)?),
            ),
            MakeStruct { dst, fields } => {
                let values = fields
                    .iter()
                    .map(|r| frame.get(*r).cloned())
                    .collect::<Result<Vec<_>, _>>()?;
                TypedValue::raw(self.reg_type(frame, *dst)?, Repr::Struct(values))
            }
            ExtractField { src, index, .. } => frame
                .get(*src)?
                .fields()
                .and_then(|f| f.get(*index as usize))
                .cloned()
                .ok_or_else(|| RuntimeError::internal(format!("no field {}", index)))?,
            InsertField {
                src, index, value, ..
            } => {
                let (ty, repr) = frame.get(*src)?.clone().into_parts();
                let Repr::Struct(mut fields) = repr else {
                    return Err(RuntimeError::internal("insert into a non-struct"));
                };
                let field = fields
                    .get_mut(*index as usize)
                    .ok_or_else(|| RuntimeError::internal(format!("no field {}", index)))?;
                *field = frame.get(*value)?.clone();
                TypedValue::raw(ty, Repr::Struct(fields))
            }
            StackSlot { dst, slot } => TypedValue::raw(self.reg_type(frame, *dst)?, Repr::Ref(*slot)),
            Load { addr, .. } => {
                let slot = slot_of(frame.get(*addr)?)?;
                frame.load(slot)?.clone()
            }
            Store { addr, value } => {
                let slot = slot_of(frame.get(*addr)?)?;
                let v = frame.get(*value)?.clone();
                return frame.store(slot, v);
            }
            FuncRef { dst, func } => TypedValue::function(*func, self.reg_type(frame, *dst)?),
            Call { .. } | CallIndirect { .. } => {
                return Err(RuntimeError::internal("calls are executed by the run loop"))
            }
            Phi { .. } => return Ok(()),
            MakeTensor { dst, elements } => {
                let ty = self.reg_type(frame, *dst)?;
                let (elem, shape) = match (ty.elem_kind(), ty.fixed_shape()) {
                    (Some(e), Some(s)) => (e, s),
                    _ => return Err(RuntimeError::internal(format!("cannot build a {}", ty))),
                };
                let mut data = vec![0u8; tensor::element_count(&shape) * elem.byte_size()];
                for (i, reg) in elements.iter().enumerate() {
                    let v = frame
                        .get(*reg)?
                        .to_elem()
                        .ok_or_else(|| RuntimeError::internal("tensor element is not a number"))?;
                    tensor::write_elem(elem, &mut data, i, v);
                }
                TypedValue::raw(ty, Repr::Tensor { shape, data })
            }
            TensorBinary {
                dst,
                op,
                lhs,
                rhs,
                checked,
            } => {
                let a = frame.get(*lhs)?;
                let b = frame.get(*rhs)?;
                let data = tensor::elementwise(*op, &view(a)?, &view(b)?, *checked)?;
                let shape = view(a)?.shape.to_vec();
                TypedValue::raw(self.reg_type(frame, *dst)?, Repr::Tensor { shape, data })
            }
            TensorScale {
                dst,
                tensor: t,
                factor,
                checked,
            } => {
                let t = frame.get(*t)?;
                let factor = elem_of(frame.get(*factor)?)?;
                let data = tensor::scale(&view(t)?, factor, *checked)?;
                let shape = view(t)?.shape.to_vec();
                TypedValue::raw(self.reg_type(frame, *dst)?, Repr::Tensor { shape, data })
            }
            Dot { lhs, rhs, .. } => {
                let a = view(frame.get(*lhs)?)?;
                let result = tensor::dot(&a, &view(frame.get(*rhs)?)?, false)?;
                TypedValue::from_elem(a.elem, result)
            }
            MatMul { dst, lhs, rhs } => {
                let (shape, data) = tensor::matmul(&view(frame.get(*lhs)?)?, &view(frame.get(*rhs)?)?, false)?;
                let ty = self.reg_type(frame, *dst)?;
                conform(&ty, &shape)?;
                TypedValue::raw(ty, Repr::Tensor { shape, data })
            }
            Sum { src, .. } => {
                let t = view(frame.get(*src)?)?;
                TypedValue::from_elem(t.elem, tensor::sum(&t, false)?)
            }
            ExtractElement { src, indices, .. } => {
                let t = view(frame.get(*src)?)?;
                let idx = indices
                    .iter()
                    .map(|r| {
                        frame
                            .get(*r)?
                            .as_i64()
                            .ok_or_else(|| RuntimeError::internal("non-integer index"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let flat = tensor::flat_index(t.shape, &idx)?;
                TypedValue::from_elem(t.elem, t.get(flat))
            }
            Dim { src, axis, .. } => {
                let t = view(frame.get(*src)?)?;
                let extent = t
                    .shape
                    .get(*axis as usize)
                    .ok_or_else(|| RuntimeError::internal(format!("axis {} out of range", axis)))?;
                TypedValue::i64(*extent as i64)
            }
            TensorCast { dst, src } => {
                let ty = self.reg_type(frame, *dst)?;
                let (_, repr) = frame.get(*src)?.clone().into_parts();
                let Repr::Tensor { shape, data } = repr else {
                    return Err(RuntimeError::internal("cast of a non-tensor"));
                };
                conform(&ty, &shape)?;
                TypedValue::raw(ty, Repr::Tensor { shape, data })
            }
        };
        match instr.dst() {
            Some(dst) => frame.set(dst, value),
            None => Ok(()),
        }
    }
}


/// A frame plus its position: current block and next instruction
struct Activation<'f> {
    frame: Frame<'f>,
    block: BlockId,
    next: usize,
}

impl<'f> Activation<'f> {
    fn new(func: &'f IrFunction, args: Vec<TypedValue>) -> Result<Self, RuntimeError> {
        Ok(Self {
            frame: Frame::new(func, args)?,
            block: BlockId(0),
            next: 0,
        })
    }

    /// Move along the edge from the current block to `to`, resolving the
    /// target's phis
    fn transfer_to(&mut self, to: BlockId, chain: &ChainContext) -> Result<(), RuntimeError> {
        transfer(&mut self.frame, self.block, to, chain)?;
        self.block = to;
        self.next = 0;
        Ok(())
    }
}

/// Move along the edge `from -> to`, resolving the target's phis
fn transfer(
    frame: &mut Frame<'_>,
    from: BlockId,
    to: BlockId,
    chain: &ChainContext,
) -> Result<(), RuntimeError> {
    if to.0 <= from.0 {
        chain.check_abort()?;
    }
    let target = frame
        .function()
        .block(to)
        .ok_or_else(|| RuntimeError::internal(format!("missing block {}", to)))?;
    let mut copies = Vec::new();
    for instr in &target.instructions {
        let Instruction::Phi { dst, incoming } = instr else {
            break;
        };
        let (_, src) = incoming
            .iter()
            .find(|(pred, _)| *pred == from)
            .ok_or_else(|| RuntimeError::internal(format!("phi {} has no input from {}", dst, from)))?;
        copies.push((*dst, frame.get(*src)?.clone()));
    }
    for (dst, value) in copies {
        frame.set(dst, value)?;
    }
    Ok(())
}

fn bits(v: &TypedValue) -> Result<u64, RuntimeError> {
    v.bits()
        .ok_or_else(|| RuntimeError::internal(format!("expected a scalar, found {}", v.ty())))
}

fn as_bool(v: &TypedValue) -> Result<bool, RuntimeError> {
    v.as_bool()
        .ok_or_else(|| RuntimeError::internal(format!("expected a bool, found {}", v.ty())))
}

pub(crate) fn parts(v: &TypedValue) -> Result<(u64, u64), RuntimeError> {
    match v.repr() {
        Repr::Complex(re, im) => Ok((*re, *im)),
        _ => Err(RuntimeError::internal(format!("expected a complex, found {}", v.ty()))),
    }
}

pub(crate) fn elem_of(v: &TypedValue) -> Result<ElemValue, RuntimeError> {
    v.to_elem()
        .ok_or_else(|| RuntimeError::internal(format!("expected a number, found {}", v.ty())))
}

pub(crate) fn view(v: &TypedValue) -> Result<tensor::TensorView<'_>, RuntimeError> {
    v.tensor_view()
        .ok_or_else(|| RuntimeError::internal(format!("expected a tensor, found {}", v.ty())))
}

fn slot_of(v: &TypedValue) -> Result<u32, RuntimeError> {
    match v.repr() {
        Repr::Ref(slot) => Ok(*slot),
        _ => Err(RuntimeError::internal("dereference of a non-reference")),
    }
}

fn collect(frame: &Frame<'_>, regs: &[IrReg]) -> Result<Vec<TypedValue>, RuntimeError> {
    regs.iter().map(|r| frame.get(*r).cloned()).collect()
}

/// Check a runtime shape against a tensor type's fixed dims
pub(crate) fn conform(ty: &Type, shape: &[usize]) -> Result<(), RuntimeError> {
    let declared = ty
        .declared_shape()
        .ok_or_else(|| RuntimeError::internal(format!("{} is not a tensor type", ty)))?;
    tensor::conform(&declared, shape).map_err(|e| {
        let mut err = RuntimeError::from(e);
        if err.kind == RuntimeErrorKind::ShapeMismatch {
            err.message = format!("{} (target {})", err.message, ty);
        }
        err
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::{BinaryOp, Intrinsic};
    use crate::compiler::ir::FunctionId;
    use crate::compiler::{CompileOptions, Compiler};
    use crate::runtime::AbortHandle;
    use crate::types::Dim;

    /// Bridge that runs every callee in the interpreter
    struct Direct<'u>(&'u CompilationUnit);

    impl CallBridge for Direct<'_> {
        fn call(&self, func: FunctionId, args: Vec<TypedValue>, chain: &mut ChainContext) -> Result<TypedValue, RuntimeError> {
            let f = self
                .0
                .function(func)
                .ok_or_else(|| RuntimeError::new(RuntimeErrorKind::UnknownFunction, "missing"))?;
            chain.enter()?;
            let result = Interpreter::new(self.0).run(f, args, self, chain);
            chain.leave();
            result
        }

        fn runs_interpreted(&self, _func: FunctionId) -> Result<bool, RuntimeError> {
            Ok(true)
        }
    }

    fn run(m: crate::ast::Module, name: &str, args: Vec<TypedValue>) -> Result<TypedValue, RuntimeError> {
        let unit = Compiler::new(CompileOptions::default().opt_level(0)).compile(&m).unwrap();
        let id = unit.function_id(name).unwrap();
        let mut chain = ChainContext::new(64, AbortHandle::new());
        Direct(&unit).call(id, args, &mut chain)
    }

    #[test]
    fn test_i32_add_wraps() {
        let m = module(vec![func(
            "inc",
            vec![param("x", Type::I32)],
            Type::I32,
            vec![ret(add(var("x"), int(1)))],
        )]);
        let out = run(m, "inc", vec![TypedValue::i32(i32::MAX)]).unwrap();
        assert_eq!(out, TypedValue::i32(i32::MIN));
    }

    #[test]
    fn test_checked_add_overflows() {
        let m = module(vec![func(
            "inc",
            vec![param("x", Type::I32)],
            Type::I32,
            vec![ret(checked(BinaryOp::Add, var("x"), int(1)))],
        )]);
        let err = run(m, "inc", vec![TypedValue::i32(i32::MAX)]).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Overflow);
    }

    #[test]
    fn test_loop_sum() {
        let m = module(vec![func(
            "tri",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                let_mut("i", int(0)),
                let_mut("acc", int(0)),
                while_(
                    lt(var("i"), var("n")),
                    vec![assign("i", add(var("i"), int(1))), assign("acc", add(var("acc"), var("i")))],
                ),
                ret(var("acc")),
            ],
        )]);
        assert_eq!(run(m, "tri", vec![TypedValue::i64(10)]).unwrap(), TypedValue::i64(55));
    }

    #[test]
    fn test_recursion_and_depth_limit() {
        let m = module(vec![func(
            "down",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                if_(eq(var("n"), int(0)), vec![ret(int(0))], vec![]),
                ret(add(call("down", vec![sub(var("n"), int(1))]), int(1))),
            ],
        )]);
        assert_eq!(run(m.clone(), "down", vec![TypedValue::i64(20)]).unwrap(), TypedValue::i64(20));
        let err = run(m, "down", vec![TypedValue::i64(1000)]).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::StackOverflow);
    }

    #[test]
    fn test_dynamic_tensor_shape_mismatch() {
        let dyn_vec = Type::Tensor(Box::new(Type::F64), vec![Dim::Dynamic]);
        let m = module(vec![func(
            "vadd",
            vec![param("a", dyn_vec.clone()), param("b", dyn_vec.clone())],
            dyn_vec,
            vec![ret(add(var("a"), var("b")))],
        )]);
        let a = TypedValue::tensor_f64(vec![Dim::Dynamic], vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let b = TypedValue::tensor_f64(vec![Dim::Dynamic], vec![2], &[1.0, 2.0]).unwrap();
        let err = run(m, "vadd", vec![a, b]).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::ShapeMismatch);
    }

    #[test]
    fn test_index_out_of_bounds() {
        let m = module(vec![func(
            "at",
            vec![param("i", Type::I64)],
            Type::F64,
            vec![
                let_("v", vector(vec![float(1.0), float(2.0)])),
                ret(index(var("v"), vec![var("i")])),
            ],
        )]);
        assert_eq!(run(m.clone(), "at", vec![TypedValue::i64(1)]).unwrap(), TypedValue::f64(2.0));
        let err = run(m, "at", vec![TypedValue::i64(2)]).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::IndexOutOfBounds);
    }

    #[test]
    fn test_dot_intrinsic() {
        let m = module(vec![func(
            "d",
            vec![],
            Type::F64,
            vec![ret(intrinsic(
                Intrinsic::Dot,
                vec![vector(vec![float(1.0), float(2.0)]), vector(vec![float(3.0), float(4.0)])],
            ))],
        )]);
        assert_eq!(run(m, "d", vec![]).unwrap(), TypedValue::f64(11.0));
    }

    #[test]
    fn test_abort_stops_loop() {
        let m = module(vec![func(
            "forever",
            vec![],
            Type::I64,
            vec![while_(boolean(true), vec![]), ret(int(0))],
        )]);
        let unit = Compiler::new(CompileOptions::default()).compile(&m).unwrap();
        let handle = AbortHandle::new();
        handle.abort();
        let mut chain = ChainContext::new(8, handle);
        let err = Direct(&unit).call(FunctionId(0), vec![], &mut chain).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::Aborted);
    }
}
