//! # TVM64 Machine
//!
//! Loads and runs lowered functions. Each top-level invocation gets a fresh
//! machine with two regions:
//!
//! | Region | Base | Use |
//! |--------|------|-----|
//! | stack | `0x2_0000_0000` | call frames, released on `exit` |
//! | heap | `0x3_0000_0000` | argument records, result slots, tensor buffers |
//!
//! The heap lives as long as the invocation. Before helper and function
//! calls the machine checks how much it has allocated since the last
//! collection and, past a quarter of the heap limit, marks every buffer
//! reachable from the descriptor homes of its live frames and from the
//! invocation's argument and result records, then sweeps the rest. A helper
//! that runs out of heap gets one collection and one retry before
//! [`RuntimeErrorKind::OutOfMemory`] reaches the caller.
//!
//! Calls between native functions push a machine frame and hand the
//! caller's argument record to the callee unchanged. Calls to functions that
//! run interpreted decode the record, cross the [`CallBridge`] and encode the
//! result into the caller's result slot. Abort is polled before every call
//! and on every backward jump.

use super::encoding::{
    alu, arith_op, class, cmp_op, jmp, mode, size_bytes, unary_op, TvmInstruction, CALL_FUNCTION, FP, LDDW,
};
use super::heap::Heap;
use super::helpers::{self, HelperArgs};
use super::{NativeFunction, NativeLinker};
use crate::compiler::ir::FunctionId;
use crate::compiler::layout::{LayoutResolver, Storage};
use crate::error::{RuntimeError, RuntimeErrorKind};
use crate::numeric::{self, ScalarKind};
use crate::runtime::abi::{load_value, record_type, store_value, AbiMemory, ScratchMemory};
use crate::runtime::{ChainContext, Repr, TypedValue};
use crate::types::Type;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace};

/// Base address of the stack region
pub const STACK_BASE: u64 = 0x2_0000_0000;
/// Base address of the heap region
pub const HEAP_BASE: u64 = 0x3_0000_0000;
/// Stack capacity in bytes
pub const STACK_LIMIT: usize = 8 << 20;
/// Heap capacity in bytes
pub const HEAP_LIMIT: usize = 256 << 20;

/// Stack and heap of one machine
#[derive(Debug, Clone)]
pub struct MachineMemory {
    stack: ScratchMemory,
    heap: Heap,
}

impl MachineMemory {
    /// Empty regions at the standard bases
    pub fn new() -> Self {
        Self::with_limits(STACK_LIMIT, HEAP_LIMIT)
    }

    /// Empty regions with custom capacities
    pub fn with_limits(stack: usize, heap: usize) -> Self {
        Self {
            stack: ScratchMemory::new(STACK_BASE, stack),
            heap: Heap::new(HEAP_BASE, heap),
        }
    }

    /// Bytes in use on the stack
    pub fn stack_used(&self) -> usize {
        self.stack.used()
    }

    /// Bytes held by live heap blocks
    pub fn heap_used(&self) -> usize {
        self.heap.used()
    }

    /// Bytes spanned by the heap region
    pub fn heap_footprint(&self) -> usize {
        self.heap.footprint()
    }

    fn push_frame(&mut self, size: usize) -> Result<u64, RuntimeError> {
        self.stack.alloc(size, 16).map_err(|_| {
            RuntimeError::new(
                RuntimeErrorKind::StackOverflow,
                format!("native stack exhausted ({} bytes in use)", self.stack.used()),
            )
        })
    }

    fn pop_frame(&mut self, fp: u64) {
        self.stack.release(fp);
    }
}

impl Default for MachineMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl AbiMemory for MachineMemory {
    fn load(&self, addr: u64, out: &mut [u8]) -> Result<(), RuntimeError> {
        if addr >= HEAP_BASE {
            self.heap.load(addr, out)
        } else {
            self.stack.load(addr, out)
        }
    }

    fn store(&mut self, addr: u64, bytes: &[u8]) -> Result<(), RuntimeError> {
        if addr >= HEAP_BASE {
            self.heap.store(addr, bytes)
        } else {
            self.stack.store(addr, bytes)
        }
    }

    fn alloc(&mut self, size: usize, align: usize) -> Result<u64, RuntimeError> {
        self.heap.alloc(size, align)
    }
}

/// Saved caller state
struct CallFrame {
    code: Arc<NativeFunction>,
    pc: usize,
    fp: u64,
}

/// TVM64 interpreter loop over lowered code
pub struct Machine<'l> {
    linker: &'l dyn NativeLinker,
    memory: MachineMemory,
    regs: [u64; 16],
    executed: u64,
    /// Heap records owned by the invocation itself
    pinned: Vec<(u64, Type)>,
    collections: u64,
}

impl<'l> Machine<'l> {
    /// Fresh machine resolving callees through `linker`
    pub fn new(linker: &'l dyn NativeLinker) -> Self {
        Self::with_memory(linker, MachineMemory::new())
    }

    /// Machine over caller-provided memory
    pub fn with_memory(linker: &'l dyn NativeLinker, memory: MachineMemory) -> Self {
        Self {
            linker,
            memory,
            regs: [0; 16],
            executed: 0,
            pinned: Vec::new(),
            collections: 0,
        }
    }

    /// Memory regions
    pub fn memory(&self) -> &MachineMemory {
        &self.memory
    }

    /// Instructions executed so far
    pub fn executed(&self) -> u64 {
        self.executed
    }

    /// Heap collections run so far
    pub fn collections(&self) -> u64 {
        self.collections
    }

    /// Run `func` on `args` and decode its result.
    ///
    /// The caller has already entered `func` on `chain`; calls it makes are
    /// entered and left here.
    pub fn invoke(
        &mut self,
        func: Arc<NativeFunction>,
        args: Vec<TypedValue>,
        chain: &mut ChainContext,
    ) -> Result<TypedValue, RuntimeError> {
        let linker = self.linker;
        let layouts = linker.layouts();
        let record_ty = record_type(&func.param_types);
        let record = layouts.of(&record_ty);
        let record_addr = self.memory.heap.alloc(record.size, record.align)?;
        let args = TypedValue::raw(record_ty.clone(), Repr::Struct(args));
        store_value(&args, record_addr, layouts, &mut self.memory)?;

        let ret = layouts.of(&func.ret_type);
        let ret_addr = self.memory.heap.alloc(ret.size, ret.align)?;
        let ret_type = func.ret_type.clone();
        self.pinned = vec![(record_addr, record_ty), (ret_addr, ret_type.clone())];

        self.regs[1] = record_addr;
        self.regs[2] = ret_addr;
        self.execute(func, chain)?;
        load_value(&ret_type, ret_addr, layouts, &self.memory)
    }

    fn execute(&mut self, entry: Arc<NativeFunction>, chain: &mut ChainContext) -> Result<(), RuntimeError> {
        let mut frames = Vec::new();
        let result = self.run(entry, &mut frames, chain);
        for _ in frames.drain(..) {
            chain.leave();
        }
        result
    }

    fn run(
        &mut self,
        entry: Arc<NativeFunction>,
        frames: &mut Vec<CallFrame>,
        chain: &mut ChainContext,
    ) -> Result<(), RuntimeError> {
        let mut code = entry;
        let mut pc = 0usize;
        self.regs[FP as usize] = self.memory.push_frame(code.frame_size)?;
        trace!(function = %code.symbol, "entering native code");

        loop {
            let insn = *code
                .program
                .get(pc)
                .ok_or_else(|| RuntimeError::internal(format!("pc {} outside {}", pc, code.symbol)))?;
            pc += insn.slots();
            self.executed += 1;

            match insn.class() {
                class::LD if insn.opcode == LDDW => self.regs[insn.dst as usize] = insn.imm64(),
                class::LDX => {
                    let n = size_bytes(insn.opcode);
                    let addr = self.address(insn.src, insn.offset);
                    let mut buf = [0u8; 8];
                    self.memory.load(addr, &mut buf[..n])?;
                    let raw = u64::from_le_bytes(buf);
                    self.regs[insn.dst as usize] = if insn.opcode & 0xe0 == mode::MEMSX {
                        let shift = 64 - 8 * n as u32;
                        (((raw << shift) as i64) >> shift) as u64
                    } else {
                        raw
                    };
                }
                class::STX => {
                    let n = size_bytes(insn.opcode);
                    let addr = self.address(insn.dst, insn.offset);
                    let bytes = self.regs[insn.src as usize].to_le_bytes();
                    self.memory.store(addr, &bytes[..n])?;
                }
                class::ALU | class::ALUC => self.alu(&insn)?,
                class::CMP => {
                    let kind = kind_of(insn.offset)?;
                    let op = cmp_op(insn.op()).ok_or_else(|| bad_opcode(&insn))?;
                    let (a, b) = (self.regs[insn.dst as usize], self.regs[insn.src as usize]);
                    self.regs[insn.dst as usize] = numeric::compare(op, kind, a, b) as u64;
                }
                class::JMP => match insn.op() {
                    jmp::JA => pc = self.jump(pc, insn.offset, chain)?,
                    jmp::JEQ | jmp::JNE => {
                        let equal = self.regs[insn.dst as usize] == insn.imm as i64 as u64;
                        if equal == (insn.op() == jmp::JEQ) {
                            pc = self.jump(pc, insn.offset, chain)?;
                        }
                    }
                    jmp::CALL if insn.src == CALL_FUNCTION => {
                        let target = FunctionId(insn.imm as u32);
                        self.safe_point(&frames[..], &code)?;
                        if let Some(callee) = self.call(target, &frames[..], &code, chain)? {
                            let fp = self.regs[FP as usize];
                            frames.push(CallFrame { code, pc, fp });
                            code = callee;
                            pc = 0;
                            self.regs[FP as usize] = self.memory.push_frame(code.frame_size)?;
                        }
                    }
                    jmp::CALL => {
                        self.safe_point(&frames[..], &code)?;
                        self.call_helper(&frames[..], &code, insn.imm as u32)?;
                    }
                    jmp::CALLX => {
                        let id = u32::try_from(self.regs[insn.dst as usize])
                            .map_err(|_| RuntimeError::internal("function value out of range"))?;
                        self.safe_point(&frames[..], &code)?;
                        if let Some(callee) = self.call(FunctionId(id), &frames[..], &code, chain)? {
                            let fp = self.regs[FP as usize];
                            frames.push(CallFrame { code, pc, fp });
                            code = callee;
                            pc = 0;
                            self.regs[FP as usize] = self.memory.push_frame(code.frame_size)?;
                        }
                    }
                    jmp::EXIT => {
                        self.memory.pop_frame(self.regs[FP as usize]);
                        match frames.pop() {
                            None => return Ok(()),
                            Some(caller) => {
                                chain.leave();
                                code = caller.code;
                                pc = caller.pc;
                                self.regs[FP as usize] = caller.fp;
                            }
                        }
                    }
                    _ => return Err(bad_opcode(&insn)),
                },
                _ => return Err(bad_opcode(&insn)),
            }
        }
    }

    fn address(&self, base: u8, offset: i16) -> u64 {
        self.regs[base as usize].wrapping_add(offset as i64 as u64)
    }

    /// Target of a taken jump; backward jumps poll the abort flag
    fn jump(&self, pc: usize, offset: i16, chain: &ChainContext) -> Result<usize, RuntimeError> {
        if offset < 0 {
            chain.check_abort()?;
        }
        usize::try_from(pc as i64 + offset as i64).map_err(|_| RuntimeError::internal("jump before function start"))
    }

    fn alu(&mut self, insn: &TvmInstruction) -> Result<(), RuntimeError> {
        let checked = insn.class() == class::ALUC;
        let kind = kind_of(insn.offset)?;
        let dst = insn.dst as usize;
        let operand = if insn.uses_src_reg() {
            self.regs[insn.src as usize]
        } else {
            insn.imm as i64 as u64
        };
        let value = match insn.op() {
            alu::MOV => operand,
            alu::CONV => numeric::convert(kind, kind_of(insn.imm as i16)?, self.regs[insn.src as usize]),
            op => {
                if let Some(u) = unary_op(op) {
                    numeric::unary(u, kind, self.regs[dst], checked)?
                } else if let Some(a) = arith_op(op) {
                    numeric::binary(a, kind, self.regs[dst], operand, checked)?
                } else {
                    return Err(bad_opcode(insn));
                }
            }
        };
        self.regs[dst] = value;
        Ok(())
    }

    /// Enter a call. Returns the callee's code when it runs natively; an
    /// interpreted callee has already completed when this returns `None`.
    fn call(
        &mut self,
        target: FunctionId,
        frames: &[CallFrame],
        code: &NativeFunction,
        chain: &mut ChainContext,
    ) -> Result<Option<Arc<NativeFunction>>, RuntimeError> {
        chain.check_abort()?;
        let linker = self.linker;
        if let Some(callee) = linker.resolve_native(target)? {
            chain.enter()?;
            return Ok(Some(callee));
        }

        let (params, _) = linker.signature(target).ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::UnknownFunction, format!("no function {}", target))
        })?;
        let layouts = linker.layouts();
        let record = load_value(&record_type(&params), self.regs[1], layouts, &self.memory)?;
        let (_, repr) = record.into_parts();
        let Repr::Struct(args) = repr else {
            return Err(RuntimeError::internal("argument record is not a struct"));
        };
        let result = linker.call(target, args, chain)?;
        let dst = self.regs[2];
        match store_value(&result, dst, layouts, &mut self.memory) {
            Err(err) if err.kind == RuntimeErrorKind::OutOfMemory => {
                self.collect(frames, code)?;
                store_value(&result, dst, layouts, &mut self.memory)?;
            }
            other => other?,
        }
        Ok(None)
    }

    fn call_helper(&mut self, frames: &[CallFrame], code: &NativeFunction, hash: u32) -> Result<(), RuntimeError> {
        let helper = helpers::lookup(hash)
            .ok_or_else(|| RuntimeError::internal(format!("unknown helper 0x{:08x}", hash)))?;
        let site = code
            .sites
            .get(self.regs[4] as usize)
            .ok_or_else(|| RuntimeError::internal(format!("no helper site {} in {}", self.regs[4], code.symbol)))?;
        let args = HelperArgs {
            dst: self.regs[1],
            lhs: self.regs[2],
            rhs: self.regs[3],
        };
        let layouts = self.linker.layouts();
        match helper(site, layouts, &mut self.memory, args) {
            Err(err) if err.kind == RuntimeErrorKind::OutOfMemory => {
                self.collect(frames, code)?;
                helper(site, layouts, &mut self.memory, args)?;
            }
            other => other?,
        }
        self.regs[0] = 0;
        Ok(())
    }

    fn safe_point(&mut self, frames: &[CallFrame], code: &NativeFunction) -> Result<(), RuntimeError> {
        if self.memory.heap.wants_sweep() {
            self.collect(frames, code)?;
        }
        Ok(())
    }

    /// Mark heap blocks reachable from the pinned records and from every
    /// frame's roots, then sweep the rest. `code` is the running function;
    /// its frame is the one at `r10`.
    fn collect(&mut self, frames: &[CallFrame], code: &NativeFunction) -> Result<(), RuntimeError> {
        let layouts = self.linker.layouts();
        let mut live = BTreeSet::new();
        for (addr, ty) in &self.pinned {
            live.insert(*addr);
            self.mark(ty, *addr, layouts, &mut live)?;
        }
        let running = std::iter::once((code, self.regs[FP as usize]));
        for (func, fp) in frames.iter().map(|f| (&*f.code, f.fp)).chain(running) {
            for (offset, ty) in &func.roots {
                self.mark(ty, fp + *offset as u64, layouts, &mut live)?;
            }
        }
        let freed = self.memory.heap.sweep(&live);
        self.collections += 1;
        debug!(
            freed,
            live = live.len(),
            footprint = self.memory.heap.footprint(),
            "collected native heap"
        );
        Ok(())
    }

    fn mark(
        &self,
        ty: &Type,
        addr: u64,
        layouts: LayoutResolver<'_>,
        live: &mut BTreeSet<u64>,
    ) -> Result<(), RuntimeError> {
        let layout = layouts.of(ty);
        match (&layout.storage, ty) {
            (Storage::Descriptor { .. }, _) => {
                let mut word = [0u8; 8];
                self.memory.load(addr, &mut word)?;
                if let Some(block) = self.memory.heap.block_containing(u64::from_le_bytes(word)) {
                    live.insert(block);
                }
            }
            (Storage::Struct, Type::Struct(fields)) => {
                for (field, offset) in fields.iter().zip(&layout.field_offsets) {
                    self.mark(&field.ty, addr + *offset as u64, layouts, live)?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn kind_of(code: i16) -> Result<ScalarKind, RuntimeError> {
    u8::try_from(code)
        .ok()
        .and_then(ScalarKind::from_code)
        .ok_or_else(|| RuntimeError::internal(format!("bad kind code {}", code)))
}

fn bad_opcode(insn: &TvmInstruction) -> RuntimeError {
    RuntimeError::internal(format!("invalid opcode 0x{:02x}", insn.opcode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::compiler::{CompilationUnit, CompileOptions, Compiler};
    use crate::native::{lower_module, NativeModule, TargetFeatures};
    use crate::runtime::{AbortHandle, CallBridge};
    use crate::types::{Dim, Type};

    /// Runs every function natively
    struct AllNative {
        unit: CompilationUnit,
        native: NativeModule,
    }

    impl AllNative {
        fn new(module: crate::ast::Module) -> Self {
            let unit = Compiler::new(CompileOptions::default()).compile(&module).unwrap();
            let native = lower_module(&unit, &TargetFeatures::all()).unwrap();
            Self { unit, native }
        }

        fn run(&self, name: &str, args: Vec<TypedValue>) -> Result<TypedValue, RuntimeError> {
            let id = self.unit.function_id(name).unwrap();
            let mut chain = ChainContext::new(64, AbortHandle::new());
            let f = self.native.function(id).unwrap().clone();
            Machine::new(self).invoke(f, args, &mut chain)
        }
    }

    impl CallBridge for AllNative {
        fn call(&self, func: FunctionId, args: Vec<TypedValue>, chain: &mut ChainContext) -> Result<TypedValue, RuntimeError> {
            let f = self.native.function(func).unwrap().clone();
            Machine::new(self).invoke(f, args, chain)
        }
    }

    impl NativeLinker for AllNative {
        fn resolve_native(&self, func: FunctionId) -> Result<Option<Arc<NativeFunction>>, RuntimeError> {
            Ok(self.native.function(func).cloned())
        }

        fn signature(&self, func: FunctionId) -> Option<(Vec<Type>, Type)> {
            Some((self.unit.param_types(func)?, self.unit.return_type(func)?.clone()))
        }

        fn layouts(&self) -> LayoutResolver<'_> {
            self.unit.resolver()
        }
    }

    fn repeated_sum() -> crate::ast::Module {
        let dynamic = Type::Tensor(Box::new(Type::F64), vec![Dim::Dynamic]);
        module(vec![func(
            "repeated_sum",
            vec![param("t", dynamic), param("n", Type::I64)],
            Type::F64,
            vec![
                let_mut("acc", float(0.0)),
                let_mut("i", sint(0)),
                while_(
                    lt(var("i"), var("n")),
                    vec![
                        assign(
                            "acc",
                            add(
                                var("acc"),
                                intrinsic(crate::ast::Intrinsic::Sum, vec![add(var("t"), var("t"))]),
                            ),
                        ),
                        assign("i", add(var("i"), sint(1))),
                    ],
                ),
                ret(var("acc")),
            ],
        )])
    }

    fn ones(n: usize) -> TypedValue {
        TypedValue::tensor_f64(vec![Dim::Dynamic], vec![n], &vec![1.0; n]).unwrap()
    }

    #[test]
    fn test_i32_add_wraps_natively() {
        let m = AllNative::new(module(vec![func(
            "add",
            vec![param("a", Type::I32), param("b", Type::I32)],
            Type::I32,
            vec![ret(add(var("a"), var("b")))],
        )]));
        let r = m.run("add", vec![TypedValue::i32(i32::MAX), TypedValue::i32(1)]).unwrap();
        assert_eq!(r, TypedValue::i32(i32::MIN));
    }

    #[test]
    fn test_loop_with_phis() {
        let m = AllNative::new(module(vec![func(
            "tri",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                let_mut("acc", sint(0)),
                let_mut("i", sint(0)),
                while_(
                    lt(var("i"), var("n")),
                    vec![
                        assign("i", add(var("i"), sint(1))),
                        assign("acc", add(var("acc"), var("i"))),
                    ],
                ),
                ret(var("acc")),
            ],
        )]));
        assert_eq!(m.run("tri", vec![TypedValue::i64(10)]).unwrap().as_i64(), Some(55));
    }

    #[test]
    fn test_recursive_calls_and_depth() {
        let m = AllNative::new(module(vec![func(
            "fact",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                if_(lt(var("n"), sint(2)), vec![ret(sint(1))], vec![]),
                ret(mul(var("n"), call("fact", vec![sub(var("n"), sint(1))]))),
            ],
        )]));
        assert_eq!(m.run("fact", vec![TypedValue::i64(10)]).unwrap().as_i64(), Some(3_628_800));
        let err = m.run("fact", vec![TypedValue::i64(1000)]).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::StackOverflow);
    }

    #[test]
    fn test_dynamic_tensor_shape_mismatch() {
        let dynamic = Type::Tensor(Box::new(Type::F64), vec![Dim::Dynamic]);
        let m = AllNative::new(module(vec![func(
            "sum2",
            vec![param("a", dynamic.clone()), param("b", dynamic.clone())],
            dynamic.clone(),
            vec![ret(add(var("a"), var("b")))],
        )]));
        let a = TypedValue::tensor_f64(vec![Dim::Dynamic], vec![2], &[1.0, 2.0]).unwrap();
        let b = TypedValue::tensor_f64(vec![Dim::Dynamic], vec![3], &[1.0, 2.0, 3.0]).unwrap();
        let err = m.run("sum2", vec![a.clone(), b]).unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::ShapeMismatch);
        let doubled = m.run("sum2", vec![a.clone(), a]).unwrap();
        assert_eq!(doubled.to_f64_vec(), Some(vec![2.0, 4.0]));
    }

    #[test]
    fn test_memory_regions() {
        let mut mem = MachineMemory::new();
        let a = mem.alloc(8, 8).unwrap();
        assert_eq!(a, HEAP_BASE);
        let fp = mem.push_frame(32).unwrap();
        assert_eq!(fp, STACK_BASE);
        mem.store(fp + 8, &[1, 2]).unwrap();
        let mut out = [0u8; 2];
        mem.load(fp + 8, &mut out).unwrap();
        assert_eq!(out, [1, 2]);
        mem.pop_frame(fp);
        assert_eq!(mem.stack_used(), 0);
        assert!(mem.load(fp, &mut out).is_err());
    }

    #[test]
    fn test_loop_temporaries_are_reclaimed() {
        let m = AllNative::new(repeated_sum());
        let id = m.unit.function_id("repeated_sum").unwrap();
        let f = m.native.function(id).unwrap().clone();
        assert!(!f.roots.is_empty());

        // 200 iterations of a 4 KiB temporary against a 64 KiB heap
        let memory = MachineMemory::with_limits(STACK_LIMIT, 64 << 10);
        let mut machine = Machine::with_memory(&m, memory);
        let mut chain = ChainContext::new(64, AbortHandle::new());
        let r = machine.invoke(f, vec![ones(512), TypedValue::i64(200)], &mut chain).unwrap();
        assert_eq!(r.as_f64(), Some(204_800.0));
        assert!(machine.collections() > 0);
        assert!(machine.memory().heap_footprint() <= 64 << 10);
    }

    #[test]
    fn test_live_data_beyond_heap_is_out_of_memory() {
        let m = AllNative::new(repeated_sum());
        let id = m.unit.function_id("repeated_sum").unwrap();
        let f = m.native.function(id).unwrap().clone();
        let memory = MachineMemory::with_limits(STACK_LIMIT, 6 << 10);
        let mut machine = Machine::with_memory(&m, memory);
        let mut chain = ChainContext::new(64, AbortHandle::new());
        let err = machine
            .invoke(f, vec![ones(512), TypedValue::i64(1)], &mut chain)
            .unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::OutOfMemory);
    }
}
