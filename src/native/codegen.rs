//! # TVM64 Lowering
//!
//! Translates one verified IR function into TVM64 code. Every IR register
//! and stack slot gets a fixed home in the function's frame; an instruction
//! loads its operands from their homes into machine registers, computes, and
//! stores the result back. Nothing stays in a machine register across IR
//! instructions, so calls need no save/restore.
//!
//! ## Frame layout (`r10` = frame base)
//!
//! ```text
//! +0        saved result address (r2 on entry)
//! ...       one home per IR register, at its layout's alignment
//! ...       one home per stack slot
//! ...       phi shadows (blocks with two or more phis)
//! ...       outgoing area: argument records and index arrays
//! ```
//!
//! ## Calling convention
//!
//! `r1` holds the address of the argument record (the struct layout of the
//! parameter list) and `r2` the address the result must be written to. The
//! callee copies its parameters out of the record on entry and writes its
//! result through the saved `r2` before `exit`.
//!
//! Homes whose type holds a dynamic tensor descriptor are listed as heap
//! roots; the machine scans them when it collects unreachable buffers.
//!
//! Phis are resolved on edges: single-phi edges copy directly, wider edges
//! copy every input into its shadow first so phis that read each other see
//! the previous values.

use super::encoding::{jmp, size, size_code, TvmInstruction, FP};
use super::helpers::{self, HelperSite, SiteOp};
use super::verifier::Verifier;
use super::TargetFeatures;
use crate::compiler::ir::{BlockId, ComplexPart as Part, ComplexUnaryOp, Instruction, IrFunction, IrReg, Terminator};
use crate::compiler::layout::{align_up, record_type, Layout, Storage, DESCRIPTOR_DIMS_OFFSET};
use crate::compiler::CompilationUnit;
use crate::error::{LoweringError, LoweringErrorKind, RuntimeError, RuntimeErrorKind};
use crate::numeric::{ArithOp, ScalarKind, UnaryOp};
use crate::runtime::abi::{self, AbiMemory};
use crate::types::Type;
use std::collections::HashMap;
use std::sync::Arc;

const R0: u8 = 0;
const R1: u8 = 1;
const R2: u8 = 2;
const R3: u8 = 3;
const R4: u8 = 4;
/// Scratch register for memory copies
const COPY: u8 = 5;
/// Holds addresses loaded from references and function values
const PTR: u8 = 6;

/// Frame offset of the saved result address
const RESULT_ADDR: usize = 0;

/// Code and metadata produced for one function
#[derive(Debug)]
pub(crate) struct Lowered {
    pub program: Vec<TvmInstruction>,
    pub frame_size: usize,
    pub sites: Vec<HelperSite>,
    pub roots: Vec<(usize, Type)>,
}

/// Lower `func` for the given target
pub(crate) fn lower(
    unit: &CompilationUnit,
    func: &IrFunction,
    features: &TargetFeatures,
) -> Result<Lowered, LoweringError> {
    let frame = FrameLayout::build(unit, func)?;
    let mut gen = FunctionCodegen {
        unit,
        func,
        features,
        frame,
        program: Vec::new(),
        slot: 0,
        labels: HashMap::new(),
        fixups: Vec::new(),
        next_label: 0,
        sites: Vec::new(),
    };

    gen.prologue()?;
    for block in &func.blocks {
        gen.bind(Label::Block(block.id));
        for instr in &block.instructions {
            gen.lower_instruction(instr)?;
        }
        gen.lower_terminator(block.id, &block.terminator)?;
    }
    gen.patch()?;

    let check = Verifier::new(unit.module.functions.len()).verify(&gen.program);
    if let Some(err) = check.errors.first() {
        return Err(LoweringError::new(
            LoweringErrorKind::Verification,
            &func.name,
            format!("generated code rejected: {}", err),
        ));
    }

    Ok(Lowered {
        program: gen.program,
        frame_size: gen.frame.size,
        sites: gen.sites,
        roots: gen.frame.roots,
    })
}

// =============================================================================
// FRAME LAYOUT
// =============================================================================

#[derive(Debug, Clone)]
struct FrameLayout {
    regs: Vec<(usize, Arc<Layout>)>,
    slots: Vec<(usize, Arc<Layout>)>,
    shadows: HashMap<IrReg, usize>,
    outgoing: usize,
    size: usize,
    roots: Vec<(usize, Type)>,
}

/// True when a value of `ty` points at an out-of-line buffer
fn holds_buffers(ty: &Type) -> bool {
    match ty {
        Type::Tensor(..) => ty.fixed_shape().is_none(),
        Type::Struct(fields) => fields.iter().any(|f| holds_buffers(&f.ty)),
        _ => false,
    }
}

fn place(offset: &mut usize, layout: &Layout) -> usize {
    *offset = align_up(*offset, layout.align);
    let at = *offset;
    *offset += layout.size;
    at
}

impl FrameLayout {
    fn build(unit: &CompilationUnit, func: &IrFunction) -> Result<Self, LoweringError> {
        let layout_of = |id| {
            unit.layouts.layout_of(&unit.module.types, id).ok_or_else(|| {
                LoweringError::new(LoweringErrorKind::Verification, &func.name, format!("unknown type {:?}", id))
            })
        };

        let mut roots = Vec::new();
        let mut root = |at: usize, id| {
            if let Some(ty) = unit.module.ty(id).filter(|ty| holds_buffers(ty)) {
                roots.push((at, ty.clone()));
            }
        };

        let mut offset = RESULT_ADDR + 8;
        let mut regs = Vec::with_capacity(func.reg_types.len());
        for id in &func.reg_types {
            let layout = layout_of(*id)?;
            let at = place(&mut offset, &layout);
            root(at, *id);
            regs.push((at, layout));
        }
        let mut slots = Vec::with_capacity(func.slot_types.len());
        for id in &func.slot_types {
            let layout = layout_of(*id)?;
            let at = place(&mut offset, &layout);
            root(at, *id);
            slots.push((at, layout));
        }

        let mut shadows = HashMap::new();
        for block in &func.blocks {
            let phis: Vec<IrReg> = block
                .instructions
                .iter()
                .map_while(|i| match i {
                    Instruction::Phi { dst, .. } => Some(*dst),
                    _ => None,
                })
                .collect();
            if phis.len() < 2 {
                continue;
            }
            for dst in phis {
                let layout = regs.get(dst.0 as usize).map(|(_, l)| l.clone()).ok_or_else(|| {
                    LoweringError::new(LoweringErrorKind::Verification, &func.name, format!("{} has no type", dst))
                })?;
                let at = place(&mut offset, &layout);
                if let Some(id) = func.reg_type(dst) {
                    root(at, id);
                }
                shadows.insert(dst, at);
            }
        }

        let mut outgoing_size = 0;
        for block in &func.blocks {
            for instr in &block.instructions {
                let needed = match instr {
                    Instruction::Call { args, .. } | Instruction::CallIndirect { args, .. } => {
                        let types = args
                            .iter()
                            .map(|r| unit.module.reg_ty(func, *r).cloned())
                            .collect::<Option<Vec<_>>>()
                            .ok_or_else(|| {
                                LoweringError::new(LoweringErrorKind::Verification, &func.name, "untyped call argument")
                            })?;
                        unit.resolver().of(&record_type(&types)).size
                    }
                    Instruction::ExtractElement { indices, .. } => 8 * indices.len(),
                    _ => 0,
                };
                outgoing_size = outgoing_size.max(needed);
            }
        }
        let outgoing = align_up(offset, 8);
        let size = align_up(outgoing + outgoing_size, 16);

        if size > i16::MAX as usize {
            return Err(LoweringError::new(
                LoweringErrorKind::EncodingLimit,
                &func.name,
                format!("frame of {} bytes exceeds the 16-bit offset range", size),
            ));
        }

        Ok(Self {
            regs,
            slots,
            shadows,
            outgoing,
            size,
            roots,
        })
    }
}

// =============================================================================
// CODE GENERATION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Label {
    Block(BlockId),
    Local(u32),
}

enum Callee {
    Direct(u32),
    Indirect(IrReg),
}

/// Memory for encoding constants; anything needing a buffer is unsupported
struct ConstMemory;

impl AbiMemory for ConstMemory {
    fn load(&self, _addr: u64, _out: &mut [u8]) -> Result<(), RuntimeError> {
        Err(RuntimeError::internal("constant encoding reads no memory"))
    }

    fn store(&mut self, _addr: u64, _bytes: &[u8]) -> Result<(), RuntimeError> {
        Err(RuntimeError::new(RuntimeErrorKind::UnresolvedNativeFeature, "out-of-line constant"))
    }

    fn alloc(&mut self, _size: usize, _align: usize) -> Result<u64, RuntimeError> {
        Err(RuntimeError::new(RuntimeErrorKind::UnresolvedNativeFeature, "out-of-line constant"))
    }
}

struct FunctionCodegen<'a> {
    unit: &'a CompilationUnit,
    func: &'a IrFunction,
    features: &'a TargetFeatures,
    frame: FrameLayout,
    program: Vec<TvmInstruction>,
    /// Slot index of the next emitted instruction
    slot: usize,
    labels: HashMap<Label, usize>,
    /// (instruction index, slot of the jump, target)
    fixups: Vec<(usize, usize, Label)>,
    next_label: u32,
    sites: Vec<HelperSite>,
}

impl<'a> FunctionCodegen<'a> {
    fn error(&self, kind: LoweringErrorKind, message: impl Into<String>) -> LoweringError {
        LoweringError::new(kind, &self.func.name, message)
    }

    fn require(&self, present: bool, capability: &str, what: &str) -> Result<(), LoweringError> {
        if present {
            Ok(())
        } else {
            Err(self.error(
                LoweringErrorKind::UnresolvedNativeFeature,
                format!("{} needs {}, which the target lacks", what, capability),
            ))
        }
    }

    fn reg(&self, reg: IrReg) -> Result<(usize, Arc<Layout>), LoweringError> {
        self.frame
            .regs
            .get(reg.0 as usize)
            .cloned()
            .ok_or_else(|| self.error(LoweringErrorKind::Verification, format!("{} outside the register table", reg)))
    }

    fn reg_ty(&self, reg: IrReg) -> Result<Type, LoweringError> {
        self.unit
            .module
            .reg_ty(self.func, reg)
            .cloned()
            .ok_or_else(|| self.error(LoweringErrorKind::Verification, format!("{} has no type", reg)))
    }

    fn types_of(&self, regs: &[IrReg]) -> Result<Vec<Type>, LoweringError> {
        regs.iter().map(|r| self.reg_ty(*r)).collect()
    }

    fn imm16(&self, offset: usize) -> Result<i16, LoweringError> {
        i16::try_from(offset).map_err(|_| {
            self.error(
                LoweringErrorKind::EncodingLimit,
                format!("offset {} exceeds the 16-bit range", offset),
            )
        })
    }

    // ------------------------------------------------------------------------
    // Emission primitives
    // ------------------------------------------------------------------------

    fn emit(&mut self, insn: TvmInstruction) {
        self.slot += insn.slots();
        self.program.push(insn);
    }

    fn emit_jump(&mut self, insn: TvmInstruction, target: Label) {
        self.fixups.push((self.program.len(), self.slot, target));
        self.emit(insn);
    }

    fn bind(&mut self, label: Label) {
        self.labels.insert(label, self.slot);
    }

    fn new_label(&mut self) -> Label {
        self.next_label += 1;
        Label::Local(self.next_label)
    }

    fn patch(&mut self) -> Result<(), LoweringError> {
        for (index, at, label) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(&label)
                .ok_or_else(|| self.error(LoweringErrorKind::Verification, format!("unbound label {:?}", label)))?;
            let delta = target as i64 - (at as i64 + 1);
            let offset = i16::try_from(delta).map_err(|_| {
                self.error(
                    LoweringErrorKind::EncodingLimit,
                    format!("jump of {} slots exceeds the 16-bit range", delta),
                )
            })?;
            if let Some(insn) = self.program.get_mut(index) {
                insn.offset = offset;
            }
        }
        Ok(())
    }

    fn load_const(&mut self, dst: u8, value: u64) {
        match i32::try_from(value as i64) {
            Ok(imm) => self.emit(TvmInstruction::mov_imm(dst, imm)),
            Err(_) => self.emit(TvmInstruction::lddw(dst, value)),
        }
    }

    fn ldx_scalar(&mut self, dst: u8, kind: ScalarKind, base: u8, offset: usize) -> Result<(), LoweringError> {
        let sz = size_code(kind.byte_size())
            .ok_or_else(|| self.error(LoweringErrorKind::Unsupported, format!("no access width for {}", kind)))?;
        let off = self.imm16(offset)?;
        self.emit(TvmInstruction::ldx(sz, dst, base, off, kind.is_signed()));
        Ok(())
    }

    fn stx_scalar(&mut self, kind: ScalarKind, base: u8, offset: usize, src: u8) -> Result<(), LoweringError> {
        let sz = size_code(kind.byte_size())
            .ok_or_else(|| self.error(LoweringErrorKind::Unsupported, format!("no access width for {}", kind)))?;
        let off = self.imm16(offset)?;
        self.emit(TvmInstruction::stx(sz, base, src, off));
        Ok(())
    }

    /// Copy `len` bytes in chunks no wider than `align`
    fn copy_bytes(
        &mut self,
        dst_base: u8,
        dst_off: usize,
        src_base: u8,
        src_off: usize,
        len: usize,
        align: usize,
    ) -> Result<(), LoweringError> {
        let mut chunk = align.clamp(1, 8);
        let mut i = 0;
        while i < len {
            while chunk > len - i {
                chunk /= 2;
            }
            let sz = size_code(chunk)
                .ok_or_else(|| self.error(LoweringErrorKind::Unsupported, format!("copy chunk of {} bytes", chunk)))?;
            let (from, to) = (self.imm16(src_off + i)?, self.imm16(dst_off + i)?);
            self.emit(TvmInstruction::ldx(sz, COPY, src_base, from, false));
            self.emit(TvmInstruction::stx(sz, dst_base, COPY, to));
            i += chunk;
        }
        Ok(())
    }

    fn copy(&mut self, dst_base: u8, dst_off: usize, src_base: u8, src_off: usize, layout: &Layout) -> Result<(), LoweringError> {
        self.copy_bytes(dst_base, dst_off, src_base, src_off, layout.size, layout.align)
    }

    /// Copy one register's home into another's
    fn move_reg(&mut self, dst: IrReg, src: IrReg) -> Result<(), LoweringError> {
        let (dst_off, layout) = self.reg(dst)?;
        let (src_off, _) = self.reg(src)?;
        self.copy(FP, dst_off, FP, src_off, &layout)
    }

    /// `dst = r10 + offset`
    fn frame_addr(&mut self, dst: u8, offset: usize) -> Result<(), LoweringError> {
        let off = self.imm16(offset)?;
        self.emit(TvmInstruction::mov(dst, FP));
        if off != 0 {
            self.emit(TvmInstruction::add_imm(dst, off as i32));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Function entry and calls
    // ------------------------------------------------------------------------

    fn prologue(&mut self) -> Result<(), LoweringError> {
        let func = self.func;
        self.emit(TvmInstruction::stx(size::DW, FP, R2, RESULT_ADDR as i16));
        let params = self.types_of(&func.params)?;
        let record = self.unit.resolver().of(&record_type(&params));
        for (param, field_off) in func.params.iter().zip(&record.field_offsets) {
            let (off, layout) = self.reg(*param)?;
            self.copy(FP, off, R1, *field_off, &layout)?;
        }
        Ok(())
    }

    fn lower_call(&mut self, dst: IrReg, args: &[IrReg], callee: Callee) -> Result<(), LoweringError> {
        let types = self.types_of(args)?;
        let record = self.unit.resolver().of(&record_type(&types));
        let outgoing = self.frame.outgoing;
        for (arg, field_off) in args.iter().zip(&record.field_offsets) {
            let (off, layout) = self.reg(*arg)?;
            self.copy(FP, outgoing + field_off, FP, off, &layout)?;
        }
        let (dst_off, _) = self.reg(dst)?;
        self.frame_addr(R1, outgoing)?;
        self.frame_addr(R2, dst_off)?;
        match callee {
            Callee::Direct(id) => self.emit(TvmInstruction::call_function(id)),
            Callee::Indirect(value) => {
                let (off, _) = self.reg(value)?;
                let off = self.imm16(off)?;
                self.emit(TvmInstruction::ldx(size::DW, PTR, FP, off, false));
                self.emit(TvmInstruction::callx(PTR));
            }
        }
        Ok(())
    }

    /// Call a helper with the result address in `r1` and operand addresses
    /// (frame offsets) in `r2`/`r3`
    fn helper_call(
        &mut self,
        name: &str,
        op: SiteOp,
        dst: IrReg,
        operands: &[usize],
        types: Vec<Type>,
        checked: bool,
    ) -> Result<(), LoweringError> {
        let site = HelperSite::new(name, op, self.reg_ty(dst)?, types, checked);
        let hash = site.helper;
        let index = self.sites.len();
        self.sites.push(site);

        let (dst_off, _) = self.reg(dst)?;
        self.frame_addr(R1, dst_off)?;
        for (reg, off) in [R2, R3].into_iter().zip(operands) {
            self.frame_addr(reg, *off)?;
        }
        self.emit(TvmInstruction::mov_imm(R4, index as i32));
        self.emit(TvmInstruction::call_helper(hash));
        Ok(())
    }

    fn homes(&self, regs: &[IrReg]) -> Result<Vec<usize>, LoweringError> {
        regs.iter().map(|r| self.reg(*r).map(|(off, _)| off)).collect()
    }

    fn tensor_helper(
        &mut self,
        name: &str,
        op: SiteOp,
        dst: IrReg,
        operands: &[IrReg],
        checked: bool,
    ) -> Result<(), LoweringError> {
        self.require(self.features.tensor_helpers, "tensor helpers", name)?;
        if checked {
            self.require(self.features.checked_arith, "checked arithmetic", name)?;
        }
        let types = self.types_of(operands)?;
        let homes = self.homes(operands)?;
        self.helper_call(name, op, dst, &homes, types, checked)
    }

    // ------------------------------------------------------------------------
    // Instructions
    // ------------------------------------------------------------------------

    fn lower_instruction(&mut self, instr: &Instruction) -> Result<(), LoweringError> {
        use Instruction::*;
        match instr {
            Const { dst, value } => {
                let unit = self.unit;
                let constant = unit
                    .module
                    .constants
                    .get(*value)
                    .ok_or_else(|| self.error(LoweringErrorKind::Verification, "constant out of range"))?;
                let bytes = abi::encode(constant, unit.resolver(), &mut ConstMemory).map_err(|_| {
                    self.error(
                        LoweringErrorKind::UnresolvedNativeFeature,
                        format!("constant of type {} needs an out-of-line buffer", constant.ty()),
                    )
                })?;
                let (off, layout) = self.reg(*dst)?;
                let chunk = layout.align.clamp(1, 8);
                for (i, piece) in bytes.chunks(chunk).enumerate() {
                    let mut word = [0u8; 8];
                    word[..piece.len()].copy_from_slice(piece);
                    let sz = size_code(piece.len()).ok_or_else(|| {
                        self.error(LoweringErrorKind::Unsupported, "constant record is not chunk aligned")
                    })?;
                    self.load_const(R0, u64::from_le_bytes(word));
                    let at = self.imm16(off + i * chunk)?;
                    self.emit(TvmInstruction::stx(sz, FP, R0, at));
                }
            }
            Binary {
                dst,
                op,
                kind,
                lhs,
                rhs,
                checked,
            } => {
                if *checked {
                    self.require(self.features.checked_arith, "checked arithmetic", "checked binary")?;
                }
                let (l, r, d) = (self.reg(*lhs)?.0, self.reg(*rhs)?.0, self.reg(*dst)?.0);
                self.ldx_scalar(R0, *kind, FP, l)?;
                self.ldx_scalar(R1, *kind, FP, r)?;
                self.emit(TvmInstruction::alu_reg(
                    super::encoding::arith_code(*op),
                    *kind,
                    R0,
                    R1,
                    *checked,
                ));
                self.stx_scalar(*kind, FP, d, R0)?;
            }
            Compare {
                dst,
                op,
                kind,
                lhs,
                rhs,
            } => {
                let (l, r, d) = (self.reg(*lhs)?.0, self.reg(*rhs)?.0, self.reg(*dst)?.0);
                self.ldx_scalar(R0, *kind, FP, l)?;
                self.ldx_scalar(R1, *kind, FP, r)?;
                self.emit(TvmInstruction::compare(*op, *kind, R0, R1));
                self.stx_scalar(ScalarKind::Bool, FP, d, R0)?;
            }
            Unary {
                dst,
                op,
                kind,
                src,
                checked,
            } => {
                if *checked {
                    self.require(self.features.checked_arith, "checked arithmetic", "checked unary")?;
                }
                let (s, d) = (self.reg(*src)?.0, self.reg(*dst)?.0);
                self.ldx_scalar(R0, *kind, FP, s)?;
                self.emit(TvmInstruction::unary(*op, *kind, R0, *checked));
                self.stx_scalar(*kind, FP, d, R0)?;
            }
            Convert { dst, from, to, src } => {
                let (s, d) = (self.reg(*src)?.0, self.reg(*dst)?.0);
                self.ldx_scalar(R1, *from, FP, s)?;
                self.emit(TvmInstruction::conv(*from, *to, R0, R1));
                self.stx_scalar(*to, FP, d, R0)?;
            }
            ComplexBinary { dst, op, lhs, rhs, .. } => {
                self.require(self.features.complex_helpers, "complex helpers", "complex arithmetic")?;
                let types = self.types_of(&[*lhs, *rhs])?;
                let homes = self.homes(&[*lhs, *rhs])?;
                self.helper_call(helpers::COMPLEX_BINARY, SiteOp::Arith(*op), *dst, &homes, types, false)?;
            }
            ComplexCompare { dst, op, lhs, rhs, .. } => {
                self.require(self.features.complex_helpers, "complex helpers", "complex comparison")?;
                let types = self.types_of(&[*lhs, *rhs])?;
                let homes = self.homes(&[*lhs, *rhs])?;
                self.helper_call(helpers::COMPLEX_COMPARE, SiteOp::Compare(*op), *dst, &homes, types, false)?;
            }
            ComplexUnary { dst, op, elem, src } => {
                let (s, d) = (self.reg(*src)?.0, self.reg(*dst)?.0);
                let half = elem.byte_size();
                for part in [0, half] {
                    self.ldx_scalar(R0, *elem, FP, s + part)?;
                    if part == half || *op == ComplexUnaryOp::Neg {
                        self.emit(TvmInstruction::unary(UnaryOp::Neg, *elem, R0, false));
                    }
                    self.stx_scalar(*elem, FP, d + part, R0)?;
                }
            }
            Instruction::ComplexPart { dst, part, elem, src } => {
                let (s, d) = (self.reg(*src)?.0, self.reg(*dst)?.0);
                let at = match part {
                    Part::Re => s,
                    Part::Im => s + elem.byte_size(),
                };
                self.ldx_scalar(R0, *elem, FP, at)?;
                self.stx_scalar(*elem, FP, d, R0)?;
            }
            MakeComplex { dst, elem, re, im } => {
                let d = self.reg(*dst)?.0;
                for (part, reg) in [(0, *re), (elem.byte_size(), *im)] {
                    let s = self.reg(reg)?.0;
                    self.ldx_scalar(R0, *elem, FP, s)?;
                    self.stx_scalar(*elem, FP, d + part, R0)?;
                }
            }
            MakeStruct { dst, fields } => {
                let (d, layout) = self.reg(*dst)?;
                for (field, field_off) in fields.iter().zip(layout.field_offsets.clone()) {
                    let (s, fl) = self.reg(*field)?;
                    self.copy(FP, d + field_off, FP, s, &fl)?;
                }
            }
            ExtractField { dst, src, index } => {
                let (s, sl) = self.reg(*src)?;
                let (d, dl) = self.reg(*dst)?;
                let field_off = *sl
                    .field_offsets
                    .get(*index as usize)
                    .ok_or_else(|| self.error(LoweringErrorKind::Verification, format!("no field {}", index)))?;
                self.copy(FP, d, FP, s + field_off, &dl)?;
            }
            InsertField { dst, src, index, value } => {
                self.move_reg(*dst, *src)?;
                let (d, dl) = self.reg(*dst)?;
                let (v, vl) = self.reg(*value)?;
                let field_off = *dl
                    .field_offsets
                    .get(*index as usize)
                    .ok_or_else(|| self.error(LoweringErrorKind::Verification, format!("no field {}", index)))?;
                self.copy(FP, d + field_off, FP, v, &vl)?;
            }
            StackSlot { dst, slot } => {
                let slot_off = self
                    .frame
                    .slots
                    .get(*slot as usize)
                    .map(|(off, _)| *off)
                    .ok_or_else(|| self.error(LoweringErrorKind::Verification, format!("no stack slot {}", slot)))?;
                let d = self.imm16(self.reg(*dst)?.0)?;
                self.frame_addr(R0, slot_off)?;
                self.emit(TvmInstruction::stx(size::DW, FP, R0, d));
            }
            Load { dst, addr } => {
                let a = self.imm16(self.reg(*addr)?.0)?;
                let (d, layout) = self.reg(*dst)?;
                self.emit(TvmInstruction::ldx(size::DW, PTR, FP, a, false));
                self.copy(FP, d, PTR, 0, &layout)?;
            }
            Store { addr, value } => {
                let a = self.imm16(self.reg(*addr)?.0)?;
                let (v, layout) = self.reg(*value)?;
                self.emit(TvmInstruction::ldx(size::DW, PTR, FP, a, false));
                self.copy(PTR, 0, FP, v, &layout)?;
            }
            Call { dst, func, args } => self.lower_call(*dst, args, Callee::Direct(func.0))?,
            FuncRef { dst, func } => {
                let d = self.imm16(self.reg(*dst)?.0)?;
                self.load_const(R0, func.0 as u64);
                self.emit(TvmInstruction::stx(size::DW, FP, R0, d));
            }
            CallIndirect { dst, callee, args } => self.lower_call(*dst, args, Callee::Indirect(*callee))?,
            Phi { .. } => {}
            MakeTensor { dst, elements } => {
                let (d, layout) = self.reg(*dst)?;
                let Storage::Inline { elem_size, .. } = layout.storage else {
                    return Err(self.error(
                        LoweringErrorKind::UnresolvedNativeFeature,
                        "tensor literal without a fixed shape",
                    ));
                };
                for (i, element) in elements.iter().enumerate() {
                    let (s, el) = self.reg(*element)?;
                    self.copy_bytes(FP, d + i * elem_size, FP, s, elem_size.min(el.size), el.align)?;
                }
            }
            TensorBinary {
                dst,
                op,
                lhs,
                rhs,
                checked,
            } => self.tensor_helper(helpers::TENSOR_BINARY, SiteOp::Arith(*op), *dst, &[*lhs, *rhs], *checked)?,
            TensorScale {
                dst,
                tensor,
                factor,
                checked,
            } => self.tensor_helper(
                helpers::TENSOR_SCALE,
                SiteOp::Arith(ArithOp::Mul),
                *dst,
                &[*tensor, *factor],
                *checked,
            )?,
            Dot { dst, lhs, rhs } => self.tensor_helper(helpers::TENSOR_DOT, SiteOp::None, *dst, &[*lhs, *rhs], false)?,
            MatMul { dst, lhs, rhs } => {
                self.tensor_helper(helpers::TENSOR_MATMUL, SiteOp::None, *dst, &[*lhs, *rhs], false)?
            }
            Sum { dst, src } => self.tensor_helper(helpers::TENSOR_SUM, SiteOp::None, *dst, &[*src], false)?,
            ExtractElement { dst, src, indices } => {
                self.require(self.features.tensor_helpers, "tensor helpers", helpers::TENSOR_EXTRACT)?;
                let outgoing = self.frame.outgoing;
                for (i, index) in indices.iter().enumerate() {
                    let (s, _) = self.reg(*index)?;
                    self.copy_bytes(FP, outgoing + 8 * i, FP, s, 8, 8)?;
                }
                let mut types = vec![self.reg_ty(*src)?];
                types.extend(std::iter::repeat(Type::I64).take(indices.len()));
                let tensor_home = self.reg(*src)?.0;
                self.helper_call(
                    helpers::TENSOR_EXTRACT,
                    SiteOp::None,
                    *dst,
                    &[tensor_home, outgoing],
                    types,
                    false,
                )?;
            }
            Dim { dst, src, axis } => {
                let ty = self.reg_ty(*src)?;
                let declared = ty
                    .declared_shape()
                    .ok_or_else(|| self.error(LoweringErrorKind::Verification, format!("dim of {}", ty)))?;
                let extent = *declared
                    .get(*axis as usize)
                    .ok_or_else(|| self.error(LoweringErrorKind::Unsupported, format!("axis {} of {}", axis, ty)))?;
                match extent {
                    Some(n) => self.load_const(R0, n as u64),
                    None => {
                        let (s, layout) = self.reg(*src)?;
                        if !matches!(layout.storage, Storage::Descriptor { .. }) {
                            return Err(self.error(LoweringErrorKind::Verification, format!("{} has no descriptor", ty)));
                        }
                        let at = self.imm16(s + DESCRIPTOR_DIMS_OFFSET + 8 * *axis as usize)?;
                        self.emit(TvmInstruction::ldx(size::DW, R0, FP, at, false));
                    }
                }
                let d = self.reg(*dst)?.0;
                self.stx_scalar(ScalarKind::I64, FP, d, R0)?;
            }
            TensorCast { dst, src } => self.tensor_helper(helpers::TENSOR_CAST, SiteOp::None, *dst, &[*src], false)?,
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------------

    /// Resolve the target's phis for the edge `from -> to`, then jump
    /// (unless `to` is the next block and `fallthrough` allows it)
    fn lower_edge(&mut self, from: BlockId, to: BlockId, fallthrough: bool) -> Result<(), LoweringError> {
        let func = self.func;
        let block = func
            .block(to)
            .ok_or_else(|| self.error(LoweringErrorKind::Verification, format!("missing block {}", to)))?;
        let mut moves = Vec::new();
        for instr in &block.instructions {
            let Instruction::Phi { dst, incoming } = instr else {
                break;
            };
            let src = incoming
                .iter()
                .find(|(pred, _)| *pred == from)
                .map(|(_, r)| *r)
                .ok_or_else(|| {
                    self.error(
                        LoweringErrorKind::Verification,
                        format!("phi {} has no input from {}", dst, from),
                    )
                })?;
            moves.push((*dst, src));
        }

        if let [(dst, src)] = moves[..] {
            self.move_reg(dst, src)?;
        } else if !moves.is_empty() {
            let mut staged = Vec::with_capacity(moves.len());
            for (dst, src) in &moves {
                let shadow = *self.frame.shadows.get(dst).ok_or_else(|| {
                    self.error(LoweringErrorKind::Verification, format!("phi {} has no shadow", dst))
                })?;
                let (src_off, layout) = self.reg(*src)?;
                self.copy(FP, shadow, FP, src_off, &layout)?;
                staged.push((*dst, shadow, layout));
            }
            for (dst, shadow, layout) in staged {
                let (dst_off, _) = self.reg(dst)?;
                self.copy(FP, dst_off, FP, shadow, &layout)?;
            }
        }

        if !(fallthrough && to.0 == from.0 + 1) {
            self.emit_jump(TvmInstruction::ja(0), Label::Block(to));
        }
        Ok(())
    }

    fn lower_terminator(&mut self, block: BlockId, terminator: &Terminator) -> Result<(), LoweringError> {
        match terminator {
            Terminator::Jump(target) => self.lower_edge(block, *target, true),
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => {
                let c = self.reg(*cond)?.0;
                self.ldx_scalar(R0, ScalarKind::Bool, FP, c)?;
                let else_label = self.new_label();
                self.emit_jump(TvmInstruction::jmp_imm(jmp::JEQ, R0, 0, 0), else_label);
                self.lower_edge(block, *then_block, false)?;
                self.bind(else_label);
                self.lower_edge(block, *else_block, true)
            }
            Terminator::Return(reg) => {
                let (off, layout) = self.reg(*reg)?;
                self.emit(TvmInstruction::ldx(size::DW, R1, FP, RESULT_ADDR as i16, false));
                self.copy(R1, 0, FP, off, &layout)?;
                self.emit(TvmInstruction::exit());
                Ok(())
            }
        }
    }
}
