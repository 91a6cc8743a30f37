//! # TVM64 Instruction Encoding
//!
//! A 64-bit register machine with eleven registers (`r0`-`r10`, `r10` the
//! read-only frame pointer) and a BPF-style fixed-width encoding:
//!
//! ```text
//! byte 0    opcode   (class in bits 0-2, operation in bits 4-7)
//! byte 1    regs     (dst in bits 0-3, src in bits 4-7)
//! byte 2-3  offset   (i16, little-endian)
//! byte 4-7  imm      (i32, little-endian)
//! ```
//!
//! `lddw` takes two slots; the second slot carries the upper 32 bits of the
//! immediate in its `imm` field. Jump offsets count 8-byte slots relative to
//! the next slot.
//!
//! Typed ALU, compare and convert instructions carry a
//! [`ScalarKind`](crate::numeric::ScalarKind) code in `offset` and evaluate
//! through the shared numeric kernel, so they agree bit for bit with the
//! interpreter.

use crate::numeric::{ArithOp, CmpOp, ScalarKind, UnaryOp};

// =============================================================================
// OPCODES
// =============================================================================

/// Instruction classes (lower 3 bits)
pub mod class {
    /// Wide immediate load
    pub const LD: u8 = 0x00;
    /// Load from memory
    pub const LDX: u8 = 0x01;
    /// Typed compare, result 0/1 in dst
    pub const CMP: u8 = 0x02;
    /// Store register
    pub const STX: u8 = 0x03;
    /// Typed ALU, wrapping
    pub const ALU: u8 = 0x04;
    /// Jumps, calls and exit
    pub const JMP: u8 = 0x05;
    /// Typed ALU, trapping on overflow
    pub const ALUC: u8 = 0x06;
}

/// ALU operation codes (bits 4-7)
pub mod alu {
    /// Addition
    pub const ADD: u8 = 0x00;
    /// Subtraction
    pub const SUB: u8 = 0x10;
    /// Multiplication
    pub const MUL: u8 = 0x20;
    /// Division
    pub const DIV: u8 = 0x30;
    /// Bitwise or
    pub const OR: u8 = 0x40;
    /// Bitwise and
    pub const AND: u8 = 0x50;
    /// Left shift
    pub const LSH: u8 = 0x60;
    /// Right shift (arithmetic for signed kinds)
    pub const RSH: u8 = 0x70;
    /// Negation
    pub const NEG: u8 = 0x80;
    /// Remainder
    pub const REM: u8 = 0x90;
    /// Bitwise xor
    pub const XOR: u8 = 0xa0;
    /// Move
    pub const MOV: u8 = 0xb0;
    /// Logical/bitwise not
    pub const NOT: u8 = 0xc0;
    /// Absolute value
    pub const ABS: u8 = 0xd0;
    /// Square root
    pub const SQRT: u8 = 0xe0;
    /// Conversion: `offset` = source kind, `imm` = target kind
    pub const CONV: u8 = 0xf0;
}

/// Compare operation codes (bits 4-7 of a `CMP` opcode)
pub mod cmp {
    /// ==
    pub const EQ: u8 = 0x00;
    /// !=
    pub const NE: u8 = 0x10;
    /// <
    pub const LT: u8 = 0x20;
    /// <=
    pub const LE: u8 = 0x30;
    /// >
    pub const GT: u8 = 0x40;
    /// >=
    pub const GE: u8 = 0x50;
}

/// Jump operation codes
pub mod jmp {
    /// Unconditional
    pub const JA: u8 = 0x00;
    /// Jump if dst == imm
    pub const JEQ: u8 = 0x10;
    /// Jump if dst != imm
    pub const JNE: u8 = 0x50;
    /// Call: src=1 function id in imm, src=0 helper hash in imm
    pub const CALL: u8 = 0x80;
    /// Return from function
    pub const EXIT: u8 = 0x90;
    /// Call the function whose id is in dst
    pub const CALLX: u8 = 0xe0;
}

/// Memory size modifiers
pub mod size {
    /// 32-bit word
    pub const W: u8 = 0x00;
    /// 16-bit half
    pub const H: u8 = 0x08;
    /// 8-bit byte
    pub const B: u8 = 0x10;
    /// 64-bit double word
    pub const DW: u8 = 0x18;
}

/// Memory mode modifiers
pub mod mode {
    /// Immediate (lddw)
    pub const IMM: u8 = 0x00;
    /// reg + offset, zero-extending
    pub const MEM: u8 = 0x60;
    /// reg + offset, sign-extending
    pub const MEMSX: u8 = 0x80;
}

/// Source modifier: immediate operand
pub const SRC_IMM: u8 = 0x00;
/// Source modifier: register operand
pub const SRC_REG: u8 = 0x08;

/// `call` src value selecting a function id
pub const CALL_FUNCTION: u8 = 1;
/// `call` src value selecting a helper hash
pub const CALL_HELPER: u8 = 0;

/// Frame pointer register
pub const FP: u8 = 10;

// =============================================================================
// MURMUR3 HASH FOR HELPER SYMBOLS
// =============================================================================

/// Murmur3 32-bit hash; helper calls carry the hash of the helper name
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e2d51;
    const C2: u32 = 0x1b873593;

    let mut hash = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(13).wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, byte) in tail.iter().enumerate() {
            k |= (*byte as u32) << (8 * i);
        }
        hash ^= k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
    }

    hash ^= data.len() as u32;
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85ebca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2ae35);
    hash ^= hash >> 16;
    hash
}

/// Hash of a helper symbol name
pub fn helper_hash(name: &str) -> u32 {
    murmur3_32(name.as_bytes(), 0)
}

// =============================================================================
// OPERATION CODE TABLES
// =============================================================================

/// ALU code for a binary operator
pub fn arith_code(op: ArithOp) -> u8 {
    match op {
        ArithOp::Add => alu::ADD,
        ArithOp::Sub => alu::SUB,
        ArithOp::Mul => alu::MUL,
        ArithOp::Div => alu::DIV,
        ArithOp::Rem => alu::REM,
        ArithOp::And => alu::AND,
        ArithOp::Or => alu::OR,
        ArithOp::Xor => alu::XOR,
        ArithOp::Shl => alu::LSH,
        ArithOp::Shr => alu::RSH,
    }
}

/// Binary operator for an ALU code
pub fn arith_op(code: u8) -> Option<ArithOp> {
    Some(match code {
        alu::ADD => ArithOp::Add,
        alu::SUB => ArithOp::Sub,
        alu::MUL => ArithOp::Mul,
        alu::DIV => ArithOp::Div,
        alu::REM => ArithOp::Rem,
        alu::AND => ArithOp::And,
        alu::OR => ArithOp::Or,
        alu::XOR => ArithOp::Xor,
        alu::LSH => ArithOp::Shl,
        alu::RSH => ArithOp::Shr,
        _ => return None,
    })
}

/// ALU code for a unary operator
pub fn unary_code(op: UnaryOp) -> u8 {
    match op {
        UnaryOp::Neg => alu::NEG,
        UnaryOp::Not => alu::NOT,
        UnaryOp::Abs => alu::ABS,
        UnaryOp::Sqrt => alu::SQRT,
    }
}

/// Unary operator for an ALU code
pub fn unary_op(code: u8) -> Option<UnaryOp> {
    Some(match code {
        alu::NEG => UnaryOp::Neg,
        alu::NOT => UnaryOp::Not,
        alu::ABS => UnaryOp::Abs,
        alu::SQRT => UnaryOp::Sqrt,
        _ => return None,
    })
}

/// CMP code for a comparison
pub fn cmp_code(op: CmpOp) -> u8 {
    match op {
        CmpOp::Eq => cmp::EQ,
        CmpOp::Ne => cmp::NE,
        CmpOp::Lt => cmp::LT,
        CmpOp::Le => cmp::LE,
        CmpOp::Gt => cmp::GT,
        CmpOp::Ge => cmp::GE,
    }
}

/// Comparison for a CMP code
pub fn cmp_op(code: u8) -> Option<CmpOp> {
    Some(match code {
        cmp::EQ => CmpOp::Eq,
        cmp::NE => CmpOp::Ne,
        cmp::LT => CmpOp::Lt,
        cmp::LE => CmpOp::Le,
        cmp::GT => CmpOp::Gt,
        cmp::GE => CmpOp::Ge,
        _ => return None,
    })
}

/// Size modifier for a 1/2/4/8-byte access
pub fn size_code(bytes: usize) -> Option<u8> {
    Some(match bytes {
        1 => size::B,
        2 => size::H,
        4 => size::W,
        8 => size::DW,
        _ => return None,
    })
}

/// Byte width of a size modifier
pub fn size_bytes(code: u8) -> usize {
    match code & 0x18 {
        size::B => 1,
        size::H => 2,
        size::W => 4,
        _ => 8,
    }
}

// =============================================================================
// TVM64 INSTRUCTION
// =============================================================================

/// TVM64 instruction (8 bytes standard, 16 bytes for lddw)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TvmInstruction {
    /// Full opcode byte
    pub opcode: u8,
    /// Destination register (0-10)
    pub dst: u8,
    /// Source register (0-10)
    pub src: u8,
    /// Signed offset for memory/jumps, kind code for typed ops
    pub offset: i16,
    /// 32-bit immediate value
    pub imm: i32,
    /// For lddw: upper 32 bits of the 64-bit immediate
    pub imm64_hi: Option<u32>,
}

/// Opcode of `lddw`
pub const LDDW: u8 = class::LD | size::DW | mode::IMM;

impl TvmInstruction {
    /// Create a standard 8-byte instruction
    pub fn new(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Self {
        Self {
            opcode,
            dst,
            src,
            offset,
            imm,
            imm64_hi: None,
        }
    }

    /// Load a 64-bit constant (16 bytes)
    pub fn lddw(dst: u8, value: u64) -> Self {
        Self {
            opcode: LDDW,
            dst,
            src: 0,
            offset: 0,
            imm: value as u32 as i32,
            imm64_hi: Some((value >> 32) as u32),
        }
    }

    /// Typed ALU with register operand: `dst = dst op src`
    pub fn alu_reg(op: u8, kind: ScalarKind, dst: u8, src: u8, checked: bool) -> Self {
        let class = if checked { class::ALUC } else { class::ALU };
        Self::new(class | op | SRC_REG, dst, src, kind.code() as i16, 0)
    }

    /// Typed ALU with immediate operand: `dst = dst op imm`
    pub fn alu_imm(op: u8, kind: ScalarKind, dst: u8, imm: i32) -> Self {
        Self::new(class::ALU | op | SRC_IMM, dst, 0, kind.code() as i16, imm)
    }

    /// 64-bit register move
    pub fn mov(dst: u8, src: u8) -> Self {
        Self::alu_reg(alu::MOV, ScalarKind::U64, dst, src, false)
    }

    /// 64-bit immediate move (sign-extended)
    pub fn mov_imm(dst: u8, imm: i32) -> Self {
        Self::alu_imm(alu::MOV, ScalarKind::U64, dst, imm)
    }

    /// 64-bit address arithmetic: `dst += imm`
    pub fn add_imm(dst: u8, imm: i32) -> Self {
        Self::alu_imm(alu::ADD, ScalarKind::U64, dst, imm)
    }

    /// Typed unary operation on `dst`
    pub fn unary(op: UnaryOp, kind: ScalarKind, dst: u8, checked: bool) -> Self {
        let class = if checked { class::ALUC } else { class::ALU };
        Self::new(class | unary_code(op) | SRC_REG, dst, dst, kind.code() as i16, 0)
    }

    /// `dst = convert(from, to, src)`
    pub fn conv(from: ScalarKind, to: ScalarKind, dst: u8, src: u8) -> Self {
        Self::new(class::ALU | alu::CONV | SRC_REG, dst, src, from.code() as i16, to.code() as i32)
    }

    /// `dst = (dst op src) as 0/1`
    pub fn compare(op: CmpOp, kind: ScalarKind, dst: u8, src: u8) -> Self {
        Self::new(class::CMP | cmp_code(op) | SRC_REG, dst, src, kind.code() as i16, 0)
    }

    /// Load from memory: `dst = *(src + offset)`
    pub fn ldx(sz: u8, dst: u8, src: u8, offset: i16, sign_extend: bool) -> Self {
        let mode = if sign_extend { mode::MEMSX } else { mode::MEM };
        Self::new(class::LDX | sz | mode, dst, src, offset, 0)
    }

    /// Store to memory: `*(dst + offset) = src`
    pub fn stx(sz: u8, dst: u8, src: u8, offset: i16) -> Self {
        Self::new(class::STX | sz | mode::MEM, dst, src, offset, 0)
    }

    /// Unconditional jump
    pub fn ja(offset: i16) -> Self {
        Self::new(class::JMP | jmp::JA, 0, 0, offset, 0)
    }

    /// Conditional jump against an immediate
    pub fn jmp_imm(op: u8, dst: u8, imm: i32, offset: i16) -> Self {
        Self::new(class::JMP | op | SRC_IMM, dst, 0, offset, imm)
    }

    /// Call a function by id
    pub fn call_function(id: u32) -> Self {
        Self::new(class::JMP | jmp::CALL, 0, CALL_FUNCTION, 0, id as i32)
    }

    /// Call a helper by symbol hash
    pub fn call_helper(hash: u32) -> Self {
        Self::new(class::JMP | jmp::CALL, 0, CALL_HELPER, 0, hash as i32)
    }

    /// Call the function whose id is in `dst`
    pub fn callx(dst: u8) -> Self {
        Self::new(class::JMP | jmp::CALLX, dst, 0, 0, 0)
    }

    /// Return to the caller
    pub fn exit() -> Self {
        Self::new(class::JMP | jmp::EXIT, 0, 0, 0, 0)
    }

    /// Instruction class
    pub fn class(&self) -> u8 {
        self.opcode & 0x07
    }

    /// Operation bits
    pub fn op(&self) -> u8 {
        self.opcode & 0xf0
    }

    /// True when the second operand is a register
    pub fn uses_src_reg(&self) -> bool {
        self.opcode & SRC_REG != 0
    }

    /// Number of 8-byte slots this instruction occupies
    pub fn slots(&self) -> usize {
        if self.imm64_hi.is_some() {
            2
        } else {
            1
        }
    }

    /// Full 64-bit immediate of an `lddw`
    pub fn imm64(&self) -> u64 {
        let lo = self.imm as u32 as u64;
        let hi = self.imm64_hi.unwrap_or(0) as u64;
        (hi << 32) | lo
    }

    /// True for jumps that transfer control within the function
    pub fn is_jump(&self) -> bool {
        self.class() == class::JMP && matches!(self.op(), jmp::JA | jmp::JEQ | jmp::JNE)
    }

    /// Encode to bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16);
        bytes.push(self.opcode);
        bytes.push((self.src << 4) | (self.dst & 0x0f));
        bytes.extend_from_slice(&self.offset.to_le_bytes());
        bytes.extend_from_slice(&self.imm.to_le_bytes());
        if let Some(hi) = self.imm64_hi {
            bytes.extend_from_slice(&[0, 0, 0, 0]);
            bytes.extend_from_slice(&hi.to_le_bytes());
        }
        bytes
    }
}

/// Why a byte stream is not a valid instruction sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeIssue {
    /// Length is not a multiple of 8
    Truncated(usize),
    /// `lddw` at the last slot
    MissingWideHalf(usize),
}

/// Decode a code stream. The result is indexed by slot: an `lddw` occupies
/// its slot and the following slot holds a copy of it, so jump targets can be
/// validated against slot boundaries.
pub fn decode_program(code: &[u8]) -> Result<Vec<TvmInstruction>, DecodeIssue> {
    if code.len() % 8 != 0 {
        return Err(DecodeIssue::Truncated(code.len()));
    }
    let slot = |i: usize| {
        let b = &code[i * 8..i * 8 + 8];
        TvmInstruction::new(
            b[0],
            b[1] & 0x0f,
            b[1] >> 4,
            i16::from_le_bytes([b[2], b[3]]),
            i32::from_le_bytes([b[4], b[5], b[6], b[7]]),
        )
    };
    let count = code.len() / 8;
    let mut program = Vec::with_capacity(count);
    let mut i = 0;
    while i < count {
        let mut insn = slot(i);
        if insn.opcode == LDDW {
            if i + 1 >= count {
                return Err(DecodeIssue::MissingWideHalf(i));
            }
            insn.imm64_hi = Some(slot(i + 1).imm as u32);
            program.push(insn);
            program.push(insn);
            i += 2;
        } else {
            program.push(insn);
            i += 1;
        }
    }
    Ok(program)
}

/// Encode a sequence of instructions
pub fn encode_program(program: &[TvmInstruction]) -> Vec<u8> {
    program.iter().flat_map(|i| i.encode()).collect()
}

// =============================================================================
// DISASSEMBLY
// =============================================================================

fn kind_name(code: i16) -> String {
    u8::try_from(code)
        .ok()
        .and_then(ScalarKind::from_code)
        .map_or_else(|| format!("k{}", code), |k| k.to_string())
}

/// Format one instruction as assembly
pub fn format_instruction(insn: &TvmInstruction) -> String {
    let operand = |insn: &TvmInstruction| {
        if insn.uses_src_reg() {
            format!("r{}", insn.src)
        } else {
            insn.imm.to_string()
        }
    };
    match insn.class() {
        class::LD if insn.opcode == LDDW => format!("lddw r{}, 0x{:x}", insn.dst, insn.imm64()),
        class::LDX => {
            let sx = if insn.opcode & 0xe0 == mode::MEMSX { "sx" } else { "" };
            format!(
                "ldx{}{} r{}, [r{}{:+}]",
                size_bytes(insn.opcode) * 8,
                sx,
                insn.dst,
                insn.src,
                insn.offset
            )
        }
        class::STX => format!(
            "stx{} [r{}{:+}], r{}",
            size_bytes(insn.opcode) * 8,
            insn.dst,
            insn.offset,
            insn.src
        ),
        class::ALU | class::ALUC => {
            let bang = if insn.class() == class::ALUC { "!" } else { "" };
            let kind = kind_name(insn.offset);
            match insn.op() {
                alu::MOV => format!("mov.{} r{}, {}", kind, insn.dst, operand(insn)),
                alu::CONV => format!(
                    "conv {} -> {} r{}, r{}",
                    kind,
                    kind_name(insn.imm as i16),
                    insn.dst,
                    insn.src
                ),
                op => {
                    if let Some(u) = unary_op(op) {
                        format!("{:?}{}.{} r{}", u, bang, kind, insn.dst).to_lowercase()
                    } else if let Some(a) = arith_op(op) {
                        format!("{:?}{}.{} r{}, {}", a, bang, kind, insn.dst, operand(insn)).to_lowercase()
                    } else {
                        format!("alu?{:#04x}", insn.opcode)
                    }
                }
            }
        }
        class::CMP => match cmp_op(insn.op()) {
            Some(op) => format!("set{:?}.{} r{}, r{}", op, kind_name(insn.offset), insn.dst, insn.src).to_lowercase(),
            None => format!("cmp?{:#04x}", insn.opcode),
        },
        class::JMP => match insn.op() {
            jmp::JA => format!("ja {:+}", insn.offset),
            jmp::JEQ => format!("jeq r{}, {}, {:+}", insn.dst, insn.imm, insn.offset),
            jmp::JNE => format!("jne r{}, {}, {:+}", insn.dst, insn.imm, insn.offset),
            jmp::CALL if insn.src == CALL_FUNCTION => format!("call f{}", insn.imm),
            jmp::CALL => match super::helpers::helper_name(insn.imm as u32) {
                Some(name) => format!("call {}", name),
                None => format!("call 0x{:08x}", insn.imm as u32),
            },
            jmp::CALLX => format!("callx r{}", insn.dst),
            jmp::EXIT => "exit".to_string(),
            _ => format!("jmp?{:#04x}", insn.opcode),
        },
        _ => format!("unknown {:#04x}", insn.opcode),
    }
}

/// Disassemble a code stream, one `offset: asm` line per instruction
pub fn disassemble(code: &[u8]) -> Vec<String> {
    match decode_program(code) {
        Ok(program) => {
            let mut lines = Vec::new();
            let mut i = 0;
            while i < program.len() {
                let insn = &program[i];
                lines.push(format!("{:04}: {}", i, format_instruction(insn)));
                i += insn.slots();
            }
            lines
        }
        Err(issue) => vec![format!("<undecodable: {:?}>", issue)],
    }
}
