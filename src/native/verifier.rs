//! # TVM64 Code Verifier
//!
//! Validates lowered code before the machine will load it: every jump lands
//! on an instruction boundary inside the function, register numbers are in
//! range and `r10` is never written, control cannot run off the end, and
//! every call names a registered helper or an existing function.

use super::encoding::{class, jmp, TvmInstruction, CALL_FUNCTION, FP, LDDW};
use super::helpers;

/// Largest function the verifier accepts, in 8-byte slots
pub const MAX_SLOTS: usize = 1 << 20;

/// Verification result with warnings
#[derive(Debug)]
pub struct VerifyResult {
    /// Code is valid for execution
    pub valid: bool,
    /// Errors that prevent execution
    pub errors: Vec<VerifyError>,
    /// Warnings (non-fatal)
    pub warnings: Vec<String>,
    /// Statistics
    pub stats: CodeStats,
}

/// Code statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CodeStats {
    /// Instruction count (an `lddw` counts once)
    pub instruction_count: usize,
    /// Encoded size in bytes
    pub code_size: usize,
    /// Helper calls
    pub helper_calls: usize,
    /// Calls to other functions
    pub function_calls: usize,
    /// Jumps with a negative offset
    pub backward_jumps: usize,
}

/// Verification error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    /// No instructions at all
    Empty,
    /// Function exceeds the slot limit
    TooLarge {
        /// Slots used
        slots: usize,
        /// Maximum allowed
        limit: usize,
    },
    /// Opcode outside the instruction set
    InvalidOpcode {
        /// Byte offset
        offset: usize,
        /// Opcode byte
        opcode: u8,
    },
    /// Register number above 10
    InvalidRegister {
        /// Byte offset
        offset: usize,
        /// Register number
        reg: u8,
    },
    /// Instruction writes the frame pointer
    FramePointerWrite {
        /// Byte offset
        offset: usize,
    },
    /// Jump lands outside the function or inside an `lddw`
    BadJumpTarget {
        /// Byte offset
        offset: usize,
        /// Target slot
        target: i64,
    },
    /// Helper hash not in the registry
    UnknownHelper {
        /// Byte offset
        offset: usize,
        /// Hash
        hash: u32,
    },
    /// Function id not in the module
    UnknownFunction {
        /// Byte offset
        offset: usize,
        /// Function id
        id: u32,
    },
    /// Last instruction neither exits nor jumps
    FallsOffEnd,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::Empty => write!(f, "Function has no instructions"),
            VerifyError::TooLarge { slots, limit } => {
                write!(f, "Function too large: {} slots (limit: {})", slots, limit)
            }
            VerifyError::InvalidOpcode { offset, opcode } => {
                write!(f, "Invalid opcode 0x{:02x} at offset {}", opcode, offset)
            }
            VerifyError::InvalidRegister { offset, reg } => {
                write!(f, "Invalid register {} at offset {}", reg, offset)
            }
            VerifyError::FramePointerWrite { offset } => {
                write!(f, "Write to r10 at offset {}", offset)
            }
            VerifyError::BadJumpTarget { offset, target } => {
                write!(f, "Jump at offset {} targets slot {}", offset, target)
            }
            VerifyError::UnknownHelper { offset, hash } => {
                write!(f, "Unknown helper 0x{:08x} at offset {}", hash, offset)
            }
            VerifyError::UnknownFunction { offset, id } => {
                write!(f, "Call to unknown function {} at offset {}", id, offset)
            }
            VerifyError::FallsOffEnd => write!(f, "Control can run past the last instruction"),
        }
    }
}

/// TVM64 code verifier
pub struct Verifier {
    /// Number of functions callable by id
    function_count: usize,
    /// Strict mode (treat warnings as errors)
    strict: bool,
}

impl Verifier {
    /// Verifier for code in a module with `function_count` functions
    pub fn new(function_count: usize) -> Self {
        Self {
            function_count,
            strict: false,
        }
    }

    /// Enable strict mode
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Verify one function's instruction list
    pub fn verify(&self, program: &[TvmInstruction]) -> VerifyResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut stats = CodeStats {
            instruction_count: program.len(),
            code_size: program.iter().map(|i| i.slots() * 8).sum(),
            ..CodeStats::default()
        };

        if program.is_empty() {
            errors.push(VerifyError::Empty);
        }

        // Slot of each instruction; lddw takes two
        let mut slot_positions = Vec::with_capacity(program.len());
        let mut total_slots = 0usize;
        for insn in program {
            slot_positions.push(total_slots);
            total_slots += insn.slots();
        }
        if total_slots > MAX_SLOTS {
            errors.push(VerifyError::TooLarge {
                slots: total_slots,
                limit: MAX_SLOTS,
            });
        }
        let boundaries: std::collections::HashSet<usize> = slot_positions.iter().copied().collect();

        for (idx, insn) in program.iter().enumerate() {
            let offset = slot_positions[idx] * 8;

            if !is_known_opcode(insn) {
                errors.push(VerifyError::InvalidOpcode {
                    offset,
                    opcode: insn.opcode,
                });
                continue;
            }

            for reg in [insn.dst, insn.src] {
                if reg > FP {
                    errors.push(VerifyError::InvalidRegister { offset, reg });
                }
            }
            if writes_dst(insn) && insn.dst == FP {
                errors.push(VerifyError::FramePointerWrite { offset });
            }

            if insn.is_jump() {
                let target = slot_positions[idx] as i64 + 1 + insn.offset as i64;
                let lands = usize::try_from(target).map_or(false, |t| boundaries.contains(&t));
                if !lands {
                    errors.push(VerifyError::BadJumpTarget { offset, target });
                }
                if insn.offset < 0 {
                    stats.backward_jumps += 1;
                }
            }

            if insn.class() == class::JMP && insn.op() == jmp::CALL {
                if insn.src == CALL_FUNCTION {
                    stats.function_calls += 1;
                    let id = insn.imm as u32;
                    if id as usize >= self.function_count {
                        errors.push(VerifyError::UnknownFunction { offset, id });
                    }
                } else {
                    stats.helper_calls += 1;
                    let hash = insn.imm as u32;
                    if !helpers::is_known(hash) {
                        errors.push(VerifyError::UnknownHelper { offset, hash });
                    }
                }
            }
        }

        if let Some(last) = program.last() {
            let terminal = last.class() == class::JMP && matches!(last.op(), jmp::EXIT | jmp::JA);
            if !terminal {
                errors.push(VerifyError::FallsOffEnd);
            }
        }

        if stats.backward_jumps > 0 && stats.function_calls == 0 && stats.helper_calls == 0 {
            warnings.push(format!(
                "{} loop back-edge(s) with no calls; abort is only observed on back-edges",
                stats.backward_jumps
            ));
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

fn is_known_opcode(insn: &TvmInstruction) -> bool {
    use super::encoding::{alu, arith_op, cmp_op, mode, unary_op};
    match insn.class() {
        class::LD => insn.opcode == LDDW,
        class::LDX => matches!(insn.opcode & 0xe0, mode::MEM | mode::MEMSX),
        class::STX => insn.opcode & 0xe0 == mode::MEM,
        class::ALU | class::ALUC => {
            let op = insn.op();
            op == alu::MOV || op == alu::CONV || arith_op(op).is_some() || unary_op(op).is_some()
        }
        class::CMP => cmp_op(insn.op()).is_some(),
        class::JMP => matches!(
            insn.op(),
            jmp::JA | jmp::JEQ | jmp::JNE | jmp::CALL | jmp::EXIT | jmp::CALLX
        ),
        _ => false,
    }
}

fn writes_dst(insn: &TvmInstruction) -> bool {
    matches!(
        insn.class(),
        class::LD | class::LDX | class::ALU | class::ALUC | class::CMP
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::encoding::{alu, size};
    use crate::numeric::ScalarKind;

    #[test]
    fn test_valid_program() {
        let program = vec![
            TvmInstruction::lddw(0, u64::MAX),
            TvmInstruction::jmp_imm(jmp::JEQ, 0, 0, 1),
            TvmInstruction::alu_imm(alu::ADD, ScalarKind::I64, 0, 1),
            TvmInstruction::stx(size::DW, FP, 0, 8),
            TvmInstruction::exit(),
        ];
        let result = Verifier::new(1).verify(&program);
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.stats.code_size, 48);
    }

    #[test]
    fn test_jump_into_lddw_rejected() {
        let program = vec![
            TvmInstruction::ja(0),
            TvmInstruction::lddw(1, 7),
            TvmInstruction::jmp_imm(jmp::JNE, 1, 0, -3),
            TvmInstruction::exit(),
        ];
        let result = Verifier::new(1).verify(&program);
        assert!(result.valid, "{:?}", result.errors);
        assert_eq!(result.stats.backward_jumps, 1);
        assert_eq!(result.warnings.len(), 1);
        let bad = vec![TvmInstruction::lddw(1, 7), TvmInstruction::ja(-2), TvmInstruction::exit()];
        let result = Verifier::new(1).verify(&bad);
        assert_eq!(
            result.errors,
            vec![VerifyError::BadJumpTarget {
                offset: 16,
                target: 1
            }]
        );
    }

    #[test]
    fn test_frame_pointer_and_calls() {
        let program = vec![
            TvmInstruction::mov_imm(FP, 0),
            TvmInstruction::call_function(3),
            TvmInstruction::call_helper(0xdead_beef),
            TvmInstruction::mov_imm(0, 0),
        ];
        let result = Verifier::new(2).verify(&program);
        assert!(!result.valid);
        assert!(result.errors.contains(&VerifyError::FramePointerWrite { offset: 0 }));
        assert!(result.errors.contains(&VerifyError::UnknownFunction { offset: 8, id: 3 }));
        assert!(result.errors.contains(&VerifyError::UnknownHelper {
            offset: 16,
            hash: 0xdead_beef
        }));
        assert!(result.errors.contains(&VerifyError::FallsOffEnd));
    }
}
