//! # IR Optimizer
//!
//! Optimization passes over verified IR:
//! - Constant folding of scalar operations (level 1)
//! - Dead code elimination (level 1)
//! - Trivial phi removal (level 2)
//!
//! Folding evaluates through the same numeric kernel both execution modes
//! use, so a folded constant is bit-identical to what either mode would have
//! computed. Operations that would trap at runtime (checked overflow,
//! division by zero) are left in place so the trap still happens.

use super::constants::ConstantPool;
use super::ir::{Instruction, IrFunction, IrModule, IrReg, Terminator};
use crate::numeric;
use crate::runtime::TypedValue;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// What the passes changed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OptimizeStats {
    /// Instructions replaced by constants
    pub folded: usize,
    /// Dead instructions removed
    pub removed: usize,
    /// Phis replaced by their single input
    pub phis_removed: usize,
}

/// Optimizer with configurable optimization level
pub struct Optimizer {
    level: u8,
}

impl Optimizer {
    /// Create a new optimizer with the specified optimization level (0-2)
    pub fn new(level: u8) -> Self {
        Self { level }
    }

    /// Run all enabled passes to a fixpoint
    pub fn optimize(&self, module: &mut IrModule) -> OptimizeStats {
        let mut stats = OptimizeStats::default();
        if self.level == 0 {
            return stats;
        }
        let IrModule {
            constants,
            functions,
            ..
        } = module;
        for func in functions.iter_mut() {
            loop {
                let folded = self.constant_folding(func, constants);
                let phis = if self.level >= 2 {
                    self.remove_trivial_phis(func)
                } else {
                    0
                };
                let removed = self.dead_code_elimination(func);
                stats.folded += folded;
                stats.phis_removed += phis;
                stats.removed += removed;
                if folded + phis + removed == 0 {
                    break;
                }
            }
        }
        debug!(
            level = self.level,
            folded = stats.folded,
            removed = stats.removed,
            phis_removed = stats.phis_removed,
            "optimized module"
        );
        stats
    }

    /// Constant folding - evaluate scalar operations on constant operands
    fn constant_folding(&self, func: &mut IrFunction, constants: &mut ConstantPool) -> usize {
        let mut known: HashMap<IrReg, u64> = HashMap::new();
        for instr in func.blocks.iter().flat_map(|b| &b.instructions) {
            if let Instruction::Const { dst, value } = instr {
                if let Some(bits) = constants.get(*value).and_then(|v| v.bits()) {
                    known.insert(*dst, bits);
                }
            }
        }

        let mut folded = 0;
        for block in &mut func.blocks {
            for instr in &mut block.instructions {
                let Some(value) = fold(instr, &known) else {
                    continue;
                };
                let Some(dst) = instr.dst() else {
                    continue;
                };
                if let Some(bits) = value.bits() {
                    known.insert(dst, bits);
                }
                let id = constants.intern(value);
                *instr = Instruction::Const { dst, value: id };
                folded += 1;
            }
        }
        folded
    }

    /// Dead code elimination - drop removable instructions whose result is unused
    fn dead_code_elimination(&self, func: &mut IrFunction) -> usize {
        let mut used: HashSet<IrReg> = HashSet::new();
        for block in &func.blocks {
            for instr in &block.instructions {
                used.extend(instr.uses());
            }
            used.extend(block.terminator.uses());
        }

        let mut removed = 0;
        for block in &mut func.blocks {
            let before = block.instructions.len();
            block.instructions.retain(|instr| match instr.dst() {
                Some(dst) => used.contains(&dst) || !instr.is_removable(),
                None => true,
            });
            removed += before - block.instructions.len();
        }
        removed
    }

    /// Replace phis whose inputs (ignoring the phi itself) are one register
    fn remove_trivial_phis(&self, func: &mut IrFunction) -> usize {
        let mut replace: HashMap<IrReg, IrReg> = HashMap::new();
        for block in &func.blocks {
            for instr in &block.instructions {
                if let Instruction::Phi { dst, incoming } = instr {
                    let mut sources = incoming.iter().map(|(_, r)| *r).filter(|r| r != dst);
                    if let Some(first) = sources.next() {
                        if sources.all(|r| r == first) {
                            replace.insert(*dst, first);
                        }
                    }
                }
            }
        }
        if replace.is_empty() {
            return 0;
        }

        let resolve = |mut reg: IrReg| {
            // Follow chains of replaced phis; SSA guarantees no cycle
            // survives since every phi keeps one foreign input.
            let mut steps = 0;
            while let Some(next) = replace.get(&reg) {
                reg = *next;
                steps += 1;
                if steps > replace.len() {
                    break;
                }
            }
            reg
        };
        for block in &mut func.blocks {
            block.instructions.retain(|instr| {
                !matches!(instr, Instruction::Phi { dst, .. } if replace.contains_key(dst))
            });
            for instr in &mut block.instructions {
                instr.map_uses(resolve);
            }
            match &mut block.terminator {
                Terminator::Jump(_) => {}
                Terminator::Branch { cond, .. } => *cond = resolve(*cond),
                Terminator::Return(reg) => *reg = resolve(*reg),
            }
        }
        replace.len()
    }
}

/// Result of a foldable instruction whose operands are all known
fn fold(instr: &Instruction, known: &HashMap<IrReg, u64>) -> Option<TypedValue> {
    match instr {
        Instruction::Binary {
            op,
            kind,
            lhs,
            rhs,
            checked,
            ..
        } => {
            let bits = numeric::binary(*op, *kind, *known.get(lhs)?, *known.get(rhs)?, *checked).ok()?;
            Some(TypedValue::scalar(*kind, bits))
        }
        Instruction::Compare {
            op, kind, lhs, rhs, ..
        } => Some(TypedValue::boolean(numeric::compare(
            *op,
            *kind,
            *known.get(lhs)?,
            *known.get(rhs)?,
        ))),
        Instruction::Unary {
            op,
            kind,
            src,
            checked,
            ..
        } => {
            let bits = numeric::unary(*op, *kind, *known.get(src)?, *checked).ok()?;
            Some(TypedValue::scalar(*kind, bits))
        }
        Instruction::Convert { from, to, src, .. } => Some(TypedValue::scalar(
            *to,
            numeric::convert(*from, *to, *known.get(src)?),
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::ast::BinaryOp;
    use crate::compiler::ir::lower_module;
    use crate::compiler::verifier::verify_module;
    use crate::types::{Type, TypeChecker};

    fn lowered(module: crate::ast::Module) -> IrModule {
        lower_module(&TypeChecker::check_module(&module).unwrap()).unwrap()
    }

    fn only_instruction_kinds(func: &IrFunction) -> Vec<&'static str> {
        func.blocks
            .iter()
            .flat_map(|b| &b.instructions)
            .map(|i| i.mnemonic())
            .collect()
    }

    #[test]
    fn test_level_zero_is_identity() {
        let mut m = lowered(module(vec![func("k", vec![], Type::I64, vec![ret(add(int(2), int(3)))])]));
        let before = m.clone();
        assert_eq!(Optimizer::new(0).optimize(&mut m), OptimizeStats::default());
        assert_eq!(m, before);
    }

    #[test]
    fn test_constant_folding() {
        let mut m = lowered(module(vec![func(
            "k",
            vec![],
            Type::I64,
            vec![ret(mul(add(int(2), int(3)), int(4)))],
        )]));
        let stats = Optimizer::new(1).optimize(&mut m);
        assert_eq!(stats.folded, 2);
        assert_eq!(only_instruction_kinds(&m.functions[0]), vec!["const"]);
        let Terminator::Return(reg) = m.functions[0].blocks[0].terminator else {
            panic!("expected return");
        };
        let Instruction::Const { dst, value } = &m.functions[0].blocks[0].instructions[0] else {
            panic!("expected const");
        };
        assert_eq!(*dst, reg);
        assert_eq!(m.constants.get(*value).unwrap().as_i64(), Some(20));
        assert!(verify_module(&m).valid);
    }

    #[test]
    fn test_trapping_operations_are_not_folded() {
        let mut m = lowered(module(vec![
            func(
                "overflow",
                vec![],
                Type::I32,
                vec![
                    let_typed("x", Type::I32, checked(BinaryOp::Add, int(2147483647), int(1))),
                    ret(var("x")),
                ],
            ),
            func("by_zero", vec![], Type::I64, vec![ret(div(int(1), int(0)))]),
        ]));
        let stats = Optimizer::new(2).optimize(&mut m);
        assert_eq!(stats.folded, 0);
        for f in &m.functions {
            assert!(only_instruction_kinds(f).contains(&"binary"));
        }
    }

    #[test]
    fn test_wrapping_add_folds_to_wrapped_value() {
        let mut m = lowered(module(vec![func(
            "wrap",
            vec![],
            Type::I32,
            vec![
                let_typed("x", Type::I32, add(int(2147483647), int(1))),
                ret(var("x")),
            ],
        )]));
        Optimizer::new(1).optimize(&mut m);
        let Instruction::Const { value, .. } = &m.functions[0].blocks[0].instructions[0] else {
            panic!("expected const");
        };
        assert_eq!(m.constants.get(*value).unwrap(), &TypedValue::i32(i32::MIN));
    }

    #[test]
    fn test_dead_code_removed_but_calls_kept() {
        let mut m = lowered(module(vec![
            func("side", vec![], Type::I64, vec![ret(int(1))]),
            func(
                "main",
                vec![param("a", Type::I64)],
                Type::I64,
                vec![
                    let_("unused", add(var("a"), int(9))),
                    expr(call("side", vec![])),
                    ret(var("a")),
                ],
            ),
        ]));
        let stats = Optimizer::new(1).optimize(&mut m);
        assert!(stats.removed >= 2);
        assert_eq!(only_instruction_kinds(&m.functions[1]), vec!["call"]);
    }

    #[test]
    fn test_trivial_loop_phi_removed() {
        let mut m = lowered(module(vec![func(
            "spin",
            vec![param("n", Type::I64)],
            Type::I64,
            vec![
                let_mut("i", int(0)),
                let_mut("k", var("n")),
                while_(
                    lt(var("i"), int(10)),
                    vec![assign("k", var("k")), assign("i", add(var("i"), int(1)))],
                ),
                ret(var("k")),
            ],
        )]));
        let stats = Optimizer::new(2).optimize(&mut m);
        assert_eq!(stats.phis_removed, 1);
        assert!(verify_module(&m).valid);
    }
}
