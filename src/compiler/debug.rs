//! Debug utilities for lowered modules
//!
//! Tools for inspecting IR as text or JSON and, with the `native` feature,
//! TVM64 machine code.

use super::ir::{Instruction, IrFunction, IrModule, Terminator};
use crate::numeric::UnaryOp;
use std::fmt::Write as _;

/// Print a module in human-readable format
pub fn dump_ir(module: &IrModule) {
    println!("═══════════════════════════════════════════════════════════");
    println!("                    IR DUMP");
    println!("═══════════════════════════════════════════════════════════");
    println!(
        "Types: {}  Constants: {}  Functions: {}",
        module.types.len(),
        module.constants.len(),
        module.functions.len()
    );
    println!("───────────────────────────────────────────────────────────");
    print!("{}", format_module(module));
    println!("═══════════════════════════════════════════════════════════\n");
}

/// Render a module as text
pub fn format_module(module: &IrModule) -> String {
    let mut out = String::new();
    for func in &module.functions {
        out.push_str(&format_function(module, func));
        out.push('\n');
    }
    out
}

/// Render one function as text
pub fn format_function(module: &IrModule, func: &IrFunction) -> String {
    let ty = |reg| {
        module
            .reg_ty(func, reg)
            .map_or_else(|| "?".to_string(), |t| t.to_string())
    };
    let mut out = String::new();
    let params: Vec<String> = func.params.iter().map(|p| format!("{}: {}", p, ty(*p))).collect();
    let ret = module
        .ty(func.ret_type)
        .map_or_else(|| "?".to_string(), |t| t.to_string());
    let _ = writeln!(out, "fn {} {}({}) -> {} {{", func.id, func.name, params.join(", "), ret);
    if !func.slot_types.is_empty() {
        let slots: Vec<String> = func
            .slot_types
            .iter()
            .map(|t| module.ty(*t).map_or_else(|| "?".to_string(), |t| t.to_string()))
            .collect();
        let _ = writeln!(out, "  slots: [{}]", slots.join(", "));
    }
    for block in &func.blocks {
        let _ = writeln!(out, "{}:  ; {}", block.label, block.id);
        for instr in &block.instructions {
            let body = format_ir_instr(module, instr);
            match instr.dst() {
                Some(dst) => {
                    let _ = writeln!(out, "  {}: {} = {}", dst, ty(dst), body);
                }
                None => {
                    let _ = writeln!(out, "  {}", body);
                }
            }
        }
        let _ = writeln!(out, "  {}", format_terminator(&block.terminator));
    }
    out.push('}');
    out
}

fn list(regs: &[crate::compiler::ir::IrReg]) -> String {
    regs.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(", ")
}

/// Format a single IR instruction (right-hand side only)
pub fn format_ir_instr(module: &IrModule, instr: &Instruction) -> String {
    use Instruction::*;
    let bang = |checked: &bool| if *checked { "!" } else { "" };
    match instr {
        Const { value, .. } => match module.constants.get(*value) {
            Some(v) => format!("const {}", v),
            None => format!("const c{}?", value.0),
        },
        Binary {
            op,
            kind,
            lhs,
            rhs,
            checked,
            ..
        } => format!("{} {}{} {}  ; {}", lhs, op.symbol(), bang(checked), rhs, kind),
        Compare {
            op, kind, lhs, rhs, ..
        } => format!("{} {} {}  ; {}", lhs, op.symbol(), rhs, kind),
        Unary {
            op,
            kind,
            src,
            checked,
            ..
        } => {
            let name = match op {
                UnaryOp::Neg => "neg",
                UnaryOp::Not => "not",
                UnaryOp::Abs => "abs",
                UnaryOp::Sqrt => "sqrt",
            };
            format!("{}{} {}  ; {}", name, bang(checked), src, kind)
        }
        Convert { from, to, src, .. } => format!("convert {} {} -> {}", src, from, to),
        ComplexBinary { op, lhs, rhs, .. } => format!("{} {} {}  ; complex", lhs, op.symbol(), rhs),
        ComplexCompare { op, lhs, rhs, .. } => format!("{} {} {}  ; complex", lhs, op.symbol(), rhs),
        ComplexUnary { op, src, .. } => format!("{:?} {}", op, src).to_lowercase(),
        Instruction::ComplexPart { part, src, .. } => format!("{:?} {}", part, src).to_lowercase(),
        MakeComplex { re, im, .. } => format!("complex({}, {})", re, im),
        MakeStruct { fields, .. } => format!("{{{}}}", list(fields)),
        ExtractField { src, index, .. } => format!("{}.{}", src, index),
        InsertField {
            src, index, value, ..
        } => format!("{} with .{} = {}", src, index, value),
        StackSlot { slot, .. } => format!("slot {}", slot),
        Load { addr, .. } => format!("load {}", addr),
        Store { addr, value } => format!("store {} <- {}", addr, value),
        Call { func, args, .. } => {
            let name = module.function(*func).map_or("?", |f| f.name.as_str());
            format!("call {} {}({})", func, name, list(args))
        }
        FuncRef { func, .. } => format!("funcref {}", func),
        CallIndirect { callee, args, .. } => format!("call *{}({})", callee, list(args)),
        Phi { incoming, .. } => {
            let parts: Vec<String> = incoming.iter().map(|(b, r)| format!("[{}, {}]", b, r)).collect();
            format!("phi {}", parts.join(" "))
        }
        MakeTensor { elements, .. } => format!("[{}]", list(elements)),
        TensorBinary {
            op,
            lhs,
            rhs,
            checked,
            ..
        } => format!("{} .{}{} {}", lhs, op.symbol(), bang(checked), rhs),
        TensorScale {
            tensor,
            factor,
            checked,
            ..
        } => format!("scale{} {} by {}", bang(checked), tensor, factor),
        Dot { lhs, rhs, .. } => format!("dot {}, {}", lhs, rhs),
        MatMul { lhs, rhs, .. } => format!("matmul {}, {}", lhs, rhs),
        Sum { src, .. } => format!("sum {}", src),
        ExtractElement { src, indices, .. } => format!("{}[{}]", src, list(indices)),
        Dim { src, axis, .. } => format!("dim {}, {}", src, axis),
        TensorCast { src, .. } => format!("tcast {}", src),
    }
}

/// Format a block terminator
pub fn format_terminator(terminator: &Terminator) -> String {
    match terminator {
        Terminator::Jump(b) => format!("jump {}", b),
        Terminator::Branch {
            cond,
            then_block,
            else_block,
        } => format!("branch {}, {}, {}", cond, then_block, else_block),
        Terminator::Return(r) => format!("ret {}", r),
    }
}

/// Serialize a module to pretty JSON
pub fn dump_ir_json(module: &IrModule) -> serde_json::Result<String> {
    serde_json::to_string_pretty(module)
}

/// Disassemble TVM64 code, one line per instruction
#[cfg(feature = "native")]
pub fn disassemble_native(code: &[u8]) -> Vec<String> {
    crate::native::encoding::disassemble(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::compiler::ir::lower_module;
    use crate::types::{Type, TypeChecker};

    fn sample() -> IrModule {
        let m = module(vec![func(
            "clamp",
            vec![param("x", Type::I32)],
            Type::I32,
            vec![
                if_(lt(var("x"), int(0)), vec![ret(int(0))], vec![]),
                ret(var("x")),
            ],
        )]);
        lower_module(&TypeChecker::check_module(&m).unwrap()).unwrap()
    }

    #[test]
    fn test_text_dump() {
        let text = format_module(&sample());
        assert!(text.starts_with("fn f0 clamp(%0: i32) -> i32 {"));
        assert!(text.contains("branch %"));
        assert!(text.contains("const 0"));
        assert!(text.contains("ret %0"));
    }

    #[test]
    fn test_json_dump() {
        let json = dump_ir_json(&sample()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["functions"][0]["name"], "clamp");
        assert!(value["constants"].as_array().unwrap().len() >= 1);
    }
}
