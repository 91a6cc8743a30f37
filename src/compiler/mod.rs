//! # Tessera Compiler
//!
//! Turns a type-annotated [`ast::Module`](crate::ast::Module) into a verified
//! [`CompilationUnit`] that both execution modes run from.
//!
//! ## Architecture
//!
//! ```text
//! AST → TypeChecker → Typed AST → IR lowering → IR verify → Optimizer → IR verify
//!                                                                        ↓
//!                                            CompilationUnit {IR, layouts, constants}
//!                                                                        ↓
//!                                              Interpreter | TVM64 native lowering
//! ```
//!
//! The second verification pass runs only when the optimizer changed
//! something.
//!
//! ## Usage
//!
//! ```ignore
//! use tessera::compiler::{Compiler, CompileOptions};
//!
//! let unit = Compiler::new(CompileOptions::default()).compile(&module)?;
//! println!("{} functions", unit.module.functions.len());
//! ```

pub mod constants;
pub mod debug;
pub mod ir;
pub mod layout;
pub mod optimizer;
pub mod verifier;

pub use constants::ConstantPool;
pub use layout::{Layout, LayoutCache, LayoutResolver, Storage};
pub use optimizer::{OptimizeStats, Optimizer};
pub use verifier::{verify_module, IrVerifier, VerifyError, VerifyResult};

use crate::ast;
use crate::types::{Type, TypeChecker};
use crate::Result;
use ir::{FunctionId, IrFunction, IrModule};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Compilation options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Optimization level (0-2)
    pub opt_level: u8,
    /// Run the IR verifier after lowering and after optimization
    pub verify_ir: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            opt_level: 1,
            verify_ir: true,
        }
    }
}

impl CompileOptions {
    /// Set the optimization level
    pub fn opt_level(mut self, level: u8) -> Self {
        self.opt_level = level.min(2);
        self
    }

    /// Skip IR verification
    pub fn skip_verify(mut self) -> Self {
        self.verify_ir = false;
        self
    }
}

/// Counters gathered while compiling a unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileStats {
    /// Functions lowered
    pub functions: usize,
    /// Basic blocks after optimization
    pub blocks: usize,
    /// IR instructions before optimization
    pub instructions_before: usize,
    /// IR instructions after optimization
    pub instructions_after: usize,
    /// Optimizer counters
    pub optimize: OptimizeStats,
}

/// A verified, immutable compilation unit.
///
/// Owns the type table, constant pool and IR (inside [`IrModule`]) plus the
/// layout memo. Shared read-only by every frame of both execution modes.
#[derive(Debug)]
pub struct CompilationUnit {
    /// Lowered module
    pub module: IrModule,
    /// Layouts memoized by interned type
    pub layouts: LayoutCache,
    /// Compilation counters
    pub stats: CompileStats,
}

impl CompilationUnit {
    /// Function by id
    pub fn function(&self, id: FunctionId) -> Option<&IrFunction> {
        self.module.function(id)
    }

    /// Function id by source name
    pub fn function_id(&self, name: &str) -> Option<FunctionId> {
        self.module.function_by_name(name).map(|f| f.id)
    }

    /// Resolved parameter types of a function
    pub fn param_types(&self, id: FunctionId) -> Option<Vec<Type>> {
        let func = self.function(id)?;
        func.param_types()
            .into_iter()
            .map(|t| self.module.ty(t).cloned())
            .collect()
    }

    /// Resolved return type of a function
    pub fn return_type(&self, id: FunctionId) -> Option<&Type> {
        self.module.ty(self.function(id)?.ret_type)
    }

    /// Layout lookups served from this unit's memo
    pub fn resolver(&self) -> LayoutResolver<'_> {
        LayoutResolver::new(&self.module.types, &self.layouts)
    }
}

/// Main compiler interface
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    /// Create a new compiler with the given options
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    /// Options in effect
    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    /// Type-check, lower, verify and optimize a module
    pub fn compile(&self, module: &ast::Module) -> Result<CompilationUnit> {
        // Phase 1: Type check
        let typed = TypeChecker::check_module(module)?;
        debug!(functions = typed.len(), "type checked module");

        // Phase 2: Lower to IR
        let ir = ir::lower_module(&typed)?;
        self.finish(ir)
    }

    /// Verify and optimize an already-lowered module (e.g. one decoded from
    /// its binary encoding)
    pub fn compile_ir(&self, module: IrModule) -> Result<CompilationUnit> {
        self.finish(module)
    }

    /// Convenience wrapper returning a shareable unit
    pub fn compile_shared(&self, module: &ast::Module) -> Result<Arc<CompilationUnit>> {
        self.compile(module).map(Arc::new)
    }

    fn finish(&self, mut module: IrModule) -> Result<CompilationUnit> {
        let instructions_before = count_instructions(&module);

        // Phase 3: Verify lowered IR
        self.verify(&module, "lowering")?;

        // Phase 4: Optimize
        let optimize = Optimizer::new(self.options.opt_level).optimize(&mut module);

        // Phase 5: Re-verify when the optimizer rewrote anything
        if optimize != OptimizeStats::default() {
            self.verify(&module, "optimization")?;
        }

        intern_abi_types(&mut module);

        let stats = CompileStats {
            functions: module.functions.len(),
            blocks: module.functions.iter().map(|f| f.blocks.len()).sum(),
            instructions_before,
            instructions_after: count_instructions(&module),
            optimize,
        };
        info!(
            functions = stats.functions,
            blocks = stats.blocks,
            instructions = stats.instructions_after,
            opt_level = self.options.opt_level,
            "compiled unit"
        );
        Ok(CompilationUnit {
            module,
            layouts: LayoutCache::new(),
            stats,
        })
    }

    fn verify(&self, module: &IrModule, after: &str) -> Result<()> {
        if !self.options.verify_ir {
            return Ok(());
        }
        let result = verify_module(module);
        for warning in &result.warnings {
            debug!(after, %warning, "IR verifier warning");
        }
        if let Err(mut err) = result.into_result() {
            err.message = format!("after {}: {}", after, err.message);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Intern every type the value ABI lays out at run time: the components of
/// each interned type and the argument record of each signature
fn intern_abi_types(module: &mut IrModule) {
    let mut pending: Vec<Type> = module.types.iter().map(|(_, ty)| ty.clone()).collect();
    for func in &module.functions {
        let params: Option<Vec<Type>> = func
            .param_types()
            .into_iter()
            .map(|t| module.ty(t).cloned())
            .collect();
        if let Some(params) = params {
            pending.push(layout::record_type(&params));
        }
    }
    let mut seen = HashSet::new();
    while let Some(ty) = pending.pop() {
        if !seen.insert(ty.clone()) {
            continue;
        }
        module.types.intern(&ty);
        match &ty {
            Type::Vector(elem, _) | Type::Tensor(elem, _) | Type::Complex(elem) => {
                pending.push((**elem).clone());
            }
            Type::Struct(fields) => pending.extend(fields.iter().map(|f| f.ty.clone())),
            Type::Function(params, ret) => {
                pending.push(layout::record_type(params));
                pending.extend(params.iter().cloned());
                pending.push((**ret).clone());
            }
            Type::Reference(target, _) => pending.push((**target).clone()),
            Type::Primitive { .. } => {}
        }
    }
}

fn count_instructions(module: &IrModule) -> usize {
    module.functions.iter().map(|f| f.instruction_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::error::{Error, ErrorStage, LoweringError, LoweringErrorKind};

    fn sample() -> ast::Module {
        module(vec![
            func(
                "square",
                vec![param("x", Type::I64)],
                Type::I64,
                vec![ret(mul(var("x"), var("x")))],
            ),
            func("nine", vec![], Type::I64, vec![ret(call("square", vec![add(int(1), int(2))]))]),
        ])
    }

    #[test]
    fn test_compile_default_options() {
        let unit = Compiler::new(CompileOptions::default()).compile(&sample()).unwrap();
        assert_eq!(unit.stats.functions, 2);
        assert_eq!(unit.function_id("nine"), Some(FunctionId(1)));
        assert_eq!(unit.param_types(FunctionId(0)), Some(vec![Type::I64]));
        assert_eq!(unit.return_type(FunctionId(1)), Some(&Type::I64));
    }

    #[test]
    fn test_optimizer_shrinks_unit() {
        let unit = Compiler::new(CompileOptions::default().opt_level(2))
            .compile(&sample())
            .unwrap();
        assert!(unit.stats.optimize.folded >= 1);
        assert!(unit.stats.instructions_after < unit.stats.instructions_before);
    }

    #[test]
    fn test_type_error_is_compile_time() {
        let bad = module(vec![func("f", vec![], Type::I64, vec![ret(boolean(true))])]);
        let err = Compiler::new(CompileOptions::default()).compile(&bad).unwrap_err();
        assert!(matches!(err, Error::Type(_)));
        assert_eq!(err.classify(), ErrorStage::CompileTime);
    }

    #[test]
    fn test_missing_return_is_lowering_error() {
        let bad = module(vec![func(
            "f",
            vec![param("c", Type::BOOL)],
            Type::I64,
            vec![if_(var("c"), vec![ret(int(1))], vec![])],
        )]);
        let err = Compiler::new(CompileOptions::default()).compile(&bad).unwrap_err();
        assert!(matches!(
            err,
            Error::Lowering(LoweringError {
                kind: LoweringErrorKind::MissingReturn,
                ..
            })
        ));
    }

    #[test]
    fn test_argument_records_are_interned() {
        let unit = Compiler::new(CompileOptions::default()).compile(&sample()).unwrap();
        let record = layout::record_type(&[Type::I64]);
        assert!(unit.module.types.lookup(&record).is_some());
        assert!(unit.module.types.lookup(&layout::record_type(&[])).is_some());

        let first = unit.resolver().of(&record);
        let again = unit.resolver().of(&record);
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(unit.layouts.len(), 1);
    }
}
