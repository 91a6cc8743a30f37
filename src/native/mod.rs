//! # Native Execution (TVM64)
//!
//! Lowers verified IR to TVM64, a 64-bit register machine with a BPF-style
//! encoding, and runs it on the in-crate [`Machine`].
//!
//! ## Architecture
//!
//! ```text
//! IrFunction ──▶ codegen ──▶ verifier ──▶ NativeFunction ──▶ Machine
//!                   │                          │
//!                   └── helper sites ──────────┴──▶ helpers (shared kernels)
//!                                                              │
//!                                                   heap (mark from frame roots, sweep)
//! ```
//!
//! ## Target features
//!
//! | Capability | Needed by |
//! |------------|-----------|
//! | `tensor_helpers` | every vector/tensor operation except literals and `dim` |
//! | `complex_helpers` | complex arithmetic and comparison |
//! | `checked_arith` | checked scalar and tensor arithmetic |
//!
//! Lowering a function that needs a missing capability fails with
//! `UnresolvedNativeFeature`; the dispatcher then runs it interpreted.

pub mod codegen;
pub mod encoding;
pub mod heap;
pub mod helpers;
pub mod machine;
pub mod verifier;

pub use encoding::TvmInstruction;
pub use helpers::HelperSite;
pub use machine::{Machine, MachineMemory};

use crate::compiler::ir::FunctionId;
use crate::compiler::{CompilationUnit, LayoutResolver};
use crate::error::{LoweringError, LoweringErrorKind, RuntimeError};
use crate::runtime::CallBridge;
use crate::types::Type;
use std::sync::Arc;
use tracing::debug;

/// Capabilities of the native target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetFeatures {
    /// Tensor helper routines are available
    pub tensor_helpers: bool,
    /// Complex helper routines are available
    pub complex_helpers: bool,
    /// Trapping arithmetic is available
    pub checked_arith: bool,
}

impl TargetFeatures {
    /// Every capability
    pub fn all() -> Self {
        Self {
            tensor_helpers: true,
            complex_helpers: true,
            checked_arith: true,
        }
    }

    /// Plain scalar arithmetic only
    pub fn minimal() -> Self {
        Self {
            tensor_helpers: false,
            complex_helpers: false,
            checked_arith: false,
        }
    }
}

impl Default for TargetFeatures {
    fn default() -> Self {
        Self::all()
    }
}

/// Lowered, verified native code for one function
#[derive(Debug, Clone)]
pub struct NativeFunction {
    /// IR function id
    pub id: FunctionId,
    /// Source name
    pub name: String,
    /// Mangled symbol, `_T<id>_<name>`
    pub symbol: String,
    /// Encoded code bytes
    pub code: Vec<u8>,
    /// Decoded code, indexed by slot (an `lddw` fills two entries)
    program: Vec<TvmInstruction>,
    /// Frame size in bytes
    pub frame_size: usize,
    /// Helper call sites, indexed by the value in `r4`
    pub sites: Vec<HelperSite>,
    /// Parameter types
    pub param_types: Vec<Type>,
    /// Return type
    pub ret_type: Type,
    /// Frame offsets of homes holding buffer descriptors, with their types
    pub roots: Vec<(usize, Type)>,
}

impl NativeFunction {
    /// Decoded code indexed by slot
    pub fn program(&self) -> &[TvmInstruction] {
        &self.program
    }

    /// Encoded size in 8-byte slots
    pub fn slot_count(&self) -> usize {
        self.code.len() / 8
    }

    /// One line of assembly per instruction
    pub fn disassemble(&self) -> Vec<String> {
        encoding::disassemble(&self.code)
    }
}

/// Symbol for a function: `_T<id>_<name>`
pub fn mangle(id: FunctionId, name: &str) -> String {
    format!("_T{}_{}", id.0, name)
}

/// Every function of a unit, lowered
#[derive(Debug, Clone, Default)]
pub struct NativeModule {
    /// Functions in id order
    pub functions: Vec<Arc<NativeFunction>>,
}

impl NativeModule {
    /// Function by id
    pub fn function(&self, id: FunctionId) -> Option<&Arc<NativeFunction>> {
        self.functions.get(id.0 as usize)
    }

    /// Function by mangled symbol
    pub fn by_symbol(&self, symbol: &str) -> Option<&Arc<NativeFunction>> {
        self.functions.iter().find(|f| f.symbol == symbol)
    }
}

/// Lower one function of a unit
pub fn lower_function(
    unit: &CompilationUnit,
    id: FunctionId,
    features: &TargetFeatures,
) -> Result<NativeFunction, LoweringError> {
    let func = unit.function(id).ok_or_else(|| {
        LoweringError::new(LoweringErrorKind::Unsupported, id.to_string(), "no such function")
    })?;
    let lowered = codegen::lower(unit, func, features)?;
    let code = encoding::encode_program(&lowered.program);
    let program = encoding::decode_program(&code).map_err(|issue| {
        LoweringError::new(LoweringErrorKind::Verification, &func.name, format!("{:?}", issue))
    })?;
    let param_types = unit.param_types(id).ok_or_else(|| {
        LoweringError::new(LoweringErrorKind::Verification, &func.name, "unresolved parameter types")
    })?;
    let ret_type = unit.return_type(id).cloned().ok_or_else(|| {
        LoweringError::new(LoweringErrorKind::Verification, &func.name, "unresolved return type")
    })?;

    debug!(
        function = %func.name,
        slots = program.len(),
        frame = lowered.frame_size,
        helper_sites = lowered.sites.len(),
        "lowered to TVM64"
    );

    Ok(NativeFunction {
        id,
        name: func.name.clone(),
        symbol: mangle(id, &func.name),
        code,
        program,
        frame_size: lowered.frame_size,
        sites: lowered.sites,
        param_types,
        ret_type,
        roots: lowered.roots,
    })
}

/// Lower every function of a unit; the first failure aborts
pub fn lower_module(unit: &CompilationUnit, features: &TargetFeatures) -> Result<NativeModule, LoweringError> {
    let functions = unit
        .module
        .functions
        .iter()
        .map(|f| lower_function(unit, f.id, features).map(Arc::new))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(NativeModule { functions })
}

/// Resolves callees for the machine.
///
/// A callee with native code is entered directly with the caller's argument
/// record; any other callee goes through [`CallBridge::call`] with the
/// record decoded into values.
pub trait NativeLinker: CallBridge {
    /// Native code for `func`, or `None` when it runs interpreted
    fn resolve_native(&self, func: FunctionId) -> Result<Option<Arc<NativeFunction>>, RuntimeError>;

    /// Parameter and return types of `func`
    fn signature(&self, func: FunctionId) -> Option<(Vec<Type>, Type)>;

    /// Layouts of the unit the functions come from
    fn layouts(&self) -> LayoutResolver<'_>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::compiler::{CompileOptions, Compiler};

    #[test]
    fn test_mangling_and_module_lowering() {
        let module = module(vec![
            func("one", vec![], Type::I64, vec![ret(sint(1))]),
            func("two", vec![], Type::I64, vec![ret(add(call("one", vec![]), sint(1)))]),
        ]);
        let unit = Compiler::new(CompileOptions::default()).compile(&module).unwrap();
        let native = lower_module(&unit, &TargetFeatures::default()).unwrap();
        assert_eq!(native.functions.len(), 2);
        let two = native.by_symbol("_T1_two").unwrap();
        assert_eq!(two.id, FunctionId(1));
        assert!(two.disassemble().iter().any(|l| l.contains("call f0")));
        assert_eq!(two.program().len(), two.slot_count());
    }
}
