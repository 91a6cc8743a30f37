//! # Tessera - Typed IR and Dual-Mode Execution
//!
//! Tessera compiles a small, statically typed numeric language into an SSA
//! intermediate representation and runs it either on a register VM or as
//! TVM64 machine code, with bit-identical results in both modes.
//!
//! ## Features
//!
//! - **Numeric tower**: fixed-width integers with wrapping or checked
//!   arithmetic, IEEE floats, complex numbers, fixed and dynamic tensors
//! - **Deterministic layouts**: every type has one size, alignment and field
//!   order shared by the interpreter, the native code and the argument ABI
//! - **Dual-mode execution**: each function runs interpreted or natively,
//!   chosen once on first call, and calls cross modes freely
//! - **Parallel batches**: independent invocations run on a Rayon pool and
//!   can be aborted from the host
//!
//! ## Quick Start
//!
//! ```rust
//! use tessera::ast::build::*;
//! use tessera::{load, EngineOptions, Type, TypedValue};
//!
//! # fn main() -> tessera::Result<()> {
//! let module = module(vec![func(
//!     "add",
//!     vec![param("a", Type::I32), param("b", Type::I32)],
//!     Type::I32,
//!     vec![ret(add(var("a"), var("b")))],
//! )]);
//!
//! let engine = load(&module, EngineOptions::default())?;
//! let result = engine.invoke_by_name("add", vec![TypedValue::i32(i32::MAX), TypedValue::i32(1)])?;
//!
//! // Unchecked arithmetic wraps
//! assert_eq!(result, TypedValue::i32(i32::MIN));
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ast::Module ─▶ TypeChecker ─▶ IR lowering ─▶ IrVerifier ─▶ Optimizer
//!                                                               │
//!                                               CompilationUnit ◀┘
//!                                                     │
//!                         Dispatcher ─┬─▶ Interpreter (register VM)
//!                                     └─▶ native codegen ─▶ Machine (TVM64)
//! ```
//!
//! ### Main Components
//!
//! - [`types`] - Type system, literal resolution and promotion
//! - [`compiler`] - IR, lowering, layouts, verifier, optimizer, debug dumps
//! - [`runtime`] - Values, the interpreter and the [`Dispatcher`]
//! - `native` - TVM64 encoding, lowering, verification and the machine
//! - [`parallel`] - Batch invocation on a thread pool
//!
//! ## Error Handling
//!
//! Every failure funnels into [`Error`]. Runtime failures keep their kind:
//!
//! ```rust
//! use tessera::ast::{build::*, BinaryOp};
//! use tessera::{load, EngineOptions, RuntimeErrorKind, Type, TypedValue};
//!
//! let module = module(vec![func(
//!     "add",
//!     vec![param("a", Type::I32), param("b", Type::I32)],
//!     Type::I32,
//!     vec![ret(checked(BinaryOp::Add, var("a"), var("b")))],
//! )]);
//!
//! let engine = load(&module, EngineOptions::default()).unwrap();
//! let err = engine
//!     .invoke_by_name("add", vec![TypedValue::i32(i32::MAX), TypedValue::i32(1)])
//!     .unwrap_err();
//! assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::Overflow));
//! ```
//!
//! ## License
//!
//! Licensed under the [MIT License](https://opensource.org/licenses/MIT).

// Allow specific clippy warnings that are false positives or intentional design choices
#![allow(clippy::too_many_arguments)] // Helper call lowering passes full operand sets
#![allow(clippy::needless_range_loop)] // Index needed for error messages

/// Version of the tessera engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ast;
pub mod compiler;
pub mod error;
#[cfg(feature = "native")]
pub mod native;
pub mod numeric;
pub mod parallel;
pub mod runtime;
pub mod tensor;
pub mod types;

use std::sync::Arc;

// Re-export main types
pub use compiler::ir::{FunctionId, IrModule};
pub use compiler::{CompilationUnit, CompileOptions, Compiler};
pub use error::{Error, ErrorStage, LoweringError, Result, RuntimeError, RuntimeErrorKind, TypeError};
#[cfg(feature = "native")]
pub use native::TargetFeatures;
pub use numeric::ScalarKind;
pub use parallel::{invoke_parallel, Invocation, ParallelConfig};
pub use runtime::{AbortHandle, Dispatcher, EngineOptions, ExecutionMode, ExecutionPolicy, TypedValue};
pub use types::{Dim, Type};

/// Compile a module and wrap it in a dispatcher.
///
/// Uses `options.compile` for the front end. Every function starts
/// `Unresolved`.
pub fn load(module: &ast::Module, options: EngineOptions) -> Result<Dispatcher> {
    let unit = Compiler::new(options.compile.clone()).compile(module)?;
    tracing::info!(
        functions = unit.stats.functions,
        instructions = unit.stats.instructions_after,
        "loaded compilation unit"
    );
    Ok(Dispatcher::new(Arc::new(unit), options))
}
