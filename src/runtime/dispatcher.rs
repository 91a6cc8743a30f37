//! # Execution Dispatcher
//!
//! Single entry point for running functions of a [`CompilationUnit`]. Each
//! function has an [`ExecutionMode`] that starts `Unresolved` and is fixed on
//! first invocation (or by [`Dispatcher::pin`]):
//!
//! | Policy | Lowering outcome | Mode |
//! |--------|------------------|------|
//! | `InterpretOnly` | not attempted | `Interpreted` |
//! | `PreferNative` | success | `Native` |
//! | `PreferNative` | `UnresolvedNativeFeature` / `EncodingLimit` | `Interpreted` |
//! | `PreferNative` | any other failure | error, stays `Unresolved` |
//!
//! Once resolved a mode never changes. A callee always runs in its own mode
//! whichever mode the caller runs in. Calls that stay within one mode never
//! leave their executor: the interpreter and the machine each keep an
//! explicit frame stack, so call depth is bounded by `max_call_depth` and not
//! by the host thread's stack. Only a mode switch comes back through the
//! dispatcher.

use super::interpreter::Interpreter;
use super::{AbortHandle, CallBridge, ChainContext, TypedValue, DEFAULT_MAX_CALL_DEPTH};
use crate::compiler::ir::FunctionId;
use crate::compiler::{CompilationUnit, CompileOptions};
use crate::error::{Error, Result, RuntimeError, RuntimeErrorKind};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(feature = "native")]
use crate::compiler::LayoutResolver;
#[cfg(feature = "native")]
use crate::error::LoweringErrorKind;
#[cfg(feature = "native")]
use crate::native::{self, Machine, NativeFunction, NativeLinker, TargetFeatures};
#[cfg(feature = "native")]
use crate::types::Type;
#[cfg(feature = "native")]
use std::collections::HashMap;
#[cfg(feature = "native")]
use tracing::warn;

/// How a function runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Not yet decided
    Unresolved,
    /// Register VM
    Interpreted,
    /// TVM64 code on the in-crate machine
    Native,
}

/// How modes get resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Never attempt native lowering
    InterpretOnly,
    /// Lower natively, falling back to the interpreter for unsupported features
    PreferNative,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Front-end options used by [`crate::load`]
    pub compile: CompileOptions,
    /// Mode resolution policy
    pub policy: ExecutionPolicy,
    /// Native target capabilities
    #[cfg(feature = "native")]
    pub target: TargetFeatures,
    /// Nested call limit per frame chain
    pub max_call_depth: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            compile: CompileOptions::default(),
            #[cfg(feature = "native")]
            policy: ExecutionPolicy::PreferNative,
            #[cfg(not(feature = "native"))]
            policy: ExecutionPolicy::InterpretOnly,
            #[cfg(feature = "native")]
            target: TargetFeatures::default(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl EngineOptions {
    /// Set the resolution policy
    pub fn policy(mut self, policy: ExecutionPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the compile options
    pub fn compile(mut self, compile: CompileOptions) -> Self {
        self.compile = compile;
        self
    }

    /// Set the nested call limit
    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Set the native target capabilities
    #[cfg(feature = "native")]
    pub fn target(mut self, target: TargetFeatures) -> Self {
        self.target = target;
        self
    }
}

/// Per-function mode selection over one shared unit.
///
/// `Sync`: any number of threads may invoke concurrently. Each invocation is
/// its own frame chain.
pub struct Dispatcher {
    unit: Arc<CompilationUnit>,
    options: EngineOptions,
    modes: RwLock<Vec<ExecutionMode>>,
    #[cfg(feature = "native")]
    native: RwLock<HashMap<FunctionId, Arc<NativeFunction>>>,
}

impl Dispatcher {
    /// Dispatcher with every function `Unresolved`
    pub fn new(unit: Arc<CompilationUnit>, options: EngineOptions) -> Self {
        let count = unit.module.functions.len();
        Self {
            unit,
            options,
            modes: RwLock::new(vec![ExecutionMode::Unresolved; count]),
            #[cfg(feature = "native")]
            native: RwLock::new(HashMap::new()),
        }
    }

    /// Unit being executed
    pub fn unit(&self) -> &Arc<CompilationUnit> {
        &self.unit
    }

    /// Options in effect
    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Current mode of a function
    pub fn mode(&self, func: FunctionId) -> Option<ExecutionMode> {
        self.modes.read().get(func.0 as usize).copied()
    }

    /// Fix the mode of a function before its first invocation.
    ///
    /// Returns the mode in effect afterwards. Pinning an already resolved
    /// function changes nothing. Pinning to `Native` fails when the function
    /// cannot be lowered.
    pub fn pin(&self, func: FunctionId, mode: ExecutionMode) -> Result<ExecutionMode> {
        if let Some(current) = self.resolved(func)? {
            return Ok(current);
        }
        let resolution = match mode {
            ExecutionMode::Unresolved => {
                return Err(Error::InvalidValue("cannot pin a function to Unresolved".into()))
            }
            ExecutionMode::Interpreted => Resolution::interpreted(),
            #[cfg(feature = "native")]
            ExecutionMode::Native => {
                let code = native::lower_function(&self.unit, func, &self.options.target)?;
                Resolution::native(code)
            }
            #[cfg(not(feature = "native"))]
            ExecutionMode::Native => {
                return Err(Error::InvalidValue("native execution is not compiled in".into()))
            }
        };
        Ok(self.install(func, resolution))
    }

    /// Invoke a function by id
    pub fn invoke(&self, func: FunctionId, args: Vec<TypedValue>) -> Result<TypedValue> {
        self.invoke_abortable(func, args, &AbortHandle::new())
    }

    /// Invoke a function by source name
    pub fn invoke_by_name(&self, name: &str, args: Vec<TypedValue>) -> Result<TypedValue> {
        let func = self.unit.function_id(name).ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::UnknownFunction, format!("no function named '{}'", name))
        })?;
        self.invoke(func, args)
    }

    /// Invoke a function in a chain the host can abort through `abort`
    pub fn invoke_abortable(&self, func: FunctionId, args: Vec<TypedValue>, abort: &AbortHandle) -> Result<TypedValue> {
        self.check_arguments(func, &args)?;
        debug!(function = %func, args = args.len(), "invoke");
        let mut chain = ChainContext::new(self.options.max_call_depth, abort.clone());
        Ok(self.enter(func, args, &mut chain)?)
    }

    /// Native code of a function resolved to `Native`
    #[cfg(feature = "native")]
    pub fn native_function(&self, func: FunctionId) -> Option<Arc<NativeFunction>> {
        self.native.read().get(&func).cloned()
    }

    fn check_arguments(&self, func: FunctionId, args: &[TypedValue]) -> std::result::Result<(), RuntimeError> {
        let params = self.unit.param_types(func).ok_or_else(|| {
            RuntimeError::new(RuntimeErrorKind::UnknownFunction, format!("no function {}", func))
        })?;
        if params.len() != args.len() {
            return Err(RuntimeError::new(
                RuntimeErrorKind::ArgumentMismatch,
                format!("{} expects {} argument(s), got {}", func, params.len(), args.len()),
            ));
        }
        for (i, (param, arg)) in params.iter().zip(args).enumerate() {
            if arg.ty() != param {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::ArgumentMismatch,
                    format!("argument {} of {}: expected {}, got {}", i, func, param, arg.ty()),
                ));
            }
            arg.check_invariants().map_err(|e| {
                RuntimeError::new(RuntimeErrorKind::ArgumentMismatch, format!("argument {} of {}: {}", i, func, e))
            })?;
        }
        Ok(())
    }

    /// Run one frame of the chain in the callee's mode
    fn enter(
        &self,
        func: FunctionId,
        args: Vec<TypedValue>,
        chain: &mut ChainContext,
    ) -> std::result::Result<TypedValue, RuntimeError> {
        chain.check_abort()?;
        chain.enter()?;
        if let Err(e) = chain.enter_executor() {
            chain.leave();
            return Err(e);
        }
        let result = self.run(func, args, chain);
        chain.leave_executor();
        chain.leave();
        result
    }

    fn run(
        &self,
        func: FunctionId,
        args: Vec<TypedValue>,
        chain: &mut ChainContext,
    ) -> std::result::Result<TypedValue, RuntimeError> {
        match self.resolve(func)? {
            #[cfg(feature = "native")]
            ExecutionMode::Native => {
                let code = self
                    .native_function(func)
                    .ok_or_else(|| RuntimeError::internal(format!("{} is native but has no code", func)))?;
                Machine::new(self).invoke(code, args, chain)
            }
            _ => {
                let ir = self.unit.function(func).ok_or_else(|| {
                    RuntimeError::new(RuntimeErrorKind::UnknownFunction, format!("no function {}", func))
                })?;
                Interpreter::new(&self.unit).run(ir, args, self, chain)
            }
        }
    }

    /// Mode of a function, resolving it on first use
    fn resolve(&self, func: FunctionId) -> std::result::Result<ExecutionMode, RuntimeError> {
        if let Some(mode) = self.resolved(func)? {
            return Ok(mode);
        }
        // Lowering runs outside the lock; the first finished resolution wins
        let resolution = self.decide(func)?;
        Ok(self.install(func, resolution))
    }

    fn resolved(&self, func: FunctionId) -> std::result::Result<Option<ExecutionMode>, RuntimeError> {
        match self.mode(func) {
            None => Err(RuntimeError::new(
                RuntimeErrorKind::UnknownFunction,
                format!("no function {}", func),
            )),
            Some(ExecutionMode::Unresolved) => Ok(None),
            Some(mode) => Ok(Some(mode)),
        }
    }

    #[cfg(feature = "native")]
    fn decide(&self, func: FunctionId) -> std::result::Result<Resolution, RuntimeError> {
        if self.options.policy == ExecutionPolicy::InterpretOnly {
            return Ok(Resolution::interpreted());
        }
        match native::lower_function(&self.unit, func, &self.options.target) {
            Ok(code) => Ok(Resolution::native(code)),
            Err(e) if matches!(e.kind, LoweringErrorKind::UnresolvedNativeFeature | LoweringErrorKind::EncodingLimit) => {
                warn!(function = %e.function, kind = %e.kind, reason = %e.message, "native lowering unavailable; interpreting");
                Ok(Resolution::interpreted())
            }
            Err(e) => Err(RuntimeError::internal(format!("native lowering failed: {}", e))),
        }
    }

    #[cfg(not(feature = "native"))]
    fn decide(&self, _func: FunctionId) -> std::result::Result<Resolution, RuntimeError> {
        Ok(Resolution::interpreted())
    }

    fn install(&self, func: FunctionId, resolution: Resolution) -> ExecutionMode {
        let mut modes = self.modes.write();
        let slot = &mut modes[func.0 as usize];
        if *slot != ExecutionMode::Unresolved {
            return *slot;
        }
        #[cfg(feature = "native")]
        if let Some(code) = resolution.code {
            self.native.write().insert(func, Arc::new(code));
        }
        *slot = resolution.mode;
        info!(function = %func, mode = ?resolution.mode, "execution mode resolved");
        resolution.mode
    }
}

/// Outcome of deciding a function's mode
struct Resolution {
    mode: ExecutionMode,
    #[cfg(feature = "native")]
    code: Option<NativeFunction>,
}

impl Resolution {
    fn interpreted() -> Self {
        Self {
            mode: ExecutionMode::Interpreted,
            #[cfg(feature = "native")]
            code: None,
        }
    }

    #[cfg(feature = "native")]
    fn native(code: NativeFunction) -> Self {
        Self {
            mode: ExecutionMode::Native,
            code: Some(code),
        }
    }
}

impl CallBridge for Dispatcher {
    fn call(
        &self,
        func: FunctionId,
        args: Vec<TypedValue>,
        chain: &mut ChainContext,
    ) -> std::result::Result<TypedValue, RuntimeError> {
        self.enter(func, args, chain)
    }

    fn runs_interpreted(&self, func: FunctionId) -> std::result::Result<bool, RuntimeError> {
        Ok(self.resolve(func)? == ExecutionMode::Interpreted)
    }
}

#[cfg(feature = "native")]
impl NativeLinker for Dispatcher {
    fn resolve_native(&self, func: FunctionId) -> std::result::Result<Option<Arc<NativeFunction>>, RuntimeError> {
        match self.resolve(func)? {
            ExecutionMode::Native => Ok(self.native_function(func)),
            _ => Ok(None),
        }
    }

    fn signature(&self, func: FunctionId) -> Option<(Vec<Type>, Type)> {
        Some((self.unit.param_types(func)?, self.unit.return_type(func)?.clone()))
    }

    fn layouts(&self) -> LayoutResolver<'_> {
        self.unit.resolver()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::compiler::Compiler;
    use crate::types::Type;

    fn dispatcher(module: crate::ast::Module, options: EngineOptions) -> Dispatcher {
        let unit = Compiler::new(options.compile.clone()).compile_shared(&module).unwrap();
        Dispatcher::new(unit, options)
    }

    fn calls() -> crate::ast::Module {
        module(vec![
            func("inc", vec![param("x", Type::I64)], Type::I64, vec![ret(add(var("x"), sint(1)))]),
            func(
                "twice",
                vec![param("x", Type::I64)],
                Type::I64,
                vec![ret(call("inc", vec![call("inc", vec![var("x")])]))],
            ),
        ])
    }

    #[test]
    fn test_modes_resolve_on_first_invoke() {
        let d = dispatcher(calls(), EngineOptions::default().policy(ExecutionPolicy::InterpretOnly));
        let twice = d.unit().function_id("twice").unwrap();
        assert_eq!(d.mode(twice), Some(ExecutionMode::Unresolved));
        let result = d.invoke(twice, vec![TypedValue::i64(5)]).unwrap();
        assert_eq!(result.as_i64(), Some(7));
        assert_eq!(d.mode(twice), Some(ExecutionMode::Interpreted));
        assert_eq!(d.mode(FunctionId(0)), Some(ExecutionMode::Interpreted));
    }

    #[test]
    fn test_argument_checks() {
        let d = dispatcher(calls(), EngineOptions::default());
        let err = d.invoke_by_name("inc", vec![]).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::ArgumentMismatch));
        let err = d.invoke_by_name("inc", vec![TypedValue::i32(1)]).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::ArgumentMismatch));
        let err = d.invoke_by_name("missing", vec![]).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::UnknownFunction));
        let err = d.invoke(FunctionId(9), vec![]).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::UnknownFunction));
    }

    #[test]
    fn test_pin_is_fixed_after_resolution() {
        let d = dispatcher(calls(), EngineOptions::default().policy(ExecutionPolicy::InterpretOnly));
        let inc = FunctionId(0);
        assert_eq!(d.pin(inc, ExecutionMode::Interpreted).unwrap(), ExecutionMode::Interpreted);
        assert_eq!(d.pin(inc, ExecutionMode::Native).unwrap(), ExecutionMode::Interpreted);
        assert!(d.pin(FunctionId(1), ExecutionMode::Unresolved).is_err());
    }

    #[test]
    fn test_abort_before_start() {
        let d = dispatcher(calls(), EngineOptions::default());
        let abort = AbortHandle::new();
        abort.abort();
        let err = d.invoke_abortable(FunctionId(1), vec![TypedValue::i64(1)], &abort).unwrap_err();
        assert_eq!(err.runtime_kind(), Some(RuntimeErrorKind::Aborted));
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_mixed_modes_agree() {
        let d = dispatcher(calls(), EngineOptions::default());
        assert_eq!(d.pin(FunctionId(0), ExecutionMode::Interpreted).unwrap(), ExecutionMode::Interpreted);
        let result = d.invoke_by_name("twice", vec![TypedValue::i64(40)]).unwrap();
        assert_eq!(result.as_i64(), Some(42));
        assert_eq!(d.mode(FunctionId(1)), Some(ExecutionMode::Native));
        assert!(d.native_function(FunctionId(1)).is_some());
        assert!(d.native_function(FunctionId(0)).is_none());
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_missing_capability_falls_back() {
        let m = module(vec![func(
            "total",
            vec![param("v", Type::Vector(Box::new(Type::F64), 3))],
            Type::F64,
            vec![ret(intrinsic(crate::ast::Intrinsic::Sum, vec![var("v")]))],
        )]);
        let d = dispatcher(m, EngineOptions::default().target(TargetFeatures::minimal()));
        let result = d
            .invoke_by_name("total", vec![TypedValue::vector_f64(&[1.0, 2.0, 3.5])])
            .unwrap();
        assert_eq!(result.as_f64(), Some(6.5));
        assert_eq!(d.mode(FunctionId(0)), Some(ExecutionMode::Interpreted));
    }
}
