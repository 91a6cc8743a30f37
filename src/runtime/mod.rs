//! # Runtime
//!
//! Values, frames and the two ways of running a lowered function.
//!
//! - [`value`]: [`TypedValue`], the canonical runtime representation
//! - [`frame`]: per-invocation register file and stack slots
//! - [`interpreter`]: the register VM
//! - [`abi`]: Layout-derived byte form of values (argument records)
//! - [`dispatcher`]: per-function mode selection and the single entry point
//!
//! A frame chain is one top-level invocation plus every call it makes. It is
//! single-threaded and carries a [`ChainContext`] (depth and abort flag)
//! through every call, whichever mode the callee runs in.

pub mod abi;
pub mod dispatcher;
pub mod frame;
pub mod interpreter;
pub mod value;

pub use abi::{AbiMemory, ScratchMemory};
pub use dispatcher::{Dispatcher, EngineOptions, ExecutionMode, ExecutionPolicy};
pub use frame::Frame;
pub use interpreter::Interpreter;
pub use value::{Repr, TypedValue};

use crate::compiler::ir::FunctionId;
use crate::error::{RuntimeError, RuntimeErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default limit on nested calls within one frame chain
pub const DEFAULT_MAX_CALL_DEPTH: usize = 256;

/// Limit on nested mode switches within one frame chain. Calls that stay in
/// one mode run on an explicit frame stack; only a switch between the
/// interpreter and the native machine nests on the host stack.
pub const MAX_MODE_SWITCHES: usize = 32;

/// Host-side switch that aborts a running frame chain.
///
/// Cloning shares the flag. The chain observes it only at call boundaries and
/// loop back-edges and unwinds with [`RuntimeErrorKind::Aborted`].
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Create a handle in the running state
    pub fn new() -> Self {
        Self::default()
    }

    /// Request abort
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// True once abort was requested
    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// State threaded through one frame chain
#[derive(Debug, Clone)]
pub struct ChainContext {
    depth: usize,
    max_depth: usize,
    switches: usize,
    abort: AbortHandle,
}

impl ChainContext {
    /// Fresh chain with the given depth limit
    pub fn new(max_depth: usize, abort: AbortHandle) -> Self {
        Self {
            depth: 0,
            max_depth,
            switches: 0,
            abort,
        }
    }

    /// Current nesting depth (0 outside any frame)
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Fail with `Aborted` when the host requested it
    pub fn check_abort(&self) -> Result<(), RuntimeError> {
        if self.abort.is_aborted() {
            return Err(RuntimeError::new(
                RuntimeErrorKind::Aborted,
                format!("frame chain aborted at depth {}", self.depth),
            ));
        }
        Ok(())
    }

    /// Push a frame; fails with `StackOverflow` past the depth limit
    pub fn enter(&mut self) -> Result<(), RuntimeError> {
        if self.depth >= self.max_depth {
            return Err(RuntimeError::new(
                RuntimeErrorKind::StackOverflow,
                format!("call depth limit of {} exceeded", self.max_depth),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    /// Pop a frame
    pub fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    /// Start running a frame on a fresh executor (the top-level entry or a
    /// switch of mode); fails with `StackOverflow` past [`MAX_MODE_SWITCHES`]
    pub fn enter_executor(&mut self) -> Result<(), RuntimeError> {
        if self.switches >= MAX_MODE_SWITCHES {
            return Err(RuntimeError::new(
                RuntimeErrorKind::StackOverflow,
                format!("more than {} nested mode switches", MAX_MODE_SWITCHES),
            ));
        }
        self.switches += 1;
        Ok(())
    }

    /// Leave an executor started with [`enter_executor`](Self::enter_executor)
    pub fn leave_executor(&mut self) {
        self.switches = self.switches.saturating_sub(1);
    }
}

/// Route for calls leaving the current frame.
///
/// The dispatcher implements this so that a callee runs in its own resolved
/// mode no matter which mode the caller runs in.
pub trait CallBridge {
    /// Invoke `func` within the caller's chain
    fn call(
        &self,
        func: FunctionId,
        args: Vec<TypedValue>,
        chain: &mut ChainContext,
    ) -> Result<TypedValue, RuntimeError>;

    /// True when `func` runs in the interpreter, so an interpreted caller
    /// can push its frame instead of going through [`call`](Self::call)
    fn runs_interpreted(&self, _func: FunctionId) -> Result<bool, RuntimeError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_limit() {
        let mut chain = ChainContext::new(2, AbortHandle::new());
        assert!(chain.enter().is_ok());
        assert!(chain.enter().is_ok());
        let err = chain.enter().unwrap_err();
        assert_eq!(err.kind, RuntimeErrorKind::StackOverflow);
        chain.leave();
        assert_eq!(chain.depth(), 1);
    }

    #[test]
    fn test_mode_switch_limit() {
        let mut chain = ChainContext::new(1024, AbortHandle::new());
        for _ in 0..MAX_MODE_SWITCHES {
            chain.enter_executor().unwrap();
        }
        assert_eq!(chain.enter_executor().unwrap_err().kind, RuntimeErrorKind::StackOverflow);
        chain.leave_executor();
        assert!(chain.enter_executor().is_ok());
    }

    #[test]
    fn test_abort_is_shared_between_clones() {
        let handle = AbortHandle::new();
        let chain = ChainContext::new(8, handle.clone());
        assert!(chain.check_abort().is_ok());
        handle.abort();
        assert_eq!(chain.check_abort().unwrap_err().kind, RuntimeErrorKind::Aborted);
    }
}
