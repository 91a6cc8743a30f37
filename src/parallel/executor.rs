//! Parallel executor for independent invocations
//!
//! Uses Rayon for work-stealing parallelism with configurable limits. Every
//! invocation is its own frame chain; they share only the dispatcher's
//! read-only unit and its synchronized mode table.

use crate::compiler::ir::FunctionId;
use crate::error::{Error, Result};
use crate::runtime::{AbortHandle, Dispatcher, TypedValue};
use rayon::prelude::*;
use tracing::{debug, warn};

/// Configuration for parallel execution
#[derive(Debug, Clone)]
pub struct ParallelConfig {
    /// Maximum number of parallel tasks (default: num_cpus)
    pub max_parallelism: usize,
    /// Abort the rest of the batch on the first error
    pub fail_fast: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_parallelism: num_cpus::get(),
            fail_fast: false,
        }
    }
}

impl ParallelConfig {
    /// Set the thread limit
    pub fn max_parallelism(mut self, threads: usize) -> Self {
        self.max_parallelism = threads.max(1);
        self
    }

    /// Enable fail-fast
    pub fn fail_fast(mut self) -> Self {
        self.fail_fast = true;
        self
    }
}

/// One top-level call in a batch
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Function to run
    pub function: FunctionId,
    /// Arguments
    pub args: Vec<TypedValue>,
}

impl Invocation {
    /// Invocation of `function` on `args`
    pub fn new(function: FunctionId, args: Vec<TypedValue>) -> Self {
        Self { function, args }
    }
}

/// Run a batch of invocations concurrently.
///
/// Results come back in input order. With `fail_fast` the first failure
/// aborts every chain still running; those report `Aborted`.
pub fn invoke_parallel(
    dispatcher: &Dispatcher,
    invocations: Vec<Invocation>,
    config: &ParallelConfig,
) -> Vec<Result<TypedValue>> {
    invoke_parallel_abortable(dispatcher, invocations, config, &AbortHandle::new())
}

/// [`invoke_parallel`] under a host-controlled abort handle shared by the
/// whole batch
pub fn invoke_parallel_abortable(
    dispatcher: &Dispatcher,
    invocations: Vec<Invocation>,
    config: &ParallelConfig,
    abort: &AbortHandle,
) -> Vec<Result<TypedValue>> {
    // Empty batch fast path
    if invocations.is_empty() {
        return Vec::new();
    }

    let run = |inv: Invocation| -> Result<TypedValue> {
        let result = dispatcher.invoke_abortable(inv.function, inv.args, abort);
        if config.fail_fast {
            if let Err(e) = &result {
                if !is_abort(e) {
                    abort.abort();
                }
            }
        }
        result
    };

    // Single item - no parallelism needed
    if invocations.len() == 1 {
        return invocations.into_iter().map(run).collect();
    }

    debug!(
        invocations = invocations.len(),
        threads = config.max_parallelism.min(invocations.len()),
        "parallel batch"
    );

    match rayon::ThreadPoolBuilder::new()
        .num_threads(config.max_parallelism.min(invocations.len()).max(1))
        .build()
    {
        Ok(pool) => pool.install(|| invocations.into_par_iter().map(run).collect()),
        Err(e) => {
            warn!(error = %e, "failed to create thread pool; using the global pool");
            invocations.into_par_iter().map(run).collect()
        }
    }
}

fn is_abort(error: &Error) -> bool {
    error.runtime_kind() == Some(crate::error::RuntimeErrorKind::Aborted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::*;
    use crate::compiler::{CompileOptions, Compiler};
    use crate::error::RuntimeErrorKind;
    use crate::runtime::EngineOptions;
    use crate::types::Type;

    fn square() -> Dispatcher {
        let module = module(vec![func(
            "square",
            vec![param("x", Type::I64)],
            Type::I64,
            vec![ret(mul(var("x"), var("x")))],
        )]);
        let unit = Compiler::new(CompileOptions::default()).compile_shared(&module).unwrap();
        Dispatcher::new(unit, EngineOptions::default())
    }

    #[test]
    fn test_parallel_invoke_basic() {
        let d = square();
        let batch = (1..=8).map(|i| Invocation::new(FunctionId(0), vec![TypedValue::i64(i)])).collect();
        let results = invoke_parallel(&d, batch, &ParallelConfig::default());
        assert_eq!(results.len(), 8);
        for (i, r) in results.iter().enumerate() {
            let n = i as i64 + 1;
            assert_eq!(r.as_ref().unwrap().as_i64(), Some(n * n));
        }
    }

    #[test]
    fn test_parallel_invoke_empty() {
        let d = square();
        assert!(invoke_parallel(&d, vec![], &ParallelConfig::default()).is_empty());
    }

    #[test]
    fn test_errors_collected_per_invocation() {
        let d = square();
        let batch = vec![
            Invocation::new(FunctionId(0), vec![TypedValue::i64(3)]),
            Invocation::new(FunctionId(0), vec![TypedValue::f64(3.0)]),
            Invocation::new(FunctionId(0), vec![TypedValue::i64(4)]),
        ];
        let results = invoke_parallel(&d, batch, &ParallelConfig::default().max_parallelism(2));
        assert_eq!(results[0].as_ref().unwrap().as_i64(), Some(9));
        assert_eq!(results[1].as_ref().unwrap_err().runtime_kind(), Some(RuntimeErrorKind::ArgumentMismatch));
        assert_eq!(results[2].as_ref().unwrap().as_i64(), Some(16));
    }

    #[test]
    fn test_aborted_batch() {
        let d = square();
        let abort = AbortHandle::new();
        abort.abort();
        let batch = vec![
            Invocation::new(FunctionId(0), vec![TypedValue::i64(1)]),
            Invocation::new(FunctionId(0), vec![TypedValue::i64(2)]),
        ];
        let results = invoke_parallel_abortable(&d, batch, &ParallelConfig::default(), &abort);
        assert!(results.iter().all(|r| matches!(r, Err(e) if is_abort(e))));
    }
}
