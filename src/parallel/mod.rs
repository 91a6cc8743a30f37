//! Parallel execution support
//!
//! Runs independent top-level invocations of one [`crate::Dispatcher`]
//! concurrently on a Rayon pool.

mod executor;

pub use executor::{invoke_parallel, invoke_parallel_abortable, Invocation, ParallelConfig};
