//! Task execution.
//!
//! - [`ExecutionEngine`]: submits accepted tasks, enforces timeouts, reports responses
//! - [`ExecutorPools`]: the named bounded pools tasks run in
//! - [`TaskRunner`] / [`RunnerRegistry`]: business logic per task type
//! - [`ShellRunner`]: the built-in `SHELL_SCRIPT` runner
//!
//! # Execution Flow
//!
//! 1. The dispatcher or validator hands a [`ResolvedTask`](crate::secrets::ResolvedTask) to the engine
//! 2. The id is inserted into the executing map; duplicates are dropped
//! 3. The body runs in the pool chosen by [`PoolKind::for_task`]
//! 4. The sanitized response is reported and the id removed exactly once
//!
//! # Security Note
//!
//! Shell scripts run directly on the host without sandboxing.

pub mod executor;
pub mod pools;
pub mod runner;
pub mod shell;

pub use executor::ExecutionEngine;
pub use pools::{ExecutorPools, PoolKind, PoolOccupancy, WorkerPool};
pub use runner::{ExecutionResult, RunnerRegistry, TaskContext, TaskLog, TaskRunner};
pub use shell::ShellRunner;
