//! Error taxonomy for the scheduling and execution engine.
//!
//! Errors local to one task's execution never escape that task's state;
//! these variants exist so the boundary (submission, scheduling) can tell
//! callers *why* something was rejected.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, TaskRigError>;

/// All engine errors.
#[derive(Debug, Error)]
pub enum TaskRigError {
    /// Malformed `TaskDefinition`/`ScheduledTask` — rejected at the boundary.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown task or schedule id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid cron expression, past-due one-time execution, or similar.
    /// Logged, never fatal to the process.
    #[error("scheduling failed: {0}")]
    Scheduling(String),

    /// A concurrency gate dropped the firing (global or per-task).
    /// The firing is not queued and not retried.
    #[error("concurrency limit: {0}")]
    ConcurrencyRejected(String),

    /// The agent invocation failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// Per-task deadline exceeded.
    #[error("timed out after {0}ms")]
    Timeout(u64),

    /// Configuration load/parse problem.
    #[error("config error: {0}")]
    Config(String),

    /// Persistence layer problem. Store failures during a scheduler tick
    /// are logged at the call site and never crash the tick.
    #[error("store error: {0}")]
    Store(String),
}
