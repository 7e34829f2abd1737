//! TaskRig bounded executor.
//!
//! A fixed-capacity worker pool for agent invocations. Submissions past
//! capacity queue (priority first, submission order second) instead of
//! running; every running task races a hard per-task deadline; cancellation
//! is cooperative via a best-effort interrupt to the agent.
//!
//! ```text
//!   submit_task ──▶ validate ──▶ slot free? ──▶ run (deadline + interrupt)
//!                                    │
//!                                    └── no ──▶ queue ──▶ dispatched when
//!                                                         a slot frees
//! ```
//!
//! The pool never restarts or retries a task. A terminal record is kept for
//! polling until the retention cap evicts it.

mod pool;
mod queue;

pub use pool::{ExecutorStats, TaskExecutor};
