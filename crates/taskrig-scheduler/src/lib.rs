//! # TaskRig Scheduler
//!
//! Converts declarative schedules (cron, fixed interval, one-shot) into
//! live timed triggers that fire agent invocations, bounded by a global
//! concurrency cap and a per-task single-flight gate.
//!
//! ```text
//!   ┌────────────┐   load    ┌──────────────────┐   fire   ┌───────────┐
//!   │  TaskStore  │ ────────▶ │ TriggerScheduler │ ───────▶ │ execution │
//!   │ (sqlite/mem)│ ◀──────── │  timers + gates  │          │  (inline  │
//!   └────────────┘  status,   └──────────────────┘          │  or pool) │
//!                   next_run            │                   └───────────┘
//!                                       ▼
//!                              taskrig-executor
//!                              (worker pool path)
//! ```
//!
//! Firings that arrive while the engine is at its concurrency cap are
//! skipped, not queued; the next trigger occurrence picks the work back up.

pub mod cron;
pub mod engine;
pub mod persistence;
pub mod timer;

pub use cron::{CronSpec, estimate_next_run, interval_to_cron};
pub use engine::{SchedulerStatus, TriggerScheduler};
pub use persistence::SqliteTaskStore;
