//! # TaskRig Core
//!
//! Shared foundation for the TaskRig scheduling and execution engine:
//! the task data model, error taxonomy, configuration, and the two seams
//! to the outside world (`TaskStore` for persistence, `AgentRunner` for
//! the long-running agent invocation).
//!
//! The engine crates (`taskrig-scheduler`, `taskrig-executor`) consume
//! everything through these types — they never reach around the seams.

pub mod agent;
pub mod config;
pub mod error;
pub mod store;
pub mod testing;
pub mod types;

pub use agent::{AgentEvent, AgentHandle, AgentRequest, AgentRunner};
pub use config::{DispatchMode, EngineConfig, ExecutorConfig, SchedulerConfig};
pub use error::{Result, TaskRigError};
pub use store::{ExecutionPatch, MemoryTaskStore, TaskPatch, TaskStore};
pub use types::{
    ExecutionLogEntry, ExecutionStatus, LogLevel, ModelOverride, RunStatus, Schedule,
    ScheduledTask, TaskDefinition, TaskExecution, TaskState, TaskStatusRecord, TaskType,
};
