//! Task definitions — the core data model for scheduled and submitted work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TaskRigError};

/// When/how a scheduled task triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Run on a five-field cron expression ("MIN HOUR DOM MON DOW").
    Cron { expression: String },
    /// Run every N minutes (converted to a cron expression at registration).
    Interval { minutes: u32 },
    /// Run once at a specific instant.
    Once { execute_at: DateTime<Utc> },
}

/// Per-task model selection override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOverride {
    pub model_id: String,
    pub version_id: Option<String>,
}

/// Last-run status of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Success,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
        }
    }
}

/// A scheduled task — declarative trigger plus the message it fires with.
///
/// Invariant: `next_run_at` is `Some` only while the task has a live trigger
/// registered with the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique task ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Whether the task may be triggered at all.
    pub enabled: bool,
    /// When/how to trigger.
    pub schedule: Schedule,
    /// Which agent executes the trigger message.
    pub agent_id: String,
    /// Working directory the agent runs in.
    pub project_path: String,
    /// The message sent to the agent when the trigger fires.
    pub trigger_message: String,
    /// Optional model override for this task.
    pub model_override: Option<ModelOverride>,
    /// Status of the most recent run.
    pub last_run_status: RunStatus,
    /// Error message from the most recent failed run.
    pub last_run_error: Option<String>,
    /// Next planned firing, when a live trigger exists and the pattern is
    /// simple enough to estimate.
    pub next_run_at: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    /// Create a new enabled task with an idle run status.
    pub fn new(
        id: &str,
        name: &str,
        schedule: Schedule,
        agent_id: &str,
        project_path: &str,
        trigger_message: &str,
    ) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            enabled: true,
            schedule,
            agent_id: agent_id.to_string(),
            project_path: project_path.to_string(),
            trigger_message: trigger_message.to_string(),
            model_override: None,
            last_run_status: RunStatus::Idle,
            last_run_error: None,
            next_run_at: None,
        }
    }

    /// Effective model id for invocation (override wins over runner default).
    pub fn effective_model(&self) -> Option<&str> {
        self.model_override.as_ref().map(|m| m.model_id.as_str())
    }
}

/// Outcome status of one concrete execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
}

/// Log severity for execution log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One entry in an execution's log stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Free-form category: "system", "assistant", "tool_use", "result".
    #[serde(rename = "type")]
    pub entry_type: String,
    pub message: String,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ExecutionLogEntry {
    pub fn info(entry_type: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, entry_type, message)
    }

    pub fn error(entry_type: &str, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, entry_type, message)
    }

    fn new(level: LogLevel, entry_type: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            entry_type: entry_type.to_string(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach a structured payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// The durable record of one concrete run of a `ScheduledTask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    /// Globally unique execution id.
    pub id: String,
    /// Owning scheduled task.
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    /// First session id observed on the agent event stream.
    pub session_id: Option<String>,
    /// First 500 characters of the full response.
    pub response_summary: Option<String>,
    pub logs: Vec<ExecutionLogEntry>,
    pub error: Option<String>,
    pub error_stack: Option<String>,
}

impl TaskExecution {
    /// Start a new running execution for the given task.
    pub fn begin(task_id: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            status: ExecutionStatus::Running,
            session_id: None,
            response_summary: None,
            logs: vec![ExecutionLogEntry::info("system", "execution started")],
            error: None,
            error_stack: None,
        }
    }
}

/// Origin of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Scheduled,
    A2aAsync,
}

/// The unit of work submitted to the bounded executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique among currently tracked tasks (running, queued, retained).
    pub id: String,
    pub task_type: TaskType,
    pub agent_id: String,
    pub project_path: String,
    pub message: String,
    /// Hard deadline for the invocation, in milliseconds. Must be > 0.
    pub timeout_ms: u64,
    pub max_turns: Option<u32>,
    pub model_id: Option<String>,
    pub permission_mode: Option<String>,
    /// Higher priority dequeues first; submission order breaks ties.
    #[serde(default)]
    pub priority: i32,
    pub version_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskDefinition {
    /// Create a definition with defaults suitable for on-demand submission.
    pub fn new(id: &str, agent_id: &str, project_path: &str, message: &str) -> Self {
        Self {
            id: id.to_string(),
            task_type: TaskType::A2aAsync,
            agent_id: agent_id.to_string(),
            project_path: project_path.to_string(),
            message: message.to_string(),
            timeout_ms: 300_000,
            max_turns: None,
            model_id: None,
            permission_mode: None,
            priority: 0,
            version_id: None,
            created_at: Utc::now(),
        }
    }

    /// Validate the definition at the submission boundary.
    ///
    /// Task ids use a strict allow-list: ASCII alphanumeric, `-`, `_`.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(TaskRigError::Validation("task id is required".into()));
        }
        if !is_valid_task_id(&self.id) {
            return Err(TaskRigError::Validation(format!(
                "task id '{}' contains characters outside [A-Za-z0-9_-]",
                self.id
            )));
        }
        if self.agent_id.is_empty() {
            return Err(TaskRigError::Validation("agent_id is required".into()));
        }
        if self.project_path.is_empty() {
            return Err(TaskRigError::Validation("project_path is required".into()));
        }
        if self.message.is_empty() {
            return Err(TaskRigError::Validation("message is required".into()));
        }
        if self.timeout_ms == 0 {
            return Err(TaskRigError::Validation("timeout_ms must be > 0".into()));
        }
        Ok(())
    }
}

/// Lifecycle state of a submitted task.
///
/// `Pending → Queued → Running → {Completed | Failed | Canceled}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }
}

/// Runtime view of a submitted task, mutated only by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusRecord {
    pub id: String,
    pub state: TaskState,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Truncated response text for completed tasks.
    pub result_summary: Option<String>,
    /// First session id observed on the agent event stream.
    pub session_id: Option<String>,
    pub error: Option<String>,
    /// Set when the task failed by exceeding its deadline.
    pub timed_out: bool,
}

impl TaskStatusRecord {
    /// Fresh record for a just-submitted task.
    pub fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            state: TaskState::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_summary: None,
            session_id: None,
            error: None,
            timed_out: false,
        }
    }
}

/// Strict task-id allow-list: ASCII alphanumeric, `-`, `_`.
pub fn is_valid_task_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Truncate a string to at most `max_chars` characters, never splitting a
/// multi-byte character.
pub fn safe_truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
