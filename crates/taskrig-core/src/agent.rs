//! The seam to the external agent process.
//!
//! The engine consumes exactly four signal categories from a running
//! invocation: a session identifier (first occurrence wins), incremental
//! text/tool-use events, and a terminal success or failure. Anything else
//! the agent emits is the runner's business.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{ScheduledTask, TaskDefinition};

/// One agent invocation request.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub agent_id: String,
    pub project_path: String,
    pub message: String,
    pub model_id: Option<String>,
    pub version_id: Option<String>,
    pub max_turns: Option<u32>,
    pub permission_mode: Option<String>,
}

impl AgentRequest {
    /// Build a request from an executor submission.
    pub fn from_definition(def: &TaskDefinition) -> Self {
        Self {
            agent_id: def.agent_id.clone(),
            project_path: def.project_path.clone(),
            message: def.message.clone(),
            model_id: def.model_id.clone(),
            version_id: def.version_id.clone(),
            max_turns: def.max_turns,
            permission_mode: def.permission_mode.clone(),
        }
    }

    /// Build a request from a scheduled task firing.
    pub fn from_scheduled(task: &ScheduledTask) -> Self {
        Self {
            agent_id: task.agent_id.clone(),
            project_path: task.project_path.clone(),
            message: task.trigger_message.clone(),
            model_id: task.effective_model().map(str::to_string),
            version_id: task
                .model_override
                .as_ref()
                .and_then(|m| m.version_id.clone()),
            max_turns: None,
            permission_mode: None,
        }
    }
}

/// Events the engine consumes from a running invocation.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// Session identifier for the invocation.
    Session { session_id: String },
    /// Incremental assistant text.
    Text { content: String },
    /// A tool invocation the agent performed.
    ToolUse {
        tool: String,
        detail: serde_json::Value,
    },
    /// Terminal success with optional cost/duration metadata.
    Completed {
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
    },
    /// Terminal failure.
    Failed {
        message: String,
        stack: Option<String>,
    },
}

/// Handle to one in-flight agent invocation.
pub struct AgentHandle {
    events: mpsc::Receiver<AgentEvent>,
    interrupt: CancellationToken,
}

impl AgentHandle {
    pub fn new(events: mpsc::Receiver<AgentEvent>, interrupt: CancellationToken) -> Self {
        Self { events, interrupt }
    }

    /// Next event from the invocation, or `None` when the stream ends.
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.events.recv().await
    }

    /// Best-effort cancellation signal — accepted or ignored, never an error.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    /// Clone of the interrupt signal, usable after the handle is consumed.
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }
}

/// Performs the actual long-running agent invocation.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Start an invocation and return a handle to its event stream.
    async fn invoke(&self, request: AgentRequest) -> Result<AgentHandle>;
}
