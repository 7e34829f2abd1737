//! Persistence seam — the engine receives a `TaskStore` at construction
//! instead of importing one reactively, plus an in-memory implementation
//! for embedding and tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, TaskRigError};
use crate::types::{
    ExecutionLogEntry, ExecutionStatus, RunStatus, Schedule, ScheduledTask, TaskExecution,
};

/// Partial update for an execution record.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub session_id: Option<String>,
    pub response_summary: Option<String>,
    pub error: Option<String>,
    pub error_stack: Option<String>,
    /// Entries appended to the execution's log stream.
    pub append_logs: Vec<ExecutionLogEntry>,
}

/// Partial update for a scheduled task definition.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub enabled: Option<bool>,
    pub name: Option<String>,
    pub trigger_message: Option<String>,
    pub schedule: Option<Schedule>,
}

/// External persistence for scheduled tasks and execution history.
///
/// Store failures are logged at the call site and never crash a scheduler
/// tick — implementations should return errors, not panic.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn load_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>>;

    async fn get_scheduled_task(&self, id: &str) -> Result<Option<ScheduledTask>>;

    async fn update_task_run_status(
        &self,
        id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()>;

    async fn update_task_next_run_at(
        &self,
        id: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn add_task_execution(&self, execution: TaskExecution) -> Result<()>;

    async fn update_task_execution(
        &self,
        task_id: &str,
        execution_id: &str,
        patch: ExecutionPatch,
    ) -> Result<()>;

    async fn update_scheduled_task(&self, id: &str, patch: TaskPatch) -> Result<()>;
}

/// In-memory `TaskStore` — no persistence across restarts.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    tasks: HashMap<String, ScheduledTask>,
    executions: HashMap<String, Vec<TaskExecution>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a task definition.
    pub fn insert_task(&self, task: ScheduledTask) {
        self.lock().tasks.insert(task.id.clone(), task);
    }

    /// Snapshot of one task, if present.
    pub fn task(&self, id: &str) -> Option<ScheduledTask> {
        self.lock().tasks.get(id).cloned()
    }

    /// Snapshot of all executions recorded for one task.
    pub fn executions(&self, task_id: &str) -> Vec<TaskExecution> {
        self.lock()
            .executions
            .get(task_id)
            .cloned()
            .unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn load_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let mut tasks: Vec<ScheduledTask> = self.lock().tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    async fn get_scheduled_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        Ok(self.lock().tasks.get(id).cloned())
    }

    async fn update_task_run_status(
        &self,
        id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskRigError::NotFound(format!("task '{id}'")))?;
        task.last_run_status = status;
        task.last_run_error = error;
        Ok(())
    }

    async fn update_task_next_run_at(
        &self,
        id: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskRigError::NotFound(format!("task '{id}'")))?;
        task.next_run_at = next_run_at;
        Ok(())
    }

    async fn add_task_execution(&self, execution: TaskExecution) -> Result<()> {
        self.lock()
            .executions
            .entry(execution.task_id.clone())
            .or_default()
            .push(execution);
        Ok(())
    }

    async fn update_task_execution(
        &self,
        task_id: &str,
        execution_id: &str,
        patch: ExecutionPatch,
    ) -> Result<()> {
        let mut inner = self.lock();
        let execution = inner
            .executions
            .get_mut(task_id)
            .and_then(|list| list.iter_mut().find(|e| e.id == execution_id))
            .ok_or_else(|| TaskRigError::NotFound(format!("execution '{execution_id}'")))?;
        apply_execution_patch(execution, patch);
        Ok(())
    }

    async fn update_scheduled_task(&self, id: &str, patch: TaskPatch) -> Result<()> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| TaskRigError::NotFound(format!("task '{id}'")))?;
        apply_task_patch(task, patch);
        Ok(())
    }
}

/// Apply an execution patch in place. Shared by store implementations.
pub fn apply_execution_patch(execution: &mut TaskExecution, patch: ExecutionPatch) {
    if let Some(status) = patch.status {
        execution.status = status;
    }
    if let Some(completed_at) = patch.completed_at {
        execution.completed_at = Some(completed_at);
    }
    if let Some(session_id) = patch.session_id {
        execution.session_id = Some(session_id);
    }
    if let Some(summary) = patch.response_summary {
        execution.response_summary = Some(summary);
    }
    if let Some(error) = patch.error {
        execution.error = Some(error);
    }
    if let Some(stack) = patch.error_stack {
        execution.error_stack = Some(stack);
    }
    execution.logs.extend(patch.append_logs);
}

/// Apply a task patch in place. Shared by store implementations.
pub fn apply_task_patch(task: &mut ScheduledTask, patch: TaskPatch) {
    if let Some(enabled) = patch.enabled {
        task.enabled = enabled;
    }
    if let Some(name) = patch.name {
        task.name = name;
    }
    if let Some(message) = patch.trigger_message {
        task.trigger_message = message;
    }
    if let Some(schedule) = patch.schedule {
        task.schedule = schedule;
    }
}
