//! SQLite-backed `TaskStore`.
//!
//! Schedules, model overrides, and execution logs are stored as JSON side
//! columns; everything the engine filters or updates directly gets its own
//! column. Timestamps are RFC 3339 text.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};

use taskrig_core::store::{apply_execution_patch, apply_task_patch};
use taskrig_core::{
    ExecutionPatch, ExecutionStatus, Result, RunStatus, ScheduledTask, TaskExecution, TaskPatch,
    TaskRigError, TaskStore,
};

const MIGRATION: &str = "
CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    enabled         INTEGER NOT NULL,
    schedule        TEXT NOT NULL,
    agent_id        TEXT NOT NULL,
    project_path    TEXT NOT NULL,
    trigger_message TEXT NOT NULL,
    model_override  TEXT,
    last_run_status TEXT NOT NULL,
    last_run_error  TEXT,
    next_run_at     TEXT
);

CREATE TABLE IF NOT EXISTS task_executions (
    id               TEXT PRIMARY KEY,
    task_id          TEXT NOT NULL,
    started_at       TEXT NOT NULL,
    completed_at     TEXT,
    status           TEXT NOT NULL,
    session_id       TEXT,
    response_summary TEXT,
    logs             TEXT NOT NULL,
    error            TEXT,
    error_stack      TEXT
);

CREATE INDEX IF NOT EXISTS idx_task_executions_task_id
    ON task_executions(task_id);
";

/// Durable task storage on a single SQLite file.
pub struct SqliteTaskStore {
    conn: Mutex<Connection>,
}

impl SqliteTaskStore {
    /// Open (creating if needed) the database at `path` and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TaskRigError::Store(format!("failed to create db dir: {e}")))?;
        }
        let conn = Connection::open(path).map_err(store_err)?;
        conn.execute_batch(MIGRATION).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Throwaway database for tests and ephemeral embedding.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(store_err)?;
        conn.execute_batch(MIGRATION).map_err(store_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert or replace a task definition.
    pub fn save_task(&self, task: &ScheduledTask) -> Result<()> {
        let schedule = serde_json::to_string(&task.schedule)
            .map_err(|e| TaskRigError::Store(format!("failed to encode schedule: {e}")))?;
        let model_override = task
            .model_override
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| TaskRigError::Store(format!("failed to encode model override: {e}")))?;

        self.lock()
            .execute(
                "INSERT OR REPLACE INTO scheduled_tasks
                 (id, name, enabled, schedule, agent_id, project_path,
                  trigger_message, model_override, last_run_status,
                  last_run_error, next_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.id,
                    task.name,
                    task.enabled,
                    schedule,
                    task.agent_id,
                    task.project_path,
                    task.trigger_message,
                    model_override,
                    task.last_run_status.as_str(),
                    task.last_run_error,
                    task.next_run_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }

    /// Delete a task and its execution history. Returns `false` when the id
    /// was unknown.
    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let conn = self.lock();
        conn.execute("DELETE FROM task_executions WHERE task_id = ?1", params![id])
            .map_err(store_err)?;
        let changed = conn
            .execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])
            .map_err(store_err)?;
        Ok(changed > 0)
    }

    /// Execution history for one task, oldest first.
    pub fn task_executions(&self, task_id: &str) -> Result<Vec<TaskExecution>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, started_at, completed_at, status, session_id,
                        response_summary, logs, error, error_stack
                 FROM task_executions WHERE task_id = ?1 ORDER BY started_at",
            )
            .map_err(store_err)?;
        let rows = stmt
            .query_map(params![task_id], execution_row)
            .map_err(store_err)?;

        let mut executions = Vec::new();
        for row in rows {
            executions.push(decode_execution(row.map_err(store_err)?)?);
        }
        Ok(executions)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn get_execution(&self, task_id: &str, execution_id: &str) -> Result<Option<TaskExecution>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, started_at, completed_at, status, session_id,
                        response_summary, logs, error, error_stack
                 FROM task_executions WHERE id = ?1 AND task_id = ?2",
            )
            .map_err(store_err)?;
        let mut rows = stmt
            .query_map(params![execution_id, task_id], execution_row)
            .map_err(store_err)?;
        match rows.next() {
            Some(row) => Ok(Some(decode_execution(row.map_err(store_err)?)?)),
            None => Ok(None),
        }
    }

    fn save_execution(&self, execution: &TaskExecution) -> Result<()> {
        let logs = serde_json::to_string(&execution.logs)
            .map_err(|e| TaskRigError::Store(format!("failed to encode logs: {e}")))?;
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO task_executions
                 (id, task_id, started_at, completed_at, status, session_id,
                  response_summary, logs, error, error_stack)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    execution.id,
                    execution.task_id,
                    execution.started_at.to_rfc3339(),
                    execution.completed_at.map(|t| t.to_rfc3339()),
                    execution_status_str(execution.status),
                    execution.session_id,
                    execution.response_summary,
                    logs,
                    execution.error,
                    execution.error_stack,
                ],
            )
            .map_err(store_err)?;
        Ok(())
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn load_scheduled_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, enabled, schedule, agent_id, project_path,
                        trigger_message, model_override, last_run_status,
                        last_run_error, next_run_at
                 FROM scheduled_tasks ORDER BY id",
            )
            .map_err(store_err)?;
        let rows = stmt.query_map([], task_row).map_err(store_err)?;

        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(decode_task(row.map_err(store_err)?)?);
        }
        Ok(tasks)
    }

    async fn get_scheduled_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT id, name, enabled, schedule, agent_id, project_path,
                        trigger_message, model_override, last_run_status,
                        last_run_error, next_run_at
                 FROM scheduled_tasks WHERE id = ?1",
            )
            .map_err(store_err)?;
        let mut rows = stmt.query_map(params![id], task_row).map_err(store_err)?;
        match rows.next() {
            Some(row) => Ok(Some(decode_task(row.map_err(store_err)?)?)),
            None => Ok(None),
        }
    }

    async fn update_task_run_status(
        &self,
        id: &str,
        status: RunStatus,
        error: Option<String>,
    ) -> Result<()> {
        let changed = self
            .lock()
            .execute(
                "UPDATE scheduled_tasks SET last_run_status = ?1, last_run_error = ?2
                 WHERE id = ?3",
                params![status.as_str(), error, id],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(TaskRigError::NotFound(format!("task '{id}'")));
        }
        Ok(())
    }

    async fn update_task_next_run_at(
        &self,
        id: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let changed = self
            .lock()
            .execute(
                "UPDATE scheduled_tasks SET next_run_at = ?1 WHERE id = ?2",
                params![next_run_at.map(|t| t.to_rfc3339()), id],
            )
            .map_err(store_err)?;
        if changed == 0 {
            return Err(TaskRigError::NotFound(format!("task '{id}'")));
        }
        Ok(())
    }

    async fn add_task_execution(&self, execution: TaskExecution) -> Result<()> {
        self.save_execution(&execution)
    }

    async fn update_task_execution(
        &self,
        task_id: &str,
        execution_id: &str,
        patch: ExecutionPatch,
    ) -> Result<()> {
        let mut execution = self
            .get_execution(task_id, execution_id)?
            .ok_or_else(|| TaskRigError::NotFound(format!("execution '{execution_id}'")))?;
        apply_execution_patch(&mut execution, patch);
        self.save_execution(&execution)
    }

    async fn update_scheduled_task(&self, id: &str, patch: TaskPatch) -> Result<()> {
        let mut task = self
            .get_scheduled_task(id)
            .await?
            .ok_or_else(|| TaskRigError::NotFound(format!("task '{id}'")))?;
        apply_task_patch(&mut task, patch);
        self.save_task(&task)
    }
}

fn store_err(e: rusqlite::Error) -> TaskRigError {
    TaskRigError::Store(e.to_string())
}

type TaskRow = (
    String,
    String,
    bool,
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
);

fn task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn decode_task(row: TaskRow) -> Result<ScheduledTask> {
    let (
        id,
        name,
        enabled,
        schedule,
        agent_id,
        project_path,
        trigger_message,
        model_override,
        last_run_status,
        last_run_error,
        next_run_at,
    ) = row;
    Ok(ScheduledTask {
        id,
        name,
        enabled,
        schedule: serde_json::from_str(&schedule)
            .map_err(|e| TaskRigError::Store(format!("bad schedule json: {e}")))?,
        agent_id,
        project_path,
        trigger_message,
        model_override: model_override
            .map(|json| serde_json::from_str(&json))
            .transpose()
            .map_err(|e| TaskRigError::Store(format!("bad model override json: {e}")))?,
        last_run_status: run_status_from_str(&last_run_status),
        last_run_error,
        next_run_at: next_run_at.map(|t| parse_ts(&t)).transpose()?,
    })
}

type ExecutionRow = (
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
);

fn execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn decode_execution(row: ExecutionRow) -> Result<TaskExecution> {
    let (
        id,
        task_id,
        started_at,
        completed_at,
        status,
        session_id,
        response_summary,
        logs,
        error,
        error_stack,
    ) = row;
    Ok(TaskExecution {
        id,
        task_id,
        started_at: parse_ts(&started_at)?,
        completed_at: completed_at.map(|t| parse_ts(&t)).transpose()?,
        status: execution_status_from_str(&status),
        session_id,
        response_summary,
        logs: serde_json::from_str(&logs)
            .map_err(|e| TaskRigError::Store(format!("bad logs json: {e}")))?,
        error,
        error_stack,
    })
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TaskRigError::Store(format!("bad timestamp '{text}': {e}")))
}

fn run_status_from_str(text: &str) -> RunStatus {
    match text {
        "running" => RunStatus::Running,
        "success" => RunStatus::Success,
        "error" => RunStatus::Error,
        _ => RunStatus::Idle,
    }
}

fn execution_status_str(status: ExecutionStatus) -> &'static str {
    match status {
        ExecutionStatus::Running => "running",
        ExecutionStatus::Success => "success",
        ExecutionStatus::Error => "error",
    }
}

fn execution_status_from_str(text: &str) -> ExecutionStatus {
    match text {
        "running" => ExecutionStatus::Running,
        "success" => ExecutionStatus::Success,
        _ => ExecutionStatus::Error,
    }
}
