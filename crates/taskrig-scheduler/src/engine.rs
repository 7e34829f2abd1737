//! The trigger scheduler: registration, timed firing, and execution gating.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use taskrig_core::types::safe_truncate;
use taskrig_core::{
    AgentEvent, AgentRequest, AgentRunner, DispatchMode, ExecutionLogEntry, ExecutionPatch,
    ExecutionStatus, Result, RunStatus, Schedule, ScheduledTask, SchedulerConfig, TaskDefinition,
    TaskExecution, TaskPatch, TaskRigError, TaskState, TaskStore, TaskType,
};
use taskrig_executor::TaskExecutor;

use crate::cron::{self, CronSpec};
use crate::timer;

/// Response summaries persisted on executions are truncated to this length.
const SUMMARY_MAX: usize = 500;

/// Point-in-time view of the scheduler for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub initialized: bool,
    pub enabled: bool,
    pub config: SchedulerConfig,
    /// Tasks with a live trigger registered.
    pub active_task_count: usize,
    /// Executions currently in flight.
    pub running_task_count: usize,
}

/// Converts stored schedules into live triggers and runs their firings.
///
/// Cheap to clone; all clones share one engine.
#[derive(Clone)]
pub struct TriggerScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    store: Arc<dyn TaskStore>,
    runner: Arc<dyn AgentRunner>,
    state: Mutex<EngineState>,
}

#[derive(Default)]
struct EngineState {
    initialized: bool,
    enabled: bool,
    /// Live trigger per task id.
    triggers: HashMap<String, JoinHandle<()>>,
    /// Task ids with an execution in flight.
    running: HashSet<String>,
    executor: Option<TaskExecutor>,
}

/// Removes the task from the in-flight set when its run ends, on any path.
struct RunningGuard {
    inner: Arc<SchedulerInner>,
    id: String,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.inner.lock().running.remove(&self.id);
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TriggerScheduler {
    pub fn new(
        store: Arc<dyn TaskStore>,
        runner: Arc<dyn AgentRunner>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                runner,
                state: Mutex::new(EngineState::default()),
            }),
        }
    }

    /// Route firings through a worker pool when `dispatch = worker_pool`.
    pub fn attach_executor(&self, executor: TaskExecutor) {
        self.inner.lock().executor = Some(executor);
    }

    /// Load stored tasks and, when `enabled`, register triggers for the
    /// enabled ones. Idempotent; a second call warns and changes nothing.
    pub async fn initialize(&self, enabled: bool) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.initialized {
                warn!("⚠️ Scheduler already initialized");
                return Ok(());
            }
            state.initialized = true;
            state.enabled = enabled;
        }
        if !enabled {
            info!("📅 Scheduler initialized disabled, no triggers registered");
            return Ok(());
        }

        let tasks = self.inner.store.load_scheduled_tasks().await?;
        let mut registered = 0;
        for task in &tasks {
            if !task.enabled {
                continue;
            }
            match self.schedule_task(task).await {
                Ok(()) => registered += 1,
                Err(e) => warn!("⚠️ Failed to schedule task {}: {}", task.id, e),
            }
        }
        info!(
            "📅 Scheduler initialized: {}/{} task(s) registered",
            registered,
            tasks.len()
        );
        Ok(())
    }

    /// Register (or replace) the live trigger for a task.
    ///
    /// A one-shot whose moment has already passed never fires: the task is
    /// disabled in the store and a scheduling error is returned.
    pub async fn schedule_task(&self, task: &ScheduledTask) -> Result<()> {
        if !self.inner.lock().enabled {
            warn!("⚠️ Scheduler disabled, not registering task {}", task.id);
            return Ok(());
        }
        if !task.enabled {
            self.unschedule_task(&task.id).await;
            return Ok(());
        }

        let (handle, next_run) = match &task.schedule {
            Schedule::Once { execute_at } => {
                let execute_at = *execute_at;
                if execute_at <= Utc::now() {
                    let patch = TaskPatch {
                        enabled: Some(false),
                        ..Default::default()
                    };
                    if let Err(e) = self.inner.store.update_scheduled_task(&task.id, patch).await
                    {
                        warn!("⚠️ Failed to disable spent task {}: {}", task.id, e);
                    }
                    return Err(TaskRigError::Scheduling(format!(
                        "task {} is one-shot and its execute_at has passed",
                        task.id
                    )));
                }
                (
                    self.spawn_once_trigger(task.id.clone(), execute_at),
                    Some(execute_at),
                )
            }
            Schedule::Cron { expression } => {
                let spec = CronSpec::parse(expression)?;
                let next = cron::estimate_next_run(expression, Utc::now());
                (self.spawn_cron_trigger(task.id.clone(), spec), next)
            }
            Schedule::Interval { minutes } => {
                let expression = cron::interval_to_cron(*minutes)?;
                let spec = CronSpec::parse(&expression)?;
                let next = cron::estimate_next_run(&expression, Utc::now());
                (self.spawn_cron_trigger(task.id.clone(), spec), next)
            }
        };

        {
            let mut state = self.inner.lock();
            if let Some(old) = state.triggers.insert(task.id.clone(), handle) {
                old.abort();
            }
        }
        if let Err(e) = self
            .inner
            .store
            .update_task_next_run_at(&task.id, next_run)
            .await
        {
            warn!("⚠️ Failed to persist next run for {}: {}", task.id, e);
        }
        info!("⏰ Task {} scheduled ({})", task.id, task.name);
        Ok(())
    }

    /// Drop a task's live trigger. Returns `false` when none was registered.
    pub async fn unschedule_task(&self, id: &str) -> bool {
        let existed = {
            let mut state = self.inner.lock();
            match state.triggers.remove(id) {
                Some(handle) => {
                    handle.abort();
                    true
                }
                None => false,
            }
        };
        if existed {
            if let Err(e) = self.inner.store.update_task_next_run_at(id, None).await {
                warn!("⚠️ Failed to clear next run for {}: {}", id, e);
            }
            info!("🗑️ Task {} unscheduled", id);
        }
        existed
    }

    /// Re-read a task from the store and rebuild its trigger. Returns
    /// `Ok(false)` when the task does not exist.
    pub async fn reschedule_task(&self, id: &str) -> Result<bool> {
        let Some(task) = self.inner.store.get_scheduled_task(id).await? else {
            return Ok(false);
        };
        self.unschedule_task(id).await;
        if task.enabled {
            self.schedule_task(&task).await?;
        }
        Ok(true)
    }

    /// Run a task now, subject to the concurrency gates.
    ///
    /// A firing that arrives while the engine is at its global cap, or while
    /// the same task is already running, is skipped with a warning rather
    /// than queued. The execution record and the task's run status are
    /// persisted on every other path; store failures are logged, never fatal.
    pub async fn execute_task(&self, id: &str) -> Result<()> {
        let Some(task) = self.inner.store.get_scheduled_task(id).await? else {
            return Err(TaskRigError::NotFound(format!("task '{id}'")));
        };
        let task = &task;
        let _guard = {
            let mut state = self.inner.lock();
            if state.running.len() >= self.inner.config.max_concurrent_tasks {
                warn!(
                    "⚠️ Concurrency cap ({}) reached, skipping firing of task {}",
                    self.inner.config.max_concurrent_tasks, task.id
                );
                return Err(TaskRigError::ConcurrencyRejected(format!(
                    "{} task(s) already running",
                    state.running.len()
                )));
            }
            if !state.running.insert(task.id.clone()) {
                warn!("⚠️ Task {} is already running, skipping firing", task.id);
                return Err(TaskRigError::ConcurrencyRejected(format!(
                    "task {} is already running",
                    task.id
                )));
            }
            RunningGuard {
                inner: self.inner.clone(),
                id: task.id.clone(),
            }
        };

        info!("▶️ Executing task {} ({})", task.id, task.name);
        let execution = TaskExecution::begin(&task.id);
        let execution_id = execution.id.clone();
        if let Err(e) = self.inner.store.add_task_execution(execution).await {
            warn!("⚠️ Failed to record execution for {}: {}", task.id, e);
        }
        if let Err(e) = self
            .inner
            .store
            .update_task_run_status(&task.id, RunStatus::Running, None)
            .await
        {
            warn!("⚠️ Failed to mark task {} running: {}", task.id, e);
        }

        let pool = match self.inner.config.dispatch {
            DispatchMode::WorkerPool => self.inner.lock().executor.clone(),
            DispatchMode::Inline => None,
        };
        let patch = match pool {
            Some(pool) => self.run_via_pool(task, &execution_id, pool).await,
            None => self.run_inline(task).await,
        };

        let succeeded = patch.status == Some(ExecutionStatus::Success);
        let run_error = patch.error.clone();
        if let Err(e) = self
            .inner
            .store
            .update_task_execution(&task.id, &execution_id, patch)
            .await
        {
            warn!(
                "⚠️ Failed to finalize execution {} of {}: {}",
                execution_id, task.id, e
            );
        }
        let status = if succeeded {
            RunStatus::Success
        } else {
            RunStatus::Error
        };
        if let Err(e) = self
            .inner
            .store
            .update_task_run_status(&task.id, status, run_error)
            .await
        {
            warn!("⚠️ Failed to update run status of {}: {}", task.id, e);
        }

        // Recurring schedules get a fresh estimate after each run; only a
        // task with a live trigger carries one.
        let recurring_next = match &task.schedule {
            Schedule::Cron { expression } => Some(cron::estimate_next_run(expression, Utc::now())),
            Schedule::Interval { minutes } => Some(
                cron::interval_to_cron(*minutes)
                    .ok()
                    .and_then(|e| cron::estimate_next_run(&e, Utc::now())),
            ),
            Schedule::Once { .. } => None,
        };
        if let Some(next) = recurring_next {
            if self.inner.lock().triggers.contains_key(&task.id) {
                if let Err(e) = self
                    .inner
                    .store
                    .update_task_next_run_at(&task.id, next)
                    .await
                {
                    warn!("⚠️ Failed to refresh next run for {}: {}", task.id, e);
                }
            }
        }

        if succeeded {
            info!("✅ Task {} completed", task.id);
        } else {
            warn!("⚠️ Task {} run ended in error", task.id);
        }
        Ok(())
    }

    /// Re-register every enabled stored task. No-op while already enabled.
    pub async fn enable_scheduler(&self) -> Result<()> {
        {
            let mut state = self.inner.lock();
            if state.enabled {
                return Ok(());
            }
            state.enabled = true;
        }
        let tasks = self.inner.store.load_scheduled_tasks().await?;
        for task in tasks.iter().filter(|t| t.enabled) {
            if let Err(e) = self.schedule_task(task).await {
                warn!("⚠️ Failed to re-register task {}: {}", task.id, e);
            }
        }
        info!("▶️ Scheduler enabled");
        Ok(())
    }

    /// Cancel every live trigger and clear the persisted next-run markers.
    /// Executions already in flight run to completion.
    pub async fn disable_scheduler(&self) {
        let ids: Vec<String> = {
            let mut state = self.inner.lock();
            state.enabled = false;
            let ids = state.triggers.keys().cloned().collect();
            for (_, handle) in state.triggers.drain() {
                handle.abort();
            }
            ids
        };
        for id in &ids {
            if let Err(e) = self.inner.store.update_task_next_run_at(id, None).await {
                warn!("⚠️ Failed to clear next run for {}: {}", id, e);
            }
        }
        info!("⏸️ Scheduler disabled, {} trigger(s) cancelled", ids.len());
    }

    /// Disable and forget initialization state.
    pub async fn shutdown(&self) {
        self.disable_scheduler().await;
        self.inner.lock().initialized = false;
        info!("🛑 Scheduler shut down");
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        let state = self.inner.lock();
        SchedulerStatus {
            initialized: state.initialized,
            enabled: state.enabled,
            config: self.inner.config.clone(),
            active_task_count: state.triggers.len(),
            running_task_count: state.running.len(),
        }
    }

    /// Ids of tasks with a live trigger, sorted.
    pub fn active_task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().triggers.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn spawn_cron_trigger(&self, task_id: String, spec: CronSpec) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = spec.next_occurrence(Utc::now()) else {
                    warn!("⚠️ Task {} has no future occurrence, trigger exiting", task_id);
                    break;
                };
                timer::sleep_until(next).await;

                // Re-read at fire time so edits and deletes take effect.
                let task = match scheduler.inner.store.get_scheduled_task(&task_id).await {
                    Ok(Some(task)) => task,
                    Ok(None) => {
                        warn!("⚠️ Task {} no longer exists, trigger exiting", task_id);
                        break;
                    }
                    Err(e) => {
                        warn!("⚠️ Failed to load task {} at fire time: {}", task_id, e);
                        continue;
                    }
                };
                if !task.enabled {
                    continue;
                }
                let runner = scheduler.clone();
                tokio::spawn(async move {
                    let _ = runner.execute_task(&task.id).await;
                });
            }
            scheduler.inner.lock().triggers.remove(&task_id);
        })
    }

    fn spawn_once_trigger(&self, task_id: String, execute_at: DateTime<Utc>) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            timer::sleep_until(execute_at).await;

            let task = match scheduler.inner.store.get_scheduled_task(&task_id).await {
                Ok(Some(task)) if task.enabled => Some(task),
                Ok(_) => None,
                Err(e) => {
                    warn!("⚠️ Failed to load task {} at fire time: {}", task_id, e);
                    None
                }
            };
            if task.is_some() {
                let _ = scheduler.execute_task(&task_id).await;
            }

            // A one-shot is spent once its moment passes.
            let patch = TaskPatch {
                enabled: Some(false),
                ..Default::default()
            };
            if let Err(e) = scheduler
                .inner
                .store
                .update_scheduled_task(&task_id, patch)
                .await
            {
                warn!("⚠️ Failed to disable spent task {}: {}", task_id, e);
            }
            if let Err(e) = scheduler
                .inner
                .store
                .update_task_next_run_at(&task_id, None)
                .await
            {
                warn!("⚠️ Failed to clear next run for {}: {}", task_id, e);
            }
            scheduler.inner.lock().triggers.remove(&task_id);
        })
    }

    /// Direct path: invoke the agent and consume its event stream here.
    async fn run_inline(&self, task: &ScheduledTask) -> ExecutionPatch {
        let request = AgentRequest::from_scheduled(task);
        let mut handle = match self.inner.runner.invoke(request).await {
            Ok(handle) => handle,
            Err(e) => {
                return failure_patch(
                    format!("agent invocation failed: {e}"),
                    None,
                    None,
                    Vec::new(),
                );
            }
        };

        let mut logs = Vec::new();
        let mut text = String::new();
        let mut session_id: Option<String> = None;

        while let Some(event) = handle.next_event().await {
            match event {
                AgentEvent::Session { session_id: sid } => {
                    // First session id wins.
                    if session_id.is_none() {
                        logs.push(ExecutionLogEntry::info("system", format!("session {sid}")));
                        session_id = Some(sid);
                    }
                }
                AgentEvent::Text { content } => {
                    logs.push(ExecutionLogEntry::info("assistant", content.clone()));
                    text.push_str(&content);
                }
                AgentEvent::ToolUse { tool, detail } => {
                    logs.push(ExecutionLogEntry::info("tool_use", tool).with_data(detail));
                }
                AgentEvent::Completed {
                    cost_usd,
                    duration_ms,
                } => {
                    logs.push(ExecutionLogEntry::info("result", "completed").with_data(
                        serde_json::json!({
                            "cost_usd": cost_usd,
                            "duration_ms": duration_ms,
                        }),
                    ));
                    return ExecutionPatch {
                        status: Some(ExecutionStatus::Success),
                        completed_at: Some(Utc::now()),
                        session_id,
                        response_summary: Some(safe_truncate(&text, SUMMARY_MAX).to_string()),
                        append_logs: logs,
                        ..Default::default()
                    };
                }
                AgentEvent::Failed { message, stack } => {
                    let mut entry = ExecutionLogEntry::error("result", message.clone());
                    if let Some(stack) = &stack {
                        entry = entry.with_data(serde_json::json!({ "stack": stack }));
                    }
                    logs.push(entry);
                    return failure_patch(message, stack, session_id, logs);
                }
            }
        }
        failure_patch(
            "agent stream ended unexpectedly".into(),
            None,
            session_id,
            logs,
        )
    }

    /// Pooled path: convert the firing into a pool submission and poll its
    /// status record until it goes terminal.
    async fn run_via_pool(
        &self,
        task: &ScheduledTask,
        execution_id: &str,
        pool: TaskExecutor,
    ) -> ExecutionPatch {
        // Per-run id keeps repeat firings unique among tracked pool tasks.
        let run_id = format!("{}-{}", task.id, &execution_id[..8]);
        let mut def = TaskDefinition::new(
            &run_id,
            &task.agent_id,
            &task.project_path,
            &task.trigger_message,
        );
        def.task_type = TaskType::Scheduled;
        def.timeout_ms = self.inner.config.default_timeout_ms;
        def.model_id = task.effective_model().map(str::to_string);
        def.version_id = task
            .model_override
            .as_ref()
            .and_then(|m| m.version_id.clone());

        if let Err(e) = pool.submit_task(def) {
            return failure_patch(
                format!("worker pool rejected the firing: {e}"),
                None,
                None,
                Vec::new(),
            );
        }

        let poll = Duration::from_millis(self.inner.config.poll_interval_ms.max(10));
        loop {
            tokio::time::sleep(poll).await;
            let Some(record) = pool.get_task_status(&run_id) else {
                return failure_patch(
                    "worker pool lost track of the firing".into(),
                    None,
                    None,
                    Vec::new(),
                );
            };
            if !record.state.is_terminal() {
                continue;
            }
            return match record.state {
                TaskState::Completed => ExecutionPatch {
                    status: Some(ExecutionStatus::Success),
                    completed_at: record.finished_at.or_else(|| Some(Utc::now())),
                    session_id: record.session_id,
                    response_summary: record.result_summary,
                    append_logs: vec![ExecutionLogEntry::info(
                        "result",
                        "completed via worker pool",
                    )],
                    ..Default::default()
                },
                TaskState::Canceled => failure_patch(
                    "firing was canceled in the worker pool".into(),
                    None,
                    record.session_id,
                    Vec::new(),
                ),
                _ => failure_patch(
                    record
                        .error
                        .unwrap_or_else(|| "firing failed in the worker pool".into()),
                    None,
                    record.session_id,
                    Vec::new(),
                ),
            };
        }
    }
}

fn failure_patch(
    message: String,
    stack: Option<String>,
    session_id: Option<String>,
    logs: Vec<ExecutionLogEntry>,
) -> ExecutionPatch {
    ExecutionPatch {
        status: Some(ExecutionStatus::Error),
        completed_at: Some(Utc::now()),
        session_id,
        error: Some(message),
        error_stack: stack,
        append_logs: logs,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use taskrig_core::testing::ScriptedRunner;
    use taskrig_core::{ExecutorConfig, MemoryTaskStore};

    fn scheduler_with(
        runner: ScriptedRunner,
        max_concurrent: usize,
    ) -> (TriggerScheduler, Arc<MemoryTaskStore>) {
        let store = Arc::new(MemoryTaskStore::new());
        let config = SchedulerConfig {
            max_concurrent_tasks: max_concurrent,
            dispatch: DispatchMode::Inline,
            default_timeout_ms: 5_000,
            poll_interval_ms: 20,
        };
        let scheduler = TriggerScheduler::new(store.clone(), Arc::new(runner), config);
        (scheduler, store)
    }

    fn interval_task(id: &str) -> ScheduledTask {
        ScheduledTask::new(
            id,
            "Interval Task",
            Schedule::Interval { minutes: 30 },
            "agent-a",
            "/tmp/project",
            "check the build",
        )
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn initialize_registers_only_enabled_tasks() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing("ok"), 3);
        store.insert_task(interval_task("active"));
        let mut off = interval_task("off");
        off.enabled = false;
        store.insert_task(off);

        scheduler.initialize(true).await.unwrap();

        let status = scheduler.scheduler_status();
        assert!(status.initialized);
        assert!(status.enabled);
        assert_eq!(status.active_task_count, 1);
        assert_eq!(scheduler.active_task_ids(), vec!["active".to_string()]);
        assert!(store.task("active").unwrap().next_run_at.is_some());
        assert!(store.task("off").unwrap().next_run_at.is_none());

        // Second call warns and changes nothing.
        scheduler.initialize(true).await.unwrap();
        assert_eq!(scheduler.scheduler_status().active_task_count, 1);
    }

    #[tokio::test]
    async fn schedule_unschedule_round_trip() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing("ok"), 3);
        scheduler.initialize(true).await.unwrap();

        let task = interval_task("t1");
        store.insert_task(task.clone());
        scheduler.schedule_task(&task).await.unwrap();
        assert_eq!(scheduler.scheduler_status().active_task_count, 1);
        assert!(store.task("t1").unwrap().next_run_at.is_some());

        assert!(scheduler.unschedule_task("t1").await);
        assert_eq!(scheduler.scheduler_status().active_task_count, 0);
        assert!(store.task("t1").unwrap().next_run_at.is_none());
        assert!(!scheduler.unschedule_task("t1").await);
    }

    #[tokio::test]
    async fn daily_interval_tasks_register_a_trigger() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing("ok"), 3);
        scheduler.initialize(true).await.unwrap();

        let mut task = interval_task("daily");
        task.schedule = Schedule::Interval { minutes: 1440 };
        store.insert_task(task.clone());
        scheduler.schedule_task(&task).await.unwrap();

        assert_eq!(scheduler.scheduler_status().active_task_count, 1);
        // Daily is not a simple minute step, so no estimate is persisted.
        assert!(store.task("daily").unwrap().next_run_at.is_none());
    }

    #[tokio::test]
    async fn invalid_cron_expression_is_rejected() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing("ok"), 3);
        scheduler.initialize(true).await.unwrap();

        let mut task = interval_task("bad");
        task.schedule = Schedule::Cron {
            expression: "not a cron".into(),
        };
        store.insert_task(task.clone());

        assert!(matches!(
            scheduler.schedule_task(&task).await,
            Err(TaskRigError::Scheduling(_))
        ));
        assert_eq!(scheduler.scheduler_status().active_task_count, 0);
    }

    #[tokio::test]
    async fn past_one_shot_never_fires_and_is_disabled() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing("ok"), 3);
        scheduler.initialize(true).await.unwrap();

        let mut task = interval_task("late");
        task.schedule = Schedule::Once {
            execute_at: Utc::now() - TimeDelta::hours(1),
        };
        store.insert_task(task.clone());

        assert!(matches!(
            scheduler.schedule_task(&task).await,
            Err(TaskRigError::Scheduling(_))
        ));
        assert_eq!(scheduler.scheduler_status().active_task_count, 0);
        assert!(!store.task("late").unwrap().enabled);
        assert!(store.executions("late").is_empty());
    }

    #[tokio::test]
    async fn one_shot_fires_once_then_disables_itself() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing("done"), 3);
        scheduler.initialize(true).await.unwrap();

        let mut task = interval_task("soon");
        task.schedule = Schedule::Once {
            execute_at: Utc::now() + TimeDelta::milliseconds(80),
        };
        store.insert_task(task.clone());
        scheduler.schedule_task(&task).await.unwrap();
        assert!(store.task("soon").unwrap().next_run_at.is_some());

        wait_until(|| !store.task("soon").unwrap().enabled).await;

        let executions = store.executions("soon");
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, ExecutionStatus::Success);
        let after = store.task("soon").unwrap();
        assert!(after.next_run_at.is_none());
        assert_eq!(after.last_run_status, RunStatus::Success);
        wait_until(|| scheduler.scheduler_status().active_task_count == 0).await;
    }

    #[tokio::test]
    async fn execute_task_records_a_successful_run() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing(&"x".repeat(600)), 3);
        store.insert_task(interval_task("t1"));

        scheduler.execute_task("t1").await.unwrap();

        let executions = store.executions("t1");
        assert_eq!(executions.len(), 1);
        let exec = &executions[0];
        assert_eq!(exec.status, ExecutionStatus::Success);
        assert_eq!(exec.session_id.as_deref(), Some("session-test"));
        assert_eq!(exec.response_summary.as_ref().unwrap().len(), 500);
        assert!(exec.completed_at.is_some());

        let after = store.task("t1").unwrap();
        assert_eq!(after.last_run_status, RunStatus::Success);
        assert!(after.last_run_error.is_none());
        assert_eq!(scheduler.scheduler_status().running_task_count, 0);
    }

    #[tokio::test]
    async fn execute_task_records_a_failed_run() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::failing("agent crashed"), 3);
        store.insert_task(interval_task("t1"));

        scheduler.execute_task("t1").await.unwrap();

        let executions = store.executions("t1");
        assert_eq!(executions[0].status, ExecutionStatus::Error);
        assert_eq!(executions[0].error.as_deref(), Some("agent crashed"));
        assert!(executions[0].error_stack.is_some());

        // The failure log entry carries the stack alongside the message.
        let result_entry = executions[0]
            .logs
            .iter()
            .find(|e| e.entry_type == "result")
            .unwrap();
        assert_eq!(
            result_entry.data.as_ref().unwrap()["stack"],
            "scripted stack"
        );

        let after = store.task("t1").unwrap();
        assert_eq!(after.last_run_status, RunStatus::Error);
        assert_eq!(after.last_run_error.as_deref(), Some("agent crashed"));
    }

    #[tokio::test]
    async fn concurrency_gates_skip_instead_of_queueing() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::hanging(), 1);
        store.insert_task(interval_task("busy"));
        store.insert_task(interval_task("other"));

        let background = scheduler.clone();
        tokio::spawn(async move {
            let _ = background.execute_task("busy").await;
        });
        wait_until(|| scheduler.scheduler_status().running_task_count == 1).await;

        // Global cap.
        assert!(matches!(
            scheduler.execute_task("other").await,
            Err(TaskRigError::ConcurrencyRejected(_))
        ));
        // Per-task gate reports the same rejection.
        assert!(matches!(
            scheduler.execute_task("busy").await,
            Err(TaskRigError::ConcurrencyRejected(_))
        ));
        // Skipped firings leave no execution record.
        assert!(store.executions("other").is_empty());
    }

    #[tokio::test]
    async fn initialize_disabled_registers_no_triggers() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing("ok"), 3);
        store.insert_task(interval_task("a"));

        scheduler.initialize(false).await.unwrap();

        let status = scheduler.scheduler_status();
        assert!(status.initialized);
        assert!(!status.enabled);
        assert_eq!(status.active_task_count, 0);
        assert!(store.task("a").unwrap().next_run_at.is_none());
    }

    #[tokio::test]
    async fn executing_an_unknown_task_is_not_found() {
        let (scheduler, _store) = scheduler_with(ScriptedRunner::completing("ok"), 3);
        assert!(matches!(
            scheduler.execute_task("ghost").await,
            Err(TaskRigError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reschedule_reports_missing_tasks() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing("ok"), 3);
        scheduler.initialize(true).await.unwrap();

        assert!(!scheduler.reschedule_task("ghost").await.unwrap());

        store.insert_task(interval_task("t1"));
        assert!(scheduler.reschedule_task("t1").await.unwrap());
        assert_eq!(scheduler.scheduler_status().active_task_count, 1);
    }

    #[tokio::test]
    async fn disable_then_enable_restores_triggers() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing("ok"), 3);
        store.insert_task(interval_task("a"));
        store.insert_task(interval_task("b"));
        scheduler.initialize(true).await.unwrap();
        assert_eq!(scheduler.scheduler_status().active_task_count, 2);

        scheduler.disable_scheduler().await;
        let status = scheduler.scheduler_status();
        assert!(!status.enabled);
        assert_eq!(status.active_task_count, 0);
        assert!(store.task("a").unwrap().next_run_at.is_none());

        scheduler.enable_scheduler().await.unwrap();
        let status = scheduler.scheduler_status();
        assert!(status.enabled);
        assert_eq!(status.active_task_count, 2);
        assert!(store.task("a").unwrap().next_run_at.is_some());
    }

    #[tokio::test]
    async fn shutdown_clears_everything() {
        let (scheduler, store) = scheduler_with(ScriptedRunner::completing("ok"), 3);
        store.insert_task(interval_task("a"));
        scheduler.initialize(true).await.unwrap();

        scheduler.shutdown().await;
        let status = scheduler.scheduler_status();
        assert!(!status.initialized);
        assert!(!status.enabled);
        assert_eq!(status.active_task_count, 0);
    }

    #[tokio::test]
    async fn worker_pool_dispatch_round_trips_through_the_executor() {
        let store = Arc::new(MemoryTaskStore::new());
        let config = SchedulerConfig {
            max_concurrent_tasks: 3,
            dispatch: DispatchMode::WorkerPool,
            default_timeout_ms: 5_000,
            poll_interval_ms: 20,
        };
        let scheduler = TriggerScheduler::new(
            store.clone(),
            Arc::new(ScriptedRunner::completing("ok")),
            config,
        );
        let pool = TaskExecutor::new(
            Arc::new(ScriptedRunner::completing("pooled result")),
            ExecutorConfig::default(),
        );
        pool.start();
        scheduler.attach_executor(pool.clone());

        store.insert_task(interval_task("t1"));
        scheduler.execute_task("t1").await.unwrap();

        let executions = store.executions("t1");
        assert_eq!(executions[0].status, ExecutionStatus::Success);
        assert_eq!(
            executions[0].response_summary.as_deref(),
            Some("pooled result")
        );
        assert_eq!(executions[0].session_id.as_deref(), Some("session-test"));

        let stats = pool.get_stats();
        assert_eq!(stats.completed_tasks, 1);
        pool.stop().await;
    }
}
