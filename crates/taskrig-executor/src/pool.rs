//! The bounded worker pool.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use taskrig_core::types::safe_truncate;
use taskrig_core::{
    AgentEvent, AgentRequest, AgentRunner, ExecutorConfig, Result, TaskDefinition, TaskRigError,
    TaskState, TaskStatusRecord,
};

/// Completed-task summaries are truncated to this many characters.
const RESULT_SUMMARY_MAX: usize = 500;

/// Poll interval used while `stop()` waits for in-flight tasks.
const STOP_POLL: Duration = Duration::from_millis(25);

/// Aggregate pool counters.
///
/// Invariant: `running + queued + completed + failed + canceled` equals the
/// total number of accepted submissions.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutorStats {
    pub running_tasks: usize,
    pub queued_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub canceled_tasks: u64,
    pub uptime_ms: u64,
}

/// Fixed-capacity executor for agent tasks.
///
/// Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    runner: Arc<dyn AgentRunner>,
    config: ExecutorConfig,
    state: Mutex<PoolState>,
}

struct PoolState {
    accepting: bool,
    started_at: Option<Instant>,
    /// Cancel signal per running task id.
    running: HashMap<String, CancellationToken>,
    queue: crate::queue::SubmissionQueue,
    /// Every tracked task: pending, queued, running, or retained terminal.
    records: HashMap<String, TaskStatusRecord>,
    /// Terminal record ids, oldest first, for retention eviction.
    finished_order: VecDeque<String>,
    submitted_total: u64,
    completed: u64,
    failed: u64,
    canceled: u64,
    healthy: bool,
}

/// How one task run ended.
struct Outcome {
    state: TaskState,
    result_summary: Option<String>,
    session_id: Option<String>,
    error: Option<String>,
    timed_out: bool,
}

impl Outcome {
    fn completed(summary: Option<String>, session_id: Option<String>) -> Self {
        Self {
            state: TaskState::Completed,
            result_summary: summary,
            session_id,
            error: None,
            timed_out: false,
        }
    }

    fn failed(message: String, session_id: Option<String>) -> Self {
        Self {
            state: TaskState::Failed,
            result_summary: None,
            session_id,
            error: Some(message),
            timed_out: false,
        }
    }

    fn timed_out(timeout_ms: u64, session_id: Option<String>) -> Self {
        Self {
            state: TaskState::Failed,
            result_summary: None,
            session_id,
            error: Some(TaskRigError::Timeout(timeout_ms).to_string()),
            timed_out: true,
        }
    }

    fn canceled(session_id: Option<String>) -> Self {
        Self {
            state: TaskState::Canceled,
            result_summary: None,
            session_id,
            error: None,
            timed_out: false,
        }
    }
}

impl TaskExecutor {
    pub fn new(runner: Arc<dyn AgentRunner>, config: ExecutorConfig) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                runner,
                config,
                state: Mutex::new(PoolState {
                    accepting: false,
                    started_at: None,
                    running: HashMap::new(),
                    queue: crate::queue::SubmissionQueue::new(),
                    records: HashMap::new(),
                    finished_order: VecDeque::new(),
                    submitted_total: 0,
                    completed: 0,
                    failed: 0,
                    canceled: 0,
                    healthy: true,
                }),
            }),
        }
    }

    /// Begin accepting submissions. Idempotent.
    pub fn start(&self) {
        let mut state = self.inner.lock();
        if state.accepting {
            warn!("⚠️ Executor already started");
            return;
        }
        state.accepting = true;
        state.started_at = Some(Instant::now());
        info!(
            "🚀 Executor started (max_concurrent={})",
            self.inner.config.max_concurrent
        );
    }

    /// Submit a task. Returns its immediate state: `Running` when a slot was
    /// free, `Queued` otherwise. Never blocks on capacity.
    pub fn submit_task(&self, def: TaskDefinition) -> Result<TaskState> {
        def.validate()?;

        let dispatch;
        {
            let mut state = self.inner.lock();
            if !state.accepting {
                return Err(TaskRigError::Execution(
                    "executor is not accepting submissions".into(),
                ));
            }
            if state.records.contains_key(&def.id) {
                return Err(TaskRigError::Validation(format!(
                    "task id '{}' is already tracked",
                    def.id
                )));
            }

            state.submitted_total += 1;
            let mut record = TaskStatusRecord::pending(&def.id);

            if state.running.len() < self.inner.config.max_concurrent {
                record.state = TaskState::Running;
                record.started_at = Some(Utc::now());
                let token = CancellationToken::new();
                state.running.insert(def.id.clone(), token.clone());
                state.records.insert(def.id.clone(), record);
                info!("🏃 Task {} running ({} slots busy)", def.id, state.running.len());
                dispatch = Some((def, token));
            } else {
                record.state = TaskState::Queued;
                state.records.insert(def.id.clone(), record);
                state.queue.push(def);
                info!("📥 Task queued ({} waiting)", state.queue.len());
                dispatch = None;
            }
        }

        match dispatch {
            Some((def, token)) => {
                self.spawn_run(def, token);
                Ok(TaskState::Running)
            }
            None => Ok(TaskState::Queued),
        }
    }

    /// Cancel a queued or running task. Returns `false` when the id is
    /// unknown or already terminal.
    pub fn cancel_task(&self, id: &str) -> bool {
        let mut state = self.inner.lock();
        if state.queue.remove(id).is_some() {
            mark_finished(
                &mut state,
                self.inner.config.max_finished_records,
                id,
                Outcome::canceled(None),
            );
            info!("🚫 Queued task {} canceled", id);
            return true;
        }
        if let Some(token) = state.running.get(id) {
            token.cancel();
            info!("🚫 Running task {} signaled to cancel", id);
            return true;
        }
        false
    }

    /// Current status of a tracked task, `None` when unknown or evicted.
    pub fn get_task_status(&self, id: &str) -> Option<TaskStatusRecord> {
        self.inner.lock().records.get(id).cloned()
    }

    pub fn get_stats(&self) -> ExecutorStats {
        let state = self.inner.lock();
        ExecutorStats {
            running_tasks: state.running.len(),
            queued_tasks: state.queue.len(),
            completed_tasks: state.completed,
            failed_tasks: state.failed,
            canceled_tasks: state.canceled,
            uptime_ms: state
                .started_at
                .map(|t| t.elapsed().as_millis() as u64)
                .unwrap_or(0),
        }
    }

    /// `false` only when internal bookkeeping has gone wrong, never because
    /// of load or task failures.
    pub fn is_healthy(&self) -> bool {
        let state = self.inner.lock();
        let accounted = state.running.len() as u64
            + state.queue.len() as u64
            + state.completed
            + state.failed
            + state.canceled;
        state.healthy && accounted == state.submitted_total
    }

    /// Stop accepting work, cancel the queue, wait out the grace period,
    /// then cancel whatever is still running.
    pub async fn stop(&self) {
        let drained = {
            let mut state = self.inner.lock();
            if !state.accepting && state.running.is_empty() {
                return;
            }
            state.accepting = false;
            let drained = state.queue.drain_all();
            for def in &drained {
                mark_finished(
                    &mut state,
                    self.inner.config.max_finished_records,
                    &def.id,
                    Outcome::canceled(None),
                );
            }
            drained.len()
        };
        if drained > 0 {
            info!("🚫 Canceled {} queued task(s) on shutdown", drained);
        }

        let grace = Duration::from_millis(self.inner.config.shutdown_grace_ms);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.inner.lock().running.is_empty() {
                info!("🛑 Executor stopped");
                return;
            }
            tokio::time::sleep(STOP_POLL).await;
        }

        let stragglers: Vec<CancellationToken> =
            self.inner.lock().running.values().cloned().collect();
        if !stragglers.is_empty() {
            warn!(
                "⚠️ {} task(s) still running after grace period, canceling",
                stragglers.len()
            );
            for token in stragglers {
                token.cancel();
            }
        }

        // Cancellation is cooperative; give releases a bounded window.
        let hard_deadline = Instant::now() + grace.max(Duration::from_millis(500));
        while Instant::now() < hard_deadline {
            if self.inner.lock().running.is_empty() {
                break;
            }
            tokio::time::sleep(STOP_POLL).await;
        }
        info!("🛑 Executor stopped");
    }

    fn spawn_run(&self, def: TaskDefinition, cancel: CancellationToken) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut guard = SlotGuard {
                inner: inner.clone(),
                id: def.id.clone(),
                done: false,
            };
            let outcome = drive(&inner, &def, cancel).await;
            guard.finish(outcome);
        });
    }
}

impl ExecutorInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Free a slot exactly once: record the outcome, then hand the slot to
    /// the next queued task.
    fn release_slot(self: &Arc<Self>, id: &str, outcome: Outcome) {
        let next = {
            let mut state = self.lock();
            state.running.remove(id);
            mark_finished(&mut state, self.config.max_finished_records, id, outcome);

            let mut next = None;
            if state.accepting && state.running.len() < self.config.max_concurrent {
                if let Some(def) = state.queue.pop() {
                    let token = CancellationToken::new();
                    if let Some(record) = state.records.get_mut(&def.id) {
                        record.state = TaskState::Running;
                        record.started_at = Some(Utc::now());
                    }
                    state.running.insert(def.id.clone(), token.clone());
                    info!("🏃 Task {} dequeued to a free slot", def.id);
                    next = Some((def, token));
                }
            }
            next
        };

        if let Some((def, token)) = next {
            let executor = TaskExecutor {
                inner: self.clone(),
            };
            executor.spawn_run(def, token);
        }
    }
}

/// Records a terminal outcome and evicts the oldest retained records past
/// the cap. No-op when the record is already terminal.
fn mark_finished(state: &mut PoolState, max_records: usize, id: &str, outcome: Outcome) {
    match state.records.get_mut(id) {
        Some(record) if !record.state.is_terminal() => {
            record.state = outcome.state;
            record.finished_at = Some(Utc::now());
            if record.result_summary.is_none() {
                record.result_summary = outcome.result_summary;
            }
            if record.session_id.is_none() {
                record.session_id = outcome.session_id;
            }
            record.error = outcome.error;
            record.timed_out = outcome.timed_out;
        }
        Some(_) => return,
        None => {
            error!("❌ Finished task {} has no status record", id);
            state.healthy = false;
            return;
        }
    }

    match outcome.state {
        TaskState::Completed => state.completed += 1,
        TaskState::Failed => state.failed += 1,
        TaskState::Canceled => state.canceled += 1,
        _ => {
            error!("❌ Task {} finished in non-terminal state", id);
            state.healthy = false;
        }
    }

    state.finished_order.push_back(id.to_string());
    while state.finished_order.len() > max_records {
        if let Some(evicted) = state.finished_order.pop_front() {
            state.records.remove(&evicted);
        }
    }
}

/// Run one task to a terminal outcome: invoke the agent, consume its event
/// stream, and race it against the deadline and the cancel signal.
async fn drive(inner: &Arc<ExecutorInner>, def: &TaskDefinition, cancel: CancellationToken) -> Outcome {
    let request = AgentRequest::from_definition(def);
    let mut handle = match inner.runner.invoke(request).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!("⚠️ Task {} failed to start: {}", def.id, e);
            return Outcome::failed(e.to_string(), None);
        }
    };
    let interrupt = handle.interrupt_token();

    let deadline = Instant::now() + Duration::from_millis(def.timeout_ms);
    let mut text = String::new();
    let mut session_id: Option<String> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                interrupt.cancel();
                info!("🚫 Task {} canceled", def.id);
                return Outcome::canceled(session_id);
            }
            _ = tokio::time::sleep_until(deadline) => {
                interrupt.cancel();
                warn!("⏱️ Task {} timed out after {}ms", def.id, def.timeout_ms);
                return Outcome::timed_out(def.timeout_ms, session_id);
            }
            event = handle.next_event() => match event {
                Some(AgentEvent::Session { session_id: sid }) => {
                    // First session id wins.
                    session_id.get_or_insert(sid);
                }
                Some(AgentEvent::Text { content }) => text.push_str(&content),
                Some(AgentEvent::ToolUse { .. }) => {}
                Some(AgentEvent::Completed { .. }) => {
                    info!("✅ Task {} completed", def.id);
                    let summary =
                        (!text.is_empty()).then(|| safe_truncate(&text, RESULT_SUMMARY_MAX).to_string());
                    return Outcome::completed(summary, session_id);
                }
                Some(AgentEvent::Failed { message, .. }) => {
                    warn!("⚠️ Task {} failed: {}", def.id, message);
                    return Outcome::failed(message, session_id);
                }
                None => {
                    warn!("⚠️ Task {} event stream ended without a terminal event", def.id);
                    return Outcome::failed("agent stream ended unexpectedly".into(), session_id);
                }
            }
        }
    }
}

/// Releases the task's slot on drop if the run never reported an outcome.
struct SlotGuard {
    inner: Arc<ExecutorInner>,
    id: String,
    done: bool,
}

impl SlotGuard {
    fn finish(&mut self, outcome: Outcome) {
        self.done = true;
        self.inner.release_slot(&self.id, outcome);
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if !self.done {
            error!("❌ Task {} run aborted without an outcome", self.id);
            self.inner.lock().healthy = false;
            self.inner.release_slot(
                &self.id,
                Outcome::failed("task run aborted unexpectedly".into(), None),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskrig_core::AgentHandle;
    use taskrig_core::testing::ScriptedRunner;

    fn executor(runner: ScriptedRunner, max_concurrent: usize) -> TaskExecutor {
        let config = ExecutorConfig {
            max_concurrent,
            shutdown_grace_ms: 50,
            max_finished_records: 200,
        };
        let pool = TaskExecutor::new(Arc::new(runner), config);
        pool.start();
        pool
    }

    fn def(id: &str) -> TaskDefinition {
        TaskDefinition::new(id, "agent-a", "/tmp/project", &format!("message for {id}"))
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
    async fn capacity_bounds_running_and_queues_the_rest() {
        let pool = executor(ScriptedRunner::hanging(), 2);

        for i in 0..5 {
            pool.submit_task(def(&format!("t{i}"))).unwrap();
        }
        wait_until(|| pool.get_stats().running_tasks == 2).await;

        let stats = pool.get_stats();
        assert_eq!(stats.running_tasks, 2);
        assert_eq!(stats.queued_tasks, 3);
        assert!(pool.is_healthy());

        for i in 0..5 {
            pool.cancel_task(&format!("t{i}"));
        }
        wait_until(|| pool.get_stats().canceled_tasks == 5).await;
        assert!(pool.is_healthy());
    }

    #[tokio::test]
    async fn queue_drains_by_priority_then_fifo() {
        let runner = ScriptedRunner::completing("done").with_step_delay(Duration::from_millis(15));
        let pool = executor(runner, 1);

        pool.submit_task(def("first")).unwrap();
        pool.submit_task(def("low-early")).unwrap();
        let mut high = def("high-late");
        high.priority = 5;
        pool.submit_task(high).unwrap();
        pool.submit_task(def("low-late")).unwrap();

        wait_until(|| pool.get_stats().completed_tasks == 4).await;

        // Dequeue order shows up in the per-task start timestamps.
        let order: Vec<_> = ["first", "high-late", "low-early", "low-late"]
            .iter()
            .map(|id| pool.get_task_status(id).unwrap().started_at.unwrap())
            .collect();
        assert!(order[0] <= order[1]);
        assert!(order[1] <= order[2]);
        assert!(order[2] <= order[3]);
    }

    #[tokio::test]
    async fn timeout_fails_the_task_and_frees_its_slot() {
        let pool = executor(ScriptedRunner::hanging(), 1);

        let mut short = def("short-deadline");
        short.timeout_ms = 50;
        pool.submit_task(short).unwrap();
        pool.submit_task(def("waiting")).unwrap();

        wait_until(|| {
            pool.get_task_status("short-deadline")
                .map(|r| r.state.is_terminal())
                .unwrap_or(false)
        })
        .await;

        let record = pool.get_task_status("short-deadline").unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert!(record.timed_out);
        assert!(record.error.is_some());

        wait_until(|| {
            pool.get_task_status("waiting")
                .map(|r| r.state == TaskState::Running)
                .unwrap_or(false)
        })
        .await;
        pool.cancel_task("waiting");
        wait_until(|| pool.get_stats().canceled_tasks == 1).await;
    }

    #[tokio::test]
    async fn cancel_queued_task_never_runs_it() {
        let pool = executor(ScriptedRunner::hanging(), 1);

        pool.submit_task(def("runner")).unwrap();
        pool.submit_task(def("victim")).unwrap();
        wait_until(|| pool.get_stats().queued_tasks == 1).await;

        assert!(pool.cancel_task("victim"));
        let record = pool.get_task_status("victim").unwrap();
        assert_eq!(record.state, TaskState::Canceled);
        assert!(record.started_at.is_none());
        assert_eq!(pool.get_stats().queued_tasks, 0);

        pool.cancel_task("runner");
        wait_until(|| pool.get_stats().canceled_tasks == 2).await;
        assert!(pool.is_healthy());
    }

    #[tokio::test]
    async fn cancel_unknown_or_terminal_returns_false() {
        let pool = executor(ScriptedRunner::completing("ok"), 1);
        assert!(!pool.cancel_task("ghost"));

        pool.submit_task(def("done-soon")).unwrap();
        wait_until(|| pool.get_stats().completed_tasks == 1).await;
        assert!(!pool.cancel_task("done-soon"));
    }

    #[tokio::test]
    async fn failures_do_not_poison_the_pool() {
        let pool = executor(ScriptedRunner::failing("agent crashed"), 2);

        pool.submit_task(def("f1")).unwrap();
        pool.submit_task(def("f2")).unwrap();
        wait_until(|| pool.get_stats().failed_tasks == 2).await;

        let record = pool.get_task_status("f1").unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert!(!record.timed_out);
        assert_eq!(record.error.as_deref(), Some("agent crashed"));
        assert!(pool.is_healthy());
    }

    #[tokio::test]
    async fn invoke_failure_for_one_agent_leaves_others_untouched() {
        // Rejects invocations for one agent id, serves the rest normally.
        struct SelectiveRunner {
            inner: ScriptedRunner,
        }

        #[async_trait::async_trait]
        impl AgentRunner for SelectiveRunner {
            async fn invoke(&self, request: AgentRequest) -> Result<AgentHandle> {
                if request.agent_id == "agent-missing" {
                    return Err(TaskRigError::Execution(format!(
                        "unknown agent '{}'",
                        request.agent_id
                    )));
                }
                self.inner.invoke(request).await
            }
        }

        let runner = SelectiveRunner {
            inner: ScriptedRunner::completing("fine"),
        };
        let config = ExecutorConfig {
            max_concurrent: 2,
            shutdown_grace_ms: 50,
            max_finished_records: 200,
        };
        let pool = TaskExecutor::new(Arc::new(runner), config);
        pool.start();

        let broken = TaskDefinition::new("broken", "agent-missing", "/tmp/project", "hello");
        pool.submit_task(broken).unwrap();
        pool.submit_task(def("valid")).unwrap();

        wait_until(|| {
            let stats = pool.get_stats();
            stats.failed_tasks == 1 && stats.completed_tasks == 1
        })
        .await;

        let record = pool.get_task_status("broken").unwrap();
        assert_eq!(record.state, TaskState::Failed);
        assert!(!record.timed_out);
        assert!(record.error.as_deref().unwrap().contains("unknown agent"));

        let record = pool.get_task_status("valid").unwrap();
        assert_eq!(record.state, TaskState::Completed);
        assert_eq!(record.result_summary.as_deref(), Some("fine"));
        assert!(pool.is_healthy());
    }

    #[tokio::test]
    async fn completion_captures_summary_and_session() {
        let pool = executor(ScriptedRunner::completing(&"x".repeat(600)), 1);

        pool.submit_task(def("big-output")).unwrap();
        wait_until(|| pool.get_stats().completed_tasks == 1).await;

        let record = pool.get_task_status("big-output").unwrap();
        assert_eq!(record.state, TaskState::Completed);
        assert_eq!(record.session_id.as_deref(), Some("session-test"));
        assert_eq!(record.result_summary.as_ref().unwrap().len(), 500);
    }

    #[tokio::test]
    async fn duplicate_and_invalid_submissions_are_rejected() {
        let pool = executor(ScriptedRunner::hanging(), 1);

        pool.submit_task(def("dup")).unwrap();
        assert!(matches!(
            pool.submit_task(def("dup")),
            Err(TaskRigError::Validation(_))
        ));

        let mut bad = def("ok-id");
        bad.timeout_ms = 0;
        assert!(pool.submit_task(bad).is_err());

        // Rejections are not counted as submissions.
        assert!(pool.is_healthy());
        pool.cancel_task("dup");
    }

    #[tokio::test]
    async fn stop_cancels_queue_and_running_tasks() {
        let pool = executor(ScriptedRunner::hanging(), 1);

        pool.submit_task(def("in-flight")).unwrap();
        pool.submit_task(def("still-queued")).unwrap();
        wait_until(|| pool.get_stats().running_tasks == 1).await;

        pool.stop().await;

        assert_eq!(
            pool.get_task_status("still-queued").unwrap().state,
            TaskState::Canceled
        );
        wait_until(|| pool.get_stats().running_tasks == 0).await;
        assert!(pool.submit_task(def("late")).is_err());
        assert!(pool.is_healthy());
    }

    #[tokio::test]
    async fn retention_cap_evicts_oldest_terminal_records() {
        let config = ExecutorConfig {
            max_concurrent: 1,
            shutdown_grace_ms: 50,
            max_finished_records: 2,
        };
        let pool = TaskExecutor::new(Arc::new(ScriptedRunner::completing("ok")), config);
        pool.start();

        for i in 0..3u64 {
            pool.submit_task(def(&format!("r{i}"))).unwrap();
            wait_until(|| pool.get_stats().completed_tasks == i + 1).await;
        }

        assert!(pool.get_task_status("r0").is_none());
        assert!(pool.get_task_status("r1").is_some());
        assert!(pool.get_task_status("r2").is_some());
    }
}
