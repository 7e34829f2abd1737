//! Deterministic `AgentRunner` implementations for tests and dry runs.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentEvent, AgentHandle, AgentRequest, AgentRunner};
use crate::error::{Result, TaskRigError};

/// Replays a fixed event script for every invocation.
pub struct ScriptedRunner {
    script: Vec<AgentEvent>,
    step_delay: Duration,
    hang_after_script: bool,
    invoke_error: Option<String>,
    invocations: AtomicUsize,
    requests: Mutex<Vec<AgentRequest>>,
}

impl ScriptedRunner {
    /// Emits a session id, the given text, then a successful completion.
    pub fn completing(text: &str) -> Self {
        Self::with_script(vec![
            AgentEvent::Session {
                session_id: "session-test".into(),
            },
            AgentEvent::Text {
                content: text.to_string(),
            },
            AgentEvent::Completed {
                cost_usd: None,
                duration_ms: None,
            },
        ])
    }

    /// Emits a terminal failure immediately.
    pub fn failing(message: &str) -> Self {
        Self::with_script(vec![AgentEvent::Failed {
            message: message.to_string(),
            stack: Some("scripted stack".into()),
        }])
    }

    /// Never reaches a terminal event; responds to interrupt with a failure.
    pub fn hanging() -> Self {
        let mut runner = Self::with_script(vec![AgentEvent::Session {
            session_id: "session-hang".into(),
        }]);
        runner.hang_after_script = true;
        runner
    }

    /// `invoke` itself fails (e.g. unknown agent id).
    pub fn invoke_error(message: &str) -> Self {
        let mut runner = Self::with_script(Vec::new());
        runner.invoke_error = Some(message.to_string());
        runner
    }

    /// Replays an arbitrary script.
    pub fn with_script(script: Vec<AgentEvent>) -> Self {
        Self {
            script,
            step_delay: Duration::ZERO,
            hang_after_script: false,
            invoke_error: None,
            invocations: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Delay inserted before each scripted event.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// How many times `invoke` was called.
    pub fn invocation_count(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Requests observed so far.
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl AgentRunner for ScriptedRunner {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentHandle> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request);

        if let Some(message) = &self.invoke_error {
            return Err(TaskRigError::Execution(message.clone()));
        }

        let (tx, rx) = mpsc::channel(32);
        let token = CancellationToken::new();
        let script = self.script.clone();
        let delay = self.step_delay;
        let hang = self.hang_after_script;
        let signal = token.clone();

        tokio::spawn(async move {
            for event in script {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = signal.cancelled() => {
                            let _ = tx
                                .send(AgentEvent::Failed {
                                    message: "interrupted".into(),
                                    stack: None,
                                })
                                .await;
                            return;
                        }
                    }
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if hang {
                signal.cancelled().await;
                let _ = tx
                    .send(AgentEvent::Failed {
                        message: "interrupted".into(),
                        stack: None,
                    })
                    .await;
            }
        });

        Ok(AgentHandle::new(rx, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AgentRequest {
        AgentRequest {
            agent_id: "agent-a".into(),
            project_path: "/tmp/project".into(),
            message: "hello".into(),
            model_id: None,
            version_id: None,
            max_turns: None,
            permission_mode: None,
        }
    }

    #[tokio::test]
    async fn completing_script_reaches_terminal_event() {
        let runner = ScriptedRunner::completing("all good");
        let mut handle = runner.invoke(request()).await.unwrap();

        let mut saw_completed = false;
        while let Some(event) = handle.next_event().await {
            if matches!(event, AgentEvent::Completed { .. }) {
                saw_completed = true;
            }
        }
        assert!(saw_completed);
        assert_eq!(runner.invocation_count(), 1);
    }

    #[tokio::test]
    async fn hanging_script_fails_on_interrupt() {
        let runner = ScriptedRunner::hanging();
        let mut handle = runner.invoke(request()).await.unwrap();

        // Session event arrives, then the stream stays open.
        assert!(matches!(
            handle.next_event().await,
            Some(AgentEvent::Session { .. })
        ));

        handle.interrupt();
        assert!(matches!(
            handle.next_event().await,
            Some(AgentEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn invoke_error_surfaces() {
        let runner = ScriptedRunner::invoke_error("no such agent");
        assert!(runner.invoke(request()).await.is_err());
    }
}
