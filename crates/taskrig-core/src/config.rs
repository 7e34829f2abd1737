//! TaskRig configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, TaskRigError};

/// Root configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl EngineConfig {
    /// Load config from the default path (~/.taskrig/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TaskRigError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TaskRigError::Config(format!("Failed to parse config: {e}")))?;
        debug!("📋 Config loaded from {}", path.display());
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TaskRigError::Config(format!("Failed to create config dir: {e}")))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| TaskRigError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)
            .map_err(|e| TaskRigError::Config(format!("Failed to write config: {e}")))?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the TaskRig home directory (~/.taskrig).
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".taskrig")
    }
}

/// Trigger scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Global cap on concurrently running scheduled executions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Where a firing runs: inline (legacy direct path) or via the worker pool.
    #[serde(default)]
    pub dispatch: DispatchMode,
    /// Deadline applied to firings routed through the worker pool.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// How often a pooled firing's status is polled.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_max_concurrent() -> usize { 3 }
fn default_timeout_ms() -> u64 { 300_000 }
fn default_poll_interval_ms() -> u64 { 250 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            dispatch: DispatchMode::default(),
            default_timeout_ms: default_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// How scheduled firings execute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Run the agent invocation inside the scheduler (legacy direct path).
    #[default]
    Inline,
    /// Convert the firing to a `TaskDefinition` and submit it to the pool.
    WorkerPool,
}

/// Bounded executor (worker pool) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Maximum number of tasks running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// How long `stop()` waits for in-flight tasks before cancelling them.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Terminal status records retained for polling; oldest evicted first.
    #[serde(default = "default_max_finished_records")]
    pub max_finished_records: usize,
}

fn default_shutdown_grace_ms() -> u64 { 10_000 }
fn default_max_finished_records() -> usize { 200 }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_finished_records: default_max_finished_records(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 3);
        assert_eq!(config.scheduler.dispatch, DispatchMode::Inline);
        assert_eq!(config.executor.max_concurrent, 3);
        assert_eq!(config.executor.max_finished_records, 200);
    }

    #[test]
    fn toml_round_trip() {
        let mut config = EngineConfig::default();
        config.scheduler.max_concurrent_tasks = 8;
        config.scheduler.dispatch = DispatchMode::WorkerPool;
        config.executor.shutdown_grace_ms = 500;

        let text = toml::to_string_pretty(&config).unwrap();
        let restored: EngineConfig = toml::from_str(&text).unwrap();
        assert_eq!(restored.scheduler.max_concurrent_tasks, 8);
        assert_eq!(restored.scheduler.dispatch, DispatchMode::WorkerPool);
        assert_eq!(restored.executor.shutdown_grace_ms, 500);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: EngineConfig =
            toml::from_str("[scheduler]\nmax_concurrent_tasks = 1\n").unwrap();
        assert_eq!(config.scheduler.max_concurrent_tasks, 1);
        assert_eq!(config.scheduler.default_timeout_ms, 300_000);
    }
}
