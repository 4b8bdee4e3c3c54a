//! Scheduler configuration: timing, history backend and worker pool sizing.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::WorkerPoolConfig;
use crate::core::RetryPolicy;

/// Backoff applied to failed history writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRetryConfig {
    /// Delay after the first failed write.
    pub base_ms: u64,
    /// Cap on the delay.
    pub max_ms: u64,
    /// Consecutive failed writes tolerated before scheduling pauses.
    pub max_retries: u32,
}

impl Default for HistoryRetryConfig {
    fn default() -> Self {
        Self {
            base_ms: 100,
            max_ms: 5_000,
            max_retries: 3,
        }
    }
}

impl HistoryRetryConfig {
    /// Equivalent retry policy.
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            Duration::from_millis(self.base_ms),
            Duration::from_millis(self.max_ms),
            self.max_retries,
        )
    }
}

/// History backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum HistoryBackendConfig {
    /// In-process history, optionally keeping only the newest records.
    InMemory {
        /// Maximum retained records.
        #[serde(default)]
        retention: Option<usize>,
    },
    /// JSON-lines file.
    File {
        /// File location.
        path: PathBuf,
    },
}

impl Default for HistoryBackendConfig {
    fn default() -> Self {
        Self::InMemory { retention: None }
    }
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Period of the scheduling tick.
    pub tick_interval_ms: u64,
    /// Skip missed fires once a job lags more than this many ticks.
    pub max_catch_up_ticks: Option<u32>,
    /// How long shutdown waits for in-flight runs.
    pub shutdown_grace_ms: u64,
    /// Retry delay after the worker pool rejects a dispatch.
    pub capacity_retry_delay_ms: u64,
    /// Backoff for failed history writes.
    pub history_retry: HistoryRetryConfig,
    /// Worker pool sizing.
    pub pool: WorkerPoolConfig,
    /// History backend.
    pub history: HistoryBackendConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            max_catch_up_ticks: None,
            shutdown_grace_ms: 30_000,
            capacity_retry_delay_ms: 1_000,
            history_retry: HistoryRetryConfig::default(),
            pool: WorkerPoolConfig::default(),
            history: HistoryBackendConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Tick period.
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Shutdown grace period.
    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Delay before retrying a rejected dispatch.
    pub const fn capacity_retry_delay(&self) -> Duration {
        Duration::from_millis(self.capacity_retry_delay_ms)
    }

    /// Validate all values.
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than 0".into());
        }
        if self.capacity_retry_delay_ms == 0 {
            return Err("capacity_retry_delay_ms must be greater than 0".into());
        }
        if self.max_catch_up_ticks == Some(0) {
            return Err("max_catch_up_ticks must be greater than 0 when set".into());
        }
        if self.history_retry.max_ms < self.history_retry.base_ms {
            return Err("history_retry.max_ms must not be smaller than base_ms".into());
        }
        if let HistoryBackendConfig::InMemory { retention: Some(0) } = self.history {
            return Err("history retention must be greater than 0 when set".into());
        }
        if let HistoryBackendConfig::File { path } = &self.history {
            if path.as_os_str().is_empty() {
                return Err("history file path must not be empty".into());
            }
        }
        self.pool.validate().map_err(|e| format!("pool invalid: {e}"))
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `SCHEDULER_*` environment variables, after
    /// loading a `.env` file if present.
    ///
    /// Recognised variables: `SCHEDULER_TICK_INTERVAL_MS`,
    /// `SCHEDULER_MAX_CATCH_UP_TICKS`, `SCHEDULER_SHUTDOWN_GRACE_MS`,
    /// `SCHEDULER_CAPACITY_RETRY_DELAY_MS`, `SCHEDULER_WORKER_COUNT`,
    /// `SCHEDULER_MAX_QUEUE_DEPTH`, `SCHEDULER_BACKPRESSURE`,
    /// `SCHEDULER_HISTORY_PATH` and `SCHEDULER_HISTORY_RETENTION`.
    pub fn from_env() -> Result<Self, String> {
        // A missing .env file is fine.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SchedulerConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SCHEDULER_TICK_INTERVAL_MS") {
            cfg.tick_interval_ms = parse_var("SCHEDULER_TICK_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("SCHEDULER_MAX_CATCH_UP_TICKS") {
            cfg.max_catch_up_ticks = Some(parse_var("SCHEDULER_MAX_CATCH_UP_TICKS", &v)?);
        }
        if let Some(v) = get("SCHEDULER_SHUTDOWN_GRACE_MS") {
            cfg.shutdown_grace_ms = parse_var("SCHEDULER_SHUTDOWN_GRACE_MS", &v)?;
        }
        if let Some(v) = get("SCHEDULER_CAPACITY_RETRY_DELAY_MS") {
            cfg.capacity_retry_delay_ms = parse_var("SCHEDULER_CAPACITY_RETRY_DELAY_MS", &v)?;
        }
        if let Some(v) = get("SCHEDULER_WORKER_COUNT") {
            cfg.pool.worker_count = parse_var("SCHEDULER_WORKER_COUNT", &v)?;
        }
        if let Some(v) = get("SCHEDULER_MAX_QUEUE_DEPTH") {
            cfg.pool.max_queue_depth = parse_var("SCHEDULER_MAX_QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = get("SCHEDULER_BACKPRESSURE") {
            cfg.pool.backpressure = parse_var("SCHEDULER_BACKPRESSURE", &v)?;
        }
        if let Some(path) = get("SCHEDULER_HISTORY_PATH") {
            cfg.history = HistoryBackendConfig::File { path: path.into() };
        } else if let Some(v) = get("SCHEDULER_HISTORY_RETENTION") {
            cfg.history = HistoryBackendConfig::InMemory {
                retention: Some(parse_var("SCHEDULER_HISTORY_RETENTION", &v)?),
            };
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| format!("{key}={value:?} is invalid: {e}"))
}
