//! Worker pool configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::util::serde::duration_ms;

fn default_worker_count() -> usize {
    num_cpus::get().max(1)
}

const fn default_max_queue_depth() -> usize {
    256
}

const fn default_thread_stack_size() -> usize {
    2 * 1024 * 1024
}

const fn default_join_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Sizing and behaviour of the worker thread pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of worker threads. Defaults to the number of CPUs.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Tasks that may wait for a worker before submissions are rejected.
    #[serde(default = "default_max_queue_depth")]
    pub max_queue_depth: usize,
    /// Block submitters on a full queue instead of rejecting them.
    /// The scheduler's own dispatch never blocks.
    #[serde(default)]
    pub backpressure: bool,
    /// Stack size of each worker thread in bytes.
    #[serde(default = "default_thread_stack_size")]
    pub thread_stack_size: usize,
    /// How long shutdown waits for each worker to exit.
    #[serde(
        default = "default_join_timeout",
        with = "duration_ms",
        rename = "join_timeout_ms"
    )]
    pub join_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_queue_depth: default_max_queue_depth(),
            backpressure: false,
            thread_stack_size: default_thread_stack_size(),
            join_timeout: default_join_timeout(),
        }
    }
}

impl WorkerPoolConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of worker threads.
    #[must_use]
    pub const fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the queue depth.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Enable or disable backpressure.
    #[must_use]
    pub const fn with_backpressure(mut self, enabled: bool) -> Self {
        self.backpressure = enabled;
        self
    }

    /// Set the worker stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, bytes: usize) -> Self {
        self.thread_stack_size = bytes;
        self
    }

    /// Set the per-worker join timeout.
    #[must_use]
    pub const fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}
