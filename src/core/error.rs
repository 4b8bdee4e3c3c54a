//! Error types for scheduler operations.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by scheduler components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// Invalid trigger expression or job definition, rejected at registration.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The worker pool could not accept another task.
    #[error("capacity exceeded: {0}")]
    Capacity(String),
    /// A collaborator (history store, clock) failed.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
    /// No job is registered under this id.
    #[error("job not found: {0}")]
    JobNotFound(String),
    /// The scheduler has been shut down.
    #[error("scheduler is shut down")]
    Shutdown,
}

/// How a failed action should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worth retrying (timeouts, unavailable dependencies).
    Transient,
    /// Retrying cannot help (bad input, bugs).
    Permanent,
}

/// Failure reported by a job action. Never escapes a run; it is converted into
/// the run's recorded state.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{class:?} action error: {message}")]
pub struct ActionError {
    /// Classification consulted by the retry policy.
    pub class: ErrorClass,
    /// Human-readable detail.
    pub message: String,
}

impl ActionError {
    /// A failure that may succeed on retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
        }
    }

    /// A failure that must not be retried.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            message: message.into(),
        }
    }

    /// Whether the retry policy may schedule another attempt.
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class, ErrorClass::Transient)
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
