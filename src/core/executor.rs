//! Task execution trait for the worker pool.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::util::serde::TaskId;

/// Bookkeeping attached to every task submitted to a [`crate::core::WorkerPool`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Pool-assigned identifier.
    pub id: TaskId,
    /// Free-form label used in logs (the scheduler passes the job id).
    pub label: String,
    /// Submission time in milliseconds since the Unix epoch.
    pub submitted_at_ms: u128,
}

/// Executes payloads on a worker thread.
///
/// Results carry no serialization bound, so executors may hand back channels
/// or other live handles.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_scheduler::core::{TaskMetadata, WorkerExecutor};
///
/// #[derive(Clone)]
/// struct Checksum;
///
/// #[async_trait]
/// impl WorkerExecutor<Vec<u8>, u32> for Checksum {
///     async fn execute(&self, payload: Vec<u8>, _meta: TaskMetadata) -> u32 {
///         payload.iter().map(|b| u32::from(*b)).sum()
///     }
/// }
/// ```
#[async_trait]
pub trait WorkerExecutor<P, R>: Send + Sync + Clone + 'static
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Execute a payload and return its result.
    ///
    /// Called on a dedicated worker thread that drives its own single-threaded
    /// tokio runtime, so blocking here stalls only that worker.
    async fn execute(&self, payload: P, meta: TaskMetadata) -> R;
}
