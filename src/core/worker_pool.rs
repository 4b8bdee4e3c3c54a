//! Bounded worker pool on dedicated OS threads.
//!
//! `WorkerPool` runs submitted payloads through a [`WorkerExecutor`] on a
//! fixed set of worker threads, each driving its own single-threaded tokio
//! runtime, so action code never stalls the scheduler's control loop.
//!
//! # Key Features
//!
//! - **Bounded intake**: a full queue rejects with [`PoolError::QueueFull`]
//!   unless backpressure is enabled
//! - **Completion delivery**: await a [`TaskHandle`] or register a callback
//!   with [`WorkerPool::submit_with`]
//! - **Panic isolation**: a panicking task resolves to
//!   [`PoolError::TaskPanicked`] and the worker keeps serving
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_scheduler::config::WorkerPoolConfig;
//! use prometheus_scheduler::core::WorkerPool;
//!
//! let pool = WorkerPool::new(
//!     WorkerPoolConfig::new().with_worker_count(4).with_max_queue_depth(64),
//!     my_executor,
//! )?;
//! let handle = pool.submit(job, "resize")?;
//! let result = handle.await?;
//! ```

mod native;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::core::{SchedulerError, TaskMetadata};
use crate::util::serde::TaskId;

pub use native::WorkerPool;

/// Errors that can occur when using a `WorkerPool`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The task queue is full; no more tasks can be accepted.
    QueueFull,

    /// The pool has been shut down.
    PoolShutdown,

    /// Configuration validation failed.
    InvalidConfig(String),

    /// The task panicked while executing.
    TaskPanicked(String),

    /// Internal error (thread spawn failure, runtime construction, etc.).
    Internal(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "task queue is full"),
            Self::PoolShutdown => write!(f, "pool has been shut down"),
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::TaskPanicked(msg) => write!(f, "task panicked: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<PoolError> for SchedulerError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::QueueFull => Self::Capacity(err.to_string()),
            PoolError::PoolShutdown => Self::Shutdown,
            PoolError::InvalidConfig(msg) => Self::Configuration(msg),
            PoolError::TaskPanicked(_) | PoolError::Internal(_) => {
                Self::Infrastructure(err.to_string())
            }
        }
    }
}

/// Statistics about pool utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,

    /// Currently executing tasks.
    pub active_tasks: u64,

    /// Tasks waiting in the queue.
    pub queued_tasks: u64,

    /// Total tasks accepted.
    pub submitted_tasks: u64,

    /// Total tasks that ran to completion.
    pub completed_tasks: u64,

    /// Total tasks that panicked.
    pub panicked_tasks: u64,

    /// Total submissions rejected because the queue was full.
    pub rejected_tasks: u64,
}

/// Internal counters for pool statistics (thread-safe).
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub active_tasks: AtomicU64,
    pub queued_tasks: AtomicU64,
    pub submitted_tasks: AtomicU64,
    pub completed_tasks: AtomicU64,
    pub panicked_tasks: AtomicU64,
    pub rejected_tasks: AtomicU64,
}

impl PoolCounters {
    /// Get a snapshot of current statistics.
    pub fn snapshot(&self, worker_count: usize) -> PoolStats {
        PoolStats {
            worker_count,
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            submitted_tasks: self.submitted_tasks.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            panicked_tasks: self.panicked_tasks.load(Ordering::Relaxed),
            rejected_tasks: self.rejected_tasks.load(Ordering::Relaxed),
        }
    }
}

/// Completion callback invoked exactly once on the worker thread.
pub(crate) type Reply<R> = Box<dyn FnOnce(Result<R, PoolError>) + Send + 'static>;

/// A task submitted to the worker pool.
pub(crate) struct WorkerTask<P, R> {
    /// The task payload to execute.
    pub payload: P,
    /// Task metadata.
    pub meta: TaskMetadata,
    /// Where the outcome goes.
    pub reply: Reply<R>,
}

/// Future resolving to the result of a submitted task.
///
/// Resolves to `Err(PoolError::PoolShutdown)` if the pool stops before the
/// task runs.
#[derive(Debug)]
pub struct TaskHandle<R> {
    id: TaskId,
    rx: oneshot::Receiver<Result<R, PoolError>>,
}

impl<R> TaskHandle<R> {
    pub(crate) const fn new(id: TaskId, rx: oneshot::Receiver<Result<R, PoolError>>) -> Self {
        Self { id, rx }
    }

    /// Identifier of the submitted task.
    pub const fn id(&self) -> TaskId {
        self.id
    }
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, PoolError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::PoolShutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}
