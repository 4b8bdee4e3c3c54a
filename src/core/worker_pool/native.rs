//! `WorkerPool` on dedicated OS threads.
//!
//! Each worker owns a single-threaded tokio runtime and blocks on the shared
//! crossbeam queue between tasks. Dropping the sender on shutdown wakes idle
//! workers so they exit without polling.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::WorkerPoolConfig;
use crate::core::executor::WorkerExecutor;
use crate::core::TaskMetadata;
use crate::util::clock::now_ms;
use crate::util::serde::TaskId;

use super::{PoolCounters, PoolError, PoolStats, Reply, TaskHandle, WorkerTask};

/// Bounded thread pool executing payloads through a [`WorkerExecutor`].
pub struct WorkerPool<P, R, E> {
    /// Pool configuration.
    config: WorkerPoolConfig,

    /// Task sender; `None` once shut down.
    task_tx: Mutex<Option<Sender<WorkerTask<P, R>>>>,

    /// Statistics counters (lock-free atomics).
    counters: Arc<PoolCounters>,

    /// Shutdown flag.
    shutdown: Arc<AtomicBool>,

    /// Worker thread handles.
    workers: Mutex<Vec<JoinHandle<()>>>,

    /// Task ID counter.
    task_id_counter: AtomicU64,

    _executor: std::marker::PhantomData<E>,
}

impl<P, R, E> WorkerPool<P, R, E>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    /// Create a pool and spawn `config.worker_count` worker threads.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration is invalid, or
    /// `PoolError::Internal` if a worker thread cannot be spawned.
    pub fn new(config: WorkerPoolConfig, executor: E) -> Result<Self, PoolError> {
        config.validate().map_err(PoolError::InvalidConfig)?;

        let (task_tx, task_rx) = bounded::<WorkerTask<P, R>>(config.max_queue_depth);
        let counters = Arc::new(PoolCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_count);
        for worker_id in 0..config.worker_count {
            let spawned = spawn_worker(
                worker_id,
                task_rx.clone(),
                Arc::clone(&counters),
                Arc::clone(&shutdown),
                executor.clone(),
                config.thread_stack_size,
            );
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Release);
                    drop(task_tx);
                    return Err(PoolError::Internal(format!(
                        "failed to spawn worker {worker_id}: {e}"
                    )));
                }
            }
        }

        info!(
            worker_count = config.worker_count,
            max_queue_depth = config.max_queue_depth,
            backpressure = config.backpressure,
            "WorkerPool initialized"
        );

        Ok(Self {
            config,
            task_tx: Mutex::new(Some(task_tx)),
            counters,
            shutdown,
            workers: Mutex::new(workers),
            task_id_counter: AtomicU64::new(0),
            _executor: std::marker::PhantomData,
        })
    }

    /// Submit a task and get a handle resolving to its result.
    ///
    /// With backpressure enabled a full queue blocks the calling thread until
    /// a slot frees up; otherwise it fails fast.
    ///
    /// # Errors
    ///
    /// - `PoolError::QueueFull` if the queue is full and backpressure is off
    /// - `PoolError::PoolShutdown` if the pool has been shut down
    pub fn submit(&self, payload: P, label: impl Into<String>) -> Result<TaskHandle<R>, PoolError> {
        let (tx, rx) = oneshot::channel();
        let id = self.enqueue(payload, label.into(), oneshot_reply(tx), self.config.backpressure)?;
        Ok(TaskHandle::new(id, rx))
    }

    /// Async variant of [`WorkerPool::submit`]; waiting for a free slot
    /// happens on tokio's blocking pool instead of the caller's thread.
    ///
    /// # Errors
    ///
    /// Same as [`WorkerPool::submit`].
    pub async fn submit_async(
        &self,
        payload: P,
        label: impl Into<String>,
    ) -> Result<TaskHandle<R>, PoolError> {
        let (tx, rx) = oneshot::channel();
        let task = self.make_task(payload, label.into(), oneshot_reply(tx));
        let id = task.meta.id;
        let sender = self.sender()?;

        match sender.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) if self.config.backpressure => {
                debug!(task_id = id, "Worker pool queue full, waiting for a slot");
                tokio::task::spawn_blocking(move || sender.send(task))
                    .await
                    .map_err(|e| PoolError::Internal(e.to_string()))?
                    .map_err(|_| PoolError::PoolShutdown)?;
            }
            Err(e) => return Err(self.rejected(id, &e)),
        }
        self.accepted(id);
        Ok(TaskHandle::new(id, rx))
    }

    /// Submit a task whose outcome is handed to `on_complete` on the worker
    /// thread. Never blocks: a full queue is rejected regardless of the
    /// backpressure setting.
    ///
    /// `on_complete` also receives `Err(PoolError::PoolShutdown)` for tasks
    /// still queued when the pool shuts down.
    ///
    /// # Errors
    ///
    /// - `PoolError::QueueFull` if the queue is full
    /// - `PoolError::PoolShutdown` if the pool has been shut down
    pub fn submit_with<F>(
        &self,
        payload: P,
        label: impl Into<String>,
        on_complete: F,
    ) -> Result<TaskId, PoolError>
    where
        F: FnOnce(Result<R, PoolError>) + Send + 'static,
    {
        self.enqueue(payload, label.into(), Box::new(on_complete), false)
    }

    fn make_task(&self, payload: P, label: String, reply: Reply<R>) -> WorkerTask<P, R> {
        let id = self.task_id_counter.fetch_add(1, Ordering::Relaxed);
        WorkerTask {
            payload,
            meta: TaskMetadata {
                id,
                label,
                submitted_at_ms: now_ms(),
            },
            reply,
        }
    }

    fn sender(&self) -> Result<Sender<WorkerTask<P, R>>, PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::PoolShutdown);
        }
        self.task_tx.lock().clone().ok_or(PoolError::PoolShutdown)
    }

    fn enqueue(
        &self,
        payload: P,
        label: String,
        reply: Reply<R>,
        block_when_full: bool,
    ) -> Result<TaskId, PoolError> {
        let sender = self.sender()?;
        let task = self.make_task(payload, label, reply);
        let id = task.meta.id;

        match sender.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) if block_when_full => {
                debug!(task_id = id, "Worker pool queue full, blocking submitter");
                sender.send(task).map_err(|_| PoolError::PoolShutdown)?;
            }
            Err(e) => return Err(self.rejected(id, &e)),
        }
        self.accepted(id);
        Ok(id)
    }

    fn accepted(&self, id: TaskId) {
        self.counters.submitted_tasks.fetch_add(1, Ordering::Relaxed);
        self.counters.queued_tasks.fetch_add(1, Ordering::Relaxed);
        debug!(task_id = id, "Task submitted to worker pool");
    }

    fn rejected<T>(&self, id: TaskId, err: &TrySendError<T>) -> PoolError {
        match err {
            TrySendError::Full(_) => {
                self.counters.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = id, "Worker pool queue is full");
                PoolError::QueueFull
            }
            TrySendError::Disconnected(_) => PoolError::PoolShutdown,
        }
    }

    /// Get current pool statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.config.worker_count)
    }

    /// Configuration the pool was built with.
    pub const fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Whether [`WorkerPool::shutdown`] has been called.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting work and join the workers.
    ///
    /// Running tasks finish; tasks still queued resolve to
    /// `PoolError::PoolShutdown`. Each worker gets `config.join_timeout` to
    /// exit before it is detached.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Shutting down worker pool");
        *self.task_tx.lock() = None;

        let mut workers = self.workers.lock();
        let worker_count = workers.len();

        for (idx, worker) in workers.drain(..).enumerate() {
            let (tx, rx) = std::sync::mpsc::channel();
            let joiner = thread::spawn(move || {
                let result = worker.join();
                let _ = tx.send(result.is_ok());
            });

            match rx.recv_timeout(self.config.join_timeout) {
                Ok(true) => debug!(worker_id = idx, "Worker joined"),
                Ok(false) => warn!(worker_id = idx, "Worker thread panicked"),
                Err(_) => {
                    warn!(worker_id = idx, "Worker did not exit within timeout, detaching");
                    continue;
                }
            }
            let _ = joiner.join();
        }

        info!(worker_count = worker_count, "Worker pool shut down");
    }
}

impl<P, R, E> Drop for WorkerPool<P, R, E> {
    fn drop(&mut self) {
        // Workers are detached, not joined; explicit shutdown() joins them.
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            *self.task_tx.lock() = None;
            debug!("WorkerPool dropped without explicit shutdown, workers detached");
        }
    }
}

fn oneshot_reply<R: Send + 'static>(tx: oneshot::Sender<Result<R, PoolError>>) -> Reply<R> {
    Box::new(move |result| {
        let _ = tx.send(result);
    })
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

fn deliver<R>(worker_id: usize, task_id: TaskId, reply: Reply<R>, result: Result<R, PoolError>) {
    if std::panic::catch_unwind(AssertUnwindSafe(move || reply(result))).is_err() {
        error!(worker_id = worker_id, task_id = task_id, "Completion callback panicked");
    }
}

fn spawn_worker<P, R, E>(
    worker_id: usize,
    task_rx: Receiver<WorkerTask<P, R>>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
    executor: E,
    stack_size: usize,
) -> std::io::Result<JoinHandle<()>>
where
    P: Send + 'static,
    R: Send + 'static,
    E: WorkerExecutor<P, R>,
{
    thread::Builder::new()
        .name(format!("sched-worker-{worker_id}"))
        .stack_size(stack_size)
        .spawn(move || {
            debug!(worker_id = worker_id, "Worker thread started");

            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!(worker_id = worker_id, error = %e, "Failed to create worker runtime");
                    return;
                }
            };

            // recv() fails once every sender is gone and the queue is drained.
            while let Ok(task) = task_rx.recv() {
                counters.queued_tasks.fetch_sub(1, Ordering::Relaxed);
                let WorkerTask { payload, meta, reply } = task;
                let task_id = meta.id;

                if shutdown.load(Ordering::Acquire) {
                    debug!(worker_id = worker_id, task_id = task_id, "Discarding task after shutdown");
                    deliver(worker_id, task_id, reply, Err(PoolError::PoolShutdown));
                    continue;
                }

                counters.active_tasks.fetch_add(1, Ordering::Relaxed);
                debug!(worker_id = worker_id, task_id = task_id, label = %meta.label, "Worker executing task");

                let outcome = rt.block_on(
                    AssertUnwindSafe(async { executor.execute(payload, meta).await }).catch_unwind(),
                );
                counters.active_tasks.fetch_sub(1, Ordering::Relaxed);

                let result = match outcome {
                    Ok(value) => {
                        counters.completed_tasks.fetch_add(1, Ordering::Relaxed);
                        Ok(value)
                    }
                    Err(panic) => {
                        counters.panicked_tasks.fetch_add(1, Ordering::Relaxed);
                        let message = panic_message(panic.as_ref());
                        warn!(worker_id = worker_id, task_id = task_id, panic = %message, "Task panicked");
                        Err(PoolError::TaskPanicked(message))
                    }
                };
                deliver(worker_id, task_id, reply, result);
            }

            debug!(worker_id = worker_id, "Worker thread exiting");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Clone)]
    struct EchoExecutor {
        execution_count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerExecutor<String, String> for EchoExecutor {
        async fn execute(&self, payload: String, _meta: TaskMetadata) -> String {
            self.execution_count.fetch_add(1, Ordering::Relaxed);
            if payload == "panic" {
                panic!("asked to panic");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            format!("Result: {payload}")
        }
    }

    fn pool(workers: usize, depth: usize) -> (WorkerPool<String, String, EchoExecutor>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let executor = EchoExecutor {
            execution_count: Arc::clone(&count),
        };
        let config = WorkerPoolConfig::new()
            .with_worker_count(workers)
            .with_max_queue_depth(depth);
        (WorkerPool::new(config, executor).unwrap(), count)
    }

    #[tokio::test]
    async fn test_submit_and_await() {
        let (pool, count) = pool(2, 10);
        let result = pool.submit("hello".to_string(), "test").unwrap().await.unwrap();
        assert_eq!(result, "Result: hello");
        assert_eq!(count.load(Ordering::Relaxed), 1);
        let stats = pool.stats();
        assert_eq!(stats.submitted_tasks, 1);
        assert_eq!(stats.completed_tasks, 1);
        pool.shutdown();
    }

    #[tokio::test]
    async fn test_panic_is_reported_and_worker_survives() {
        let (pool, _) = pool(1, 10);
        let err = pool.submit("panic".to_string(), "test").unwrap().await.unwrap_err();
        assert!(matches!(err, PoolError::TaskPanicked(msg) if msg.contains("asked to panic")));
        let ok = pool.submit("after".to_string(), "test").unwrap().await.unwrap();
        assert_eq!(ok, "Result: after");
        assert_eq!(pool.stats().panicked_tasks, 1);
        pool.shutdown();
    }

    #[test]
    fn test_submit_with_callback() {
        let (pool, _) = pool(1, 4);
        let (tx, rx) = std::sync::mpsc::channel();
        pool.submit_with("cb".to_string(), "test", move |r| {
            let _ = tx.send(r);
        })
        .unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap(), "Result: cb");
        pool.shutdown();
    }

    #[test]
    fn test_submit_after_shutdown_fails() {
        let (pool, _) = pool(1, 4);
        pool.shutdown();
        assert!(pool.is_shutdown());
        assert!(matches!(
            pool.submit("late".to_string(), "test"),
            Err(PoolError::PoolShutdown)
        ));
    }
}
