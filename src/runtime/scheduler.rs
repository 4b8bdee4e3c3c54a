//! Async driver and public handle for [`SchedulerCore`].
//!
//! One tokio task owns the core and multiplexes three inputs: the tick timer
//! from the [`Clock`], commands from [`Scheduler`] handles, and run events
//! from the worker pool. Every state change happens on that task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::SchedulerConfig;
use crate::core::{
    HistoryCursor, HistoryQuery, HistoryStore, HistorySummary, JobDefinition, JobStatus, PoolStats,
    RunEvents, SchedulerCore, SchedulerError, TickReport,
};
use crate::util::clock::Clock;

/// Outcome of [`Scheduler::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Runs that finished during the grace period.
    pub completed: usize,
    /// Runs still in flight when the grace period ended.
    pub abandoned: usize,
    /// History records that could not be written.
    pub unwritten_history: usize,
}

enum Command {
    Register(JobDefinition, oneshot::Sender<Result<(), SchedulerError>>),
    Unregister(String, oneshot::Sender<bool>),
    SetEnabled(String, bool, oneshot::Sender<Result<(), SchedulerError>>),
    Trigger(String, oneshot::Sender<Result<bool, SchedulerError>>),
    Status(String, oneshot::Sender<Option<JobStatus>>),
    Jobs(oneshot::Sender<Vec<String>>),
    PoolStats(oneshot::Sender<PoolStats>),
    Tick(oneshot::Sender<TickReport>),
    Shutdown(oneshot::Sender<ShutdownReport>),
}

/// Handle to a running scheduler.
///
/// Dropping the last handle without calling [`Scheduler::shutdown`] still
/// drains the scheduler in the background.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use std::time::Duration;
/// use prometheus_scheduler::config::SchedulerConfig;
/// use prometheus_scheduler::core::{action_fn, JobDefinition, Trigger};
/// use prometheus_scheduler::infra::InMemoryHistoryStore;
/// use prometheus_scheduler::runtime::Scheduler;
/// use prometheus_scheduler::util::SystemClock;
///
/// let scheduler = Scheduler::start(
///     &SchedulerConfig::default(),
///     Arc::new(SystemClock),
///     Arc::new(InMemoryHistoryStore::new()),
/// )?;
/// let job = JobDefinition::builder(
///     "heartbeat",
///     Trigger::interval(Duration::from_secs(30))?,
///     action_fn(|_ctx| async { Ok(None) }),
/// )
/// .build()?;
/// scheduler.register(job).await?;
/// // ...
/// let report = scheduler.shutdown().await?;
/// ```
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    history: Arc<dyn HistoryStore>,
    driver: Mutex<Option<JoinHandle<ShutdownReport>>>,
}

impl Scheduler {
    /// Start a scheduler on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Configuration` for an invalid configuration
    /// - `SchedulerError::Infrastructure` outside a tokio runtime or if the
    ///   worker pool cannot start
    pub fn start(
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self, SchedulerError> {
        let handle = Handle::try_current()
            .map_err(|e| SchedulerError::Infrastructure(format!("no tokio runtime: {e}")))?;
        Self::start_on(&handle, config, clock, history)
    }

    /// Start a scheduler whose control loop runs on `handle`.
    ///
    /// # Errors
    ///
    /// Same as [`Scheduler::start`].
    pub fn start_on(
        handle: &Handle,
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<Self, SchedulerError> {
        let (core, events) = SchedulerCore::new(config, Arc::clone(&clock), Arc::clone(&history))?;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let driver = ControlLoop {
            core,
            events,
            commands: commands_rx,
            clock,
            shutdown_grace: config.shutdown_grace(),
        };

        info!(
            tick_ms = config.tick_interval_ms,
            workers = config.pool.worker_count,
            queue_depth = config.pool.max_queue_depth,
            "Scheduler started"
        );
        Ok(Self {
            commands,
            history,
            driver: Mutex::new(Some(handle.spawn(driver.run()))),
        })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| SchedulerError::Shutdown)?;
        rx.await.map_err(|_| SchedulerError::Shutdown)
    }

    /// Register a job.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Configuration` if the id is already registered
    /// - `SchedulerError::Shutdown` after shutdown
    pub async fn register(&self, definition: JobDefinition) -> Result<(), SchedulerError> {
        self.request(|tx| Command::Register(definition, tx)).await?
    }

    /// Unregister a job. Returns `Ok(false)` if it was not registered, so
    /// repeated calls are harmless.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Shutdown` after shutdown.
    pub async fn unregister(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let job_id = job_id.to_string();
        self.request(|tx| Command::Unregister(job_id, tx)).await
    }

    /// Enable or disable a job.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::JobNotFound` for an unknown id
    /// - `SchedulerError::Shutdown` after shutdown
    pub async fn set_enabled(&self, job_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let job_id = job_id.to_string();
        self.request(|tx| Command::SetEnabled(job_id, enabled, tx)).await?
    }

    /// Fire a job once, now, outside its schedule. Returns `Ok(false)` if
    /// the worker pool was full; the run is then retried like any capacity
    /// failure.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::JobNotFound` for an unknown id
    /// - `SchedulerError::Capacity` if the job is at its concurrency limit
    /// - `SchedulerError::Shutdown` after shutdown
    pub async fn trigger_now(&self, job_id: &str) -> Result<bool, SchedulerError> {
        let job_id = job_id.to_string();
        self.request(|tx| Command::Trigger(job_id, tx)).await?
    }

    /// Status of one job, `None` if unknown.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Shutdown` after shutdown.
    pub async fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>, SchedulerError> {
        let job_id = job_id.to_string();
        self.request(|tx| Command::Status(job_id, tx)).await
    }

    /// Registered job ids.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Shutdown` after shutdown.
    pub async fn jobs(&self) -> Result<Vec<String>, SchedulerError> {
        self.request(Command::Jobs).await
    }

    /// Worker pool statistics.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Shutdown` after shutdown.
    pub async fn pool_stats(&self) -> Result<PoolStats, SchedulerError> {
        self.request(Command::PoolStats).await
    }

    /// Run a scheduling pass now instead of waiting for the next tick.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Shutdown` after shutdown.
    pub async fn tick_now(&self) -> Result<TickReport, SchedulerError> {
        self.request(Command::Tick).await
    }

    /// The history store runs are recorded in.
    pub fn history(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.history)
    }

    /// Query the history store.
    ///
    /// # Errors
    ///
    /// Propagates history store failures.
    pub fn query(&self, query: &HistoryQuery) -> Result<HistoryCursor, SchedulerError> {
        self.history.query(query)
    }

    /// Aggregate statistics over the records matching `query`.
    ///
    /// # Errors
    ///
    /// Propagates history store failures.
    pub fn summary(&self, query: &HistoryQuery) -> Result<HistorySummary, SchedulerError> {
        Ok(HistorySummary::from_runs(self.history.query(query)?))
    }

    /// Stop scheduling, give in-flight runs the configured grace period,
    /// abandon the rest and stop the worker pool.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Shutdown` if the scheduler already stopped.
    pub async fn shutdown(&self) -> Result<ShutdownReport, SchedulerError> {
        let report = self.request(Command::Shutdown).await?;
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                error!(error = %e, "Scheduler control loop failed");
            }
        }
        Ok(report)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &!self.commands.is_closed())
            .finish_non_exhaustive()
    }
}

struct ControlLoop {
    core: SchedulerCore,
    events: RunEvents,
    commands: mpsc::UnboundedReceiver<Command>,
    clock: Arc<dyn Clock>,
    shutdown_grace: Duration,
}

impl ControlLoop {
    async fn run(mut self) -> ShutdownReport {
        let tick = self.core.tick_interval();
        let mut next_tick = self.clock.after(tick);

        loop {
            tokio::select! {
                biased;

                Some(event) = self.events.recv() => self.core.handle_event(event),

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        let report = self.drain().await;
                        let _ = reply.send(report);
                        return report;
                    }
                    Some(command) => self.apply(command),
                    None => {
                        info!("All scheduler handles dropped");
                        return self.drain().await;
                    }
                },

                () = &mut next_tick => {
                    self.core.tick();
                    next_tick = self.clock.after(tick);
                }
            }
        }
    }

    fn apply(&mut self, command: Command) {
        // Replies are dropped silently when the caller stopped waiting.
        match command {
            Command::Register(definition, reply) => {
                let _ = reply.send(self.core.register(definition));
            }
            Command::Unregister(job_id, reply) => {
                let _ = reply.send(self.core.unregister(&job_id));
            }
            Command::SetEnabled(job_id, enabled, reply) => {
                let _ = reply.send(self.core.set_enabled(&job_id, enabled));
            }
            Command::Trigger(job_id, reply) => {
                let _ = reply.send(self.core.trigger_now(&job_id));
            }
            Command::Status(job_id, reply) => {
                let _ = reply.send(self.core.job_status(&job_id));
            }
            Command::Jobs(reply) => {
                let _ = reply.send(self.core.job_ids());
            }
            Command::PoolStats(reply) => {
                let _ = reply.send(self.core.pool_stats());
            }
            Command::Tick(reply) => {
                let _ = reply.send(self.core.tick());
            }
            Command::Shutdown(reply) => {
                warn!("Shutdown command reached apply; ignoring");
                drop(reply);
            }
        }
    }

    async fn drain(&mut self) -> ShutdownReport {
        self.core.begin_shutdown();

        let waiting = self.core.in_flight_count();
        if waiting > 0 {
            info!(in_flight = waiting, grace_ms = self.shutdown_grace.as_millis(), "Waiting for in-flight runs");
            let mut deadline = self.clock.after(self.shutdown_grace);
            while self.core.in_flight_count() > 0 {
                tokio::select! {
                    biased;
                    event = self.events.recv() => match event {
                        Some(event) => self.core.handle_event(event),
                        None => break,
                    },
                    () = &mut deadline => {
                        warn!(in_flight = self.core.in_flight_count(), "Shutdown grace period elapsed");
                        break;
                    }
                }
            }
        }

        let completed = waiting.saturating_sub(self.core.in_flight_count());
        let abandoned = self.core.abandon_in_flight();
        let unwritten_history = self.core.flush_remaining();

        if let Err(e) = tokio::task::spawn_blocking(self.core.pool_shutdown()).await {
            error!(error = %e, "Worker pool shutdown failed");
        }

        info!(
            completed = completed,
            abandoned = abandoned,
            unwritten_history = unwritten_history,
            "Scheduler stopped"
        );
        ShutdownReport {
            completed,
            abandoned,
            unwritten_history,
        }
    }
}
