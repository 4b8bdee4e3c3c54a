//! The scheduling state machine.
//!
//! `SchedulerCore` owns the job registry, the in-flight runs and the history
//! outbox. It is driven from a single task (see [`crate::runtime::Scheduler`]):
//! [`SchedulerCore::tick`] on every tick, [`SchedulerCore::handle_event`] for
//! every run event, plus the registration commands. Nothing in here blocks or
//! sleeps; all waiting happens in the driver.
//!
//! # Run lifecycle
//!
//! ```text
//! tick ── due fire or retry ──► dispatch ──► Pending ──Started──► Running
//!                                  │                                 │
//!                           pool rejected                        Finished
//!                                  ▼                                 ▼
//!                     Failed (capacity) + retry          Succeeded | Failed (+ retry?)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::core::{
    ActionError, ActionResult, HistoryStore, JobAction, JobDefinition, JobEntry, JobPhase, JobRegistry,
    JobRun, JobStatus, PendingRetry, PoolError, PoolStats, RetryDecision, RetryPolicy,
    RunContext, RunError, SchedulerError, TaskMetadata, WorkerExecutor, WorkerPool,
};
use crate::util::clock::Clock;
use crate::util::serde::{InvocationId, RunId};

/// Progress reported by the worker side of a dispatched run.
#[derive(Debug)]
pub enum RunEvent {
    /// The action began executing.
    Started {
        /// Run that started.
        run_id: RunId,
        /// Clock time at start.
        at: DateTime<Utc>,
    },
    /// The run left the worker pool.
    Finished {
        /// Run that finished.
        run_id: RunId,
        /// Clock time at completion.
        at: DateTime<Utc>,
        /// Action outcome, or why the pool could not produce one.
        result: Result<ActionResult, PoolError>,
    },
}

/// Receiving side of the run-event channel returned by [`SchedulerCore::new`].
pub type RunEvents = mpsc::UnboundedReceiver<RunEvent>;

/// What one call to [`SchedulerCore::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Natural fires accepted by the worker pool.
    pub dispatched: usize,
    /// Retries accepted by the worker pool.
    pub retries_dispatched: usize,
    /// Jobs that were due but at their concurrency limit.
    pub held_at_capacity: usize,
    /// Dispatches the worker pool rejected.
    pub rejected: usize,
    /// Missed fires dropped by the catch-up limit.
    pub skipped_fires: u64,
    /// Scheduling was skipped because history writes are failing.
    pub history_blocked: bool,
}

/// Worker payload for one run.
pub(crate) struct Dispatch {
    action: Arc<dyn JobAction>,
    ctx: RunContext,
    timeout: Option<Duration>,
    events: mpsc::UnboundedSender<RunEvent>,
    clock: Arc<dyn Clock>,
}

/// Runs job actions on pool workers, enforcing the per-job timeout.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct RunExecutor;

#[async_trait]
impl WorkerExecutor<Dispatch, ActionResult> for RunExecutor {
    async fn execute(&self, dispatch: Dispatch, _meta: TaskMetadata) -> ActionResult {
        let Dispatch {
            action,
            ctx,
            timeout,
            events,
            clock,
        } = dispatch;
        let _ = events.send(RunEvent::Started {
            run_id: ctx.run_id,
            at: clock.now(),
        });

        let Some(limit) = timeout else {
            return action.run(ctx).await;
        };
        let token = ctx.cancellation.clone();
        tokio::select! {
            result = action.run(ctx) => result,
            () = clock.after(limit) => {
                token.cancel();
                Err(ActionError::transient(format!(
                    "timed out after {}ms",
                    limit.as_millis()
                )))
            }
        }
    }
}

type RunPool = WorkerPool<Dispatch, ActionResult, RunExecutor>;

/// Ordered queue of history records waiting to be appended.
struct HistoryOutbox {
    queue: VecDeque<JobRun>,
    failures: u32,
    retry_at: Option<DateTime<Utc>>,
    backoff: RetryPolicy,
}

impl HistoryOutbox {
    /// Whether consecutive write failures exceeded the retry budget.
    const fn exhausted(&self) -> bool {
        self.failures > self.backoff.max_retries
    }
}

/// `at + delay`, saturating at the largest representable time.
fn later(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Single-writer scheduling state.
pub struct SchedulerCore {
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    max_catch_up_ticks: Option<u32>,
    capacity_retry_delay: Duration,
    registry: JobRegistry,
    pool: Arc<RunPool>,
    history: Arc<dyn HistoryStore>,
    in_flight: HashMap<RunId, JobRun>,
    next_run_id: RunId,
    events: mpsc::UnboundedSender<RunEvent>,
    outbox: HistoryOutbox,
    root: CancellationToken,
    accepting: bool,
}

impl SchedulerCore {
    /// Build the core and its worker pool. The returned receiver must be
    /// drained into [`SchedulerCore::handle_event`].
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` for an invalid configuration
    /// and `SchedulerError::Infrastructure` if worker threads cannot start.
    pub fn new(
        config: &SchedulerConfig,
        clock: Arc<dyn Clock>,
        history: Arc<dyn HistoryStore>,
    ) -> Result<(Self, RunEvents), SchedulerError> {
        config.validate().map_err(SchedulerError::Configuration)?;
        let pool = WorkerPool::new(config.pool.clone(), RunExecutor)?;
        let (events, events_rx) = mpsc::unbounded_channel();

        let core = Self {
            clock,
            tick_interval: config.tick_interval(),
            max_catch_up_ticks: config.max_catch_up_ticks,
            capacity_retry_delay: config.capacity_retry_delay(),
            registry: JobRegistry::new(),
            pool: Arc::new(pool),
            history,
            in_flight: HashMap::new(),
            next_run_id: 1,
            events,
            outbox: HistoryOutbox {
                queue: VecDeque::new(),
                failures: 0,
                retry_at: None,
                backoff: config.history_retry.policy(),
            },
            root: CancellationToken::new(),
            accepting: true,
        };
        Ok((core, events_rx))
    }

    /// Register a job. Its first fire time is computed from the current time.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::Configuration` if the id is already registered
    /// - `SchedulerError::Shutdown` once shutdown has begun
    pub fn register(&mut self, definition: JobDefinition) -> Result<(), SchedulerError> {
        if !self.accepting {
            return Err(SchedulerError::Shutdown);
        }
        let now = self.clock.now();
        let entry = self.registry.insert(definition, now, &self.root)?;
        info!(
            job_id = %entry.definition.id(),
            name = %entry.definition.name(),
            next_fire = ?entry.next_fire,
            "Job registered"
        );
        Ok(())
    }

    /// Remove a job. Pending retries are dropped and the job's cancellation
    /// token is cancelled; runs already in flight finish and are recorded.
    /// Returns `false` if the job was not registered.
    pub fn unregister(&mut self, job_id: &str) -> bool {
        let Some(entry) = self.registry.remove(job_id) else {
            debug!(job_id = job_id, "Unregister for unknown job ignored");
            return false;
        };
        entry.cancel.cancel();
        info!(
            job_id = job_id,
            in_flight = entry.in_flight.len(),
            dropped_retries = entry.pending_retries.len(),
            "Job unregistered"
        );
        true
    }

    /// Enable or disable a job. Re-enabling moves a stale next fire time to
    /// the first fire after now.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::JobNotFound` for an unknown id.
    pub fn set_enabled(&mut self, job_id: &str, enabled: bool) -> Result<(), SchedulerError> {
        let now = self.clock.now();
        let entry = self
            .registry
            .get_mut(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if entry.enabled == enabled {
            return Ok(());
        }
        entry.enabled = enabled;
        if enabled && entry.next_fire.is_some_and(|fire| fire < now) {
            entry.next_fire = entry.definition.trigger().next_after(now);
        }
        info!(job_id = job_id, enabled = enabled, next_fire = ?entry.next_fire, "Job enabled flag changed");
        Ok(())
    }

    /// Fire a registered job once, now, outside its schedule. The run is a
    /// fresh invocation starting at attempt 1 and its failures follow the
    /// job's retry policy. The job's next scheduled fire is unchanged, and
    /// disabled jobs can still be fired this way.
    ///
    /// Returns `Ok(false)` if the worker pool rejected the run; that is
    /// recorded as a capacity failure with a retry, like a scheduled fire.
    ///
    /// # Errors
    ///
    /// - `SchedulerError::JobNotFound` for an unknown id
    /// - `SchedulerError::Capacity` if the job is at its concurrency limit
    /// - `SchedulerError::Shutdown` once shutdown has begun
    pub fn trigger_now(&mut self, job_id: &str) -> Result<bool, SchedulerError> {
        if !self.accepting {
            return Err(SchedulerError::Shutdown);
        }
        let entry = self
            .registry
            .get(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))?;
        if !entry.has_capacity() {
            return Err(SchedulerError::Capacity(format!(
                "job {job_id} already has {} runs in flight",
                entry.in_flight.len()
            )));
        }
        let now = self.clock.now();
        info!(job_id = job_id, "Job triggered manually");
        Ok(self.dispatch(job_id, InvocationId::new(), 1, now, now))
    }

    /// Status of one job.
    pub fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.registry.get(job_id).map(JobEntry::status)
    }

    /// Registered job ids.
    pub fn job_ids(&self) -> Vec<String> {
        self.registry.ids()
    }

    /// Runs currently Pending or Running.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// History records not yet appended.
    pub fn pending_history_writes(&self) -> usize {
        self.outbox.queue.len()
    }

    /// Worker pool statistics.
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// The history store runs are recorded in.
    pub fn history(&self) -> Arc<dyn HistoryStore> {
        Arc::clone(&self.history)
    }

    /// Tick period this core was configured with.
    pub const fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Run one scheduling pass at the clock's current time.
    pub fn tick(&mut self) -> TickReport {
        let mut report = TickReport::default();
        if !self.accepting {
            return report;
        }
        let now = self.clock.now();
        // Dispatch continues while history writes are still within their
        // retry budget; once it is spent the tick is skipped.
        if let Err(err) = self.flush_history(now) {
            if self.outbox.exhausted() {
                debug!(
                    pending = self.outbox.queue.len(),
                    failures = self.outbox.failures,
                    error = %err,
                    "Tick skipped, history store unavailable"
                );
                report.history_blocked = true;
                return report;
            }
        }

        for job_id in self.registry.ids() {
            if !self.schedule_job(&job_id, now, &mut report) {
                // The pool is full; later jobs would be rejected too.
                break;
            }
        }

        if report != TickReport::default() {
            debug!(
                dispatched = report.dispatched,
                retries = report.retries_dispatched,
                held = report.held_at_capacity,
                rejected = report.rejected,
                skipped = report.skipped_fires,
                "Tick complete"
            );
        }
        report
    }

    /// Dispatch everything due for one job. Returns `false` if the pool
    /// rejected a dispatch.
    fn schedule_job(&mut self, job_id: &str, now: DateTime<Utc>, report: &mut TickReport) -> bool {
        loop {
            let Some(entry) = self.registry.get_mut(job_id) else {
                return true;
            };
            if !entry.enabled {
                return true;
            }
            let retry_index = entry.due_retry(now);
            if !entry.has_capacity() {
                if retry_index.is_some() || entry.is_due(now) {
                    entry.phase = JobPhase::Due;
                    report.held_at_capacity += 1;
                    debug!(
                        job_id = job_id,
                        in_flight = entry.in_flight.len(),
                        "Job due but at its concurrency limit"
                    );
                }
                return true;
            }

            let (accepted, is_retry) = if let Some(index) = retry_index {
                let retry = entry.pending_retries.remove(index);
                let accepted =
                    self.dispatch(job_id, retry.invocation_id, retry.attempt, retry.scheduled_for, now);
                (accepted, true)
            } else if let Some(mut fire) = entry.next_fire.filter(|fire| *fire <= now) {
                if let Some(limit) = self.max_catch_up_ticks {
                    let max_lag = later(fire, self.tick_interval.saturating_mul(limit));
                    if now > max_lag {
                        let (latest, skipped) = entry.definition.trigger().latest_due(fire, now);
                        if skipped > 0 {
                            warn!(
                                job_id = job_id,
                                skipped = skipped,
                                from = %fire,
                                to = %latest,
                                "Job fell too far behind, skipping missed fires"
                            );
                            report.skipped_fires += skipped;
                            fire = latest;
                        }
                    }
                }
                entry.next_fire = entry.definition.trigger().next_after(fire);
                (self.dispatch(job_id, InvocationId::new(), 1, fire, now), false)
            } else {
                return true;
            };

            if !accepted {
                report.rejected += 1;
                return false;
            }
            if is_retry {
                report.retries_dispatched += 1;
            } else {
                report.dispatched += 1;
            }
        }
    }

    /// Hand one run to the worker pool. Returns `false` if the pool rejected it.
    fn dispatch(
        &mut self,
        job_id: &str,
        invocation_id: InvocationId,
        attempt: u32,
        scheduled_for: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(entry) = self.registry.get(job_id) else {
            return false;
        };
        let run_id = self.next_run_id;
        self.next_run_id += 1;

        let payload = Dispatch {
            action: Arc::clone(entry.definition.action()),
            ctx: RunContext {
                run_id,
                invocation_id,
                job_id: job_id.to_string(),
                attempt,
                scheduled_for,
                cancellation: entry.cancel.child_token(),
            },
            timeout: entry.definition.timeout(),
            events: self.events.clone(),
            clock: Arc::clone(&self.clock),
        };
        let events = self.events.clone();
        let clock = Arc::clone(&self.clock);
        let submitted = self.pool.submit_with(payload, job_id, move |result| {
            let _ = events.send(RunEvent::Finished {
                run_id,
                at: clock.now(),
                result,
            });
        });

        let mut run = JobRun::pending(run_id, invocation_id, job_id, attempt, scheduled_for, now);
        match submitted {
            Ok(task_id) => {
                debug!(
                    job_id = job_id,
                    run_id = run_id,
                    attempt = attempt,
                    task_id = task_id,
                    scheduled_for = %scheduled_for,
                    "Run dispatched"
                );
                if let Some(entry) = self.registry.get_mut(job_id) {
                    entry.in_flight.insert(run_id);
                    entry.phase = JobPhase::Dispatched;
                }
                self.in_flight.insert(run_id, run);
                true
            }
            Err(err) => {
                let due_at = later(now, self.capacity_retry_delay);
                warn!(
                    job_id = job_id,
                    run_id = run_id,
                    attempt = attempt,
                    error = %err,
                    retry_at = %due_at,
                    "Worker pool rejected run"
                );
                run.fail(now, RunError::capacity(err.to_string()), Some(due_at));
                if let Some(entry) = self.registry.get_mut(job_id) {
                    entry.pending_retries.push(PendingRetry {
                        invocation_id,
                        attempt: attempt.saturating_add(1),
                        scheduled_for,
                        due_at,
                    });
                    entry.phase = JobPhase::FailedPendingRetry;
                }
                self.record(run);
                false
            }
        }
    }

    /// Apply a run event.
    pub fn handle_event(&mut self, event: RunEvent) {
        match event {
            RunEvent::Started { run_id, at } => {
                if let Some(run) = self.in_flight.get_mut(&run_id) {
                    run.mark_running(at);
                    debug!(job_id = %run.job_id, run_id = run_id, attempt = run.attempt, "Run started");
                }
            }
            RunEvent::Finished { run_id, at, result } => self.finish(run_id, at, result),
        }
    }

    fn finish(&mut self, run_id: RunId, at: DateTime<Utc>, result: Result<ActionResult, PoolError>) {
        let Some(mut run) = self.in_flight.remove(&run_id) else {
            debug!(run_id = run_id, "Completion for a run no longer tracked");
            return;
        };
        // A job re-registered under the same id does not own this run.
        let owned = self
            .registry
            .get_mut(&run.job_id)
            .is_some_and(|entry| entry.in_flight.remove(&run_id));

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(PoolError::TaskPanicked(message)) => {
                Err(ActionError::permanent(format!("action panicked: {message}")))
            }
            Err(PoolError::PoolShutdown) => {
                run.abandon(at, "worker pool stopped before the run started");
                warn!(job_id = %run.job_id, run_id = run_id, "Run abandoned by the worker pool");
                self.record(run);
                return;
            }
            Err(other) => Err(ActionError::transient(other.to_string())),
        };

        match outcome {
            Ok(output) => {
                run.succeed(at, output);
                if let Some(entry) = self.registry.get_mut(&run.job_id).filter(|_| owned) {
                    entry.phase = JobPhase::Succeeded;
                }
                info!(job_id = %run.job_id, run_id = run_id, attempt = run.attempt, "Run succeeded");
            }
            Err(err) => self.fail(&mut run, at, &err, owned),
        }
        self.record(run);
    }

    /// Record a failure and queue a retry if the policy allows one. Runs no
    /// longer `owned` by a registered job always give up.
    fn fail(&mut self, run: &mut JobRun, at: DateTime<Utc>, err: &ActionError, owned: bool) {
        let now = self.clock.now();
        let accepting = self.accepting;
        let entry = self.registry.get_mut(&run.job_id).filter(|_| owned);
        let decision = match &entry {
            Some(entry) if accepting => entry.definition.retry_policy().next_attempt(run.attempt, err),
            _ => RetryDecision::GiveUp,
        };

        match (decision, entry) {
            (RetryDecision::Retry { after }, Some(entry)) => {
                let due_at = later(now, after);
                run.fail(at, RunError::from(err), Some(due_at));
                entry.pending_retries.push(PendingRetry {
                    invocation_id: run.invocation_id,
                    attempt: run.attempt.saturating_add(1),
                    scheduled_for: run.scheduled_for,
                    due_at,
                });
                entry.phase = JobPhase::FailedPendingRetry;
                warn!(
                    job_id = %run.job_id,
                    run_id = run.run_id,
                    attempt = run.attempt,
                    error = %err,
                    retry_at = %due_at,
                    "Run failed, retry scheduled"
                );
            }
            (_, entry) => {
                run.fail(at, RunError::from(err), None);
                if let Some(entry) = entry {
                    entry.phase = JobPhase::FailedGivenUp;
                }
                error!(
                    job_id = %run.job_id,
                    run_id = run.run_id,
                    attempt = run.attempt,
                    error = %err,
                    "Run failed, giving up"
                );
            }
        }
    }

    /// Queue a record and try to write everything queued so far.
    fn record(&mut self, run: JobRun) {
        self.outbox.queue.push_back(run);
        let now = self.clock.now();
        // Failures stay queued and are retried by later ticks.
        let _ = self.flush_history(now);
    }

    /// Append queued records in order, honouring the write backoff.
    fn flush_history(&mut self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        let outbox = &mut self.outbox;
        if outbox.queue.is_empty() {
            return Ok(());
        }
        if let Some(retry_at) = outbox.retry_at {
            if now < retry_at {
                return Err(SchedulerError::Infrastructure(format!(
                    "history writes backing off until {retry_at}"
                )));
            }
        }

        while let Some(run) = outbox.queue.front() {
            match self.history.append(run) {
                Ok(()) => {
                    outbox.queue.pop_front();
                    outbox.failures = 0;
                    outbox.retry_at = None;
                }
                Err(err) => {
                    outbox.failures = outbox.failures.saturating_add(1);
                    let retry_at = later(now, outbox.backoff.base_delay(outbox.failures));
                    outbox.retry_at = Some(retry_at);
                    if outbox.exhausted() {
                        error!(
                            pending = outbox.queue.len(),
                            failures = outbox.failures,
                            error = %err,
                            retry_at = %retry_at,
                            "History store unavailable, scheduling paused"
                        );
                    } else {
                        warn!(
                            pending = outbox.queue.len(),
                            failures = outbox.failures,
                            error = %err,
                            retry_at = %retry_at,
                            "History write failed, will retry"
                        );
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Stop dispatching and cancel every job's token.
    pub fn begin_shutdown(&mut self) {
        if !self.accepting {
            return;
        }
        self.accepting = false;
        self.root.cancel();
        info!(
            jobs = self.registry.len(),
            in_flight = self.in_flight.len(),
            "Scheduler shutting down"
        );
    }

    /// Record every in-flight run as abandoned. Returns how many there were.
    pub fn abandon_in_flight(&mut self) -> usize {
        let now = self.clock.now();
        let mut runs: Vec<JobRun> = self.in_flight.drain().map(|(_, run)| run).collect();
        runs.sort_by_key(|run| run.run_id);
        let count = runs.len();
        for mut run in runs {
            if let Some(entry) = self.registry.get_mut(&run.job_id) {
                entry.in_flight.remove(&run.run_id);
            }
            warn!(job_id = %run.job_id, run_id = run.run_id, attempt = run.attempt, "Run abandoned at shutdown");
            run.abandon(now, "scheduler shut down before the run finished");
            self.record(run);
        }
        count
    }

    /// Final attempt to write queued records, ignoring the backoff. Returns
    /// the number of records that could not be written.
    pub fn flush_remaining(&mut self) -> usize {
        self.outbox.retry_at = None;
        let now = self.clock.now();
        if let Err(err) = self.flush_history(now) {
            error!(
                unwritten = self.outbox.queue.len(),
                error = %err,
                "History records lost at shutdown"
            );
        }
        self.outbox.queue.len()
    }

    /// A blocking closure that shuts the worker pool down, for running off the
    /// async executor.
    pub fn pool_shutdown(&self) -> impl FnOnce() + Send + 'static {
        let pool = Arc::clone(&self.pool);
        move || pool.shutdown()
    }
}

impl std::fmt::Debug for SchedulerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerCore")
            .field("jobs", &self.registry.len())
            .field("in_flight", &self.in_flight.len())
            .field("pending_history_writes", &self.outbox.queue.len())
            .field("accepting", &self.accepting)
            .finish_non_exhaustive()
    }
}
