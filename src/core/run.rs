//! Run records: one `JobRun` per dispatched attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{ActionError, ActionOutput, ErrorClass};
use crate::util::serde::{InvocationId, RunId};

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Handed to the worker pool, not started yet.
    Pending,
    /// The action is executing.
    Running,
    /// The action returned success.
    Succeeded,
    /// The action failed, or the pool rejected the dispatch.
    Failed,
    /// Still in flight when the scheduler shut down.
    Abandoned,
}

impl RunState {
    /// Whether the run can no longer change.
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Abandoned)
    }
}

/// Why a run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The action reported a transient error (or timed out).
    Transient,
    /// The action reported a permanent error (or panicked).
    Permanent,
    /// The worker pool was full; no action attempt happened.
    Capacity,
    /// The scheduler stopped before the run finished.
    Abandoned,
}

/// Error detail stored on failed and abandoned runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl RunError {
    /// Worker pool rejected the dispatch.
    pub fn capacity(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Capacity,
            message: message.into(),
        }
    }

    /// Run abandoned at shutdown.
    pub fn abandoned(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Abandoned,
            message: message.into(),
        }
    }
}

impl From<&ActionError> for RunError {
    fn from(err: &ActionError) -> Self {
        Self {
            kind: match err.class {
                ErrorClass::Transient => FailureKind::Transient,
                ErrorClass::Permanent => FailureKind::Permanent,
            },
            message: err.message.clone(),
        }
    }
}

/// One attempt of one invocation of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Unique, monotonically increasing id.
    pub run_id: RunId,
    /// Shared by every attempt of the same invocation.
    pub invocation_id: InvocationId,
    /// Owning job.
    pub job_id: String,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Current state.
    pub state: RunState,
    /// Fire time the invocation was scheduled for.
    pub scheduled_for: DateTime<Utc>,
    /// When the scheduler handed the run to the pool.
    pub dispatched_at: DateTime<Utc>,
    /// When the action started executing.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached its recorded state.
    pub finished_at: Option<DateTime<Utc>>,
    /// Present iff the run failed or was abandoned.
    pub error: Option<RunError>,
    /// Present iff another attempt has been scheduled.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Output of a successful action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: ActionOutput,
}

impl JobRun {
    /// New run in the `Pending` state.
    pub fn pending(
        run_id: RunId,
        invocation_id: InvocationId,
        job_id: impl Into<String>,
        attempt: u32,
        scheduled_for: DateTime<Utc>,
        dispatched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            run_id,
            invocation_id,
            job_id: job_id.into(),
            attempt,
            state: RunState::Pending,
            scheduled_for,
            dispatched_at,
            started_at: None,
            finished_at: None,
            error: None,
            next_retry_at: None,
            output: None,
        }
    }

    /// `Pending -> Running`.
    pub fn mark_running(&mut self, at: DateTime<Utc>) {
        if self.state == RunState::Pending {
            self.state = RunState::Running;
            self.started_at = Some(at);
        }
    }

    /// Record success.
    pub fn succeed(&mut self, at: DateTime<Utc>, output: ActionOutput) {
        self.started_at.get_or_insert(at);
        self.state = RunState::Succeeded;
        self.finished_at = Some(at);
        self.output = output;
        self.error = None;
        self.next_retry_at = None;
    }

    /// Record failure, optionally with the time of the scheduled retry.
    pub fn fail(&mut self, at: DateTime<Utc>, error: RunError, next_retry_at: Option<DateTime<Utc>>) {
        self.state = RunState::Failed;
        self.finished_at = Some(at);
        self.error = Some(error);
        self.next_retry_at = next_retry_at;
    }

    /// Record that the run was still in flight at shutdown.
    pub fn abandon(&mut self, at: DateTime<Utc>, reason: impl Into<String>) {
        self.state = RunState::Abandoned;
        self.finished_at = Some(at);
        self.error = Some(RunError::abandoned(reason));
        self.next_retry_at = None;
    }

    /// A failed attempt with another attempt queued.
    pub const fn is_retry_scheduled(&self) -> bool {
        matches!(self.state, RunState::Failed) && self.next_retry_at.is_some()
    }

    /// Time the run was recorded: its finish time, or dispatch time while in flight.
    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.finished_at.unwrap_or(self.dispatched_at)
    }

    /// Execution time, if the run started and finished.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn run() -> JobRun {
        JobRun::pending(1, InvocationId::new(), "job", 1, t(0), t(0))
    }

    #[test]
    fn test_success_lifecycle() {
        let mut r = run();
        assert_eq!(r.state, RunState::Pending);
        r.mark_running(t(1));
        assert_eq!(r.state, RunState::Running);
        r.succeed(t(4), Some(serde_json::json!(42)));
        assert_eq!(r.state, RunState::Succeeded);
        assert!(r.state.is_finished());
        assert_eq!(r.duration(), Some(chrono::Duration::seconds(3)));
        assert!(r.error.is_none());
    }

    #[test]
    fn test_failure_with_retry() {
        let mut r = run();
        r.mark_running(t(1));
        r.fail(t(2), RunError::from(&ActionError::transient("flaky")), Some(t(3)));
        assert!(r.is_retry_scheduled());
        assert_eq!(r.error.as_ref().unwrap().kind, FailureKind::Transient);
        assert_eq!(r.recorded_at(), t(2));
    }

    #[test]
    fn test_mark_running_only_from_pending() {
        let mut r = run();
        r.abandon(t(5), "shutdown");
        r.mark_running(t(6));
        assert_eq!(r.state, RunState::Abandoned);
        assert!(r.started_at.is_none());
        assert!(r.duration().is_none());
    }

    #[test]
    fn test_run_serde_shape() {
        let mut r = run();
        r.fail(t(1), RunError::capacity("queue full"), Some(t(2)));
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["state"], "failed");
        assert_eq!(json["error"]["kind"], "capacity");
        assert!(json.get("output").is_none());
        let back: JobRun = serde_json::from_value(json).unwrap();
        assert_eq!(back, r);
    }
}
