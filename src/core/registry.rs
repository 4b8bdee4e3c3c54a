//! Registered jobs and their per-job scheduling state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::{JobDefinition, SchedulerError};
use crate::util::serde::{InvocationId, RunId};

/// Where a job is in its scheduling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Waiting for its next fire time.
    Idle,
    /// Due, but held back by its concurrency limit.
    Due,
    /// At least one run handed to the worker pool.
    Dispatched,
    /// The last finished run succeeded.
    Succeeded,
    /// The last finished run failed and a retry is queued.
    FailedPendingRetry,
    /// The last finished run failed with no retry left.
    FailedGivenUp,
}

/// Another attempt of an invocation, waiting for its due time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRetry {
    /// Invocation being retried.
    pub invocation_id: InvocationId,
    /// Attempt number of the retry.
    pub attempt: u32,
    /// Original fire time of the invocation.
    pub scheduled_for: DateTime<Utc>,
    /// Earliest dispatch time.
    pub due_at: DateTime<Utc>,
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job id.
    pub job_id: String,
    /// Display name.
    pub name: String,
    /// Current phase.
    pub phase: JobPhase,
    /// Next natural fire time, `None` once the trigger is exhausted.
    pub next_fire: Option<DateTime<Utc>>,
    /// Runs currently Pending or Running.
    pub in_flight: usize,
    /// Retries waiting for their due time.
    pub pending_retries: usize,
    /// Whether new fires are produced.
    pub enabled: bool,
}

/// A registered job with its mutable scheduling state.
#[derive(Debug)]
pub struct JobEntry {
    /// Immutable definition.
    pub definition: JobDefinition,
    /// Cached next natural fire time.
    pub next_fire: Option<DateTime<Utc>>,
    /// Runs in flight.
    pub in_flight: BTreeSet<RunId>,
    /// Queued retries, in the order they were scheduled.
    pub pending_retries: Vec<PendingRetry>,
    /// Current phase.
    pub phase: JobPhase,
    /// Runtime enabled flag (starts from the definition).
    pub enabled: bool,
    /// Parent of every run's cancellation token.
    pub cancel: CancellationToken,
}

impl JobEntry {
    /// Whether another run may start.
    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.definition.max_concurrent()
    }

    /// Index of the earliest pending retry due at or before `now`.
    pub fn due_retry(&self, now: DateTime<Utc>) -> Option<usize> {
        self.pending_retries
            .iter()
            .enumerate()
            .filter(|(_, r)| r.due_at <= now)
            .min_by_key(|(_, r)| r.due_at)
            .map(|(index, _)| index)
    }

    /// Whether the natural fire is due.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire.is_some_and(|fire| fire <= now)
    }

    /// Snapshot for callers outside the scheduler.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.definition.id().to_string(),
            name: self.definition.name().to_string(),
            phase: self.phase,
            next_fire: self.next_fire,
            in_flight: self.in_flight.len(),
            pending_retries: self.pending_retries.len(),
            enabled: self.enabled,
        }
    }
}

/// Jobs keyed by id; iteration order is the id order.
#[derive(Debug, Default)]
pub struct JobRegistry {
    entries: BTreeMap<String, JobEntry>,
}

impl JobRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `definition`, computing its first fire time from `now`.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Configuration` if the id is already taken.
    pub fn insert(
        &mut self,
        definition: JobDefinition,
        now: DateTime<Utc>,
        parent: &CancellationToken,
    ) -> Result<&JobEntry, SchedulerError> {
        let id = definition.id().to_string();
        if self.entries.contains_key(&id) {
            return Err(SchedulerError::Configuration(format!(
                "job `{id}` is already registered"
            )));
        }
        let entry = JobEntry {
            next_fire: definition.trigger().first_fire(now),
            enabled: definition.enabled(),
            in_flight: BTreeSet::new(),
            pending_retries: Vec::new(),
            phase: JobPhase::Idle,
            cancel: parent.child_token(),
            definition,
        };
        Ok(self.entries.entry(id).or_insert(entry))
    }

    /// Remove a job, returning its entry if it was registered.
    pub fn remove(&mut self, id: &str) -> Option<JobEntry> {
        self.entries.remove(id)
    }

    /// Look up a job.
    pub fn get(&self, id: &str) -> Option<&JobEntry> {
        self.entries.get(id)
    }

    /// Look up a job mutably.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut JobEntry> {
        self.entries.get_mut(id)
    }

    /// Registered ids in order.
    pub fn ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Iterate over entries.
    pub fn iter(&self) -> impl Iterator<Item = &JobEntry> {
        self.entries.values()
    }

    /// Number of registered jobs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no job is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{action_fn, Trigger};
    use chrono::TimeZone;
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn def(id: &str) -> JobDefinition {
        JobDefinition::builder(
            id,
            Trigger::interval(Duration::from_secs(5)).unwrap(),
            action_fn(|_| async { Ok(None) }),
        )
        .max_concurrent(2)
        .build()
        .unwrap()
    }

    #[test]
    fn test_insert_computes_first_fire() {
        let mut registry = JobRegistry::new();
        let root = CancellationToken::new();
        let entry = registry.insert(def("a"), t0(), &root).unwrap();
        assert_eq!(entry.next_fire, Some(t0() + chrono::Duration::seconds(5)));
        assert_eq!(entry.phase, JobPhase::Idle);
        assert!(entry.has_capacity());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut registry = JobRegistry::new();
        let root = CancellationToken::new();
        registry.insert(def("a"), t0(), &root).unwrap();
        let err = registry.insert(def("a"), t0(), &root).unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_job_token_is_child_of_root() {
        let mut registry = JobRegistry::new();
        let root = CancellationToken::new();
        registry.insert(def("a"), t0(), &root).unwrap();
        root.cancel();
        assert!(registry.get("a").unwrap().cancel.is_cancelled());
    }

    #[test]
    fn test_due_retry_picks_earliest() {
        let mut registry = JobRegistry::new();
        let root = CancellationToken::new();
        registry.insert(def("a"), t0(), &root).unwrap();
        let entry = registry.get_mut("a").unwrap();
        let retry = |secs| PendingRetry {
            invocation_id: InvocationId::new(),
            attempt: 2,
            scheduled_for: t0(),
            due_at: t0() + chrono::Duration::seconds(secs),
        };
        entry.pending_retries.push(retry(3));
        entry.pending_retries.push(retry(1));
        entry.pending_retries.push(retry(10));
        assert_eq!(entry.due_retry(t0()), None);
        assert_eq!(entry.due_retry(t0() + chrono::Duration::seconds(5)), Some(1));
    }

    #[test]
    fn test_capacity_tracks_in_flight() {
        let mut registry = JobRegistry::new();
        let root = CancellationToken::new();
        registry.insert(def("a"), t0(), &root).unwrap();
        let entry = registry.get_mut("a").unwrap();
        entry.in_flight.insert(1);
        assert!(entry.has_capacity());
        entry.in_flight.insert(2);
        assert!(!entry.has_capacity());
        assert_eq!(entry.status().in_flight, 2);
    }
}
