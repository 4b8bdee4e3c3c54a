//! Run history: the append-only store abstraction and its query cursor.
//!
//! Every recorded [`JobRun`] goes through [`HistoryStore::append`]. Readers
//! get a [`HistoryCursor`] over an immutable snapshot, so queries never block
//! the scheduler and never observe a half-written record.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::{JobRun, RunState, SchedulerError};

/// Durable record of job runs.
///
/// Implementations must keep appends for the same invocation in call order.
pub trait HistoryStore: Send + Sync + 'static {
    /// Append a record.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Infrastructure` when the backing store is
    /// unavailable. The caller retries the same record later.
    fn append(&self, run: &JobRun) -> Result<(), SchedulerError>;

    /// Open a cursor over the records matching `query`, newest first.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Infrastructure` when the store cannot be read.
    fn query(&self, query: &HistoryQuery) -> Result<HistoryCursor, SchedulerError>;
}

/// Filter for [`HistoryStore::query`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryQuery {
    /// Only runs of this job.
    pub job_id: Option<String>,
    /// At most this many records.
    pub limit: Option<usize>,
    /// Only records with `recorded_at() >= since`.
    pub since: Option<DateTime<Utc>>,
    /// Only records in this state.
    pub state: Option<RunState>,
}

impl HistoryQuery {
    /// Every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Records of one job.
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }

    /// Cap the number of records.
    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Skip records older than `since`.
    #[must_use]
    pub const fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Only records in `state`.
    #[must_use]
    pub const fn state(mut self, state: RunState) -> Self {
        self.state = Some(state);
        self
    }

    /// Whether `run` passes the job, time and state filters.
    pub fn matches(&self, run: &JobRun) -> bool {
        self.job_id.as_deref().is_none_or(|id| run.job_id == id)
            && self.since.is_none_or(|since| run.recorded_at() >= since)
            && self.state.is_none_or(|state| run.state == state)
    }
}

/// Lazy, restartable iterator over a history snapshot, newest record first.
///
/// The snapshot is taken when the cursor is created; later appends are not
/// visible. [`HistoryCursor::rewind`] restarts from the newest record.
#[derive(Debug, Clone)]
pub struct HistoryCursor {
    snapshot: Arc<Vec<JobRun>>,
    query: HistoryQuery,
    // Records consumed from the back of `snapshot`.
    scanned: usize,
    yielded: usize,
}

impl HistoryCursor {
    /// Cursor over `snapshot`, which holds records in append order.
    pub const fn new(snapshot: Arc<Vec<JobRun>>, query: HistoryQuery) -> Self {
        Self {
            snapshot,
            query,
            scanned: 0,
            yielded: 0,
        }
    }

    /// Restart iteration from the newest record.
    pub const fn rewind(&mut self) {
        self.scanned = 0;
        self.yielded = 0;
    }

    /// Number of records in the underlying snapshot, before filtering.
    pub fn snapshot_len(&self) -> usize {
        self.snapshot.len()
    }
}

impl Iterator for HistoryCursor {
    type Item = JobRun;

    fn next(&mut self) -> Option<Self::Item> {
        if self.query.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }
        while self.scanned < self.snapshot.len() {
            let index = self.snapshot.len() - 1 - self.scanned;
            self.scanned += 1;
            let run = &self.snapshot[index];
            if self.query.matches(run) {
                self.yielded += 1;
                return Some(run.clone());
            }
        }
        None
    }
}
