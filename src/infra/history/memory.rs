//! In-memory history store with optional retention.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::{HistoryCursor, HistoryQuery, HistoryStore, JobRun, SchedulerError};

/// In-memory history for tests and single-process deployments.
///
/// Records live in a copy-on-write vector: cursors hold an `Arc` to the
/// version they were opened on while appends build the next version.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    runs: RwLock<Arc<Vec<JobRun>>>,
    retention: Option<usize>,
}

impl InMemoryHistoryStore {
    /// Unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store keeping only the newest `retention` records.
    pub fn with_retention(retention: usize) -> Self {
        Self {
            runs: RwLock::new(Arc::default()),
            retention: Some(retention),
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.runs.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records in append order.
    pub fn snapshot(&self) -> Arc<Vec<JobRun>> {
        Arc::clone(&self.runs.read())
    }
}

impl HistoryStore for InMemoryHistoryStore {
    fn append(&self, run: &JobRun) -> Result<(), SchedulerError> {
        let mut guard = self.runs.write();
        let runs = Arc::make_mut(&mut guard);
        runs.push(run.clone());
        if let Some(retention) = self.retention {
            let excess = runs.len().saturating_sub(retention);
            if excess > 0 {
                runs.drain(..excess);
            }
        }
        Ok(())
    }

    fn query(&self, query: &HistoryQuery) -> Result<HistoryCursor, SchedulerError> {
        Ok(HistoryCursor::new(self.snapshot(), query.clone()))
    }
}
