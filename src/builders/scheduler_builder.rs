//! Build a history store and a running scheduler from configuration.

use std::sync::Arc;

use anyhow::Context;

use crate::config::{HistoryBackendConfig, SchedulerConfig};
use crate::core::{AppResult, HistoryStore, SchedulerError};
use crate::infra::{FileHistoryStore, InMemoryHistoryStore};
use crate::runtime::Scheduler;
use crate::util::clock::Clock;

/// Construct the history backend selected by `cfg`.
///
/// # Errors
///
/// Returns `SchedulerError::Infrastructure` if a file store cannot be opened.
pub fn build_history_store(cfg: &HistoryBackendConfig) -> Result<Arc<dyn HistoryStore>, SchedulerError> {
    Ok(match cfg {
        HistoryBackendConfig::InMemory { retention: None } => Arc::new(InMemoryHistoryStore::new()),
        HistoryBackendConfig::InMemory {
            retention: Some(retention),
        } => Arc::new(InMemoryHistoryStore::with_retention(*retention)),
        HistoryBackendConfig::File { path } => Arc::new(FileHistoryStore::open(path)?),
    })
}

/// Validate `cfg`, open its history backend and start a scheduler on the
/// current tokio runtime.
///
/// # Errors
///
/// Returns an error describing which step failed.
pub fn build_scheduler(cfg: &SchedulerConfig, clock: Arc<dyn Clock>) -> AppResult<Scheduler> {
    cfg.validate()
        .map_err(SchedulerError::Configuration)
        .context("invalid scheduler configuration")?;
    let history = build_history_store(&cfg.history).context("failed to open history store")?;
    let scheduler = Scheduler::start(cfg, clock, history).context("failed to start scheduler")?;
    Ok(scheduler)
}
