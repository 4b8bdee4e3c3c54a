//! Tests for builder modules

use prometheus_scheduler::builders::{build_history_store, build_scheduler};
use prometheus_scheduler::config::{HistoryBackendConfig, SchedulerConfig, WorkerPoolConfig};
use prometheus_scheduler::core::{HistoryQuery, HistoryStore};
use prometheus_scheduler::util::SystemClock;
use std::sync::Arc;

#[test]
fn test_build_in_memory_store() {
    let store = build_history_store(&HistoryBackendConfig::default()).unwrap();
    assert_eq!(store.query(&HistoryQuery::all()).unwrap().count(), 0);
}

#[test]
fn test_build_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = HistoryBackendConfig::File {
        path: dir.path().join("runs.jsonl"),
    };
    let store: Arc<dyn HistoryStore> = build_history_store(&cfg).unwrap();
    assert_eq!(store.query(&HistoryQuery::all()).unwrap().snapshot_len(), 0);
    assert!(dir.path().join("runs.jsonl").exists());
}

#[tokio::test]
async fn test_build_scheduler_rejects_invalid_config() {
    let cfg = SchedulerConfig {
        tick_interval_ms: 0,
        ..SchedulerConfig::default()
    };
    let err = build_scheduler(&cfg, Arc::new(SystemClock)).unwrap_err();
    assert!(err.to_string().contains("invalid scheduler configuration"));
}

#[tokio::test]
async fn test_build_scheduler_starts_and_stops() {
    let cfg = SchedulerConfig {
        pool: WorkerPoolConfig::new().with_worker_count(1),
        ..SchedulerConfig::default()
    };
    let scheduler = build_scheduler(&cfg, Arc::new(SystemClock)).unwrap();
    assert!(scheduler.jobs().await.unwrap().is_empty());
    assert_eq!(scheduler.pool_stats().await.unwrap().worker_count, 1);
    let report = scheduler.shutdown().await.unwrap();
    assert_eq!(report.abandoned, 0);
}
