//! Tests for configuration validation

use prometheus_scheduler::config::{HistoryBackendConfig, HistoryRetryConfig, SchedulerConfig, WorkerPoolConfig};
use std::time::Duration;

#[test]
fn test_pool_config_validation() {
    let valid = WorkerPoolConfig::new().with_worker_count(2).with_max_queue_depth(16);
    assert!(valid.validate().is_ok());
}

#[test]
fn test_pool_config_invalid_worker_count() {
    let invalid = WorkerPoolConfig::new().with_worker_count(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_queue_depth() {
    let invalid = WorkerPoolConfig::new().with_max_queue_depth(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_invalid_stack_size() {
    let invalid = WorkerPoolConfig::new().with_thread_stack_size(1024);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_pool_config_json_defaults() {
    let cfg: WorkerPoolConfig = serde_json::from_str(r#"{"worker_count": 3, "join_timeout_ms": 250}"#).unwrap();
    assert_eq!(cfg.worker_count, 3);
    assert_eq!(cfg.join_timeout, Duration::from_millis(250));
    assert_eq!(cfg.max_queue_depth, WorkerPoolConfig::default().max_queue_depth);
    assert!(!cfg.backpressure);
}

#[test]
fn test_scheduler_config_default_is_valid() {
    let cfg = SchedulerConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.capacity_retry_delay(), Duration::from_secs(1));
    assert_eq!(cfg.max_catch_up_ticks, None);
}

#[test]
fn test_scheduler_config_invalid_capacity_delay() {
    let cfg = SchedulerConfig {
        capacity_retry_delay_ms: 0,
        ..SchedulerConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_history_retry() {
    let cfg = SchedulerConfig {
        history_retry: HistoryRetryConfig {
            base_ms: 1_000,
            max_ms: 10,
            max_retries: 3,
        },
        ..SchedulerConfig::default()
    };
    assert!(cfg.validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_history_backend() {
    let zero_retention = SchedulerConfig {
        history: HistoryBackendConfig::InMemory { retention: Some(0) },
        ..SchedulerConfig::default()
    };
    assert!(zero_retention.validate().is_err());

    let empty_path = SchedulerConfig {
        history: HistoryBackendConfig::File { path: "".into() },
        ..SchedulerConfig::default()
    };
    assert!(empty_path.validate().is_err());
}

#[test]
fn test_scheduler_config_from_json() {
    let cfg = SchedulerConfig::from_json_str(
        r#"{
            "shutdown_grace_ms": 500,
            "history_retry": { "base_ms": 50, "max_ms": 400, "max_retries": 2 },
            "history": { "backend": "in_memory", "retention": 1000 }
        }"#,
    )
    .unwrap();
    assert_eq!(cfg.shutdown_grace(), Duration::from_millis(500));
    assert_eq!(cfg.history_retry.policy().base_delay(4), Duration::from_millis(400));
    assert_eq!(cfg.history, HistoryBackendConfig::InMemory { retention: Some(1000) });
}

#[test]
fn test_history_path_overrides_retention() {
    let cfg = SchedulerConfig::from_lookup(|key| match key {
        "SCHEDULER_HISTORY_PATH" => Some("/var/lib/scheduler/history.jsonl".to_string()),
        "SCHEDULER_HISTORY_RETENTION" => Some("10".to_string()),
        _ => None,
    })
    .unwrap();
    assert!(matches!(cfg.history, HistoryBackendConfig::File { .. }));
}
