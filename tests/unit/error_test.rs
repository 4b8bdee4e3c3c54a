//! Tests for error types

use prometheus_scheduler::core::{ActionError, ErrorClass, FailureKind, PoolError, RunError, SchedulerError};

#[test]
fn test_configuration_error() {
    let err = SchedulerError::Configuration("bad cron".to_string());
    assert_eq!(format!("{}", err), "configuration error: bad cron");
}

#[test]
fn test_capacity_error() {
    let err = SchedulerError::Capacity("task queue is full".to_string());
    assert_eq!(format!("{}", err), "capacity exceeded: task queue is full");
}

#[test]
fn test_job_not_found_error() {
    let err = SchedulerError::JobNotFound("nightly".to_string());
    assert_eq!(format!("{}", err), "job not found: nightly");
}

#[test]
fn test_shutdown_error() {
    assert_eq!(format!("{}", SchedulerError::Shutdown), "scheduler is shut down");
}

#[test]
fn test_action_error_classes() {
    let transient = ActionError::transient("upstream 503");
    assert_eq!(transient.class, ErrorClass::Transient);
    assert!(transient.is_retryable());

    let permanent = ActionError::permanent("invalid payload");
    assert_eq!(permanent.class, ErrorClass::Permanent);
    assert!(!permanent.is_retryable());
}

#[test]
fn test_run_error_from_action_error() {
    let run_err = RunError::from(&ActionError::permanent("invalid payload"));
    assert_eq!(run_err.kind, FailureKind::Permanent);
    assert_eq!(run_err.message, "invalid payload");
}

#[test]
fn test_pool_error_conversion() {
    assert!(matches!(
        SchedulerError::from(PoolError::InvalidConfig("worker_count".into())),
        SchedulerError::Configuration(msg) if msg == "worker_count"
    ));
    assert!(matches!(
        SchedulerError::from(PoolError::Internal("spawn failed".into())),
        SchedulerError::Infrastructure(_)
    ));
}

#[test]
fn test_action_error_serde() {
    let err = ActionError::transient("timeout");
    let json = serde_json::to_string(&err).unwrap();
    assert!(json.contains("\"transient\""));
    let back: ActionError = serde_json::from_str(&json).unwrap();
    assert_eq!(back, err);
}
