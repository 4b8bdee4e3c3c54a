//! Tests for history stores and summaries

use chrono::{DateTime, TimeZone, Utc};
use prometheus_scheduler::core::{
    ActionError, HistoryQuery, HistoryStore, HistorySummary, JobRun, RunError, RunState,
};
use prometheus_scheduler::infra::{FileHistoryStore, InMemoryHistoryStore};
use prometheus_scheduler::util::InvocationId;

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

fn succeeded(run_id: u64, job: &str, secs: i64) -> JobRun {
    let mut run = JobRun::pending(run_id, InvocationId::new(), job, 1, at(secs), at(secs));
    run.mark_running(at(secs));
    run.succeed(at(secs + 2), None);
    run
}

fn failed(run_id: u64, job: &str, secs: i64, retry: bool) -> JobRun {
    let mut run = JobRun::pending(run_id, InvocationId::new(), job, 1, at(secs), at(secs));
    run.mark_running(at(secs));
    let next = retry.then(|| at(secs + 10));
    run.fail(at(secs + 1), RunError::from(&ActionError::transient("flaky")), next);
    run
}

#[test]
fn test_query_is_newest_first_and_filtered() {
    let store = InMemoryHistoryStore::new();
    store.append(&succeeded(1, "a", 0)).unwrap();
    store.append(&succeeded(2, "b", 1)).unwrap();
    store.append(&succeeded(3, "a", 2)).unwrap();

    let ids: Vec<u64> = store.query(&HistoryQuery::for_job("a")).unwrap().map(|r| r.run_id).collect();
    assert_eq!(ids, vec![3, 1]);

    let limited: Vec<u64> = store
        .query(&HistoryQuery::all().limit(2))
        .unwrap()
        .map(|r| r.run_id)
        .collect();
    assert_eq!(limited, vec![3, 2]);
}

#[test]
fn test_query_by_state() {
    let store = InMemoryHistoryStore::new();
    store.append(&succeeded(1, "a", 0)).unwrap();
    store.append(&failed(2, "a", 1, true)).unwrap();
    store.append(&failed(3, "b", 2, false)).unwrap();
    store.append(&succeeded(4, "b", 3)).unwrap();

    let failed_ids: Vec<u64> = store
        .query(&HistoryQuery::all().state(RunState::Failed))
        .unwrap()
        .map(|r| r.run_id)
        .collect();
    assert_eq!(failed_ids, vec![3, 2]);

    let b_succeeded: Vec<u64> = store
        .query(&HistoryQuery::for_job("b").state(RunState::Succeeded))
        .unwrap()
        .map(|r| r.run_id)
        .collect();
    assert_eq!(b_succeeded, vec![4]);
    assert_eq!(store.query(&HistoryQuery::all().state(RunState::Abandoned)).unwrap().count(), 0);
}

#[test]
fn test_cursor_is_a_stable_snapshot() {
    let store = InMemoryHistoryStore::new();
    store.append(&succeeded(1, "a", 0)).unwrap();
    let mut cursor = store.query(&HistoryQuery::all()).unwrap();
    store.append(&succeeded(2, "a", 1)).unwrap();

    assert_eq!(cursor.snapshot_len(), 1);
    assert_eq!(cursor.by_ref().count(), 1);
    cursor.rewind();
    assert_eq!(cursor.next().map(|r| r.run_id), Some(1));
    assert_eq!(store.len(), 2);
}

#[test]
fn test_retention_keeps_newest() {
    let store = InMemoryHistoryStore::with_retention(2);
    for id in 1..=5 {
        store.append(&succeeded(id, "a", i64::try_from(id).unwrap())).unwrap();
    }
    let ids: Vec<u64> = store.snapshot().iter().map(|r| r.run_id).collect();
    assert_eq!(ids, vec![4, 5]);
}

#[test]
fn test_file_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("history.jsonl");
    {
        let store = FileHistoryStore::open(&path).unwrap();
        store.append(&succeeded(1, "a", 0)).unwrap();
        store.append(&failed(2, "a", 5, true)).unwrap();
    }

    let reopened = FileHistoryStore::open(&path).unwrap();
    let runs: Vec<JobRun> = reopened.query(&HistoryQuery::all()).unwrap().collect();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].state, RunState::Failed);
    assert_eq!(runs[0].next_retry_at, Some(at(15)));
    assert_eq!(runs[1].state, RunState::Succeeded);
}

#[test]
fn test_file_store_rejects_corrupt_line() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");
    std::fs::write(&path, "{not json}\n").unwrap();
    let err = FileHistoryStore::open(&path).err().unwrap();
    assert!(err.to_string().contains("line 1"));
}

#[test]
fn test_summary_over_query() {
    let store = InMemoryHistoryStore::new();
    store.append(&succeeded(1, "a", 0)).unwrap();
    store.append(&failed(2, "a", 10, true)).unwrap();
    store.append(&succeeded(3, "a", 20)).unwrap();
    store.append(&failed(4, "a", 30, false)).unwrap();

    let summary = HistorySummary::from_runs(store.query(&HistoryQuery::for_job("a")).unwrap());
    assert_eq!(summary.total, 4);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.failed, 1);
    let rate = summary.success_rate.unwrap();
    assert!((rate - 2.0 / 3.0).abs() < f64::EPSILON);
    // Two 2s successes and two 1s failures.
    assert_eq!(summary.average_duration_ms, Some(1_500.0));
}
