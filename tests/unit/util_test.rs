//! Tests for utility functions

use chrono::{TimeZone, Utc};
use prometheus_scheduler::util::{Clock, InvocationId, ManualClock};
use std::time::Duration;

#[test]
fn test_invocation_ids_are_unique() {
    let a = InvocationId::new();
    let b = InvocationId::new();
    assert_ne!(a, b);
    assert_eq!(a.to_string().len(), 36);
}

#[test]
fn test_invocation_id_serde_is_transparent() {
    let id = InvocationId::new();
    let json = serde_json::to_string(&id).unwrap();
    assert_eq!(json, format!("\"{id}\""));
    let back: InvocationId = serde_json::from_str(&json).unwrap();
    assert_eq!(back, id);
}

#[test]
fn test_manual_clock_clones_share_time() {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    let other = clock.clone();
    clock.advance(Duration::from_secs(90));
    assert_eq!(other.now(), start + chrono::Duration::seconds(90));
}

#[tokio::test]
async fn test_manual_clock_timer_fires_on_advance() {
    let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
    let clock = ManualClock::new(start);
    let timer = clock.after(Duration::from_secs(10));
    assert_eq!(clock.pending_timers(), 1);

    clock.advance(Duration::from_secs(9));
    assert_eq!(clock.pending_timers(), 1);
    clock.advance(Duration::from_secs(1));
    assert_eq!(clock.pending_timers(), 0);
    tokio::time::timeout(Duration::from_secs(1), timer).await.unwrap();
}

#[test]
fn test_dropped_timers_are_not_counted() {
    let clock = ManualClock::new(Utc::now());
    let timer = clock.after(Duration::from_secs(60));
    assert_eq!(clock.pending_timers(), 1);
    drop(timer);
    assert_eq!(clock.pending_timers(), 0);
}
