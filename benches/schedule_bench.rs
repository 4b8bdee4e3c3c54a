//! Benchmarks for the scheduler's hot paths.
//!
//! Benchmarks cover:
//! - Fire time computation for interval and cron triggers
//! - Retry backoff decisions
//! - Scheduling passes over many registered jobs
//! - Worker pool round trips

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::runtime::Runtime;

use prometheus_scheduler::config::{SchedulerConfig, WorkerPoolConfig};
use prometheus_scheduler::core::{
    action_fn, ActionError, CronSchedule, JobDefinition, RetryPolicy, SchedulerCore, TaskMetadata,
    Trigger, WorkerExecutor, WorkerPool,
};
use prometheus_scheduler::infra::InMemoryHistoryStore;
use prometheus_scheduler::util::ManualClock;

// ============================================================================
// Helpers
// ============================================================================

fn reference() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 2, 28, 23, 59, 30).unwrap()
}

#[derive(Clone)]
struct EchoExecutor;

#[async_trait]
impl WorkerExecutor<u64, u64> for EchoExecutor {
    async fn execute(&self, payload: u64, _meta: TaskMetadata) -> u64 {
        payload
    }
}

// ============================================================================
// Trigger Benchmarks
// ============================================================================

fn bench_next_fire(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_fire");

    let interval = Trigger::interval(Duration::from_secs(90)).unwrap();
    group.bench_function("interval", |b| {
        b.iter(|| black_box(interval.next_after(black_box(reference()))));
    });

    for expression in ["*/5 * * * *", "0 2 * * 1-5", "30 4 29 2 *", "0 0 1,15 * SUN"] {
        let schedule = CronSchedule::parse(expression).unwrap();
        group.bench_with_input(BenchmarkId::new("cron", expression), &schedule, |b, schedule| {
            b.iter(|| black_box(schedule.next_after(black_box(reference()))));
        });
    }

    group.bench_function("cron_parse", |b| {
        b.iter(|| black_box(CronSchedule::parse(black_box("0-30/5 8-18 * JAN-JUN MON-FRI"))));
    });

    group.finish();
}

fn bench_retry(c: &mut Criterion) {
    let policy = RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(60), 10)
        .with_jitter(0.2);
    let error = ActionError::transient("unavailable");
    let mut rng = StdRng::seed_from_u64(7);

    c.bench_function("retry_next_attempt", |b| {
        b.iter(|| black_box(policy.next_attempt_with(black_box(5), &error, &mut rng)));
    });
}

// ============================================================================
// Scheduling Benchmarks
// ============================================================================

fn bench_idle_tick(c: &mut Criterion) {
    let mut group = c.benchmark_group("idle_tick");

    for jobs in [10usize, 100, 1_000] {
        let clock = ManualClock::new(reference());
        let config = SchedulerConfig {
            pool: WorkerPoolConfig::new().with_worker_count(1),
            ..SchedulerConfig::default()
        };
        let (mut core, _events) = SchedulerCore::new(
            &config,
            Arc::new(clock.clone()),
            Arc::new(InMemoryHistoryStore::new()),
        )
        .unwrap();
        for i in 0..jobs {
            let job = JobDefinition::builder(
                format!("job-{i}"),
                Trigger::interval(Duration::from_secs(3_600)).unwrap(),
                action_fn(|_ctx| async { Ok(None) }),
            )
            .build()
            .unwrap();
            core.register(job).unwrap();
        }

        group.throughput(Throughput::Elements(jobs as u64));
        group.bench_with_input(BenchmarkId::from_parameter(jobs), &jobs, |b, _| {
            b.iter(|| black_box(core.tick()));
        });
        core.begin_shutdown();
        core.pool_shutdown()();
    }

    group.finish();
}

fn bench_pool_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let pool = WorkerPool::new(
        WorkerPoolConfig::new().with_worker_count(2).with_max_queue_depth(1_024),
        EchoExecutor,
    )
    .unwrap();

    c.bench_function("pool_round_trip", |b| {
        b.to_async(&rt).iter(|| async {
            let handle = pool.submit(black_box(42), "bench").unwrap();
            black_box(handle.await.unwrap())
        });
    });

    pool.shutdown();
}

criterion_group!(benches, bench_next_fire, bench_retry, bench_idle_tick, bench_pool_round_trip);
criterion_main!(benches);
