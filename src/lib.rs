//! # Prometheus Scheduler
//!
//! A single-instance job scheduler for recurring and one-off work, with
//! retry/backoff and an execution history.
//!
//! Jobs pair a [`core::Trigger`] (fixed interval, cron expression or one-shot
//! time) with an async [`core::JobAction`]. On every tick the scheduler works
//! out which jobs are due, dispatches them to a bounded pool of worker threads
//! and records each attempt as a [`core::JobRun`] in a [`core::HistoryStore`].
//!
//! ## Key Features
//!
//! - **No drift**: interval fire times are computed from the previous
//!   *scheduled* time, never from when the run actually happened
//! - **Per-job concurrency limits**: a job that is still running is held back
//!   and caught up later instead of piling up
//! - **Retries as state**: failed attempts schedule a retry through the job's
//!   [`core::RetryPolicy`] (capped exponential backoff with jitter); nothing
//!   sleeps in the scheduling path
//! - **Worker isolation**: actions run on dedicated OS threads, panics are
//!   contained and recorded as permanent failures
//! - **Testable time**: everything reads time through [`util::Clock`], so
//!   tests drive schedules with [`util::ManualClock`]
//! - **Graceful shutdown**: in-flight runs get a grace period, the rest are
//!   recorded as abandoned
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use prometheus_scheduler::builders::build_scheduler;
//! use prometheus_scheduler::config::SchedulerConfig;
//! use prometheus_scheduler::core::{action_fn, ActionError, JobDefinition, RetryPolicy, Trigger};
//! use prometheus_scheduler::util::{init_tracing, SystemClock};
//!
//! init_tracing();
//! let scheduler = build_scheduler(&SchedulerConfig::from_env()?, Arc::new(SystemClock))?;
//!
//! let report = JobDefinition::builder(
//!     "nightly-report",
//!     Trigger::cron("0 2 * * *")?,
//!     action_fn(|ctx| async move {
//!         tracing::info!(attempt = ctx.attempt, "building report");
//!         Err(ActionError::transient("upstream unavailable"))
//!     }),
//! )
//! .retry_policy(RetryPolicy::exponential(Duration::from_secs(30), Duration::from_secs(600), 5))
//! .timeout(Duration::from_secs(300))
//! .build()?;
//!
//! scheduler.register(report).await?;
//! // ...
//! let shutdown = scheduler.shutdown().await?;
//! ```
//!
//! For complete scenarios, see `tests/scheduler_test.rs`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Configuration models for the scheduler, worker pool and history backend.
pub mod config;
/// Core scheduling model and state machine.
pub mod core;
/// History store backends.
pub mod infra;
/// Tokio driver and public scheduler handle.
pub mod runtime;
/// Shared utilities.
pub mod util;
