//! Core scheduling model: triggers, retry policy, jobs, runs, history and the
//! scheduling state machine.

pub mod cron;
pub mod error;
pub mod executor;
pub mod history;
pub mod job;
pub mod monitor;
pub mod registry;
pub mod retry;
pub mod run;
pub mod scheduler;
pub mod trigger;
pub mod worker_pool;

pub use cron::CronSchedule;
pub use error::{ActionError, AppResult, ErrorClass, SchedulerError};
pub use executor::{TaskMetadata, WorkerExecutor};
pub use history::{HistoryCursor, HistoryQuery, HistoryStore};
pub use job::{
    action_fn, ActionOutput, ActionResult, JobAction, JobDefinition, JobDefinitionBuilder,
    RunContext,
};
pub use monitor::HistorySummary;
pub use registry::{JobEntry, JobPhase, JobRegistry, JobStatus, PendingRetry};
pub use retry::{RetryDecision, RetryPolicy};
pub use run::{FailureKind, JobRun, RunError, RunState};
pub use scheduler::{RunEvent, RunEvents, SchedulerCore, TickReport};
pub use trigger::{next_fire_time, Trigger};
pub use worker_pool::{PoolError, PoolStats, TaskHandle, WorkerPool};
