//! Configuration models for the scheduler, its worker pool and history backend.

pub mod pool;
pub mod scheduler;

pub use pool::WorkerPoolConfig;
pub use scheduler::{HistoryBackendConfig, HistoryRetryConfig, SchedulerConfig};
