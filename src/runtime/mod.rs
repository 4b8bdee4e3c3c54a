//! Tokio driver for the scheduler core.

pub mod scheduler;

pub use scheduler::{Scheduler, ShutdownReport};
