//! Builders that assemble scheduler components from configuration.

pub mod scheduler_builder;

pub use scheduler_builder::{build_history_store, build_scheduler};
