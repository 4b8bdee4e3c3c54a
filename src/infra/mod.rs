//! Infrastructure adapters for run history storage.

pub mod history;

pub use history::{FileHistoryStore, InMemoryHistoryStore};
