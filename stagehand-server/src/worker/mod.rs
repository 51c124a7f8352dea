//! Worker pod lifecycle management

mod manager;

pub use manager::{failure_reason, BatchOutcome, ManagerConfig, WorkerError, WorkerManager};
