//! Infrastructure layer: concrete brokers and the background threads that
//! drive the engine.

pub mod broker;
pub mod workers;

pub use workers::{ConsumerWorker, Scheduler, SchedulerHandle, SchedulerStats, WorkerHandle, WorkerStats};
