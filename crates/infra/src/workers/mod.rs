//! Background threads driving the two consumption paths.

mod consumer_worker;
mod scheduler;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use consumer_worker::{ConsumerWorker, WorkerHandle, WorkerStats};
pub use scheduler::{Scheduler, SchedulerHandle, SchedulerStats};

/// Stats stay readable after a panicking writer.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}
