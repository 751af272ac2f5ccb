//! Panic and poison handling shared by the pool and the chain.

use crate::error::TaskError;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};

/// Locks a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Runs a task, turning a panic into a `TaskError::Panicked`.
pub(crate) fn run_guarded<T, F>(task: F) -> Result<T, TaskError>
where
    F: FnOnce() -> Result<T, TaskError>,
{
    panic::catch_unwind(AssertUnwindSafe(task))
        .unwrap_or_else(|payload| Err(TaskError::from_panic(payload)))
}
