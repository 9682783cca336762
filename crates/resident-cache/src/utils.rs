use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

/// Execute a callback on dropping of the container type.
///
/// The callback must not panic under any circumstance. Since it is called while dropping an item,
/// this might result in aborting program execution.
pub struct CallOnDrop {
    f: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl CallOnDrop {
    /// Creates a new `CallOnDrop`.
    pub fn new<F: FnOnce() + Send + 'static>(f: F) -> CallOnDrop {
        CallOnDrop {
            f: Some(Box::new(f)),
        }
    }
}

impl std::fmt::Debug for CallOnDrop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallOnDrop")
            .field("armed", &self.f.is_some())
            .finish()
    }
}

impl Drop for CallOnDrop {
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            f();
        }
    }
}

/// Locks a mutex, ignoring poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State of the [`MeasureGuard`].
#[derive(Clone, Copy, Debug)]
enum MeasureState {
    /// The work has not finished.
    Pending,
    /// The work has terminated with a status.
    Done(&'static str),
}

/// A guard to measure the execution of scheduled work.
///
/// Emits `{task_name}.run_time` and `{task_name}.completed` when dropped. Work that is dropped
/// before it calls [`done`](Self::done) is reported with the `"cancelled"` status.
pub(crate) struct MeasureGuard {
    state: MeasureState,
    task_name: &'static str,
    start_time: Instant,
}

impl MeasureGuard {
    pub fn start(task_name: &'static str) -> Self {
        Self {
            state: MeasureState::Pending,
            task_name,
            start_time: Instant::now(),
        }
    }

    /// Marks the work as terminated.
    pub fn done(&mut self, status: &'static str) {
        self.state = MeasureState::Done(status);
    }
}

impl Drop for MeasureGuard {
    fn drop(&mut self) {
        let status = match self.state {
            MeasureState::Pending => "cancelled",
            MeasureState::Done(status) => status,
        };

        metric!(
            timer(&format!("{}.run_time", self.task_name)) = self.start_time.elapsed(),
            "status" => status,
        );
        metric!(
            counter(&format!("{}.completed", self.task_name)) += 1,
            "status" => status,
        );
    }
}
