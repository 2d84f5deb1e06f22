//! Tasks and the executor contract.
//!
//! A [`Task`] is a type-erased, run-once continuation. The runner packages
//! "the rest of the pipeline plus its state" into tasks and hands them to
//! executors at every `via` and `await` boundary; dispatch is how ownership
//! of the run state migrates between threads.
//!
//! An [`Executor`] is anything that can accept a task and eventually run it.
//! The engine owns no threads of its own and makes no liveness assumption
//! beyond "every dispatched task runs in finite time unless the process
//! exits".

use std::sync::Arc;

/// A move-only, run-once, type-erased continuation.
///
/// Tasks must not panic: the engine treats them as the no-panic `void()`
/// closures of the source model, and executors are entitled to run them on
/// threads with no unwinding story.
pub struct Task {
    f: Box<dyn FnOnce() + Send>,
}

impl Task {
    /// Wraps a closure into a task.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { f: Box::new(f) }
    }

    /// Consumes the task and runs it.
    pub fn run(self) {
        (self.f)();
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}

/// The executor contract required by `via` and `await` stages.
///
/// `dispatch` must accept the task even when the executor is effectively
/// inline; the runner relies on dispatcher-mediated continuation for
/// ownership transfer, so tasks may never be silently dropped while the
/// executor is live.
pub trait Executor: Send + Sync {
    /// Accepts a task for eventual execution.
    fn dispatch(&self, task: Task);
}

/// A shared handle to an executor, as stored inside blueprint stages.
pub type ExecutorHandle = Arc<dyn Executor>;

impl<E: Executor + ?Sized> Executor for Arc<E> {
    fn dispatch(&self, task: Task) {
        (**self).dispatch(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn task_runs_once_and_consumes_captures() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let task = Task::new(move || {
            c.fetch_add(1, Ordering::Relaxed);
        });
        task.run();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
