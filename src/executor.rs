//! Sample executors.
//!
//! The engine only requires the [`Executor`] contract; these two
//! implementations cover the common test and embedding shapes:
//!
//! - [`InlineExecutor`] runs every task on the calling thread, immediately.
//!   Useful for fully synchronous pipelines and for tests; never use it as
//!   the resume executor of an awaitable whose backend completes from the
//!   submitting thread, or the continuation will re-enter the submitter.
//! - [`SimpleExecutor`] is a bounded multi-producer, single-consumer
//!   executor: many threads `dispatch`, exactly one thread drives [`run`],
//!   and shutdown drains every admitted task before returning.
//!
//! [`run`]: SimpleExecutor::run

use std::cell::Cell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::backoff::Backoff;
use crate::task::{Executor, ExecutorHandle, Task};

/// Runs each dispatched task immediately on the dispatching thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl InlineExecutor {
    /// Returns a shared handle to an inline executor.
    #[must_use]
    pub fn handle() -> ExecutorHandle {
        Arc::new(Self)
    }
}

impl Executor for InlineExecutor {
    fn dispatch(&self, task: Task) {
        task.run();
    }
}

const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const SHUTDOWN: u8 = 2;

thread_local! {
    // Identity of the SimpleExecutor whose run() loop owns this thread.
    static CURRENT: Cell<usize> = const { Cell::new(0) };
}

/// A bounded MPSC executor with a single consumer loop.
///
/// # Execution model
///
/// - any number of producer threads may call [`dispatch`](Executor::dispatch)
/// - exactly one thread may call [`run`](Self::run)
///
/// # Lifecycle model
///
/// - `dispatch` before `run` is allowed; tasks queue up
/// - `dispatch` after shutdown is invalid usage and panics
/// - [`try_shutdown`](Self::try_shutdown) requests stop; `run` drains all
///   admitted tasks before returning
///
/// Every dispatch "buys a ticket" (the pending counter) before enqueueing,
/// which is what lets shutdown drain deterministically: a task is either
/// consumed by `run` or, when the queue is full and the dispatcher *is* the
/// consumer thread, executed inline.
pub struct SimpleExecutor {
    pending: AtomicUsize,
    state: AtomicU8,
    queue: ArrayQueue<Task>,
}

impl SimpleExecutor {
    /// Creates an executor whose queue admits `capacity` tasks.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            state: AtomicU8::new(IDLE),
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Creates a shared handle with the given queue capacity.
    #[must_use]
    pub fn shared(capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(capacity))
    }

    fn identity(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Consumer loop. Returns after shutdown is observed and every admitted
    /// task has run.
    ///
    /// Must be called by at most one thread at a time and must not be
    /// re-entered from inside a task.
    pub fn run(&self) {
        if self
            .state
            .compare_exchange(IDLE, RUNNING, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        debug_assert_eq!(
            CURRENT.with(Cell::get),
            0,
            "SimpleExecutor::run must not be nested"
        );
        CURRENT.with(|c| c.set(self.identity()));

        let mut backoff = Backoff::new();
        while self.state.load(Ordering::Relaxed) != SHUTDOWN {
            if let Some(task) = self.queue.pop() {
                task.run();
                self.pending.fetch_sub(1, Ordering::Relaxed);
                backoff.reset();
            } else {
                backoff.wait();
            }
        }

        // Drain: every ticket holder is either queued or about to be.
        let mut backoff = Backoff::new();
        while self.pending.load(Ordering::Relaxed) != 0 {
            if let Some(task) = self.queue.pop() {
                task.run();
                self.pending.fetch_sub(1, Ordering::Relaxed);
                backoff.reset();
            } else {
                backoff.wait();
            }
        }

        CURRENT.with(|c| c.set(0));
    }

    /// Requests shutdown. Returns true once the shutdown transition is
    /// visible (including when another caller performed it).
    pub fn try_shutdown(&self) -> bool {
        match self.state.compare_exchange(
            RUNNING,
            SHUTDOWN,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => true,
            Err(observed) => observed == SHUTDOWN,
        }
    }

    /// Spawns a thread running the consumer loop of a shared executor.
    ///
    /// Convenience for tests and small embeddings; production code usually
    /// owns the consumer thread itself.
    pub fn spawn_consumer(this: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let me = Arc::clone(this);
        std::thread::spawn(move || me.run())
    }
}

impl Executor for SimpleExecutor {
    fn dispatch(&self, task: Task) {
        self.pending.fetch_add(1, Ordering::Relaxed);
        assert!(
            self.state.load(Ordering::Relaxed) != SHUTDOWN,
            "dispatch on a shut-down executor"
        );

        let mut task = task;
        let mut backoff = Backoff::new();
        loop {
            match self.queue.push(task) {
                Ok(()) => return,
                Err(returned) => {
                    // Full queue. The consumer thread may not block on
                    // itself, so it runs the task in place.
                    if CURRENT.with(Cell::get) == self.identity() {
                        self.pending.fetch_sub(1, Ordering::Relaxed);
                        returned.run();
                        return;
                    }
                    task = returned;
                    backoff.wait();
                }
            }
        }
    }
}

impl std::fmt::Debug for SimpleExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleExecutor")
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("state", &self.state.load(Ordering::Relaxed))
            .finish()
    }
}
