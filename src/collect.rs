//! Polling readiness collector for fork/join patterns.
//!
//! Unlike the awaitable aggregators, the collector does not resume anything:
//! per-slot receivers feed a shared board, and the caller polls readiness
//! with whatever waiting policy it likes: spin, yield, condition variable,
//! or event-loop probe. Mechanism here, policy at the call site.
//!
//! ```
//! use flowforge::{blueprint, Collector2, FastRunner, Fault};
//!
//! let bp_a = blueprint::<i32, Fault>().transform(|x| x + 10).end();
//! let bp_b = blueprint::<i32, Fault>().transform(|x| x + 20).end();
//!
//! let collector = Collector2::new();
//! FastRunner::new(bp_a, collector.slot0()).run(1);
//! FastRunner::new(bp_b, collector.slot1()).run(2);
//!
//! assert!(collector.is_all_ready());
//! let (a, b) = collector.try_take().unwrap();
//! assert_eq!(a.into_value(), Some(11));
//! assert_eq!(b.into_value(), Some(22));
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ErrorFamily;
use crate::result::FlowResult;
use crate::runner::Receiver;

struct Board2<T1, T2, E> {
    slots: (Mutex<FlowResult<T1, E>>, Mutex<FlowResult<T2, E>>),
    ready: [AtomicBool; 2],
    ready_count: AtomicUsize,
}

impl<T1, T2, E: Default> Board2<T1, T2, E> {
    fn new() -> Self {
        Self {
            slots: (
                Mutex::new(FlowResult::default()),
                Mutex::new(FlowResult::default()),
            ),
            ready: [AtomicBool::new(false), AtomicBool::new(false)],
            ready_count: AtomicUsize::new(0),
        }
    }

    fn mark_ready(&self, index: usize) {
        self.ready[index].store(true, Ordering::Release);
        self.ready_count.fetch_add(1, Ordering::Release);
    }
}

/// A two-slot readiness board.
///
/// Each slot's receiver must be used for exactly one pipeline run; readiness
/// queries are cheap acquire loads.
pub struct Collector2<T1, T2, E> {
    board: Arc<Board2<T1, T2, E>>,
}

impl<T1, T2, E> Collector2<T1, T2, E>
where
    T1: Send + 'static,
    T2: Send + 'static,
    E: ErrorFamily,
{
    /// Creates an empty board.
    #[must_use]
    pub fn new() -> Self {
        Self {
            board: Arc::new(Board2::new()),
        }
    }

    /// Receiver feeding slot 0.
    #[must_use]
    pub fn slot0(&self) -> CollectorSlot0<T1, T2, E> {
        CollectorSlot0 {
            board: Arc::clone(&self.board),
        }
    }

    /// Receiver feeding slot 1.
    #[must_use]
    pub fn slot1(&self) -> CollectorSlot1<T1, T2, E> {
        CollectorSlot1 {
            board: Arc::clone(&self.board),
        }
    }

    /// True once both slots have been fed.
    #[must_use]
    pub fn is_all_ready(&self) -> bool {
        self.board.ready_count.load(Ordering::Acquire) == 2
    }

    /// True once at least one slot has been fed.
    #[must_use]
    pub fn is_any_ready(&self) -> bool {
        self.board.ready_count.load(Ordering::Acquire) > 0
    }

    /// True once slot `index` has been fed.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not 0 or 1.
    #[must_use]
    pub fn is_slot_ready(&self, index: usize) -> bool {
        self.board.ready[index].load(Ordering::Acquire)
    }

    /// Takes both results once all slots are ready; `None` before that.
    #[must_use]
    pub fn try_take(&self) -> Option<(FlowResult<T1, E>, FlowResult<T2, E>)> {
        if !self.is_all_ready() {
            return None;
        }
        Some((
            std::mem::take(&mut *self.board.slots.0.lock()),
            std::mem::take(&mut *self.board.slots.1.lock()),
        ))
    }
}

impl<T1, T2, E> Default for Collector2<T1, T2, E>
where
    T1: Send + 'static,
    T2: Send + 'static,
    E: ErrorFamily,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver feeding slot 0 of a [`Collector2`].
pub struct CollectorSlot0<T1, T2, E> {
    board: Arc<Board2<T1, T2, E>>,
}

impl<T1, T2, E> Clone for CollectorSlot0<T1, T2, E> {
    fn clone(&self) -> Self {
        Self {
            board: Arc::clone(&self.board),
        }
    }
}

impl<T1, T2, E> Receiver<FlowResult<T1, E>> for CollectorSlot0<T1, T2, E>
where
    T1: Send + 'static,
    T2: Send + 'static,
    E: ErrorFamily,
{
    fn deliver(self, value: FlowResult<T1, E>) {
        *self.board.slots.0.lock() = value;
        self.board.mark_ready(0);
    }
}

/// Receiver feeding slot 1 of a [`Collector2`].
pub struct CollectorSlot1<T1, T2, E> {
    board: Arc<Board2<T1, T2, E>>,
}

impl<T1, T2, E> Clone for CollectorSlot1<T1, T2, E> {
    fn clone(&self) -> Self {
        Self {
            board: Arc::clone(&self.board),
        }
    }
}

impl<T1, T2, E> Receiver<FlowResult<T2, E>> for CollectorSlot1<T1, T2, E>
where
    T1: Send + 'static,
    T2: Send + 'static,
    E: ErrorFamily,
{
    fn deliver(self, value: FlowResult<T2, E>) {
        *self.board.slots.1.lock() = value;
        self.board.mark_ready(1);
    }
}
