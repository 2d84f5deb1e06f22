//! The awaitable contract: one async operation, one delivered result.
//!
//! An awaitable is the pairing of a user [`Operation`] with the engine-owned
//! [`Awaitable`] base that enforces the lifecycle:
//!
//! ```text
//!  idle --submit_async (CAS)--> waiting
//!  waiting --resume (CAS)--> done      [next-step invoked, backend ref dropped]
//!  waiting --cancel via controller--> done  [next-step invoked with cancel error]
//!  idle --submit refused--> idle       [next-step never invoked from that path]
//! ```
//!
//! Only one of the two `waiting → done` transitions wins; the loser is a
//! no-op, so double resume is impossible and the registered continuation
//! runs exactly once per awaitable.
//!
//! # Ownership
//!
//! `OpRef<A>` is an `Arc`: the reference count lives beside the object, and
//! the runner chain, the controller's cancel handler, and any backend
//! callback each hold one clone. Backend code that keeps a reference must
//! clone the `OpRef` inside [`Operation::submit`] and drop it *after* calling
//! [`Awaitable::resume`]: calling `resume` must be the final use of the
//! awaitable on that path.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::controller::CancelTarget;
use crate::error::{CancelKind, ErrorFamily};
use crate::result::FlowResult;

const IDLE: u8 = 0;
const WAITING: u8 = 1;
const DONE: u8 = 2;

/// Whether a backend accepted the submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The operation was started; a `resume` will follow (possibly already
    /// happened synchronously).
    Accepted,
    /// The backend refused; no callback will fire and the continuation was
    /// not invoked from this call.
    Rejected,
}

/// Why [`Awaitable::submit_async`] did not start the operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// The awaitable had already left the idle state.
    #[error("awaitable already submitted")]
    AlreadySubmitted,
    /// The backend refused the submission.
    #[error("backend refused submission")]
    Rejected,
}

/// A shared handle to an awaitable.
pub type OpRef<A> = Arc<Awaitable<A>>;

pub(crate) type NextStep<T, E> = Box<dyn FnOnce(FlowResult<T, E>) + Send>;

/// A single asynchronous operation driven through an [`Awaitable`].
///
/// Implementations must not start side effects before `submit` is called.
pub trait Operation: Send + Sync + 'static {
    /// The value the operation delivers on success.
    type Value: Send + 'static;
    /// The pipeline error family.
    type Error: ErrorFamily;

    /// Starts the async work.
    ///
    /// Clone `aw` into the backend callback if (and only if) the backend
    /// will call [`Awaitable::resume`] later; immediate synchronous `resume`
    /// from inside `submit` is allowed. A [`SubmitOutcome::Rejected`] return
    /// must not be paired with a `resume` from the same call.
    fn submit(aw: &OpRef<Self>) -> SubmitOutcome
    where
        Self: Sized;

    /// Attempts to short-circuit in-flight work. Best effort; the state
    /// machine resolves any race with natural completion.
    fn cancel(&self) {}
}

/// Construction protocol for awaitables built by an `await_on` stage.
///
/// The factory receives the stage's *entire* input, including the error
/// side, and reports construction failure (or forwards an upstream error)
/// by returning the error side, which the runner surfaces as the
/// awaitable-creation failure path.
pub trait FromFlowInput<In>: Operation + Sized {
    /// Builds the operation from the stage input.
    fn from_input(input: FlowResult<In, Self::Error>) -> FlowResult<Self, Self::Error>;
}

/// Engine-owned base pairing an [`Operation`] with its lifecycle state.
pub struct Awaitable<A: Operation> {
    state: AtomicU8,
    next_step: Mutex<Option<NextStep<A::Value, A::Error>>>,
    op: A,
}

impl<A: Operation> Awaitable<A> {
    /// Wraps an operation, producing the shared handle.
    pub fn new(op: A) -> OpRef<A> {
        Arc::new(Self {
            state: AtomicU8::new(IDLE),
            next_step: Mutex::new(None),
            op,
        })
    }

    /// Borrows the wrapped operation.
    pub fn operation(&self) -> &A {
        &self.op
    }

    /// Delivers the operation's result.
    ///
    /// Atomically transitions `waiting → done` and invokes the registered
    /// continuation; if the transition was already taken (cancel won, or a
    /// duplicate callback fired) this is a no-op. This must be the backend's
    /// final use of the awaitable.
    pub fn resume(&self, result: FlowResult<A::Value, A::Error>) {
        if self
            .state
            .compare_exchange(WAITING, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.finish(result);
    }

    /// Registers the continuation invoked on completion or cancellation.
    ///
    /// Must happen before `submit_async`; the slot is consumed exactly once.
    pub(crate) fn emplace_next_step(&self, next: NextStep<A::Value, A::Error>) {
        *self.next_step.lock() = Some(next);
    }

    /// Performs the `idle → waiting` transition and submits the operation.
    ///
    /// Normally driven by the runner's await dispatch; exposed for custom
    /// drivers. A second call is refused as [`SubmitError::AlreadySubmitted`].
    /// On backend refusal the state returns to idle and the continuation is
    /// left uninvoked so the caller can take the failure path.
    pub fn submit_async(self: &Arc<Self>) -> Result<(), SubmitError> {
        if self
            .state
            .compare_exchange(IDLE, WAITING, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return Err(SubmitError::AlreadySubmitted);
        }

        match A::submit(self) {
            SubmitOutcome::Accepted => Ok(()),
            SubmitOutcome::Rejected => {
                self.state.store(IDLE, Ordering::Release);
                Err(SubmitError::Rejected)
            }
        }
    }

    fn finish(&self, result: FlowResult<A::Value, A::Error>) {
        if let Some(next) = self.next_step.lock().take() {
            next(result);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }
}

impl<A: Operation> CancelTarget for Awaitable<A> {
    fn cancel(&self, kind: CancelKind) {
        if self
            .state
            .compare_exchange(WAITING, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.op.cancel();
        self.finish(FlowResult::Error(A::Error::from_cancel(kind)));
    }
}

impl<A: Operation> std::fmt::Debug for Awaitable<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Awaitable")
            .field("state", &self.state.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}
