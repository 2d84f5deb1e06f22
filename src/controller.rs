//! Per-run cancellation controller.
//!
//! A [`Controller`] is shared between a pipeline run and any number of
//! external threads that may cancel it. Its state is one packed atomic word:
//!
//! ```text
//! | epoch (upper bits) | low 2 bits: 00=none 01=hard 10=soft 11=locked |
//! ```
//!
//! While an async stage is in flight, the runner *locks* the word and
//! installs the awaitable's cancel handler; external `cancel` calls that win
//! the low-bit CAS invoke and clear that handler. The lock bit plus the
//! epoch counter guarantee that exactly one party transitions the word out
//! of the locked state; the other observes an advanced epoch and takes the
//! handler-already-cleared branch. Unlocking adds `1` to a locked word,
//! which clears the `0b11` low bits by carry and bumps the epoch in the same
//! store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backoff::Backoff;
use crate::error::CancelKind;

const HARD: usize = 0b01;
const SOFT: usize = 0b10;
const LOCKED: usize = 0b11;
const MASK: usize = 0b11;
pub(crate) const EPOCH: usize = 0b100;

/// The cancel surface an in-flight awaitable exposes to the controller.
///
/// Installing a target retains it (the stored `Arc` clone); every clearing
/// path (cancel fired, async stage completed, controller dropped) releases
/// it by dropping that clone exactly once.
pub trait CancelTarget: Send + Sync {
    /// Asks the in-flight operation to short-circuit. No guarantee the
    /// backend stops; the awaitable's state machine resolves the race with
    /// natural completion.
    fn cancel(&self, kind: CancelKind);
}

/// Outcome of [`Controller::lock_and_set_handler`].
pub(crate) enum LockAttempt {
    /// The lock bit was acquired and the handler installed. The token is the
    /// locked state word, used to unlock and to detect epoch advancement.
    Locked(usize),
    /// The controller was already cancelled; the handler was not installed.
    Canceled,
}

/// Per-run cancellation handle.
///
/// `cancel` is thread-safe and may be called from any thread at any time.
/// The locking operations are runner-internal and are never invoked
/// concurrently with each other (a runner drives one stage at a time); they
/// only race with `cancel`.
pub struct Controller {
    state: AtomicUsize,
    handler: Mutex<Option<Arc<dyn CancelTarget>>>,
}

impl Controller {
    /// Creates a controller in the not-cancelled state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicUsize::new(0),
            handler: Mutex::new(None),
        }
    }

    /// Creates a shared controller handle.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Requests cancellation: soft by default, hard when `force` is true.
    ///
    /// If an async stage is in flight, its cancel handler is invoked once and
    /// cleared. Repeated calls after a cancellation has been recorded are
    /// no-ops; a call that arrives while the runner holds the lock spins
    /// until the short install/submit window closes.
    pub fn cancel(&self, force: bool) {
        let kind = if force { HARD } else { SOFT };

        let mut observed = self.state.load(Ordering::Acquire);
        if observed & MASK == SOFT || observed & MASK == HARD {
            return;
        }

        let mut backoff = Backoff::new();
        loop {
            let clean = observed & !MASK;
            match self.state.compare_exchange_weak(
                clean,
                clean | kind,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => {
                    if now & MASK == SOFT || now & MASK == HARD {
                        return;
                    }
                    observed = now;
                    backoff.wait();
                }
            }
        }

        tracing::debug!(force, "flow run canceled");
        let target = self.handler.lock().take();
        if let Some(target) = target {
            let cancel_kind = if force {
                CancelKind::Hard
            } else {
                CancelKind::Soft
            };
            target.cancel(cancel_kind);
        }
    }

    /// Returns true if a hard cancellation has been recorded.
    #[must_use]
    pub fn is_force_canceled(&self) -> bool {
        self.state.load(Ordering::Acquire) & MASK == HARD
    }

    /// Returns true if a soft cancellation has been recorded.
    #[must_use]
    pub fn is_soft_canceled(&self) -> bool {
        self.state.load(Ordering::Acquire) & MASK == SOFT
    }

    /// Returns true if any cancellation has been recorded.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        let low = self.state.load(Ordering::Acquire) & MASK;
        low == SOFT || low == HARD
    }

    /// Acquires the lock bit and installs the cancel handler for the async
    /// stage about to submit.
    ///
    /// If the controller was already cancelled the handler is not installed
    /// and the caller takes the cancelled path.
    pub(crate) fn lock_and_set_handler(&self, target: Arc<dyn CancelTarget>) -> LockAttempt {
        let mut observed = self.state.load(Ordering::Acquire);
        if observed & MASK != 0 {
            return LockAttempt::Canceled;
        }

        let mut backoff = Backoff::new();
        loop {
            match self.state.compare_exchange_weak(
                observed,
                observed | LOCKED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => {
                    if now & MASK != 0 {
                        return LockAttempt::Canceled;
                    }
                    observed = now;
                    backoff.wait();
                }
            }
        }

        *self.handler.lock() = Some(target);
        LockAttempt::Locked(observed | LOCKED)
    }

    /// Releases the lock bit acquired with `token`, bumping the epoch.
    ///
    /// A failed exchange means the completion path already took the word out
    /// of this epoch; nothing is left to do.
    pub(crate) fn unlock(&self, token: usize) {
        let _ = self.state.compare_exchange(
            token,
            token + 1,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    /// Clears the handler while the caller owns the lock bit.
    pub(crate) fn reset_handler_when_locked(&self) {
        drop(self.handler.lock().take());
    }

    /// Completion-side transition out of an async stage.
    ///
    /// Either this call still owns the epoch named by `token`, in which case
    /// it re-claims the lock by bumping the epoch under it, clears the
    /// handler, and unlocks; or the epoch has advanced (the runner's
    /// post-submit unlock already ran) and the handler is drained through
    /// the lock-clear-unlock path.
    pub(crate) fn finish_async_stage(&self, token: usize) {
        if self
            .state
            .compare_exchange(token, token + EPOCH, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.reset_handler_when_locked();
            self.state.fetch_add(1, Ordering::Release);
        } else {
            self.reset_handler();
        }
    }

    /// Drains the handler from an unlocked controller: lock, clear, unlock.
    ///
    /// Returns without touching the handler when a cancellation has been
    /// recorded; the cancel path already drained it.
    pub(crate) fn reset_handler(&self) {
        let mut observed = self.state.load(Ordering::Acquire);
        if observed & MASK != 0 {
            return;
        }

        let mut backoff = Backoff::new();
        loop {
            match self.state.compare_exchange_weak(
                observed,
                observed | LOCKED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.reset_handler_when_locked();
                    self.state.store(observed + EPOCH, Ordering::Release);
                    return;
                }
                Err(now) => {
                    if now & MASK != 0 {
                        return;
                    }
                    observed = now;
                    backoff.wait();
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn raw_state(&self) -> usize {
        self.state.load(Ordering::Acquire)
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        // No stale cancel may fire after the controller dies.
        self.reset_handler();
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let word = self.state.load(Ordering::Acquire);
        f.debug_struct("Controller")
            .field("epoch", &(word / EPOCH))
            .field("low_bits", &(word & MASK))
            .finish()
    }
}
