//! Parallel sub-pipeline aggregation.
//!
//! `when_all` launches N child blueprints in parallel and resumes its parent
//! exactly once: with every child's value if all succeeded, or with an
//! any-failed error naming a failing child. `when_any` resumes with the
//! first child that produced a value, or an all-failed error if none did.
//!
//! An aggregator *is* an awaitable: the functions here build an open
//! [`FlowBuilder`](crate::FlowBuilder) whose single await stage drives the
//! aggregate, so further stages (and the mandatory `end`) are piped onto it
//! like any other pipeline. Arity-suffixed functions (`when_all2`,
//! `when_any3`, …) follow the ecosystem convention for fixed-arity joins;
//! higher arities are a mechanical extension.
//!
//! # The fired word
//!
//! All aggregator bookkeeping hangs off one packed atomic:
//!
//! ```text
//! | pending-child count (×4) | launched bit (2) | launch-failed bit (1) |
//! ```
//!
//! Each launch adds one epoch; each child completion subtracts one. The
//! terminal condition is a decrement that observes `launched | one epoch`
//! (the count was one and the launch loop has fully finished), so exactly one
//! thread (a child's, or the submitter's when every child completed before
//! the launch mark) consumes the aggregate and resumes the parent.

mod when_all;
mod when_any;

pub use when_all::{
    when_all2, when_all2_fast, when_all3, when_all3_fast, AllAdapt2, AllAdapt3, AllHandle2,
    AllHandle3, WhenAll2Factory, WhenAll2Op, WhenAll3Factory, WhenAll3Op,
};
pub use when_any::{
    when_any2, when_any2_fast, when_any3, when_any3_fast, AnyAdapt2, AnyAdapt3, AnyHandle2,
    AnyHandle3, WhenAny2Factory, WhenAny2Op, WhenAny3Factory, WhenAny3Op, Winner2, Winner3,
};

use std::sync::atomic::{fence, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::builder::Blueprint;
use crate::controller::Controller;
use std::sync::Arc;

/// Acquire fence pairing with the release decrements of the fired word; run
/// by whichever thread observes the terminal condition before it reads the
/// result slots.
pub(crate) fn acquire_fence() {
    fence(Ordering::Acquire);
}

pub(crate) const LAUNCH_FAILED: usize = 1 << 0;
pub(crate) const LAUNCHED: usize = 1 << 1;
pub(crate) const EPOCH: usize = 1 << 2;
pub(crate) const FINISHED: usize = LAUNCHED | EPOCH;

/// The packed `fired` word plus the failed/winner index of one aggregate.
pub(crate) struct AggCore {
    fired: AtomicUsize,
    /// `when_all`: first failing child index. `when_any`: winner index.
    /// Initialized to the child count, meaning "none".
    claim: AtomicUsize,
    n: usize,
}

impl AggCore {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            fired: AtomicUsize::new(0),
            claim: AtomicUsize::new(n),
            n,
        }
    }

    /// One more child is about to run.
    pub(crate) fn begin_launch(&self) {
        self.fired.fetch_add(EPOCH, Ordering::Release);
    }

    /// A launch that was counted did not actually start.
    pub(crate) fn abort_launch(&self) {
        self.fired.fetch_sub(EPOCH, Ordering::AcqRel);
    }

    /// Marks the launch loop finished; returns the prior word (zero means
    /// every child already completed).
    pub(crate) fn mark_launched(&self) -> usize {
        self.fired.fetch_or(LAUNCHED, Ordering::Release)
    }

    /// Marks the whole launch as failed; `cancel` becomes a no-op.
    pub(crate) fn mark_launch_failed(&self) {
        self.fired.fetch_or(LAUNCH_FAILED, Ordering::AcqRel);
    }

    pub(crate) fn launched(&self) -> bool {
        self.fired.load(Ordering::Acquire) & LAUNCHED != 0
    }

    pub(crate) fn launch_failed(&self) -> bool {
        self.fired.load(Ordering::Acquire) & LAUNCH_FAILED != 0
    }

    /// Retires one child. True exactly once: for the completion that
    /// observed itself to be the last pending child of a fully-marked
    /// launch.
    pub(crate) fn child_done(&self) -> bool {
        self.fired.fetch_sub(EPOCH, Ordering::Release) == FINISHED
    }

    /// CAS "none" to `index`; true for the claiming child.
    pub(crate) fn try_claim(&self, index: usize) -> bool {
        self.claim
            .compare_exchange(self.n, index, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }

    /// Reads the claimed index; equals the child count when unclaimed.
    pub(crate) fn claimed(&self) -> usize {
        self.claim.load(Ordering::Acquire)
    }

    /// The "none claimed" sentinel.
    pub(crate) fn none(&self) -> usize {
        self.n
    }
}

/// A child position of an aggregator: a blueprint, or a vacated slot.
///
/// Aggregators built from handles may legitimately end up with an absent
/// child (the null-pointer case of the source model). `when_all` refuses to
/// submit with any vacant slot; `when_any` skips vacant slots and launches
/// the rest.
pub struct ChildSlot<S, E> {
    bp: Option<Blueprint<S, E>>,
}

impl<S, E> ChildSlot<S, E> {
    /// Consumes a blueprint, keeping only the slot's type: a vacant child.
    #[must_use]
    pub fn vacated(blueprint: Blueprint<S, E>) -> Self {
        drop(blueprint);
        Self { bp: None }
    }

    /// Returns true if the slot holds a blueprint.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.bp.is_some()
    }

    pub(crate) fn blueprint(&self) -> Option<&Blueprint<S, E>> {
        self.bp.as_ref()
    }
}

impl<S, E> From<Blueprint<S, E>> for ChildSlot<S, E> {
    fn from(bp: Blueprint<S, E>) -> Self {
        Self { bp: Some(bp) }
    }
}

impl<S, E> Clone for ChildSlot<S, E> {
    fn clone(&self) -> Self {
        Self {
            bp: self.bp.clone(),
        }
    }
}

/// Cancels the first `upto` recorded child controllers, hard.
pub(crate) fn cancel_recorded(controllers: &[Mutex<Option<Arc<Controller>>>], upto: usize) {
    for cell in &controllers[..upto] {
        let ctrl = cell.lock().clone();
        if let Some(ctrl) = ctrl {
            ctrl.cancel(true);
        }
    }
}
