//! Receivers and the execution cursors.
//!
//! A [`Runner`] binds a sealed blueprint to a receiver and drives runs with
//! a per-run [`Controller`], supporting cooperative and forced cancellation
//! mid-flight. A [`FastRunner`] drops the controller and every piece of
//! cancel bookkeeping; it is the shape used for aggregator leaves and hot
//! paths.
//!
//! # Concurrency contract
//!
//! Runner values are not internally synchronized launch cursors: do not call
//! `launch`/`run` concurrently on the same instance. Continuations move the
//! run state into tasks, so a pipeline executes on whatever thread the most
//! recent `via`/`await` dispatched to. [`Controller::cancel`] may be called
//! concurrently from any thread.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::builder::Blueprint;
use crate::controller::Controller;
use crate::error::ErrorFamily;
use crate::result::FlowResult;
use crate::stage::Stage;

/// Terminal consumer of a pipeline run.
///
/// `deliver` consumes the receiver: each run consumes one clone, which is
/// how the exactly-once delivery contract is expressed in the types. The
/// engine calls `deliver` exactly once per run, on success, failure,
/// cancellation, and every setup-failure path.
pub trait Receiver<V>: Clone + Send + 'static {
    /// Accepts the run's result.
    fn deliver(self, value: V);
}

/// A receiver that discards the result; for runs wanted only for effects.
pub struct DiscardReceiver<V>(PhantomData<fn(V)>);

impl<V> DiscardReceiver<V> {
    /// Creates a discarding receiver.
    #[must_use]
    pub const fn new() -> Self {
        Self(PhantomData)
    }
}

impl<V> Default for DiscardReceiver<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for DiscardReceiver<V> {
    fn clone(&self) -> Self {
        Self(PhantomData)
    }
}

impl<V: 'static> Receiver<V> for DiscardReceiver<V> {
    fn deliver(self, _value: V) {}
}

/// Adapts a cloneable closure into a receiver.
///
/// The usual test shape is a captured channel sender:
/// `FnReceiver::new(move |r| { tx.send(r).ok(); })`.
pub struct FnReceiver<F>(F);

impl<F> FnReceiver<F> {
    /// Wraps the closure.
    pub const fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F: Clone> Clone for FnReceiver<F> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<V, F> Receiver<V> for FnReceiver<F>
where
    F: FnOnce(V) + Clone + Send + 'static,
{
    fn deliver(self, value: V) {
        (self.0)(value);
    }
}

/// Full execution cursor: blueprint + receiver + per-run controller.
pub struct Runner<S, R, E> {
    blueprint: Blueprint<S, E>,
    receiver: R,
}

impl<S, R, E> Runner<S, R, E>
where
    S: Stage<E>,
    E: ErrorFamily,
    R: Receiver<FlowResult<S::Final, E>>,
{
    /// Binds a blueprint to a receiver.
    pub fn new(blueprint: Blueprint<S, E>, receiver: R) -> Self {
        Self {
            blueprint,
            receiver,
        }
    }

    /// Starts one run with a fresh controller and returns it.
    ///
    /// The controller governs this run only; a later `launch` gets its own.
    pub fn launch(&self, input: S::In) -> Arc<Controller> {
        let controller = Controller::shared();
        self.launch_with(controller.clone(), input);
        controller
    }

    /// Starts one run under a caller-provided controller.
    ///
    /// A controller cancelled before this call makes the receiver observe
    /// the corresponding cancel error.
    pub fn launch_with(&self, controller: Arc<Controller>, input: S::In) {
        tracing::trace!("flow run launched");
        self.blueprint.first().run(
            FlowResult::Value(input),
            Some(controller),
            self.receiver.clone(),
        );
    }
}

impl<S, E> Runner<S, DiscardReceiver<FlowResult<S::Final, E>>, E>
where
    S: Stage<E>,
    E: ErrorFamily,
{
    /// A runner that discards results.
    pub fn detached(blueprint: Blueprint<S, E>) -> Self {
        Self::new(blueprint, DiscardReceiver::new())
    }
}

/// One-shot-style cursor with no controller and no cancellation.
///
/// Async dispatch degenerates to creating the awaitable, registering the
/// continuation, and submitting; no handler locking, no cancel gates.
pub struct FastRunner<S, R, E> {
    blueprint: Blueprint<S, E>,
    receiver: R,
}

impl<S, R, E> FastRunner<S, R, E>
where
    S: Stage<E>,
    E: ErrorFamily,
    R: Receiver<FlowResult<S::Final, E>>,
{
    /// Binds a blueprint to a receiver.
    pub fn new(blueprint: Blueprint<S, E>, receiver: R) -> Self {
        Self {
            blueprint,
            receiver,
        }
    }

    /// Runs the pipeline once on the given input.
    pub fn run(&self, input: S::In) {
        self.blueprint
            .first()
            .run(FlowResult::Value(input), None, self.receiver.clone());
    }
}

impl<S, E> FastRunner<S, DiscardReceiver<FlowResult<S::Final, E>>, E>
where
    S: Stage<E>,
    E: ErrorFamily,
{
    /// A fast runner that discards results.
    pub fn detached(blueprint: Blueprint<S, E>) -> Self {
        Self::new(blueprint, DiscardReceiver::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::blueprint;
    use crate::error::{CancelKind, Fault, FaultKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::sync::Arc;

    #[test]
    fn fn_receiver_forwards_the_result() {
        let bp = blueprint::<u8, Fault>().transform(|x| x + 1).end();
        let (tx, rx) = channel();
        Runner::new(
            bp,
            FnReceiver::new(move |r: FlowResult<u8, Fault>| {
                tx.send(r).ok();
            }),
        )
        .launch(1);
        assert_eq!(rx.recv().unwrap().into_value(), Some(2));
    }

    #[test]
    fn detached_runner_discards_but_still_runs_stages() {
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = hits.clone();
        let bp = blueprint::<u8, Fault>()
            .transform(move |x| {
                seen.fetch_add(1, Ordering::Relaxed);
                x
            })
            .end();
        Runner::detached(bp).launch(0);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn fast_runner_has_no_cancel_surface_but_delivers() {
        let bp = blueprint::<u8, Fault>().transform(|x| x * 2).end();
        let (tx, rx) = channel();
        FastRunner::new(
            bp,
            FnReceiver::new(move |r: FlowResult<u8, Fault>| {
                tx.send(r).ok();
            }),
        )
        .run(4);
        assert_eq!(rx.recv().unwrap().into_value(), Some(8));
    }

    #[test]
    fn precanceled_controller_short_circuits_to_the_end() {
        let bp = blueprint::<u8, Fault>().transform(|x| x + 1).end();
        let (tx, rx) = channel();
        let runner = Runner::new(
            bp,
            FnReceiver::new(move |r: FlowResult<u8, Fault>| {
                tx.send(r).ok();
            }),
        );
        let controller = Controller::shared();
        controller.cancel(true);
        runner.launch_with(controller, 1);
        let got = rx.recv().unwrap().into_error().unwrap();
        assert_eq!(got.kind(), FaultKind::Canceled(CancelKind::Hard));
    }
}
