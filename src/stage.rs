//! Stage nodes and per-stage dispatch.
//!
//! A sealed blueprint is a nested chain of stage nodes in execution order:
//! the first stage owns an `Arc` of its successor, and the innermost node is
//! always the `end` stage. Dispatch walks the chain:
//!
//! - **calc** runs its callable on the current thread and tails into the
//!   next node,
//! - **via** packages the remaining run state into a [`Task`] and hands it to
//!   the stage's executor,
//! - **await** builds an awaitable, couples it to the controller through the
//!   lock-set-handler protocol, submits it, and resumes downstream on the
//!   stage's executor,
//! - **end** finalizes and delivers to the receiver.
//!
//! Cancellation gates run at the head of every non-end node: a hard cancel
//! jumps straight to the end node with a hard-cancel error; a soft cancel
//! replaces the node's input with a soft-cancel error and keeps walking, so
//! recovery stages still observe it and the receiver is always reached.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::awaitable::{Awaitable, FromFlowInput, OpRef, Operation};
use crate::controller::{CancelTarget, Controller, LockAttempt};
use crate::error::{CancelKind, ErrorFamily, Fault};
use crate::result::FlowResult;
use crate::runner::Receiver;
use crate::task::{Executor, ExecutorHandle, Task};

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// A node in a sealed blueprint chain.
///
/// This trait is sealed; blueprints are built exclusively through
/// [`FlowBuilder`](crate::FlowBuilder) composition.
pub trait Stage<E: ErrorFamily>: sealed::Sealed + Send + Sync + 'static {
    /// Value type this node consumes.
    type In: Send + 'static;
    /// Value type the chain's end node delivers.
    type Final: Send + 'static;

    /// Runs this node and everything downstream of it.
    fn run<R>(&self, input: FlowResult<Self::In, E>, ctrl: Option<Arc<Controller>>, recv: R)
    where
        R: Receiver<FlowResult<Self::Final, E>>;

    /// Bypasses the remaining stages and finalizes with a hard-cancel error.
    fn finish_hard_canceled<R>(&self, recv: R)
    where
        R: Receiver<FlowResult<Self::Final, E>>;
}

enum Gate {
    Clear,
    Soft,
    Hard,
}

fn gate(ctrl: &Option<Arc<Controller>>) -> Gate {
    match ctrl {
        None => Gate::Clear,
        Some(c) => {
            if c.is_force_canceled() {
                Gate::Hard
            } else if c.is_soft_canceled() {
                Gate::Soft
            } else {
                Gate::Clear
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Calc callables
// ---------------------------------------------------------------------------

/// A computation installed in a calc or end node.
///
/// The concrete implementations wrap user callables with the stage's
/// value/error routing; the raw user function never sees the routing.
pub trait CalcFn<In, Out, E>: Send + Sync + 'static {
    /// Applies the computation to the stage input.
    fn call(&self, input: FlowResult<In, E>) -> FlowResult<Out, E>;
}

/// Passes the input through unchanged. The finalizer of `end()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFn;

impl<T: Send + 'static, E> CalcFn<T, T, E> for IdentityFn {
    fn call(&self, input: FlowResult<T, E>) -> FlowResult<T, E> {
        input
    }
}

/// `transform(f)`: applies `f` to the value side; errors pass through.
pub struct TransformFn<F>(pub(crate) F);

impl<In, Out, E, F> CalcFn<In, Out, E> for TransformFn<F>
where
    F: Fn(In) -> Out + Send + Sync + 'static,
{
    fn call(&self, input: FlowResult<In, E>) -> FlowResult<Out, E> {
        match input {
            FlowResult::Value(v) => FlowResult::Value((self.0)(v)),
            FlowResult::Error(e) => FlowResult::Error(e),
        }
    }
}

/// `then(f)`: applies `f` to the whole result when it holds a value; errors
/// pass through re-typed.
pub struct ThenFn<F>(pub(crate) F);

impl<In, Out, E, F> CalcFn<In, Out, E> for ThenFn<F>
where
    F: Fn(FlowResult<In, E>) -> FlowResult<Out, E> + Send + Sync + 'static,
{
    fn call(&self, input: FlowResult<In, E>) -> FlowResult<Out, E> {
        match input {
            FlowResult::Value(_) => (self.0)(input),
            FlowResult::Error(e) => FlowResult::Error(e),
        }
    }
}

/// `on_error(f)`: applies `f` to the error side; values pass through.
pub struct OnErrorFn<F>(pub(crate) F);

impl<In, E, F> CalcFn<In, In, E> for OnErrorFn<F>
where
    F: Fn(E) -> FlowResult<In, E> + Send + Sync + 'static,
{
    fn call(&self, input: FlowResult<In, E>) -> FlowResult<In, E> {
        match input {
            FlowResult::Value(v) => FlowResult::Value(v),
            FlowResult::Error(e) => (self.0)(e),
        }
    }
}

/// `catch_fault::<X>(f)`: recovers errors whose source downcasts to `X`.
pub struct CatchFn<F, X> {
    pub(crate) f: F,
    pub(crate) _source: PhantomData<fn(X)>,
}

impl<In, Out, F, X> CalcFn<In, Out, Fault> for CatchFn<F, X>
where
    In: Into<Out> + Send + 'static,
    F: Fn(&X) -> Out + Send + Sync + 'static,
    X: std::error::Error + 'static,
{
    fn call(&self, input: FlowResult<In, Fault>) -> FlowResult<Out, Fault> {
        match input {
            FlowResult::Value(v) => FlowResult::Value(v.into()),
            FlowResult::Error(fault) => match fault.source_as::<X>() {
                Some(x) => FlowResult::Value((self.f)(x)),
                None => FlowResult::Error(fault),
            },
        }
    }
}

/// `end_with(f)`: the user finalizer, applied to whatever reaches the end.
pub struct EndFn<F>(pub(crate) F);

impl<In, E, F> CalcFn<In, In, E> for EndFn<F>
where
    F: Fn(FlowResult<In, E>) -> FlowResult<In, E> + Send + Sync + 'static,
{
    fn call(&self, input: FlowResult<In, E>) -> FlowResult<In, E> {
        (self.0)(input)
    }
}

// ---------------------------------------------------------------------------
// Await-stage collaborators
// ---------------------------------------------------------------------------

/// Builds one awaitable per run from the await stage's input.
pub trait OpFactory<In, A: Operation>: Send + Sync + 'static {
    /// Creates the awaitable, or reports the creation failure / forwarded
    /// upstream error on the error side.
    fn create(&self, input: FlowResult<In, A::Error>) -> FlowResult<OpRef<A>, A::Error>;
}

/// Factory for awaitables constructed via [`FromFlowInput`].
pub struct FromInputFactory<A>(pub(crate) PhantomData<fn() -> A>);

impl<In, A> OpFactory<In, A> for FromInputFactory<A>
where
    In: Send + 'static,
    A: FromFlowInput<In>,
{
    fn create(&self, input: FlowResult<In, A::Error>) -> FlowResult<OpRef<A>, A::Error> {
        match A::from_input(input) {
            FlowResult::Value(op) => FlowResult::Value(Awaitable::new(op)),
            FlowResult::Error(e) => FlowResult::Error(e),
        }
    }
}

/// Maps an awaitable's delivered result onto the next stage's input.
///
/// Cloned into the completion continuation on every run, so implementations
/// must be cheap to clone (the aggregator adaptors share their joiners
/// through `Arc`s).
pub trait Adapt<V, Out, E>: Clone + Send + Sync + 'static {
    /// Adapts one delivered result.
    fn adapt(&self, result: FlowResult<V, E>) -> FlowResult<Out, E>;
}

/// The adaptor of a plain `await_on` stage.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityAdapt;

impl<V: Send + 'static, E: ErrorFamily> Adapt<V, V, E> for IdentityAdapt {
    fn adapt(&self, result: FlowResult<V, E>) -> FlowResult<V, E> {
        result
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Pure-computation node.
pub struct CalcStage<In, F, Next> {
    pub(crate) f: F,
    pub(crate) next: Arc<Next>,
    pub(crate) _in: PhantomData<fn(In)>,
}

impl<In, F, Next> sealed::Sealed for CalcStage<In, F, Next> {}

impl<E, In, F, Next> Stage<E> for CalcStage<In, F, Next>
where
    E: ErrorFamily,
    In: Send + 'static,
    Next: Stage<E>,
    F: CalcFn<In, Next::In, E>,
{
    type In = In;
    type Final = Next::Final;

    fn run<R>(&self, input: FlowResult<In, E>, ctrl: Option<Arc<Controller>>, recv: R)
    where
        R: Receiver<FlowResult<Self::Final, E>>,
    {
        let input = match gate(&ctrl) {
            Gate::Hard => return self.finish_hard_canceled(recv),
            Gate::Soft => FlowResult::Error(E::from_cancel(CancelKind::Soft)),
            Gate::Clear => input,
        };
        self.next.run(self.f.call(input), ctrl, recv);
    }

    fn finish_hard_canceled<R>(&self, recv: R)
    where
        R: Receiver<FlowResult<Self::Final, E>>,
    {
        self.next.finish_hard_canceled(recv);
    }
}

/// Executor-rehoming node.
pub struct ViaStage<Next> {
    pub(crate) dispatcher: ExecutorHandle,
    pub(crate) next: Arc<Next>,
}

impl<Next> sealed::Sealed for ViaStage<Next> {}

impl<E, Next> Stage<E> for ViaStage<Next>
where
    E: ErrorFamily,
    Next: Stage<E>,
{
    type In = Next::In;
    type Final = Next::Final;

    fn run<R>(&self, input: FlowResult<Self::In, E>, ctrl: Option<Arc<Controller>>, recv: R)
    where
        R: Receiver<FlowResult<Self::Final, E>>,
    {
        let input = match gate(&ctrl) {
            Gate::Hard => return self.finish_hard_canceled(recv),
            // A soft-cancelled run still crosses the executor boundary; the
            // dispatcher receives a task carrying the cancel error.
            Gate::Soft => FlowResult::Error(E::from_cancel(CancelKind::Soft)),
            Gate::Clear => input,
        };
        let next = Arc::clone(&self.next);
        self.dispatcher
            .dispatch(Task::new(move || next.run(input, ctrl, recv)));
    }

    fn finish_hard_canceled<R>(&self, recv: R)
    where
        R: Receiver<FlowResult<Self::Final, E>>,
    {
        self.next.finish_hard_canceled(recv);
    }
}

/// Suspension node: awaitable creation, controller coupling, submission.
pub struct AwaitStage<In, A: Operation, FF, Ad, Next> {
    pub(crate) dispatcher: ExecutorHandle,
    pub(crate) factory: FF,
    pub(crate) adaptor: Ad,
    pub(crate) next: Arc<Next>,
    pub(crate) _in: PhantomData<fn(In) -> A>,
}

impl<In, A: Operation, FF, Ad, Next> sealed::Sealed for AwaitStage<In, A, FF, Ad, Next> {}

impl<E, In, A, FF, Ad, Next> Stage<E> for AwaitStage<In, A, FF, Ad, Next>
where
    E: ErrorFamily,
    In: Send + 'static,
    A: Operation<Error = E>,
    FF: OpFactory<In, A>,
    Ad: Adapt<A::Value, Next::In, E>,
    Next: Stage<E>,
{
    type In = In;
    type Final = Next::Final;

    fn run<R>(&self, input: FlowResult<In, E>, ctrl: Option<Arc<Controller>>, recv: R)
    where
        R: Receiver<FlowResult<Self::Final, E>>,
    {
        match gate(&ctrl) {
            Gate::Hard => return self.finish_hard_canceled(recv),
            Gate::Soft => {
                return self.dispatch_error(E::from_cancel(CancelKind::Soft), ctrl, recv);
            }
            Gate::Clear => {}
        }

        let aw = match self.factory.create(input) {
            FlowResult::Value(aw) => aw,
            FlowResult::Error(e) => return self.dispatch_error(e, ctrl, recv),
        };

        match ctrl {
            Some(ctrl) => self.run_controlled(aw, ctrl, recv),
            None => self.run_uncontrolled(aw, recv),
        }
    }

    fn finish_hard_canceled<R>(&self, recv: R)
    where
        R: Receiver<FlowResult<Self::Final, E>>,
    {
        self.next.finish_hard_canceled(recv);
    }
}

impl<E, In, A, FF, Ad, Next> AwaitStage<In, A, FF, Ad, Next>
where
    E: ErrorFamily,
    In: Send + 'static,
    A: Operation<Error = E>,
    FF: OpFactory<In, A>,
    Ad: Adapt<A::Value, Next::In, E>,
    Next: Stage<E>,
{
    fn dispatch_error<R>(&self, error: E, ctrl: Option<Arc<Controller>>, recv: R)
    where
        R: Receiver<FlowResult<Next::Final, E>>,
    {
        let next = Arc::clone(&self.next);
        self.dispatcher
            .dispatch(Task::new(move || {
                next.run(FlowResult::Error(error), ctrl, recv);
            }));
    }

    /// Full-runner path: the lock-set-handler protocol of the controller.
    fn run_controlled<R>(&self, aw: OpRef<A>, ctrl: Arc<Controller>, recv: R)
    where
        R: Receiver<FlowResult<Next::Final, E>>,
    {
        // Export the cancel surface; the stored clone is the retain.
        let target: Arc<dyn CancelTarget> = aw.clone();
        let token = match ctrl.lock_and_set_handler(target) {
            LockAttempt::Locked(token) => token,
            LockAttempt::Canceled => {
                let kind = if ctrl.is_soft_canceled() {
                    CancelKind::Soft
                } else {
                    CancelKind::Hard
                };
                drop(aw);
                return self.dispatch_error(E::from_cancel(kind), Some(ctrl), recv);
            }
        };

        // Continuation: transition the controller out of this epoch, then
        // resume downstream on the stage's executor.
        let next = Arc::clone(&self.next);
        let dispatcher = self.dispatcher.clone();
        let adaptor = self.adaptor.clone();
        let cont_ctrl = ctrl.clone();
        let cont_recv = recv.clone();
        aw.emplace_next_step(Box::new(move |result| {
            dispatcher.dispatch(Task::new(move || {
                cont_ctrl.finish_async_stage(token);
                next.run(adaptor.adapt(result), Some(cont_ctrl), cont_recv);
            }));
        }));

        if aw.submit_async().is_err() {
            ctrl.reset_handler_when_locked();
            ctrl.unlock(token);
            drop(aw);
            return self.dispatch_error(E::submission_failed(), Some(ctrl), recv);
        }

        // Lock held only across install+submit; the handler stays armed.
        ctrl.unlock(token);
    }

    /// Fast-runner path: no controller, no handler bookkeeping.
    fn run_uncontrolled<R>(&self, aw: OpRef<A>, recv: R)
    where
        R: Receiver<FlowResult<Next::Final, E>>,
    {
        let next = Arc::clone(&self.next);
        let dispatcher = self.dispatcher.clone();
        let adaptor = self.adaptor.clone();
        let cont_recv = recv.clone();
        aw.emplace_next_step(Box::new(move |result| {
            dispatcher.dispatch(Task::new(move || {
                next.run(adaptor.adapt(result), None, cont_recv);
            }));
        }));

        if aw.submit_async().is_err() {
            drop(aw);
            self.dispatch_error(E::submission_failed(), None, recv);
        }
    }
}

/// Finalization node; every runnable chain terminates here.
pub struct EndStage<In, F> {
    pub(crate) f: F,
    pub(crate) _in: PhantomData<fn(In)>,
}

impl<In, F> sealed::Sealed for EndStage<In, F> {}

impl<E, In, F> Stage<E> for EndStage<In, F>
where
    E: ErrorFamily,
    In: Send + 'static,
    F: CalcFn<In, In, E>,
{
    type In = In;
    type Final = In;

    fn run<R>(&self, input: FlowResult<In, E>, _ctrl: Option<Arc<Controller>>, recv: R)
    where
        R: Receiver<FlowResult<In, E>>,
    {
        recv.deliver(self.f.call(input));
    }

    fn finish_hard_canceled<R>(&self, recv: R)
    where
        R: Receiver<FlowResult<In, E>>,
    {
        recv.deliver(
            self.f
                .call(FlowResult::Error(E::from_cancel(CancelKind::Hard))),
        );
    }
}
