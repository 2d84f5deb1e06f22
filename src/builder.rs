//! Blueprint composition.
//!
//! A pipeline is composed left to right on a [`FlowBuilder`], starting from
//! [`blueprint`] and ending with [`end`](FlowBuilder::end) (or
//! [`end_with`](FlowBuilder::end_with)), which seals the builder into an
//! immutable, shareable [`Blueprint`]:
//!
//! ```
//! use flowforge::{blueprint, Fault};
//!
//! let bp = blueprint::<i32, Fault>()
//!     .transform(|x| x + 1)
//!     .transform(|x| x * 2)
//!     .end();
//! # let _ = bp;
//! ```
//!
//! Composition is typed end to end: each stage's output value type is the
//! next stage's input, checked at compile time. Illegal shapes do not build:
//! a sealed blueprint has no composition methods (nothing follows `end`),
//! and `via` is not available directly after an `await` stage, since an
//! async stage already resumes on its own executor.
//!
//! Builders assemble a chain of links; sealing walks the links once,
//! wrapping each stage node around the end node in execution order.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::awaitable::{FromFlowInput, Operation};
use crate::error::{ErrorFamily, Fault};
use crate::result::FlowResult;
use crate::stage::{
    Adapt, AwaitStage, CalcFn, CalcStage, CatchFn, EndFn, EndStage, FromInputFactory, IdentityAdapt,
    IdentityFn, OnErrorFn, OpFactory, Stage, ThenFn, TransformFn, ViaStage,
};
use crate::task::ExecutorHandle;

/// Last-stage marker: the pipeline currently ends in a calc stage.
#[derive(Debug, Clone, Copy)]
pub struct CalcMark;

/// Last-stage marker: the pipeline currently ends in a `via` stage.
#[derive(Debug, Clone, Copy)]
pub struct ViaMark;

/// Last-stage marker: the pipeline currently ends in an `await` stage.
#[derive(Debug, Clone, Copy)]
pub struct AsyncMark;

/// Marker trait for builder states onto which `via` may be composed.
///
/// Not implemented for [`AsyncMark`]: an await stage resumes via its own
/// executor, so `await | via` is rejected at compile time.
pub trait AcceptsVia {}

impl AcceptsVia for CalcMark {}
impl AcceptsVia for ViaMark {}

/// One link of a builder chain: knows how to wrap its stage node around an
/// already-sealed tail.
///
/// This trait is an implementation detail of composition; it is public only
/// because it appears in [`FlowBuilder`] signatures.
pub trait Compose<E: ErrorFamily>: Send + Sized + 'static {
    /// Input value type of the whole chain.
    type In: Send + 'static;
    /// Output value type produced by the last link.
    type Out: Send + 'static;
    /// The sealed chain once `Next` is installed downstream of this link.
    type Chain<Next>: Stage<E, In = Self::In, Final = Next::Final>
    where
        Next: Stage<E, In = Self::Out>;

    /// Wraps this link's node (and all upstream links) around `next`.
    fn compose<Next>(self, next: Next) -> Self::Chain<Next>
    where
        Next: Stage<E, In = Self::Out>;
}

/// The empty chain produced by [`blueprint`].
pub struct RootLink<T>(pub(crate) PhantomData<fn(T)>);

impl<E, T> Compose<E> for RootLink<T>
where
    E: ErrorFamily,
    T: Send + 'static,
{
    type In = T;
    type Out = T;
    type Chain<Next>
        = Next
    where
        Next: Stage<E, In = T>;

    fn compose<Next>(self, next: Next) -> Next
    where
        Next: Stage<E, In = T>,
    {
        next
    }
}

/// Link holding a calc node.
pub struct CalcLink<Prev, F, Out> {
    prev: Prev,
    f: F,
    _out: PhantomData<fn() -> Out>,
}

impl<E, Prev, F, Out> Compose<E> for CalcLink<Prev, F, Out>
where
    E: ErrorFamily,
    Prev: Compose<E>,
    F: CalcFn<Prev::Out, Out, E>,
    Out: Send + 'static,
{
    type In = Prev::In;
    type Out = Out;
    type Chain<Next>
        = Prev::Chain<CalcStage<Prev::Out, F, Next>>
    where
        Next: Stage<E, In = Out>;

    fn compose<Next>(self, next: Next) -> Self::Chain<Next>
    where
        Next: Stage<E, In = Out>,
    {
        self.prev.compose(CalcStage {
            f: self.f,
            next: Arc::new(next),
            _in: PhantomData,
        })
    }
}

/// Link holding a `via` node.
pub struct ViaLink<Prev> {
    prev: Prev,
    dispatcher: ExecutorHandle,
}

impl<E, Prev> Compose<E> for ViaLink<Prev>
where
    E: ErrorFamily,
    Prev: Compose<E>,
{
    type In = Prev::In;
    type Out = Prev::Out;
    type Chain<Next>
        = Prev::Chain<ViaStage<Next>>
    where
        Next: Stage<E, In = Prev::Out>;

    fn compose<Next>(self, next: Next) -> Self::Chain<Next>
    where
        Next: Stage<E, In = Prev::Out>,
    {
        self.prev.compose(ViaStage {
            dispatcher: self.dispatcher,
            next: Arc::new(next),
        })
    }
}

/// Link holding an `await` node.
pub struct AwaitLink<Prev, A: Operation, FF, Ad, Out> {
    pub(crate) prev: Prev,
    pub(crate) dispatcher: ExecutorHandle,
    pub(crate) factory: FF,
    pub(crate) adaptor: Ad,
    pub(crate) _out: PhantomData<fn(A) -> Out>,
}

impl<E, Prev, A, FF, Ad, Out> Compose<E> for AwaitLink<Prev, A, FF, Ad, Out>
where
    E: ErrorFamily,
    Prev: Compose<E>,
    A: Operation<Error = E>,
    FF: OpFactory<Prev::Out, A>,
    Ad: Adapt<A::Value, Out, E>,
    Out: Send + 'static,
{
    type In = Prev::In;
    type Out = Out;
    type Chain<Next>
        = Prev::Chain<AwaitStage<Prev::Out, A, FF, Ad, Next>>
    where
        Next: Stage<E, In = Out>;

    fn compose<Next>(self, next: Next) -> Self::Chain<Next>
    where
        Next: Stage<E, In = Out>,
    {
        self.prev.compose(AwaitStage {
            dispatcher: self.dispatcher,
            factory: self.factory,
            adaptor: self.adaptor,
            next: Arc::new(next),
            _in: PhantomData,
        })
    }
}

/// An immutable, shareable, runnable pipeline description.
///
/// Cloning shares the underlying stage chain; blueprints are reusable across
/// any number of runs and runners.
pub struct Blueprint<S, E> {
    first: Arc<S>,
    _e: PhantomData<fn(E)>,
}

impl<S, E> Blueprint<S, E> {
    pub(crate) fn from_chain(first: Arc<S>) -> Self {
        Self {
            first,
            _e: PhantomData,
        }
    }

    pub(crate) fn first(&self) -> &Arc<S> {
        &self.first
    }
}

impl<S, E> Clone for Blueprint<S, E> {
    fn clone(&self) -> Self {
        Self {
            first: Arc::clone(&self.first),
            _e: PhantomData,
        }
    }
}

impl<S, E> std::fmt::Debug for Blueprint<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Blueprint").finish_non_exhaustive()
    }
}

/// An open pipeline under composition.
///
/// `I` and `O` are the input and current output *value* types, `K` the
/// last-stage marker governing which compositions are legal, and `C` the
/// chain of links accumulated so far.
pub struct FlowBuilder<I, O, E, K, C> {
    chain: C,
    _types: PhantomData<fn(I, K) -> (O, E)>,
}

/// Starts a pipeline whose input value type is `T`.
#[must_use]
pub fn blueprint<T, E>() -> FlowBuilder<T, T, E, CalcMark, RootLink<T>>
where
    T: Send + 'static,
    E: ErrorFamily,
{
    FlowBuilder {
        chain: RootLink(PhantomData),
        _types: PhantomData,
    }
}

pub(crate) fn builder_from_chain<I, O, E, K, C>(chain: C) -> FlowBuilder<I, O, E, K, C> {
    FlowBuilder {
        chain,
        _types: PhantomData,
    }
}

impl<I, O, E, K, C> FlowBuilder<I, O, E, K, C>
where
    I: Send + 'static,
    O: Send + 'static,
    E: ErrorFamily,
    C: Compose<E, In = I, Out = O>,
{
    /// Appends a pure value transformation; errors pass through untouched.
    pub fn transform<F, O2>(
        self,
        f: F,
    ) -> FlowBuilder<I, O2, E, CalcMark, CalcLink<C, TransformFn<F>, O2>>
    where
        F: Fn(O) -> O2 + Send + Sync + 'static,
        O2: Send + 'static,
    {
        builder_from_chain(CalcLink {
            prev: self.chain,
            f: TransformFn(f),
            _out: PhantomData,
        })
    }

    /// Appends a result-to-result computation, invoked only on the value
    /// side; errors pass through re-typed.
    pub fn then<F, O2>(self, f: F) -> FlowBuilder<I, O2, E, CalcMark, CalcLink<C, ThenFn<F>, O2>>
    where
        F: Fn(FlowResult<O, E>) -> FlowResult<O2, E> + Send + Sync + 'static,
        O2: Send + 'static,
    {
        builder_from_chain(CalcLink {
            prev: self.chain,
            f: ThenFn(f),
            _out: PhantomData,
        })
    }

    /// Appends an error handler, invoked only on the error side; values pass
    /// through untouched.
    pub fn on_error<F>(self, f: F) -> FlowBuilder<I, O, E, CalcMark, CalcLink<C, OnErrorFn<F>, O>>
    where
        F: Fn(E) -> FlowResult<O, E> + Send + Sync + 'static,
    {
        builder_from_chain(CalcLink {
            prev: self.chain,
            f: OnErrorFn(f),
            _out: PhantomData,
        })
    }

    /// Appends an await stage: suspend on an awaitable built from the
    /// current output, resume downstream on `executor`.
    pub fn await_on<A>(
        self,
        executor: ExecutorHandle,
    ) -> FlowBuilder<
        I,
        A::Value,
        E,
        AsyncMark,
        AwaitLink<C, A, FromInputFactory<A>, IdentityAdapt, A::Value>,
    >
    where
        A: FromFlowInput<O> + Operation<Error = E>,
    {
        builder_from_chain(AwaitLink {
            prev: self.chain,
            dispatcher: executor,
            factory: FromInputFactory(PhantomData),
            adaptor: IdentityAdapt,
            _out: PhantomData,
        })
    }

    /// Seals the pipeline with an identity finalizer.
    pub fn end(self) -> Blueprint<C::Chain<EndStage<O, IdentityFn>>, E> {
        Blueprint::from_chain(Arc::new(self.chain.compose(EndStage {
            f: IdentityFn,
            _in: PhantomData,
        })))
    }

    /// Seals the pipeline with a finalizer.
    ///
    /// The finalizer maps the output result onto itself: finalization may
    /// observe and replace, but not re-type, the run's outcome.
    pub fn end_with<F>(self, f: F) -> Blueprint<C::Chain<EndStage<O, EndFn<F>>>, E>
    where
        F: Fn(FlowResult<O, E>) -> FlowResult<O, E> + Send + Sync + 'static,
    {
        Blueprint::from_chain(Arc::new(self.chain.compose(EndStage {
            f: EndFn(f),
            _in: PhantomData,
        })))
    }
}

impl<I, O, E, K, C> FlowBuilder<I, O, E, K, C>
where
    I: Send + 'static,
    O: Send + 'static,
    E: ErrorFamily,
    K: AcceptsVia,
    C: Compose<E, In = I, Out = O>,
{
    /// Rehomes subsequent stages onto `executor`.
    ///
    /// Composing `via` twice in a row chains the hops; the later executor
    /// performs the final dispatch and so determines where the next stage
    /// runs. Not available directly after `await_on`, since an async stage
    /// resumes via its own executor.
    pub fn via(self, executor: ExecutorHandle) -> FlowBuilder<I, O, E, ViaMark, ViaLink<C>> {
        builder_from_chain(ViaLink {
            prev: self.chain,
            dispatcher: executor,
        })
    }
}

impl<I, O, K, C> FlowBuilder<I, O, Fault, K, C>
where
    I: Send + 'static,
    O: Send + 'static,
    C: Compose<Fault, In = I, Out = O>,
{
    /// Appends a typed recovery stage, available for the [`Fault`] family:
    /// errors whose source downcasts to `X` are mapped back to the value
    /// side, all other errors pass through.
    pub fn catch_fault<X, F, O2>(
        self,
        f: F,
    ) -> FlowBuilder<I, O2, Fault, CalcMark, CalcLink<C, CatchFn<F, X>, O2>>
    where
        X: std::error::Error + 'static,
        F: Fn(&X) -> O2 + Send + Sync + 'static,
        O: Into<O2>,
        O2: Send + 'static,
    {
        builder_from_chain(CalcLink {
            prev: self.chain,
            f: CatchFn {
                f,
                _source: PhantomData,
            },
            _out: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::InlineExecutor;
    use crate::runner::{FnReceiver, Runner};
    use std::sync::mpsc::channel;

    #[test]
    fn composition_preserves_stage_order() {
        // (x + 1) then (x * 2), not the other way around.
        let bp = blueprint::<i32, Fault>()
            .transform(|x| x + 1)
            .transform(|x| x * 2)
            .end();

        let (tx, rx) = channel();
        Runner::new(
            bp,
            FnReceiver::new(move |r: FlowResult<i32, Fault>| {
                tx.send(r).ok();
            }),
        )
        .launch(5);
        assert_eq!(rx.recv().unwrap().into_value(), Some(12));
    }

    #[test]
    fn blueprints_are_reusable_after_clone() {
        let bp = blueprint::<i32, Fault>().transform(|x| x - 1).end();
        for input in [1, 2, 3] {
            let (tx, rx) = channel();
            Runner::new(
                bp.clone(),
                FnReceiver::new(move |r: FlowResult<i32, Fault>| {
                    tx.send(r).ok();
                }),
            )
            .launch(input);
            assert_eq!(rx.recv().unwrap().into_value(), Some(input - 1));
        }
    }

    #[test]
    fn end_with_observes_and_replaces_the_outcome() {
        let bp = blueprint::<i32, Fault>()
            .transform(|x| x * 2)
            .end_with(|r| r.map_value(|v| v + 1));

        let (tx, rx) = channel();
        Runner::new(
            bp,
            FnReceiver::new(move |r: FlowResult<i32, Fault>| {
                tx.send(r).ok();
            }),
        )
        .launch(10);
        assert_eq!(rx.recv().unwrap().into_value(), Some(21));
    }

    #[test]
    fn chained_via_lands_on_the_later_executor() {
        // Two inline hops still deliver; the later hop performs the final
        // dispatch.
        let bp = blueprint::<i32, Fault>()
            .via(InlineExecutor::handle())
            .via(InlineExecutor::handle())
            .transform(|x| x + 5)
            .end();

        let (tx, rx) = channel();
        Runner::new(
            bp,
            FnReceiver::new(move |r: FlowResult<i32, Fault>| {
                tx.send(r).ok();
            }),
        )
        .launch(1);
        assert_eq!(rx.try_recv().unwrap().into_value(), Some(6));
    }
}
