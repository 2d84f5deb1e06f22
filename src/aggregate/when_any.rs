//! The `when_any` aggregator: first value wins.
//!
//! Children race; the first one to deliver a value claims the winner index,
//! immediately resumes the parent with the winning slot, and hard-cancels
//! its launched siblings. The last pending completion resumes with an
//! all-failed error only if no winner was ever elected. The launch loop
//! skips vacant child slots and stops early once a winner appears
//! mid-launch; submission is refused only when *no* child could launch.

use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::aggregate::{acquire_fence, cancel_recorded, AggCore, ChildSlot};
use crate::awaitable::{Awaitable, OpRef, Operation, SubmitOutcome};
use crate::builder::{builder_from_chain, AsyncMark, AwaitLink, FlowBuilder, RootLink};
use crate::controller::Controller;
use crate::error::ErrorFamily;
use crate::result::FlowResult;
use crate::runner::Receiver;
use crate::stage::{Adapt, OpFactory, Stage};
use crate::task::ExecutorHandle;

/// The winning slot of a two-child `when_any`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Winner2<T1, T2> {
    /// Child 0 won.
    First(T1),
    /// Child 1 won.
    Second(T2),
}

/// The winning slot of a three-child `when_any`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Winner3<T1, T2, T3> {
    /// Child 0 won.
    First(T1),
    /// Child 1 won.
    Second(T2),
    /// Child 2 won.
    Third(T3),
}

/// Per-slot delegate receiver of one `when_any` arity: writes its child's
/// result, elects itself winner on the first delivered value (resuming the
/// parent immediately and cancelling siblings), and if it retired the last
/// pending epoch without a winner anywhere, resumes with all-failed.
macro_rules! when_any_slot {
    ($state:ident, ($($S:ident),+), $Si:ident, $slot:ident, $handle:ident, $idx:tt) => {
        struct $slot<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            state: Arc<$state<$($S,)+ E>>,
        }

        impl<$($S,)+ E> Clone for $slot<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            fn clone(&self) -> Self {
                Self {
                    state: Arc::clone(&self.state),
                }
            }
        }

        impl<$($S,)+ E> Receiver<FlowResult<<$Si as Stage<E>>::Final, E>> for $slot<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            fn deliver(self, value: FlowResult<<$Si as Stage<E>>::Final, E>) {
                let state = &self.state;
                let has_value = value.has_value();
                *state.slots.$idx.lock() = value;

                let mut elected = false;
                if has_value && state.core.try_claim($idx) {
                    elected = true;
                    tracing::trace!(winner = $idx, "when_any winner elected");
                    state.cancel_losers($idx);
                    let parent = state.parent.lock().clone();
                    if let Some(aw) = parent {
                        aw.resume(FlowResult::Value($handle {
                            state: Arc::clone(state),
                        }));
                    }
                }

                if state.core.child_done() {
                    acquire_fence();
                    let parent = state.parent.lock().take();
                    if let Some(aw) = parent {
                        if !elected && state.core.claimed() == state.core.none() {
                            tracing::trace!("when_any resolved: all children failed");
                            aw.resume(FlowResult::Error(E::all_failed()));
                        }
                        // Dropping the taken handle releases the submit
                        // retain whether or not a winner already resumed.
                    }
                }
            }
        }
    };
}

/// Everything else of one `when_any` arity.
macro_rules! when_any_arity {
    (
        $n:literal,
        $op:ident, $state:ident, $handle:ident, $factory:ident, $adapt:ident,
        $winner:ident, $when:ident, $when_fast:ident, $stage_fn:ident,
        $( ($S:ident, $slot:ident, $in:ident, $variant:ident, $idx:tt) ),+
    ) => {
        struct $state<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            slots: ($(Mutex<FlowResult<$S::Final, E>>,)+),
            core: AggCore,
            controllers: [Mutex<Option<Arc<Controller>>>; $n],
            parent: Mutex<Option<OpRef<$op<$($S,)+ E>>>>,
        }

        impl<$($S,)+ E> $state<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            fn new() -> Self {
                Self {
                    slots: ($(Mutex::new(FlowResult::<$S::Final, E>::default()),)+),
                    core: AggCore::new($n),
                    controllers: std::array::from_fn(|_| Mutex::new(None)),
                    parent: Mutex::new(None),
                }
            }

            /// Cancels the winner's rivals: every launched child once the
            /// launch mark is up, otherwise the ones launched so far.
            fn cancel_losers(&self, winner: usize) {
                if self.core.launched() {
                    cancel_recorded(&self.controllers, $n);
                } else {
                    cancel_recorded(&self.controllers, winner);
                }
            }
        }

        /// Access handle to the winning slot of a resolved aggregate.
        pub struct $handle<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            state: Arc<$state<$($S,)+ E>>,
        }

        impl<$($S,)+ E> $handle<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            /// The elected winner's index; the child count when none won.
            #[must_use]
            pub fn winner(&self) -> usize {
                self.state.core.claimed()
            }

            /// Moves the winning value out, if a winner was elected.
            #[must_use]
            pub fn take(self) -> Option<$winner<$($S::Final,)+>> {
                match self.winner() {
                    $(
                        $idx => std::mem::take(&mut *self.state.slots.$idx.lock())
                            .into_value()
                            .map($winner::$variant),
                    )+
                    _ => None,
                }
            }
        }

        /// The aggregate awaitable launched by a `when_any` stage.
        pub struct $op<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            children: ($(ChildSlot<$S, E>,)+),
            inputs: Mutex<Option<($($S::In,)+)>>,
            state: Arc<$state<$($S,)+ E>>,
            cancellable: bool,
        }

        impl<$($S,)+ E> Operation for $op<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            type Value = $handle<$($S,)+ E>;
            type Error = E;

            fn submit(aw: &OpRef<Self>) -> SubmitOutcome {
                let op = aw.operation();
                let state = &op.state;

                *state.parent.lock() = Some(Arc::clone(aw));

                let inputs = op.inputs.lock().take();
                let Some(($($in,)+)) = inputs else {
                    drop(state.parent.lock().take());
                    return SubmitOutcome::Rejected;
                };

                // Vacant slots are skipped; a winner appearing mid-launch
                // stops the loop.
                let mut launched_any = false;
                $(
                    if op.children.$idx.is_present()
                        && state.core.claimed() == state.core.none()
                    {
                        state.core.begin_launch();
                        let ctrl = op.cancellable.then(Controller::shared);
                        if let Some(c) = &ctrl {
                            *state.controllers[$idx].lock() = Some(Arc::clone(c));
                        }
                        op.children
                            .$idx
                            .blueprint()
                            .expect("presence checked above")
                            .first()
                            .run(
                                FlowResult::Value($in),
                                ctrl,
                                $slot {
                                    state: Arc::clone(state),
                                },
                            );
                        launched_any = true;
                    }
                )+

                if !launched_any {
                    state.core.mark_launch_failed();
                    drop(state.parent.lock().take());
                    return SubmitOutcome::Rejected;
                }

                if state.core.mark_launched() == 0 {
                    // Every launched child completed before the mark.
                    acquire_fence();
                    let parent = state.parent.lock().take();
                    if let Some(parent) = parent {
                        if state.core.claimed() == state.core.none() {
                            parent.resume(FlowResult::Error(E::all_failed()));
                        }
                    }
                }
                SubmitOutcome::Accepted
            }

            fn cancel(&self) {
                if self.state.core.launch_failed() {
                    return;
                }
                cancel_recorded(&self.state.controllers, $n);
            }
        }

        /// Builds one aggregate awaitable per run from the input tuple.
        pub struct $factory<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            children: ($(ChildSlot<$S, E>,)+),
            cancellable: bool,
        }

        impl<$($S,)+ E> OpFactory<($($S::In,)+), $op<$($S,)+ E>> for $factory<$($S,)+ E>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
        {
            fn create(
                &self,
                input: FlowResult<($($S::In,)+), E>,
            ) -> FlowResult<OpRef<$op<$($S,)+ E>>, E> {
                match input {
                    FlowResult::Value(inputs) => FlowResult::Value(Awaitable::new($op {
                        children: self.children.clone(),
                        inputs: Mutex::new(Some(inputs)),
                        state: Arc::new($state::new()),
                        cancellable: self.cancellable,
                    })),
                    FlowResult::Error(e) => FlowResult::Error(e),
                }
            }
        }

        /// Pairs the winner mapper and failure mapper of a `when_any`
        /// stage.
        pub struct $adapt<F, G> {
            ok: Arc<F>,
            err: Arc<G>,
        }

        impl<F, G> Clone for $adapt<F, G> {
            fn clone(&self) -> Self {
                Self {
                    ok: Arc::clone(&self.ok),
                    err: Arc::clone(&self.err),
                }
            }
        }

        impl<$($S,)+ E, F, G, Of> Adapt<$handle<$($S,)+ E>, Of, E> for $adapt<F, G>
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
            F: Fn($winner<$($S::Final,)+>) -> FlowResult<Of, E> + Send + Sync + 'static,
            G: Fn(E) -> FlowResult<Of, E> + Send + Sync + 'static,
            Of: Send + 'static,
        {
            fn adapt(&self, result: FlowResult<$handle<$($S,)+ E>, E>) -> FlowResult<Of, E> {
                match result {
                    FlowResult::Value(handle) => match handle.take() {
                        Some(winner) => (self.ok)(winner),
                        None => (self.err)(E::all_failed()),
                    },
                    FlowResult::Error(e) => (self.err)(e),
                }
            }
        }

        /// Starts a pipeline that races the given child blueprints.
        ///
        /// The produced builder's input is the tuple of child inputs.
        /// `on_success` maps the winning slot, `on_failure` the aggregate
        /// error; both must return the same result type. The first child to
        /// produce a value wins and its launched rivals are hard-cancelled;
        /// if every child fails, the parent observes an all-failed error.
        pub fn $when<$($S,)+ E, F, G, Of>(
            children: ($(impl Into<ChildSlot<$S, E>>,)+),
            executor: ExecutorHandle,
            on_success: F,
            on_failure: G,
        ) -> FlowBuilder<
            ($($S::In,)+),
            Of,
            E,
            AsyncMark,
            AwaitLink<RootLink<($($S::In,)+)>, $op<$($S,)+ E>, $factory<$($S,)+ E>, $adapt<F, G>, Of>,
        >
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
            F: Fn($winner<$($S::Final,)+>) -> FlowResult<Of, E> + Send + Sync + 'static,
            G: Fn(E) -> FlowResult<Of, E> + Send + Sync + 'static,
            Of: Send + 'static,
        {
            $stage_fn(children, executor, on_success, on_failure, true)
        }

        /// The fast variant: children run with no controllers and the
        /// aggregate has no cancel surface; losing children run to
        /// completion unobserved.
        pub fn $when_fast<$($S,)+ E, F, G, Of>(
            children: ($(impl Into<ChildSlot<$S, E>>,)+),
            executor: ExecutorHandle,
            on_success: F,
            on_failure: G,
        ) -> FlowBuilder<
            ($($S::In,)+),
            Of,
            E,
            AsyncMark,
            AwaitLink<RootLink<($($S::In,)+)>, $op<$($S,)+ E>, $factory<$($S,)+ E>, $adapt<F, G>, Of>,
        >
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
            F: Fn($winner<$($S::Final,)+>) -> FlowResult<Of, E> + Send + Sync + 'static,
            G: Fn(E) -> FlowResult<Of, E> + Send + Sync + 'static,
            Of: Send + 'static,
        {
            $stage_fn(children, executor, on_success, on_failure, false)
        }

        fn $stage_fn<$($S,)+ E, F, G, Of>(
            children: ($(impl Into<ChildSlot<$S, E>>,)+),
            executor: ExecutorHandle,
            on_success: F,
            on_failure: G,
            cancellable: bool,
        ) -> FlowBuilder<
            ($($S::In,)+),
            Of,
            E,
            AsyncMark,
            AwaitLink<RootLink<($($S::In,)+)>, $op<$($S,)+ E>, $factory<$($S,)+ E>, $adapt<F, G>, Of>,
        >
        where
            $($S: Stage<E>,)+
            E: ErrorFamily,
            F: Fn($winner<$($S::Final,)+>) -> FlowResult<Of, E> + Send + Sync + 'static,
            G: Fn(E) -> FlowResult<Of, E> + Send + Sync + 'static,
            Of: Send + 'static,
        {
            builder_from_chain(AwaitLink {
                prev: RootLink(PhantomData),
                dispatcher: executor,
                factory: $factory {
                    children: ($(children.$idx.into(),)+),
                    cancellable,
                },
                adaptor: $adapt {
                    ok: Arc::new(on_success),
                    err: Arc::new(on_failure),
                },
                _out: PhantomData,
            })
        }
    };
}

when_any_slot!(WhenAny2State, (S1, S2), S1, AnySlot2of0, AnyHandle2, 0);
when_any_slot!(WhenAny2State, (S1, S2), S2, AnySlot2of1, AnyHandle2, 1);
when_any_arity!(
    2,
    WhenAny2Op, WhenAny2State, AnyHandle2, WhenAny2Factory, AnyAdapt2,
    Winner2, when_any2, when_any2_fast, when_any2_stage,
    (S1, AnySlot2of0, in0, First, 0),
    (S2, AnySlot2of1, in1, Second, 1)
);

when_any_slot!(WhenAny3State, (S1, S2, S3), S1, AnySlot3of0, AnyHandle3, 0);
when_any_slot!(WhenAny3State, (S1, S2, S3), S2, AnySlot3of1, AnyHandle3, 1);
when_any_slot!(WhenAny3State, (S1, S2, S3), S3, AnySlot3of2, AnyHandle3, 2);
when_any_arity!(
    3,
    WhenAny3Op, WhenAny3State, AnyHandle3, WhenAny3Factory, AnyAdapt3,
    Winner3, when_any3, when_any3_fast, when_any3_stage,
    (S1, AnySlot3of0, in0, First, 0),
    (S2, AnySlot3of1, in1, Second, 1),
    (S3, AnySlot3of2, in2, Third, 2)
);
