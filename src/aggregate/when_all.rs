//! The `when_all` aggregator: all children must succeed.
//!
//! Submission launches every child pipeline under its own controller (the
//! cancellable variant) with a per-slot delegate receiver. A child that
//! delivers an error hard-cancels its siblings and claims the failed index;
//! whichever completion retires the last pending epoch consumes the
//! aggregate and resumes the parent: with an access handle to the output
//! tuple if no child failed, or an any-failed error otherwise.

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

/// Per-slot delegate receiver of one `when_all` arity: writes its child's
/// result, claims the failed index and cancels siblings on error, and
/// consumes the aggregate if it retired the last pending epoch.
macro_rules! when_all_slot {
    ($state:ident, ($($S:ident),+), $Si:ident, $slot:ident, $idx:tt) => {
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
                let is_err = value.has_error();
                *self.state.slots.$idx.lock() = value;
                if is_err {
                    self.state.cancel_siblings($idx);
                    self.state.core.try_claim($idx);
                }
                if self.state.core.child_done() {
                    $state::resolve(&self.state);
                }
            }
        }
    };
}

/// Everything else of one `when_all` arity: state, op, handle, factory,
/// adaptor, and the user-facing builder functions. The atomic protocol
/// itself lives in [`AggCore`] and is shared by every arity.
macro_rules! when_all_arity {
    (
        $n:literal,
        $op:ident, $state:ident, $handle:ident, $factory:ident, $adapt:ident,
        $when:ident, $when_fast:ident, $stage_fn:ident,
        $( ($S:ident, $slot:ident, $in:ident, $idx:tt) ),+
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

            /// Sibling cancellation for a failing child: every child once
            /// the launch mark is up, otherwise only the ones launched
            /// before this slot.
            fn cancel_siblings(&self, my_index: usize) {
                if self.core.launched() {
                    cancel_recorded(&self.controllers, $n);
                } else {
                    cancel_recorded(&self.controllers, my_index);
                }
            }

            /// Consumes the aggregate; exactly one caller reaches this per
            /// run.
            fn resolve(state: &Arc<Self>) {
                acquire_fence();
                let failed = state.core.claimed();
                let parent = state.parent.lock().take();
                let Some(aw) = parent else { return };
                if failed == state.core.none() {
                    tracing::trace!("when_all resolved: all children succeeded");
                    aw.resume(FlowResult::Value($handle {
                        state: Arc::clone(state),
                    }));
                } else {
                    tracing::trace!(failed, "when_all resolved: child failed");
                    aw.resume(FlowResult::Error(E::any_failed(failed)));
                }
            }
        }

        /// Access handle to the child outputs of a resolved aggregate.
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
            /// Moves the child results out, leaving sentinels behind.
            #[must_use]
            pub fn take(self) -> ($(FlowResult<$S::Final, E>,)+) {
                ($(std::mem::take(&mut *self.state.slots.$idx.lock()),)+)
            }
        }

        /// The aggregate awaitable launched by a `when_all` stage.
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

                // Every sub-blueprint must be present before anything runs.
                if !($(op.children.$idx.is_present())&&+) {
                    state.core.mark_launch_failed();
                    drop(state.parent.lock().take());
                    return SubmitOutcome::Rejected;
                }

                $(
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
                )+

                if state.core.mark_launched() == 0 {
                    // Every child completed before the launch mark went up.
                    $state::resolve(state);
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

        /// Pairs the success joiner and failure mapper of a `when_all`
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
            F: Fn($($S::Final,)+) -> FlowResult<Of, E> + Send + Sync + 'static,
            G: Fn(E) -> FlowResult<Of, E> + Send + Sync + 'static,
            Of: Send + 'static,
        {
            fn adapt(&self, result: FlowResult<$handle<$($S,)+ E>, E>) -> FlowResult<Of, E> {
                match result {
                    FlowResult::Value(handle) => match handle.take() {
                        ($(FlowResult::Value($in),)+) => (self.ok)($($in,)+),
                        ($($in,)+) => {
                            // Success implies all values; a stray error slot
                            // maps to its any-failed form.
                            let mut index = $n;
                            $(
                                if index == $n && $in.has_error() {
                                    index = $idx;
                                }
                            )+
                            (self.err)(E::any_failed(index))
                        }
                    },
                    FlowResult::Error(e) => (self.err)(e),
                }
            }
        }

        /// Starts a pipeline that runs the given child blueprints in
        /// parallel and joins their outputs.
        ///
        /// The produced builder's input is the tuple of child inputs; pipe
        /// further stages and `end` onto it as usual. `on_success` joins the
        /// child values, `on_failure` maps the aggregate error; both must
        /// return the same result type. Children run under their own
        /// controllers and a failing child hard-cancels its siblings.
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
            F: Fn($($S::Final,)+) -> FlowResult<Of, E> + Send + Sync + 'static,
            G: Fn(E) -> FlowResult<Of, E> + Send + Sync + 'static,
            Of: Send + 'static,
        {
            $stage_fn(children, executor, on_success, on_failure, true)
        }

        /// The fast variant: children run with no controllers and the
        /// aggregate has no cancel surface. Intended for leaf sub-pipelines
        /// and one-shot invocations.
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
            F: Fn($($S::Final,)+) -> FlowResult<Of, E> + Send + Sync + 'static,
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
            F: Fn($($S::Final,)+) -> FlowResult<Of, E> + Send + Sync + 'static,
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

when_all_slot!(WhenAll2State, (S1, S2), S1, AllSlot2of0, 0);
when_all_slot!(WhenAll2State, (S1, S2), S2, AllSlot2of1, 1);
when_all_arity!(
    2,
    WhenAll2Op, WhenAll2State, AllHandle2, WhenAll2Factory, AllAdapt2,
    when_all2, when_all2_fast, when_all2_stage,
    (S1, AllSlot2of0, in0, 0),
    (S2, AllSlot2of1, in1, 1)
);

when_all_slot!(WhenAll3State, (S1, S2, S3), S1, AllSlot3of0, 0);
when_all_slot!(WhenAll3State, (S1, S2, S3), S2, AllSlot3of1, 1);
when_all_slot!(WhenAll3State, (S1, S2, S3), S3, AllSlot3of2, 2);
when_all_arity!(
    3,
    WhenAll3Op, WhenAll3State, AllHandle3, WhenAll3Factory, AllAdapt3,
    when_all3, when_all3_fast, when_all3_stage,
    (S1, AllSlot3of0, in0, 0),
    (S2, AllSlot3of1, in1, 1),
    (S3, AllSlot3of2, in2, 2)
);
