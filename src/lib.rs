//! Flowforge: strongly-typed asynchronous dataflow pipelines.
//!
//! # Overview
//!
//! A pipeline is composed once as an immutable, compile-time-typed
//! [`Blueprint`] of stages, then executed any number of times by a runner
//! against pluggable executors. Data flows downstream from an input value
//! through calc, via, and await stages into a terminal receiver; errors are
//! values riding the same [`FlowResult`] carrier, and cancellation is a
//! protocol, not a silent drop.
//!
//! # Core guarantees
//!
//! - **Exactly-once delivery**: the receiver observes exactly one result per
//!   run, on success, failure, cancellation, and every setup-failure path
//! - **Exactly-once continuation**: each awaitable's registered next step
//!   runs once; completion and cancellation race through a single CAS
//! - **Race-free cancel handoff**: the controller's lock-set-handler
//!   protocol ensures the in-flight awaitable's cancel surface is invoked
//!   and released exactly once, whichever side wins
//! - **Aggregation resumes once**: `when_all`/`when_any` resume their parent
//!   pipeline exactly once, with at-most-once completion semantics
//!
//! # Composition
//!
//! ```
//! use flowforge::{blueprint, Fault, FnReceiver, Runner};
//!
//! let bp = blueprint::<i32, Fault>()
//!     .transform(|x| x + 1)
//!     .transform(|x| x * 2)
//!     .end();
//!
//! let (tx, rx) = std::sync::mpsc::channel();
//! let runner = Runner::new(bp, FnReceiver::new(move |r| {
//!     tx.send(r).ok();
//! }));
//! runner.launch(5);
//! assert_eq!(rx.recv().unwrap().into_value(), Some(12));
//! ```
//!
//! # Module structure
//!
//! - [`result`](FlowResult): the value/error carrier between stages
//! - [`error`](ErrorFamily): error customization points and the [`Fault`]
//!   default family
//! - [`builder`](FlowBuilder): typed blueprint composition
//! - [`runner`](Runner): execution cursors, receivers, the fast variant
//! - [`controller`](Controller): per-run cancellation
//! - [`awaitable`](Awaitable): the async operation contract
//! - [`aggregate`](when_all2): parallel sub-pipeline aggregation
//! - [`task`](Task) / [`executor`](SimpleExecutor): the executor boundary
//! - [`collect`](Collector2): polling fork/join board
//! - [`util`]: deterministic RNG for randomized tests

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::type_complexity)]
#![allow(clippy::doc_markdown)]

mod aggregate;
mod awaitable;
mod backoff;
mod builder;
mod collect;
mod controller;
mod error;
mod executor;
mod result;
mod runner;
mod stage;
mod task;
pub mod util;

pub use aggregate::{
    when_all2, when_all2_fast, when_all3, when_all3_fast, when_any2, when_any2_fast, when_any3,
    when_any3_fast, AllAdapt2, AllAdapt3, AllHandle2, AllHandle3, AnyAdapt2, AnyAdapt3, AnyHandle2,
    AnyHandle3, ChildSlot, WhenAll2Factory, WhenAll2Op, WhenAll3Factory, WhenAll3Op,
    WhenAny2Factory, WhenAny2Op, WhenAny3Factory, WhenAny3Op, Winner2, Winner3,
};
pub use awaitable::{
    Awaitable, FromFlowInput, OpRef, Operation, SubmitError, SubmitOutcome,
};
pub use backoff::Backoff;
pub use builder::{
    blueprint, AcceptsVia, AsyncMark, AwaitLink, Blueprint, CalcLink, CalcMark, Compose,
    FlowBuilder, RootLink, ViaLink, ViaMark,
};
pub use collect::{Collector2, CollectorSlot0, CollectorSlot1};
pub use controller::{CancelTarget, Controller};
pub use error::{CancelKind, ErrorFamily, Fault, FaultKind};
pub use executor::{InlineExecutor, SimpleExecutor};
pub use result::FlowResult;
pub use runner::{DiscardReceiver, FastRunner, FnReceiver, Receiver, Runner};
pub use stage::{
    Adapt, AwaitStage, CalcFn, CalcStage, CatchFn, EndFn, EndStage, FromInputFactory,
    IdentityAdapt, IdentityFn, OnErrorFn, OpFactory, Stage, ThenFn, TransformFn, ViaStage,
};
pub use task::{Executor, ExecutorHandle, Task};
