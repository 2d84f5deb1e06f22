//! End-to-end pipeline scenarios: composition, rehoming, awaitables,
//! aggregation, and the failure surfaces.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver as ChanReceiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flowforge::{
    blueprint, when_all2, when_all2_fast, when_any2, Awaitable, CancelKind, ChildSlot, FastRunner,
    Fault, FaultKind, FlowResult, FnReceiver, FromFlowInput, InlineExecutor, OpRef, Operation,
    Runner, SimpleExecutor, SubmitOutcome, Winner2,
};

const WAIT: Duration = Duration::from_secs(5);

/// Channel-backed receiver plus the read side.
fn probe<T: Send + 'static>() -> (
    FnReceiver<impl FnOnce(FlowResult<T, Fault>) + Clone + Send + 'static>,
    ChanReceiver<FlowResult<T, Fault>>,
) {
    let (tx, rx) = channel();
    (
        FnReceiver::new(move |r| {
            tx.send(r).ok();
        }),
        rx,
    )
}

struct Worker {
    exec: Arc<SimpleExecutor>,
    consumer: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn start() -> Self {
        let exec = SimpleExecutor::shared(256);
        let consumer = Some(SimpleExecutor::spawn_consumer(&exec));
        Self { exec, consumer }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        while !self.exec.try_shutdown() {
            thread::yield_now();
        }
        if let Some(h) = self.consumer.take() {
            h.join().ok();
        }
    }
}

/// Awaitable that completes immediately with `input + 1`.
struct PlusOne {
    input: i32,
}

impl Operation for PlusOne {
    type Value = i32;
    type Error = Fault;

    fn submit(aw: &OpRef<Self>) -> SubmitOutcome {
        let value = aw.operation().input + 1;
        aw.resume(FlowResult::value(value));
        SubmitOutcome::Accepted
    }
}

impl FromFlowInput<i32> for PlusOne {
    fn from_input(input: FlowResult<i32, Fault>) -> FlowResult<Self, Fault> {
        input.map_value(|input| Self { input })
    }
}

/// Awaitable that completes with `input * 2` from a helper thread after a
/// delay; cancel is observed as a flag.
struct SlowDouble {
    input: i32,
    delay: Duration,
    cancel_seen: Arc<AtomicBool>,
}

impl Operation for SlowDouble {
    type Value = i32;
    type Error = Fault;

    fn submit(aw: &OpRef<Self>) -> SubmitOutcome {
        // The spawned thread's clone is the backend reference; resume is its
        // final use.
        let backend = Arc::clone(aw);
        thread::spawn(move || {
            thread::sleep(backend.operation().delay);
            let value = backend.operation().input * 2;
            backend.resume(FlowResult::value(value));
        });
        SubmitOutcome::Accepted
    }

    fn cancel(&self) {
        self.cancel_seen.store(true, Ordering::Release);
    }
}

impl FromFlowInput<i32> for SlowDouble {
    fn from_input(input: FlowResult<i32, Fault>) -> FlowResult<Self, Fault> {
        input.map_value(|input| Self {
            input,
            delay: Duration::from_millis(25),
            cancel_seen: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Awaitable whose backend always refuses submission.
struct NeverStarts;

impl Operation for NeverStarts {
    type Value = i32;
    type Error = Fault;

    fn submit(_aw: &OpRef<Self>) -> SubmitOutcome {
        SubmitOutcome::Rejected
    }
}

impl FromFlowInput<i32> for NeverStarts {
    fn from_input(input: FlowResult<i32, Fault>) -> FlowResult<Self, Fault> {
        input.map_value(|_| Self)
    }
}

#[test]
fn s1_sync_chain_runs_on_the_calling_thread() {
    let bp = blueprint::<i32, Fault>()
        .transform(|x| x + 1)
        .transform(|x| x * 2)
        .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch(5);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().into_value(), Some(12));
}

#[test]
fn s2_via_rehomes_onto_the_worker() {
    let worker = Worker::start();
    let ran_on_worker = Arc::new(AtomicBool::new(false));

    let bp = blueprint::<i32, Fault>()
        .via(worker.exec.clone())
        .transform({
            let seen = ran_on_worker.clone();
            move |x| {
                seen.store(true, Ordering::Release);
                x + 1
            }
        })
        .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch(7);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().into_value(), Some(8));
    assert!(ran_on_worker.load(Ordering::Acquire));
}

#[test]
fn s3_chained_awaitables_add_twice() {
    let worker = Worker::start();
    let bp = blueprint::<i32, Fault>()
        .await_on::<PlusOne>(worker.exec.clone())
        .await_on::<PlusOne>(worker.exec.clone())
        .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch(5);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().into_value(), Some(7));
}

#[test]
fn s4_when_all_joins_both_children() {
    let worker = Worker::start();
    let left = blueprint::<i32, Fault>().transform(|x| x + 10).end();
    let right = blueprint::<i32, Fault>().transform(|x| x + 20).end();

    let bp = when_all2(
        (left, right),
        worker.exec.clone(),
        |a: i32, b: i32| FlowResult::value(a + b),
        |e| FlowResult::<i32, Fault>::error(e),
    )
    .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch((1, 2));
    assert_eq!(rx.recv_timeout(WAIT).unwrap().into_value(), Some(33));
}

#[test]
fn s5_when_any_first_value_wins() {
    let worker = Worker::start();
    let left = blueprint::<i32, Fault>().transform(|x| x + 100).end();
    let right = blueprint::<i32, Fault>().transform(|x| x + 200).end();

    let bp = when_any2(
        (left, right),
        worker.exec.clone(),
        |winner: Winner2<i32, i32>| match winner {
            Winner2::First(v) | Winner2::Second(v) => FlowResult::value(v),
        },
        |e| FlowResult::<i32, Fault>::error(e),
    )
    .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch((1, 2));
    let got = rx.recv_timeout(WAIT).unwrap().into_value().unwrap();
    assert!(got == 101 || got == 202, "unexpected winner value {got}");
}

#[test]
fn s6_refused_submission_surfaces_downstream() {
    let worker = Worker::start();
    let bp = blueprint::<i32, Fault>()
        .await_on::<NeverStarts>(worker.exec.clone())
        .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch(9);
    let got = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(
        got.into_error().unwrap().kind(),
        FaultKind::SubmissionFailed
    );
}

#[test]
fn s7_when_all_with_vacant_child_refuses_to_launch() {
    let worker = Worker::start();
    let left = blueprint::<i32, Fault>().transform(|x| x + 10).end();
    let right = blueprint::<i32, Fault>().transform(|x| x + 20).end();

    let bp = when_all2(
        (ChildSlot::vacated(left), ChildSlot::from(right)),
        worker.exec.clone(),
        |a: i32, b: i32| FlowResult::value(a + b),
        |e| FlowResult::<i32, Fault>::error(e),
    )
    .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch((7, 1));
    let got = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(
        got.into_error().unwrap().kind(),
        FaultKind::SubmissionFailed
    );
}

#[test]
fn s8_when_any_skips_vacant_children() {
    let worker = Worker::start();
    let left = blueprint::<i32, Fault>().transform(|x| x + 999).end();
    let right = blueprint::<i32, Fault>().transform(|x| x + 100).end();

    let bp = when_any2(
        (ChildSlot::vacated(left), ChildSlot::from(right)),
        worker.exec.clone(),
        |winner: Winner2<i32, i32>| match winner {
            Winner2::First(v) | Winner2::Second(v) => FlowResult::value(v),
        },
        |e| FlowResult::<i32, Fault>::error(e),
    )
    .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch((7, 1));
    assert_eq!(rx.recv_timeout(WAIT).unwrap().into_value(), Some(101));
}

#[test]
fn s9_cancel_races_a_delayed_awaitable() {
    for _ in 0..16 {
        let worker = Worker::start();
        let bp = blueprint::<i32, Fault>()
            .await_on::<SlowDouble>(worker.exec.clone())
            .end();

        let (recv, rx) = probe();
        let runner = Runner::new(bp, recv);
        let controller = runner.launch(21);

        thread::sleep(Duration::from_millis(10));
        controller.cancel(true);

        let got = rx.recv_timeout(WAIT).unwrap();
        match got {
            FlowResult::Value(v) => assert_eq!(v, 42),
            FlowResult::Error(e) => {
                assert_eq!(e.kind(), FaultKind::Canceled(CancelKind::Hard));
            }
        }
        // Exactly one delivery: nothing else may arrive.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }
}

#[test]
fn when_all_fast_variant_joins_without_controllers() {
    let worker = Worker::start();
    let left = blueprint::<i32, Fault>().transform(|x| x * 3).end();
    let right = blueprint::<i32, Fault>().transform(|x| x * 5).end();

    let bp = when_all2_fast(
        (left, right),
        worker.exec.clone(),
        |a: i32, b: i32| FlowResult::value(a + b),
        |e| FlowResult::<i32, Fault>::error(e),
    )
    .end();

    let (recv, rx) = probe();
    FastRunner::new(bp, recv).run((2, 2));
    assert_eq!(rx.recv_timeout(WAIT).unwrap().into_value(), Some(16));
}

#[test]
fn when_all_child_failure_maps_to_any_failed() {
    let worker = Worker::start();
    let ok = blueprint::<i32, Fault>().transform(|x| x + 1).end();
    let bad = blueprint::<i32, Fault>()
        .then(|_r: FlowResult<i32, Fault>| {
            FlowResult::<i32, Fault>::error(Fault::user("child refused"))
        })
        .end();

    let bp = when_all2(
        (ok, bad),
        worker.exec.clone(),
        |a: i32, b: i32| FlowResult::value(a + b),
        |e| FlowResult::<i32, Fault>::error(e),
    )
    .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch((1, 2));
    let got = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(got.into_error().unwrap().kind(), FaultKind::AnyFailed(1));
}

#[test]
fn when_any_all_failed_when_no_child_produces_a_value() {
    let worker = Worker::start();
    let bad1 = blueprint::<i32, Fault>()
        .then(|_r: FlowResult<i32, Fault>| FlowResult::<i32, Fault>::error(Fault::user("left")))
        .end();
    let bad2 = blueprint::<i32, Fault>()
        .then(|_r: FlowResult<i32, Fault>| FlowResult::<i32, Fault>::error(Fault::user("right")))
        .end();

    let bp = when_any2(
        (bad1, bad2),
        worker.exec.clone(),
        |winner: Winner2<i32, i32>| match winner {
            Winner2::First(v) | Winner2::Second(v) => FlowResult::value(v),
        },
        |e| FlowResult::<i32, Fault>::error(e),
    )
    .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch((1, 2));
    let got = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(got.into_error().unwrap().kind(), FaultKind::AllFailed);
}

#[test]
fn inline_executor_keeps_a_calc_pipeline_synchronous() {
    let bp = blueprint::<i32, Fault>()
        .via(InlineExecutor::handle())
        .transform(|x| x - 3)
        .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch(10);
    // Inline dispatch: the result is already there.
    assert_eq!(rx.try_recv().unwrap().into_value(), Some(7));
}

#[test]
fn awaitable_construction_failure_surfaces_as_creation_error() {
    struct Picky;

    impl Operation for Picky {
        type Value = i32;
        type Error = Fault;

        fn submit(aw: &OpRef<Self>) -> SubmitOutcome {
            aw.resume(FlowResult::value(0));
            SubmitOutcome::Accepted
        }
    }

    impl FromFlowInput<i32> for Picky {
        fn from_input(input: FlowResult<i32, Fault>) -> FlowResult<Self, Fault> {
            match input {
                FlowResult::Value(v) if v >= 0 => FlowResult::Value(Self),
                FlowResult::Value(_) => FlowResult::Error(Fault::new(FaultKind::AwaitableCreation)),
                FlowResult::Error(e) => FlowResult::Error(e),
            }
        }
    }

    let worker = Worker::start();
    let bp = blueprint::<i32, Fault>()
        .await_on::<Picky>(worker.exec.clone())
        .end();

    let (recv, rx) = probe();
    Runner::new(bp, recv).launch(-5);
    let got = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(
        got.into_error().unwrap().kind(),
        FaultKind::AwaitableCreation
    );

    let _ = Awaitable::new(Picky); // exercising the public constructor
}
