//! Universal pipeline invariants under composition, cancellation schedules,
//! and randomized executor choices.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flowforge::util::DetRng;
use flowforge::{
    blueprint, CancelKind, Controller, Fault, FaultKind, FlowResult, FnReceiver, FromFlowInput,
    OpRef, Operation, Runner, SimpleExecutor, SubmitOutcome,
};

const WAIT: Duration = Duration::from_secs(5);

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

/// Completes with `input + 1` after a caller-chosen delay.
struct DelayedInc {
    input: i64,
    delay_ms: u64,
}

impl Operation for DelayedInc {
    type Value = i64;
    type Error = Fault;

    fn submit(aw: &OpRef<Self>) -> SubmitOutcome {
        let backend = Arc::clone(aw);
        thread::spawn(move || {
            if backend.operation().delay_ms > 0 {
                thread::sleep(Duration::from_millis(backend.operation().delay_ms));
            }
            let value = backend.operation().input + 1;
            backend.resume(FlowResult::value(value));
        });
        SubmitOutcome::Accepted
    }
}

impl FromFlowInput<i64> for DelayedInc {
    fn from_input(input: FlowResult<i64, Fault>) -> FlowResult<Self, Fault> {
        input.map_value(|input| Self {
            input,
            delay_ms: 5,
        })
    }
}

#[test]
fn composition_typing_carries_values_across_types() {
    // i32 -> String -> usize: every hop typechecked at build time.
    let bp = blueprint::<i32, Fault>()
        .transform(|x| format!("{x}{x}"))
        .transform(|s: String| s.len())
        .end();

    let (tx, rx) = channel();
    Runner::new(
        bp,
        FnReceiver::new(move |r: FlowResult<usize, Fault>| {
            tx.send(r).ok();
        }),
    )
    .launch(42);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().into_value(), Some(4));
}

#[test]
fn calc_chaining_equals_composed_function() {
    // transform(f) | transform(g) is observationally g(f(x)).
    let chained = blueprint::<i64, Fault>()
        .transform(|x| x + 3)
        .transform(|x| x * 7)
        .end();
    let composed = blueprint::<i64, Fault>().transform(|x| (x + 3) * 7).end();

    for input in [-4i64, 0, 1, 99] {
        let (tx_a, rx_a) = channel();
        Runner::new(
            chained.clone(),
            FnReceiver::new(move |r: FlowResult<i64, Fault>| {
                tx_a.send(r).ok();
            }),
        )
        .launch(input);
        let (tx_b, rx_b) = channel();
        Runner::new(
            composed.clone(),
            FnReceiver::new(move |r: FlowResult<i64, Fault>| {
                tx_b.send(r).ok();
            }),
        )
        .launch(input);
        assert_eq!(
            rx_a.recv_timeout(WAIT).unwrap().into_value(),
            rx_b.recv_timeout(WAIT).unwrap().into_value()
        );
    }
}

#[test]
fn errors_bypass_calc_callables_unchanged() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let bp = blueprint::<i64, Fault>()
        .then(|_r: FlowResult<i64, Fault>| FlowResult::<i64, Fault>::error(Fault::user("poisoned")))
        .transform(move |x: i64| {
            seen.fetch_add(1, Ordering::Relaxed);
            x + 1
        })
        .transform(|x| x * 2)
        .end();

    let (tx, rx) = channel();
    Runner::new(
        bp,
        FnReceiver::new(move |r: FlowResult<i64, Fault>| {
            tx.send(r).ok();
        }),
    )
    .launch(1);

    let got = rx.recv_timeout(WAIT).unwrap().into_error().unwrap();
    assert_eq!(got.kind(), FaultKind::User);
    assert_eq!(got.message(), Some("poisoned"));
    assert_eq!(calls.load(Ordering::Relaxed), 0);
}

#[test]
fn on_error_converts_error_back_to_value() {
    let bp = blueprint::<i64, Fault>()
        .then(|_r: FlowResult<i64, Fault>| FlowResult::<i64, Fault>::error(Fault::user("recover me")))
        .on_error(|_e| FlowResult::value(-1))
        .transform(|x| x * 10)
        .end();

    let (tx, rx) = channel();
    Runner::new(
        bp,
        FnReceiver::new(move |r: FlowResult<i64, Fault>| {
            tx.send(r).ok();
        }),
    )
    .launch(5);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().into_value(), Some(-10));
}

#[test]
fn catch_fault_recovers_by_source_type() {
    #[derive(Debug, thiserror::Error)]
    #[error("flaky backend")]
    struct Flaky;

    let bp = blueprint::<i64, Fault>()
        .then(|_r: FlowResult<i64, Fault>| {
            FlowResult::<i64, Fault>::error(Fault::with_source(Flaky))
        })
        .catch_fault::<Flaky, _, i64>(|_flaky| -7)
        .end();

    let (tx, rx) = channel();
    Runner::new(
        bp,
        FnReceiver::new(move |r: FlowResult<i64, Fault>| {
            tx.send(r).ok();
        }),
    )
    .launch(1);
    assert_eq!(rx.recv_timeout(WAIT).unwrap().into_value(), Some(-7));
}

#[test]
fn cancel_before_start_delivers_hard_cancel_error() {
    let worker = Worker::start();
    let bp = blueprint::<i64, Fault>()
        .await_on::<DelayedInc>(worker.exec.clone())
        .transform(|x| x * 2)
        .end();

    let (tx, rx) = channel();
    let runner = Runner::new(
        bp,
        FnReceiver::new(move |r: FlowResult<i64, Fault>| {
            tx.send(r).ok();
        }),
    );

    let controller = Controller::shared();
    controller.cancel(true);
    runner.launch_with(controller, 3);

    let got = rx.recv_timeout(WAIT).unwrap().into_error().unwrap();
    assert_eq!(got.kind(), FaultKind::Canceled(CancelKind::Hard));
}

#[test]
fn soft_cancel_still_reaches_the_receiver_through_all_stages() {
    let worker = Worker::start();
    let bp = blueprint::<i64, Fault>()
        .await_on::<DelayedInc>(worker.exec.clone())
        .transform(|x| x * 2)
        .end();

    let (tx, rx) = channel();
    let runner = Runner::new(
        bp,
        FnReceiver::new(move |r: FlowResult<i64, Fault>| {
            tx.send(r).ok();
        }),
    );

    let controller = Controller::shared();
    controller.cancel(false);
    runner.launch_with(controller, 3);

    let got = rx.recv_timeout(WAIT).unwrap().into_error().unwrap();
    assert_eq!(got.kind(), FaultKind::Canceled(CancelKind::Soft));
}

#[test]
fn exactly_one_delivery_under_racing_cancel_schedules() {
    let worker = Worker::start();
    let bp = blueprint::<i64, Fault>()
        .await_on::<DelayedInc>(worker.exec.clone())
        .transform(|x| x + 100)
        .end();

    let mut rng = DetRng::new(0xF10E);
    for _ in 0..48 {
        let (tx, rx) = channel();
        let runner = Runner::new(
            bp.clone(),
            FnReceiver::new(move |r: FlowResult<i64, Fault>| {
                tx.send(r).ok();
            }),
        );
        let controller = runner.launch(1);

        let cancel_delay = rng.below(8) as u64;
        let force = rng.chance(1, 2);
        let canceler = thread::spawn(move || {
            if cancel_delay > 0 {
                thread::sleep(Duration::from_millis(cancel_delay));
            }
            controller.cancel(force);
        });

        let got = rx.recv_timeout(WAIT).unwrap();
        match got {
            // Natural completion made it through the whole chain.
            FlowResult::Value(v) => assert_eq!(v, 102),
            FlowResult::Error(e) => {
                assert!(
                    matches!(e.kind(), FaultKind::Canceled(_)),
                    "unexpected error kind {:?}",
                    e.kind()
                );
            }
        }
        assert!(
            rx.recv_timeout(Duration::from_millis(30)).is_err(),
            "receiver observed a second delivery"
        );
        canceler.join().unwrap();
    }
}

#[test]
fn repeated_launches_each_deliver_once() {
    let worker = Worker::start();
    let bp = blueprint::<i64, Fault>()
        .via(worker.exec.clone())
        .transform(|x| x + 1)
        .end();

    let deliveries = Arc::new(AtomicUsize::new(0));
    let counter = deliveries.clone();
    let runner = Runner::new(
        bp,
        FnReceiver::new(move |_r: FlowResult<i64, Fault>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );

    for i in 0..32 {
        runner.launch(i);
    }
    let deadline = std::time::Instant::now() + WAIT;
    while deliveries.load(Ordering::SeqCst) != 32 {
        assert!(std::time::Instant::now() < deadline, "missing deliveries");
        thread::yield_now();
    }
}

#[test]
fn randomized_pipeline_schedules_preserve_delivery_and_typing() {
    // Vary input, executor hops, cancel timing, and cancel strength; every
    // schedule must produce exactly one receiver value of the right shape.
    let worker_a = Worker::start();
    let worker_b = Worker::start();

    let mut rng = DetRng::new(0xDA7A_F10E);
    for round in 0..40 {
        let exec = if rng.chance(1, 2) {
            worker_a.exec.clone()
        } else {
            worker_b.exec.clone()
        };
        let hop = if rng.chance(1, 2) {
            worker_a.exec.clone()
        } else {
            worker_b.exec.clone()
        };

        let bp = blueprint::<i64, Fault>()
            .transform(|x| x ^ 1)
            .via(hop)
            .await_on::<DelayedInc>(exec)
            .transform(|x| x.wrapping_mul(3))
            .end();

        let (tx, rx) = channel();
        let runner = Runner::new(
            bp,
            FnReceiver::new(move |r: FlowResult<i64, Fault>| {
                tx.send(r).ok();
            }),
        );

        let input = rng.next_u64() as i64 % 1_000;
        let controller = runner.launch(input);

        if rng.chance(1, 3) {
            let force = rng.chance(1, 2);
            let delay = rng.below(6) as u64;
            thread::spawn(move || {
                if delay > 0 {
                    thread::sleep(Duration::from_millis(delay));
                }
                controller.cancel(force);
            });
        }

        let got = rx.recv_timeout(WAIT).unwrap();
        match got {
            FlowResult::Value(v) => {
                assert_eq!(v, ((input ^ 1) + 1).wrapping_mul(3), "round {round}");
            }
            FlowResult::Error(e) => {
                assert!(
                    matches!(e.kind(), FaultKind::Canceled(_)),
                    "round {round}: unexpected error {:?}",
                    e.kind()
                );
            }
        }
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());
    }
}

#[test]
fn duplicate_backend_resumes_collapse_to_one_delivery() {
    // A misbehaving backend that resumes from two racing threads: the
    // waiting→done CAS lets exactly one through, so the continuation and
    // the receiver fire once.
    struct DoubleResume;

    impl Operation for DoubleResume {
        type Value = i64;
        type Error = Fault;

        fn submit(aw: &OpRef<Self>) -> SubmitOutcome {
            for value in [10i64, 20] {
                let backend = Arc::clone(aw);
                thread::spawn(move || backend.resume(FlowResult::value(value)));
            }
            SubmitOutcome::Accepted
        }
    }

    impl FromFlowInput<i64> for DoubleResume {
        fn from_input(input: FlowResult<i64, Fault>) -> FlowResult<Self, Fault> {
            input.map_value(|_| Self)
        }
    }

    let worker = Worker::start();
    let bp = blueprint::<i64, Fault>()
        .await_on::<DoubleResume>(worker.exec.clone())
        .end();

    for _ in 0..32 {
        let (tx, rx) = channel();
        Runner::new(
            bp.clone(),
            FnReceiver::new(move |r: FlowResult<i64, Fault>| {
                tx.send(r).ok();
            }),
        )
        .launch(0);

        let got = rx.recv_timeout(WAIT).unwrap().into_value().unwrap();
        assert!(got == 10 || got == 20);
        assert!(
            rx.recv_timeout(Duration::from_millis(30)).is_err(),
            "second resume leaked through"
        );
    }
}
