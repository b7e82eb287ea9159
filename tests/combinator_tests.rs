use std::thread;
use std::time::Duration;

use futures::executor::block_on;
use rust_deferred::{combine, deferred, observe, CombinatorMode, Error, Future};

mod common;
use common::setup_tracing;

#[test]
fn fail_fast_cancels_when_any_cancels() {
    setup_tracing();
    let d1 = deferred::<i32>();
    let d2 = deferred::<String>();
    let c = combine(CombinatorMode::FailFast);
    c.add(d1.future());
    c.add(d2.future());

    d1.complete(1);
    d2.cancel();
    assert!(c.future().is_canceled());
}

#[test]
fn all_settled_waits_then_cancels() {
    setup_tracing();
    let d1 = deferred::<i32>();
    let d2 = deferred::<String>();
    let d3 = deferred::<f64>();
    let c = combine(CombinatorMode::AllSettled);
    c.add(d1.future()).add(d2.future()).add(d3.future());

    d1.complete(1);
    d2.cancel();
    assert!(c.future().is_running());

    d3.complete(0.5);
    assert!(c.future().is_finished());
    assert!(c.future().is_canceled());
}

#[test]
fn all_settled_completes_without_cancellations() {
    setup_tracing();
    let inputs: Vec<_> = (0..5).map(|_| deferred::<usize>()).collect();
    let c = combine(CombinatorMode::AllSettled);
    for d in &inputs {
        c.add(d.future());
    }

    for (i, d) in inputs.iter().enumerate() {
        assert_eq!(c.future().progress_value(), i as i32);
        d.complete(i);
    }
    assert!(c.future().is_finished());
    assert!(!c.future().is_canceled());
    assert_eq!(c.future().progress_maximum(), 5);
}

#[test]
fn heterogeneous_operator_chain() {
    setup_tracing();
    let number = deferred::<i32>();
    let text = deferred::<String>();
    let unit = deferred::<()>();

    let c = combine(CombinatorMode::FailFast) << &number << text.future() << &unit;
    assert_eq!(c.count(), 3);

    unit.complete(());
    text.complete("x".into());
    assert!(c.future().is_running());
    number.complete(7);
    assert!(block_on(c.future()).is_ok());
}

#[test]
fn copies_share_state_and_late_adds_are_ignored() {
    setup_tracing();
    let d = deferred::<i32>();
    let c = combine(CombinatorMode::FailFast);
    let copy = c.clone();
    c.add(d.future());
    d.complete(1);

    let late = deferred::<i32>();
    copy.add(late.future());
    late.cancel();

    assert!(copy.future().ptr_eq(&c.future()));
    assert!(c.future().is_finished());
    assert!(!c.future().is_canceled());
}

#[test]
fn settles_after_handles_dropped() {
    setup_tracing();
    let d1 = deferred::<i32>();
    let d2 = deferred::<i32>();
    let f = (combine(CombinatorMode::AllSettled) << &d1 << &d2).future();

    d1.complete(1);
    assert!(f.is_running());
    d2.complete(2);
    assert!(f.is_finished());
    assert!(!f.is_canceled());
}

#[test]
fn empty_combinator_cancels_on_drop() {
    setup_tracing();
    let f = combine(CombinatorMode::FailFast).future();
    assert!(matches!(block_on(f), Err(Error::Canceled)));
}

#[test]
fn constituents_settled_from_many_threads() {
    setup_tracing();
    let inputs: Vec<_> = (0..16).map(|_| deferred::<usize>()).collect();
    let c = combine(CombinatorMode::AllSettled);
    for d in &inputs {
        c.add(d.future());
    }
    let f = c.future();
    drop(c);

    let workers: Vec<_> = inputs
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis((i % 4) as u64));
                d.complete(i);
            })
        })
        .collect();

    assert!(block_on(f.clone()).is_ok());
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(f.progress_value(), 16);
}

#[test]
fn combined_future_chains() {
    setup_tracing();
    let a = deferred::<i32>();
    let b = deferred::<i32>();
    let (fa, fb) = (a.future(), b.future());

    let c = combine(CombinatorMode::FailFast) << a.future() << b.future();
    let sum = c
        .observe()
        .then(move || fa.result().unwrap_or(0) + fb.result().unwrap_or(0))
        .future();

    a.complete(2);
    b.complete(3);
    assert_eq!(sum.result(), Some(5));
}

#[test]
fn add_already_canceled_future() {
    setup_tracing();
    let d = deferred::<i32>();
    let c = combine(CombinatorMode::AllSettled) << &d << Future::<u8>::canceled();

    assert!(c.future().is_running());
    d.complete(1);
    assert!(c.future().is_canceled());

    let canceled = observe(c.future()).then(|| "unreachable").future();
    assert!(canceled.is_canceled());
}
