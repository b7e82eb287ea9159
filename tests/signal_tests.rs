use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use futures::executor::block_on;
use rust_deferred::{combine, observe_signal, CombinatorMode, Error, Signal};

mod common;
use common::setup_tracing;

#[test]
fn bridge_completes_with_first_emission() {
    setup_tracing();
    let signal = Signal::<i32>::new();
    let next = signal.next();
    assert!(next.is_running());

    signal.emit(1);
    signal.emit(2);
    assert_eq!(next.results(), vec![1]);

    let after = signal.next();
    signal.emit(3);
    assert_eq!(after.result(), Some(3));
}

#[test]
fn bridge_cancels_when_signal_destroyed() {
    setup_tracing();
    let signal = Signal::<()>::new();
    let pending = observe_signal(&signal).then(|| "fired").future();

    drop(signal);
    assert!(pending.is_canceled());
    assert!(matches!(block_on(pending), Err(Error::Canceled)));
}

#[test]
fn emission_from_another_thread() {
    setup_tracing();
    let signal = Signal::<String>::new();
    let next = signal.next();

    let emitter = signal.clone();
    thread::spawn(move || emitter.emit("hello".into()))
        .join()
        .unwrap();

    assert_eq!(block_on(next).unwrap(), vec!["hello".to_string()]);
}

#[test]
fn waiting_for_several_signals() {
    setup_tracing();
    let opened = Signal::<()>::new();
    let loaded = Signal::<usize>::new();

    let both = combine(CombinatorMode::FailFast) << opened.next() << loaded.next();
    loaded.emit(10);
    assert!(both.future().is_running());
    opened.emit(());
    assert!(both.future().is_finished());
    assert!(!both.future().is_canceled());
}

#[test]
fn persistent_slots_keep_receiving() {
    setup_tracing();
    let signal = Signal::<usize>::new();
    let total = Arc::new(AtomicUsize::new(0));

    let t = total.clone();
    let id = signal.connect(move |v| {
        t.fetch_add(v, Ordering::SeqCst);
    });
    let once = signal.next();

    for v in 1..=4 {
        signal.emit(v);
    }
    assert_eq!(total.load(Ordering::SeqCst), 10);
    assert_eq!(once.result(), Some(1));
    assert_eq!(signal.slot_count(), 1);

    signal.disconnect(id);
    assert_eq!(signal.slot_count(), 0);
}
