#![allow(dead_code)]

use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

use rust_deferred::Future;

static INIT: Once = Once::new();

/// Sets up the tracing subscriber for tests, ensuring it's only initialized once.
pub fn setup_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt::init();
    });
}

/// Polls until `future` finished or `timeout` elapsed; returns whether it finished.
pub fn wait_finished<T>(future: &Future<T>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !future.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}
