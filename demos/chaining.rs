//! Chaining continuations across a worker pool and an execution context.
//!
//! Run with `cargo run --example chaining`.

use std::thread;
use std::time::Duration;

use rust_deferred::{deferred, observe, pool, Context, Future};

fn main() -> rust_deferred::Result<()> {
    tracing_subscriber::fmt::init();

    // Results are delivered on a dedicated "ui" context
    let ui = Context::spawn("ui")?;

    let words = pool::run(|| {
        thread::sleep(Duration::from_millis(20));
        "the quick brown fox jumps over the lazy dog".to_string()
    });

    let lengths = observe(words)
        .then(|text: String| text.split_whitespace().map(str::to_string).collect::<Vec<_>>())
        .and_then(|words: Vec<String>| pool::mapped(words, |w| w.len()));

    let report = lengths.context(&ui).then(|lengths: Future<usize>| {
        let lengths = lengths.results();
        tracing::info!(?lengths, "word lengths computed on the ui context");
        lengths.iter().sum::<usize>()
    });

    // A deferred value settled by hand
    let answer = deferred::<u32>();
    let doubled = answer.observe().then(|v: u32| v * 2).future();
    answer.complete(21);

    let total = futures::executor::block_on(report.future())?;
    println!("total letters: {:?}", total);
    println!("doubled answer: {:?}", doubled.result());
    Ok(())
}
