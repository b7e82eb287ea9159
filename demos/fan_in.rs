//! Waiting for several independent sources with a combinator.
//!
//! Run with `cargo run --example fan_in`.

use std::thread;
use std::time::Duration;

use rust_deferred::{combine, observe, pool, CombinatorMode, Signal};

fn main() -> rust_deferred::Result<()> {
    tracing_subscriber::fmt::init();

    let config_loaded = Signal::<String>::new();
    let config = config_loaded.next();

    let cache = pool::run(|| {
        thread::sleep(Duration::from_millis(10));
        vec![1u8, 2, 3]
    });
    let index = pool::mapped((0..8).collect::<Vec<u32>>(), |shard| shard * 100);

    let ready = combine(CombinatorMode::FailFast) << config.clone() << cache.clone() << index.clone();
    observe(ready.future()).on_progress(move || {
        tracing::info!("startup progress");
    });

    let emitter = config_loaded.clone();
    thread::spawn(move || emitter.emit("release".to_string()));

    futures::executor::block_on(ready.future())?;
    println!("config: {:?}", config.result());
    println!("cache entries: {}", cache.results().concat().len());
    println!("index shards: {:?}", index.results());

    // A source that never arrives cancels the whole startup
    let missing = Signal::<()>::new();
    let doomed = combine(CombinatorMode::AllSettled) << missing.next() << pool::run(|| ());
    drop(missing);
    match futures::executor::block_on(doomed.future()) {
        Ok(_) => println!("unexpected success"),
        Err(e) => println!("startup aborted: {}", e),
    }
    Ok(())
}
