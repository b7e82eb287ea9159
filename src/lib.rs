//! rust-deferred: continuations and combinators over thread-settled futures
//!
//! This crate lets independent pieces of asynchronous work (jobs running on
//! worker threads, one-shot events, anything that eventually produces a value)
//! be composed without blocking and without hand-written thread coordination.
//!
//! Everything revolves around one abstraction, the host [`Future`]: a shared
//! result cell that settles exactly once, either finished (with zero, one or
//! many results) or canceled. On top of it the crate provides:
//!
//! - [`Deferred`] - a resolvable value. Complete it with a value, a batch of
//!   values, or another future; cancel it directly or when another future
//!   finishes. A deferred dropped before settling cancels itself.
//! - [`Observable`] - continuations. `observe(future).then(callback)` runs the
//!   callback once the source finishes and returns a new observable for the
//!   callback's result. Callbacks returning futures are flattened with
//!   [`Observable::and_then`].
//! - [`Combinator`] - fan-in. `combine(mode)` settles once all added futures
//!   settled ([`CombinatorMode::AllSettled`]) or as soon as one is canceled
//!   ([`CombinatorMode::FailFast`]).
//! - [`Context`] - execution contexts. Continuations can be marshalled onto a
//!   thread-affine queue; closing the context cancels continuations that have
//!   not run yet.
//! - [`Signal`] - a minimal event emitter and its bridge into futures.
//!
//! No operation of the library blocks. Futures are settled by whatever thread
//! reports the outcome and callbacks run on that thread (or on the chosen
//! context).
//!
//! # Example
//!
//! ```rust
//! use rust_deferred::{combine, deferred, observe, CombinatorMode};
//!
//! let d = deferred::<i32>();
//! let squared = observe(d.future()).then(|v: i32| v * v).future();
//!
//! d.complete(10);
//! assert_eq!(squared.result(), Some(100));
//!
//! let a = deferred::<i32>();
//! let b = deferred::<String>();
//! let all = combine(CombinatorMode::FailFast) << a.future() << b.future();
//! a.complete(1);
//! b.cancel();
//! assert!(all.future().is_canceled());
//! ```
//!
//! # Blocking work
//!
//! With the default `pool` feature, [`pool::run`] executes a closure on a
//! shared thread pool and hands back a [`Future`] for its result:
//!
//! ```rust
//! # #[cfg(feature = "pool")] {
//! use rust_deferred::{observe, pool};
//!
//! let length = observe(pool::run(|| "hello".to_string()))
//!     .then(|s: String| s.len())
//!     .future();
//!
//! let values = futures::executor::block_on(length).unwrap();
//! assert_eq!(values, vec![5]);
//! # }
//! ```

pub mod combinator;
pub mod config;
pub mod context;
pub mod deferred;
pub mod future;
pub mod observable;
pub mod shape;
pub mod signal;

#[cfg(feature = "pool")]
pub mod pool;

// Re-export core types
pub use combinator::{combine, Combinator, CombinatorMode};
pub use context::{Context, ContextHandle, ContextId, HookId};
pub use deferred::{deferred, Deferred, Source};
pub use error::{Error, Result};
pub use future::{Future, FutureEvent, ListenerId, Outcome, Producer};
pub use observable::{observe, Execution, Observable};
pub use signal::{observe_signal, Signal, SlotId};

#[cfg(feature = "pool")]
pub use pool::{PoolBuilder, ThreadPool};

/// Error types for the crate
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Future was canceled")]
        Canceled,

        #[error("Execution context is closed")]
        ContextClosed,

        #[error("Thread pool is shut down")]
        PoolShutdown,

        #[error("Failed to spawn thread: {0}")]
        Spawn(#[from] std::io::Error),
    }

    pub type Result<T> = std::result::Result<T, Error>;
}
