//! Continuations
//!
//! `observe(future)` wraps a [`Future`] in an [`Observable`], which attaches
//! callbacks that run once the future settles. Every `then`-style call
//! returns a new observable for the callback's result, so pipelines chain:
//!
//! ```rust
//! use rust_deferred::{deferred, observe, Future};
//!
//! let d = deferred::<i32>();
//! let text = observe(d.future())
//!     .then(|v: i32| v + 1)
//!     .and_then(|v: i32| Future::ready(v.to_string()))
//!     .future();
//!
//! d.complete(41);
//! assert_eq!(text.result().as_deref(), Some("42"));
//! ```
//!
//! Exactly one of the completion callback and the cancellation callback runs,
//! once. A canceled source skips the completion callback and cancels the
//! output. A panic inside a callback is caught and cancels the output too.
//!
//! By default callbacks run inline on the thread that settles the source.
//! [`Observable::context`] moves them onto an execution context instead; if
//! that context closes before the callback ran, the output is canceled and
//! the callback never runs.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::context::ContextHandle;
use crate::deferred::{DeferredCore, Hold};
use crate::future::{Future, FutureEvent, Outcome};
use crate::shape::{Callback, IsFuture, ProgressCallback};

/// Where continuation callbacks run
#[derive(Debug, Clone, Default)]
pub enum Execution {
    /// On whichever thread settles the source
    #[default]
    Inline,
    /// Queued on an execution context
    Context(ContextHandle),
}

/// Wrap `future` for attaching continuations
pub fn observe<T>(future: Future<T>) -> Observable<T> {
    Observable::new(future)
}

/// A future plus the execution continuations attached to it use
pub struct Observable<T> {
    future: Future<T>,
    execution: Execution,
}

impl<T> Observable<T> {
    pub fn new(future: Future<T>) -> Self {
        Observable {
            future,
            execution: Execution::Inline,
        }
    }

    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Run callbacks attached from here on `context`.
    ///
    /// Observables produced by those callbacks inherit the context.
    pub fn context(mut self, context: &ContextHandle) -> Self {
        self.execution = Execution::Context(context.clone());
        self
    }

    /// Run callbacks attached from here inline
    pub fn inline(mut self) -> Self {
        self.execution = Execution::Inline;
        self
    }
}

impl<T: Send + 'static> Observable<T> {
    /// Run `callback` once the source finishes.
    ///
    /// The output finishes with the callback's return value. A value-taking
    /// callback on a source that finished without a result cancels the output.
    ///
    /// The callback may take nothing, the result value, or the source future.
    /// The shape is picked through [`Callback`] impls keyed by marker types,
    /// and a closure parameter's type is not inferred from a trait that has
    /// several candidate impls. Value and future callbacks therefore spell out
    /// their argument type:
    ///
    /// ```rust
    /// use rust_deferred::{deferred, observe, Future};
    ///
    /// let d = deferred::<i32>();
    /// let doubled = observe(d.future()).then(|v: i32| v * 2).future();
    /// let counted = observe(d.future()).then(|f: Future<i32>| f.result_count()).future();
    /// let ticked = observe(d.future()).then(|| "done").future();
    ///
    /// d.complete(21);
    /// assert_eq!(doubled.result(), Some(42));
    /// assert_eq!(counted.result(), Some(1));
    /// assert_eq!(ticked.result(), Some("done"));
    /// ```
    pub fn then<C, M>(&self, callback: C) -> Observable<C::Output>
    where
        C: Callback<T, M>,
        C::Output: Send + 'static,
    {
        self.then_or(callback, || {})
    }

    /// Like [`Observable::then`], running `on_canceled` if the source is canceled
    pub fn then_or<C, M, K>(&self, callback: C, on_canceled: K) -> Observable<C::Output>
    where
        C: Callback<T, M>,
        C::Output: Send + 'static,
        K: FnOnce() + Send + 'static,
    {
        self.execute(
            move |source, core| match callback.invoke(source) {
                Some(value) => core.complete(value),
                None => core.cancel(),
            },
            on_canceled,
        )
    }

    /// Run `callback` once the source finishes and follow the future it returns.
    ///
    /// The output settles when the returned future settles, with its results.
    pub fn and_then<C, M>(&self, callback: C) -> Observable<<C::Output as IsFuture>::Item>
    where
        C: Callback<T, M>,
        C::Output: IsFuture,
        <C::Output as IsFuture>::Item: Clone + Send + 'static,
    {
        self.and_then_or(callback, || {})
    }

    /// Like [`Observable::and_then`], running `on_canceled` if the source is canceled
    pub fn and_then_or<C, M, K>(
        &self,
        callback: C,
        on_canceled: K,
    ) -> Observable<<C::Output as IsFuture>::Item>
    where
        C: Callback<T, M>,
        C::Output: IsFuture,
        <C::Output as IsFuture>::Item: Clone + Send + 'static,
        K: FnOnce() + Send + 'static,
    {
        self.execute(
            move |source, core| match callback.invoke(source) {
                Some(next) => core.complete_with(next.into_host()),
                None => core.cancel(),
            },
            on_canceled,
        )
    }

    /// Run `callback` when the source finishes without cancellation
    pub fn on_completed<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(
            move |_, core: &Arc<DeferredCore<()>>| {
                callback();
                core.complete(());
            },
            || {},
        );
        self
    }

    /// Run `callback` when the source is canceled
    pub fn on_canceled<F>(&self, callback: F) -> &Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute(|_, core: &Arc<DeferredCore<()>>| core.complete(()), callback);
        self
    }

    /// Run `callback` whenever the source's progress range or value changes.
    ///
    /// A callback returning `bool` stops being called after returning `false`.
    pub fn on_progress<P, M>(&self, callback: P) -> &Self
    where
        P: ProgressCallback<M>,
    {
        let callback = Arc::new(Mutex::new(callback));
        let stopped = Arc::new(AtomicBool::new(false));
        let execution = self.execution.clone();

        self.future.listen(move |_, event| {
            if !matches!(
                event,
                FutureEvent::ProgressRange { .. } | FutureEvent::ProgressValue(_)
            ) {
                return !stopped.load(Ordering::SeqCst);
            }
            if stopped.load(Ordering::SeqCst) {
                return false;
            }

            let callback = callback.clone();
            let job_stopped = stopped.clone();
            let job = move || {
                if job_stopped.load(Ordering::SeqCst) {
                    return;
                }
                let mut callback = callback.lock().unwrap_or_else(PoisonError::into_inner);
                match catch_unwind(AssertUnwindSafe(|| callback.on_progress())) {
                    Ok(true) => {}
                    Ok(false) => job_stopped.store(true, Ordering::SeqCst),
                    Err(_) => {
                        tracing::warn!("progress callback panicked, unsubscribing");
                        job_stopped.store(true, Ordering::SeqCst);
                    }
                }
            };

            match &execution {
                Execution::Inline => job(),
                Execution::Context(context) => {
                    if context.dispatch(job).is_err() {
                        tracing::warn!("progress callback dropped, context {} is closed", context.name());
                        return false;
                    }
                }
            }
            !stopped.load(Ordering::SeqCst)
        });
        self
    }

    /// Attach a continuation that settles a fresh core from `evaluate`.
    ///
    /// `evaluate` runs when the source finished without cancellation and
    /// must settle the core; `on_canceled` runs if the source was canceled.
    fn execute<R, E, K>(&self, evaluate: E, on_canceled: K) -> Observable<R>
    where
        R: Send + 'static,
        E: FnOnce(&Future<T>, &Arc<DeferredCore<R>>) + Send + 'static,
        K: FnOnce() + Send + 'static,
    {
        let core = DeferredCore::<R>::new();
        let output = Observable {
            future: core.future(),
            execution: self.execution.clone(),
        };
        let hold = core.hold();

        match &self.execution {
            Execution::Inline => {
                self.future.watch(move |source, outcome| {
                    fire(hold, source, outcome, evaluate, on_canceled);
                });
            }
            Execution::Context(context) => {
                let weak = Arc::downgrade(&core);
                let hook = context.on_close(move || {
                    if let Some(core) = weak.upgrade() {
                        tracing::debug!("context closed before continuation ran, canceling");
                        core.cancel();
                    }
                });

                let context = context.clone();
                self.future.watch(move |source, outcome| {
                    let source = source.clone();
                    let job_context = context.clone();
                    let dispatched = context.dispatch(move || {
                        if let Some(id) = hook {
                            job_context.remove_close_hook(id);
                        }
                        fire(hold, &source, outcome, evaluate, on_canceled);
                    });
                    // The rejected job was dropped together with its hold
                    if dispatched.is_err() {
                        tracing::warn!("continuation dropped, context {} is closed", context.name());
                    }
                });
            }
        }

        output
    }
}

impl<T: Clone + Send + 'static> Observable<Future<T>> {
    /// Follow the inner future.
    pub fn flatten(&self) -> Observable<T> {
        self.and_then(|inner: Future<T>| inner)
    }
}

/// Run the side of a continuation matching `outcome`, then let go of `hold`
fn fire<T, R, E, K>(hold: Hold<R>, source: &Future<T>, outcome: Outcome, evaluate: E, on_canceled: K)
where
    E: FnOnce(&Future<T>, &Arc<DeferredCore<R>>),
    K: FnOnce(),
{
    let core = hold.core();
    match outcome {
        Outcome::Finished => {
            if catch_unwind(AssertUnwindSafe(|| evaluate(source, core))).is_err() {
                tracing::warn!("continuation callback panicked, canceling its future");
                core.cancel();
            }
        }
        Outcome::Canceled => {
            if catch_unwind(AssertUnwindSafe(on_canceled)).is_err() {
                tracing::warn!("cancellation callback panicked");
            }
            core.cancel();
        }
    }
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Observable {
            future: self.future.clone(),
            execution: self.execution.clone(),
        }
    }
}

impl<T> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("future", &self.future)
            .field("execution", &self.execution)
            .finish()
    }
}

impl<T> From<Future<T>> for Observable<T> {
    fn from(future: Future<T>) -> Self {
        Observable::new(future)
    }
}
