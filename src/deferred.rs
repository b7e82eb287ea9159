//! Resolvable values
//!
//! A [`Deferred`] is the writable side of a [`Future`] with a lifetime rule:
//! the future it hands out is guaranteed to settle. It settles when one of
//! the `complete*`/`cancel*` methods wins, or, if every owner handle and every
//! pending operation (such as [`Deferred::complete_with`]) went away first,
//! by canceling itself.
//!
//! Internally this is a `DeferredCore` counting pending holds. Owner handles
//! share one hold between them, and each forwarding operation takes its own.
//! When the count drops to zero on an unsettled core, the core cancels.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::future::{Future, FutureEvent, Outcome, Producer};
use crate::observable::{observe, Observable};

struct Lifecycle {
    /// Set by the first settle call; later calls are no-ops
    resolved: bool,
    /// Outstanding holds (owner handles count as one)
    pending: usize,
}

/// Settlement latch plus pending-hold count shared by deferred values,
/// continuations and combinators.
pub(crate) struct DeferredCore<T> {
    producer: Producer<T>,
    lifecycle: Mutex<Lifecycle>,
}

/// A counted reference keeping a `DeferredCore` from being abandoned.
///
/// Dropping the last hold of an unsettled core cancels it.
pub(crate) struct Hold<T> {
    core: Arc<DeferredCore<T>>,
}

impl<T> Hold<T> {
    pub(crate) fn core(&self) -> &Arc<DeferredCore<T>> {
        &self.core
    }
}

impl<T> Drop for Hold<T> {
    fn drop(&mut self) {
        self.core.release();
    }
}

impl<T> DeferredCore<T> {
    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn future(&self) -> Future<T> {
        self.producer.future()
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.lifecycle().resolved
    }

    /// Take a hold on the core
    pub(crate) fn hold(self: &Arc<Self>) -> Hold<T> {
        self.lifecycle().pending += 1;
        Hold { core: self.clone() }
    }

    /// Flip the latch; true for the caller that won
    fn settle(&self) -> bool {
        let mut lifecycle = self.lifecycle();
        if lifecycle.resolved {
            return false;
        }
        lifecycle.resolved = true;
        true
    }

    pub(crate) fn complete(&self, value: T) {
        if !self.settle() {
            return;
        }
        self.producer.report_started();
        self.producer.report_result(value);
        self.producer.report_finished();
    }

    pub(crate) fn complete_all(&self, values: Vec<T>) {
        if !self.settle() {
            return;
        }
        self.producer.report_started();
        self.producer.report_results(values);
        self.producer.report_finished();
    }

    pub(crate) fn cancel(&self) {
        if !self.settle() {
            return;
        }
        self.producer.report_canceled();
        self.producer.report_finished();
    }

    pub(crate) fn report_result_at(&self, index: usize, value: T) {
        if self.is_settled() {
            return;
        }
        self.producer.report_result_at(index, value);
    }

    pub(crate) fn set_progress_range(&self, min: i32, max: i32) {
        self.producer.set_progress_range(min, max);
    }

    pub(crate) fn set_progress_value(&self, value: i32) {
        self.producer.set_progress_value(value);
    }

    fn release(&self) {
        let abandoned = {
            let mut lifecycle = self.lifecycle();
            lifecycle.pending = lifecycle.pending.saturating_sub(1);
            lifecycle.pending == 0 && !lifecycle.resolved
        };

        if abandoned {
            tracing::debug!("deferred abandoned before settling, canceling");
            self.cancel();
        }
    }
}

impl<T: Send + 'static> DeferredCore<T> {
    /// A fresh core with no holds
    pub(crate) fn new() -> Arc<Self> {
        let (future, producer) = Future::new();
        let core = Arc::new(DeferredCore {
            producer,
            lifecycle: Mutex::new(Lifecycle {
                resolved: false,
                pending: 0,
            }),
        });

        // A cancel request on the handed-out future settles the core
        let weak = Arc::downgrade(&core);
        future.watch(move |_, outcome| {
            if outcome == Outcome::Canceled {
                if let Some(core) = weak.upgrade() {
                    core.cancel();
                }
            }
        });

        core
    }

    /// Cancel once `source` finishes without cancellation.
    pub(crate) fn cancel_with<A: 'static>(self: &Arc<Self>, source: &Future<A>) {
        if self.is_settled() {
            return;
        }
        let hold = self.hold();
        source.watch(move |_, outcome| {
            if outcome == Outcome::Finished {
                hold.core().cancel();
            }
        });
    }

    /// Mirror the progress and started/paused flags of `source`.
    pub(crate) fn track<A: 'static>(self: &Arc<Self>, source: &Future<A>) {
        let producer = &self.producer;
        if source.is_started() {
            producer.report_started();
        }
        producer.set_progress_range(source.progress_minimum(), source.progress_maximum());
        producer.set_progress_value(source.progress_value());
        if source.is_paused() {
            producer.set_paused(true);
        }

        let weak: Weak<DeferredCore<T>> = Arc::downgrade(self);
        source.listen(move |_, event| {
            let Some(core) = weak.upgrade() else {
                return false;
            };
            if core.producer.is_finished() {
                return false;
            }
            match *event {
                FutureEvent::Started => core.producer.report_started(),
                FutureEvent::Paused => core.producer.set_paused(true),
                FutureEvent::Resumed => core.producer.set_paused(false),
                FutureEvent::ProgressRange { min, max } => core.producer.set_progress_range(min, max),
                FutureEvent::ProgressValue(value) => core.producer.set_progress_value(value),
                _ => {}
            }
            true
        });
    }
}

impl<T: Clone + Send + 'static> DeferredCore<T> {
    /// Settle with the outcome of `source` once it settles.
    ///
    /// All results of the source are copied over.
    pub(crate) fn complete_with(self: &Arc<Self>, source: Future<T>) {
        if self.is_settled() {
            return;
        }
        self.track(&source);
        let hold = self.hold();
        source.watch(move |source, outcome| match outcome {
            Outcome::Finished => hold.core().complete_all(source.results()),
            Outcome::Canceled => hold.core().cancel(),
        });
    }
}

impl<T: Clone + Send + 'static> Future<Future<T>> {
    /// Collapse a future of a future into a future of the inner value.
    ///
    /// The outer future finishing without a result cancels the flattened one.
    pub fn flatten(&self) -> Future<T> {
        let core = DeferredCore::new();
        let hold = core.hold();
        self.watch(move |outer, outcome| {
            let core = hold.core();
            match (outcome, outer.result()) {
                (Outcome::Finished, Some(inner)) => core.complete_with(inner),
                _ => core.cancel(),
            }
        });
        core.future()
    }
}

/// Anything a [`Deferred`] can be completed with.
///
/// Implemented for `Future<T>` and for `Future<Future<T>>`, the latter
/// following the inner future once the outer one delivers it.
pub trait Source<T> {
    fn into_flat(self) -> Future<T>;
}

impl<T> Source<T> for Future<T> {
    fn into_flat(self) -> Future<T> {
        self
    }
}

impl<T: Clone + Send + 'static> Source<T> for Future<Future<T>> {
    fn into_flat(self) -> Future<T> {
        self.flatten()
    }
}

/// Create a new resolvable value
pub fn deferred<T: Send + 'static>() -> Deferred<T> {
    Deferred::new()
}

/// A resolvable value handing out a [`Future`].
///
/// Clones are handles onto the same value. Dropping every handle of an
/// unsettled deferred cancels it, unless an operation such as
/// [`Deferred::complete_with`] is still pending on it.
///
/// ```rust
/// use rust_deferred::deferred;
///
/// let d = deferred::<i32>();
/// let f = d.future();
/// d.complete(10);
/// d.cancel();
///
/// assert!(f.is_finished());
/// assert!(!f.is_canceled());
/// assert_eq!(f.result(), Some(10));
/// ```
pub struct Deferred<T> {
    owner: Arc<Hold<T>>,
}

impl<T: Send + 'static> Deferred<T> {
    pub fn new() -> Self {
        let core = DeferredCore::new();
        Deferred {
            owner: Arc::new(core.hold()),
        }
    }

    fn core(&self) -> &Arc<DeferredCore<T>> {
        self.owner.core()
    }

    pub fn future(&self) -> Future<T> {
        self.core().future()
    }

    pub fn observe(&self) -> Observable<T> {
        observe(self.future())
    }

    /// True once any complete or cancel call won
    pub fn is_settled(&self) -> bool {
        self.core().is_settled()
    }

    /// Finish with a single result; a no-op once settled
    pub fn complete(&self, value: T) {
        self.core().complete(value)
    }

    /// Finish with a batch of results stored at their positions
    pub fn complete_all(&self, values: Vec<T>) {
        self.core().complete_all(values)
    }

    /// Cancel; a no-op once settled
    pub fn cancel(&self) {
        self.core().cancel()
    }

    /// Cancel as soon as `source` finishes without being canceled.
    ///
    /// A canceled source leaves this value alone. Racing a work future
    /// against a timer future expresses a timeout.
    pub fn cancel_with<A: 'static>(&self, source: &Future<A>) {
        self.core().cancel_with(source)
    }

    /// Mirror progress and started/paused state of `source`
    pub fn track<A: 'static>(&self, source: &Future<A>) {
        self.core().track(source)
    }

    /// Store a partial result before settling
    pub fn report_result_at(&self, index: usize, value: T) {
        self.core().report_result_at(index, value)
    }

    pub fn set_progress_range(&self, min: i32, max: i32) {
        self.core().set_progress_range(min, max)
    }

    pub fn set_progress_value(&self, value: i32) {
        self.core().set_progress_value(value)
    }

    /// Run `callback` once the value finishes without cancellation
    pub fn on_completed<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.observe().on_completed(callback);
    }

    /// Run `callback` if the value gets canceled
    pub fn on_canceled<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.observe().on_canceled(callback);
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    /// Settle with whatever `source` settles with.
    ///
    /// Results are copied once the source finishes, a canceled source
    /// cancels this value. Progress of the source is tracked meanwhile.
    /// The pending operation keeps the value alive after its handles drop.
    /// A `Future<Future<T>>` source is followed through to its inner future.
    ///
    /// ```rust
    /// use rust_deferred::{deferred, Future};
    ///
    /// let inner = deferred::<i32>();
    /// let outer = Future::ready(inner.future());
    ///
    /// let d = deferred::<i32>();
    /// d.complete_with(outer);
    /// inner.complete(3);
    /// assert_eq!(d.future().result(), Some(3));
    /// ```
    pub fn complete_with<S: Source<T>>(&self, source: S) {
        self.core().complete_with(source.into_flat())
    }
}

impl<T: Send + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Deferred {
            owner: self.owner.clone(),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("settled", &self.owner.core().is_settled())
            .field("handles", &Arc::strong_count(&self.owner))
            .field("future", &self.owner.core().future())
            .finish()
    }
}


#[cfg(test)]
mod concurrency_tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_racing_settlers_agree() {
        for _ in 0..50 {
            let d = deferred::<usize>();
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let d = d.clone();
                    thread::spawn(move || {
                        if i % 2 == 0 {
                            d.complete(i);
                        } else {
                            d.cancel();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }

            let f = d.future();
            assert!(f.is_finished());
            // Exactly one winner: either one result or a cancellation
            assert_eq!(f.is_canceled(), f.result_count() == 0);
            assert!(f.result_count() <= 1);
        }
    }
}
