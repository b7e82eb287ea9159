//! Event signals and their bridge into futures
//!
//! A [`Signal`] is a minimal in-process event emitter: slots connected to it
//! are called with the argument of every emission. Clones share the same slot
//! list; dropping the last clone destroys the signal.
//!
//! [`Signal::next`] turns the next emission into a [`Future`]: it completes
//! with the emitted argument, or is canceled if the signal is destroyed first.
//! Use `Signal<()>` for notifications without an argument.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::deferred::DeferredCore;
use crate::future::Future;
use crate::observable::{observe, Observable};

/// Type for slots connected to a signal
pub type SlotFn<A> = Arc<dyn Fn(A) + Send + Sync>;

type DestroyHook = Box<dyn FnOnce() + Send>;

/// Identifies a connected slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(u64);

struct Slot<A> {
    id: SlotId,
    once: bool,
    callback: SlotFn<A>,
    /// Runs if the signal is destroyed while the slot is still connected
    on_destroy: Option<DestroyHook>,
}

struct Inner<A> {
    next_id: AtomicU64,
    slots: Mutex<Vec<Slot<A>>>,
}

impl<A> Inner<A> {
    fn slots(&self) -> MutexGuard<'_, Vec<Slot<A>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<A> Drop for Inner<A> {
    fn drop(&mut self) {
        let slots = mem::take(self.slots.get_mut().unwrap_or_else(PoisonError::into_inner));
        tracing::trace!("signal destroyed with {} connected slots", slots.len());
        for slot in slots {
            if let Some(hook) = slot.on_destroy {
                hook();
            }
        }
    }
}

/// An event emitter with connectable slots
pub struct Signal<A> {
    inner: Arc<Inner<A>>,
}

impl<A> Signal<A> {
    pub fn new() -> Self {
        Signal {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                slots: Mutex::new(Vec::new()),
            }),
        }
    }

    fn attach(&self, once: bool, callback: SlotFn<A>, on_destroy: Option<DestroyHook>) -> SlotId {
        let id = SlotId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.slots().push(Slot {
            id,
            once,
            callback,
            on_destroy,
        });
        id
    }

    /// Call `slot` on every emission until disconnected
    pub fn connect<F>(&self, slot: F) -> SlotId
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        self.attach(false, Arc::new(slot), None)
    }

    /// Call `slot` on the next emission only
    pub fn connect_once<F>(&self, slot: F) -> SlotId
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        self.attach(true, Arc::new(slot), None)
    }

    /// Disconnect a slot; returns whether it was still connected
    pub fn disconnect(&self, id: SlotId) -> bool {
        let mut slots = self.inner.slots();
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        slots.len() != before
    }

    pub fn slot_count(&self) -> usize {
        self.inner.slots().len()
    }
}

impl<A: Clone> Signal<A> {
    /// Call every connected slot with `value`.
    ///
    /// Slots run on the calling thread, outside the slot lock, so they may
    /// connect or emit themselves.
    pub fn emit(&self, value: A) {
        let callbacks: Vec<SlotFn<A>> = {
            let mut slots = self.inner.slots();
            let callbacks = slots.iter().map(|slot| slot.callback.clone()).collect();
            slots.retain(|slot| !slot.once);
            callbacks
        };

        for callback in callbacks {
            callback(value.clone());
        }
    }
}

impl<A: Clone + Send + 'static> Signal<A> {
    /// A future for the next emission's argument.
    ///
    /// ```rust
    /// use rust_deferred::Signal;
    ///
    /// let clicked = Signal::<u32>::new();
    /// let first = clicked.next();
    ///
    /// clicked.emit(7);
    /// clicked.emit(8);
    /// assert_eq!(first.result(), Some(7));
    ///
    /// let never = clicked.next();
    /// drop(clicked);
    /// assert!(never.is_canceled());
    /// ```
    pub fn next(&self) -> Future<A> {
        let core = DeferredCore::new();
        let on_emit = core.clone();
        let on_destroy = core.clone();

        self.attach(
            true,
            Arc::new(move |value: A| on_emit.complete(value)),
            Some(Box::new(move || on_destroy.cancel())),
        );
        core.future()
    }
}

/// Observe the next emission of `signal`
pub fn observe_signal<A: Clone + Send + 'static>(signal: &Signal<A>) -> Observable<A> {
    observe(signal.next())
}

impl<A> Default for Signal<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for Signal<A> {
    fn clone(&self) -> Self {
        Signal {
            inner: self.inner.clone(),
        }
    }
}

impl<A> fmt::Debug for Signal<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("slots", &self.slot_count())
            .finish()
    }
}
