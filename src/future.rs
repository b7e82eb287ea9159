//! Host Future/Producer implementation
//!
//! This module provides the shared result cell every other part of the crate
//! is built on. A [`Future`] is a read-only handle to the cell, a [`Producer`]
//! is the writer. Any number of handles of either kind may point at the same
//! cell; whatever one handle writes is visible through all of them.
//!
//! The cell starts out running and not yet started. It moves forward only:
//! once `finished` is set it stays set, and `canceled` is never set after
//! `finished`.
//!
//! Two notification mechanisms are exposed:
//!
//! - [`Future::watch`] registers a one-shot callback that fires exactly once,
//!   either with [`Outcome::Finished`] or [`Outcome::Canceled`].
//! - [`Future::listen`] registers a callback for every [`FutureEvent`]
//!   (progress, started, paused, results) until it returns `false` or the
//!   future finishes.
//!
//! Callbacks always run outside the internal lock, on whichever thread caused
//! the transition.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};

type Watcher<T> = Box<dyn FnOnce(&Future<T>, Outcome) + Send>;
type Listener<T> = Arc<dyn Fn(&Future<T>, &FutureEvent) -> bool + Send + Sync>;

/// How a future settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Finished without cancellation
    Finished,
    /// Canceled (possibly before the producer reported finished)
    Canceled,
}

/// Lifecycle and progress notifications delivered to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureEvent {
    Started,
    Paused,
    Resumed,
    ProgressRange { min: i32, max: i32 },
    ProgressValue(i32),
    ResultReady { index: usize },
    Canceled,
    Finished,
}

/// Identifies a listener registered with [`Future::listen`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// A read-only handle to an eventually settled result cell
pub struct Future<T> {
    shared: Arc<Shared<T>>,
}

/// The writer side of a [`Future`]
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    started: bool,
    finished: bool,
    canceled: bool,
    paused: bool,
    results: BTreeMap<usize, T>,
    progress_min: i32,
    progress_max: i32,
    progress_value: i32,
    watchers: Vec<Watcher<T>>,
    listeners: Vec<(ListenerId, Listener<T>)>,
    next_listener: u64,
    wakers: Vec<Waker>,
}

impl<T> State<T> {
    /// Insert after the highest taken index
    fn insert_next(&mut self, value: T) -> usize {
        let index = self.results.keys().next_back().map_or(0, |last| last + 1);
        self.results.insert(index, value);
        index
    }
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        // User code never runs under this lock, a poisoned state is still consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Future<T> {
    /// Create a new Future/Producer pair in the running state
    pub fn new() -> (Future<T>, Producer<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                started: false,
                finished: false,
                canceled: false,
                paused: false,
                results: BTreeMap::new(),
                progress_min: 0,
                progress_max: 0,
                progress_value: 0,
                watchers: Vec::new(),
                listeners: Vec::new(),
                next_listener: 0,
                wakers: Vec::new(),
            }),
        });

        let future = Future {
            shared: shared.clone(),
        };

        let producer = Producer { shared };

        (future, producer)
    }

    /// A future that already finished with one result
    pub fn ready(value: T) -> Future<T> {
        Self::ready_all(vec![value])
    }

    /// A future that already finished with a batch of results
    pub fn ready_all(values: Vec<T>) -> Future<T> {
        let (future, producer) = Self::new();
        producer.report_started();
        producer.report_results(values);
        producer.report_finished();
        future
    }

    /// A future that is already canceled and finished
    pub fn canceled() -> Future<T> {
        let (future, producer) = Self::new();
        producer.report_canceled();
        producer.report_finished();
        future
    }

    pub fn is_started(&self) -> bool {
        self.shared.lock().started
    }

    /// Running until finished, regardless of cancellation
    pub fn is_running(&self) -> bool {
        !self.shared.lock().finished
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.lock().canceled
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn progress_value(&self) -> i32 {
        self.shared.lock().progress_value
    }

    pub fn progress_minimum(&self) -> i32 {
        self.shared.lock().progress_min
    }

    pub fn progress_maximum(&self) -> i32 {
        self.shared.lock().progress_max
    }

    /// Number of results stored so far
    pub fn result_count(&self) -> usize {
        self.shared.lock().results.len()
    }

    pub fn is_result_ready_at(&self, index: usize) -> bool {
        self.shared.lock().results.contains_key(&index)
    }

    /// Request cancellation.
    ///
    /// Sets `canceled` and notifies watchers right away. `finished` is only
    /// set once the producer reports it; results reported afterwards are
    /// dropped.
    pub fn cancel(&self) {
        let (watchers, wakers) = {
            let mut state = self.shared.lock();
            if state.finished || state.canceled {
                return;
            }
            state.canceled = true;
            (mem::take(&mut state.watchers), mem::take(&mut state.wakers))
        };

        tracing::trace!("future canceled");

        for waker in wakers {
            waker.wake();
        }
        self.emit(FutureEvent::Canceled);
        for watcher in watchers {
            watcher(self, Outcome::Canceled);
        }
    }

    /// Register a one-shot settle notification.
    ///
    /// `callback` runs exactly once: with [`Outcome::Canceled`] as soon as the
    /// future is canceled, or with [`Outcome::Finished`] when it finishes
    /// without cancellation. If the future already settled the callback runs
    /// immediately on the calling thread.
    pub fn watch<F>(&self, callback: F)
    where
        F: FnOnce(&Future<T>, Outcome) + Send + 'static,
    {
        let outcome = {
            let mut state = self.shared.lock();
            if state.canceled {
                Outcome::Canceled
            } else if state.finished {
                Outcome::Finished
            } else {
                state.watchers.push(Box::new(callback));
                return;
            }
        };

        callback(self, outcome)
    }

    /// Register a listener for lifecycle and progress events.
    ///
    /// The listener stays registered until it returns `false`, is removed with
    /// [`Future::unlisten`], or the future finishes (the `Finished` event is
    /// the last one delivered). Returns `None` when the future already
    /// finished.
    pub fn listen<F>(&self, listener: F) -> Option<ListenerId>
    where
        F: Fn(&Future<T>, &FutureEvent) -> bool + Send + Sync + 'static,
    {
        let mut state = self.shared.lock();
        if state.finished {
            return None;
        }
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push((id, Arc::new(listener)));
        Some(id)
    }

    pub fn unlisten(&self, id: ListenerId) {
        self.shared.lock().listeners.retain(|(other, _)| *other != id);
    }

    fn emit(&self, event: FutureEvent) {
        let listeners: Vec<(ListenerId, Listener<T>)> = self.shared.lock().listeners.clone();
        if listeners.is_empty() {
            return;
        }

        let mut dropped = Vec::new();
        for (id, listener) in listeners {
            if !listener(self, &event) {
                dropped.push(id);
            }
        }

        if !dropped.is_empty() {
            self.shared
                .lock()
                .listeners
                .retain(|(id, _)| !dropped.contains(id));
        }
    }

    fn finish(&self) {
        let (watchers, listeners, wakers, canceled) = {
            let mut state = self.shared.lock();
            if state.finished {
                return;
            }
            state.finished = true;
            (
                mem::take(&mut state.watchers),
                mem::take(&mut state.listeners),
                mem::take(&mut state.wakers),
                state.canceled,
            )
        };

        tracing::trace!(canceled, "future finished");

        for waker in wakers {
            waker.wake();
        }
        for (_, listener) in listeners {
            listener(self, &FutureEvent::Finished);
        }

        let outcome = if canceled {
            Outcome::Canceled
        } else {
            Outcome::Finished
        };
        for watcher in watchers {
            watcher(self, outcome);
        }
    }

    /// True when both handles share the same cell
    pub fn ptr_eq(&self, other: &Future<T>) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl<T: Clone> Future<T> {
    /// The result at index 0
    pub fn result(&self) -> Option<T> {
        self.result_at(0)
    }

    pub fn result_at(&self, index: usize) -> Option<T> {
        self.shared.lock().results.get(&index).cloned()
    }

    /// All results in index order
    pub fn results(&self) -> Vec<T> {
        self.shared.lock().results.values().cloned().collect()
    }
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Future")
            .field("started", &state.started)
            .field("finished", &state.finished)
            .field("canceled", &state.canceled)
            .field("results", &state.results.len())
            .field("progress", &(state.progress_min, state.progress_value, state.progress_max))
            .finish()
    }
}

impl<T: Clone> std::future::Future for Future<T> {
    type Output = Result<Vec<T>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.shared.lock();

        if state.canceled {
            Poll::Ready(Err(Error::Canceled))
        } else if state.finished {
            Poll::Ready(Ok(state.results.values().cloned().collect()))
        } else {
            // Store the waker for later notification
            if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
                state.wakers.push(cx.waker().clone());
            }
            Poll::Pending
        }
    }
}

impl<T> Producer<T> {
    /// A read handle onto the same cell
    pub fn future(&self) -> Future<T> {
        Future {
            shared: self.shared.clone(),
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.shared.lock().canceled
    }

    pub fn is_finished(&self) -> bool {
        self.shared.lock().finished
    }

    pub fn report_started(&self) {
        {
            let mut state = self.shared.lock();
            if state.started || state.finished {
                return;
            }
            state.started = true;
        }
        self.future().emit(FutureEvent::Started);
    }

    /// Store a result at the next free index
    pub fn report_result(&self, value: T) {
        let index = {
            let mut state = self.shared.lock();
            if state.canceled || state.finished {
                return;
            }
            state.insert_next(value)
        };
        self.future().emit(FutureEvent::ResultReady { index });
    }

    /// Store a result at `index`, replacing nothing if that slot is taken
    pub fn report_result_at(&self, index: usize, value: T) {
        {
            let mut state = self.shared.lock();
            if state.canceled || state.finished || state.results.contains_key(&index) {
                return;
            }
            state.results.insert(index, value);
        }
        self.future().emit(FutureEvent::ResultReady { index });
    }

    /// Append a batch of results, each tagged with its own index
    ///
    /// The batch lands at consecutive indices even with concurrent writers.
    pub fn report_results(&self, values: Vec<T>) {
        let indices: Vec<usize> = {
            let mut state = self.shared.lock();
            if state.canceled || state.finished {
                return;
            }
            values.into_iter().map(|value| state.insert_next(value)).collect()
        };
        let future = self.future();
        for index in indices {
            future.emit(FutureEvent::ResultReady { index });
        }
    }

    pub fn report_canceled(&self) {
        self.future().cancel();
    }

    pub fn report_finished(&self) {
        self.future().finish();
    }

    pub fn set_progress_range(&self, min: i32, max: i32) {
        {
            let mut state = self.shared.lock();
            if state.finished {
                return;
            }
            state.progress_min = min;
            state.progress_max = max;
            state.progress_value = state.progress_value.max(min);
        }
        self.future().emit(FutureEvent::ProgressRange { min, max });
    }

    /// Progress only moves forward; stale or post-settlement values are ignored
    pub fn set_progress_value(&self, value: i32) {
        {
            let mut state = self.shared.lock();
            if state.canceled || state.finished || value <= state.progress_value {
                return;
            }
            state.progress_value = value;
        }
        self.future().emit(FutureEvent::ProgressValue(value));
    }

    pub fn set_paused(&self, paused: bool) {
        {
            let mut state = self.shared.lock();
            if state.paused == paused || state.finished {
                return;
            }
            state.paused = paused;
        }
        let event = if paused {
            FutureEvent::Paused
        } else {
            FutureEvent::Resumed
        };
        self.future().emit(event);
    }
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> fmt::Debug for Producer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer")
            .field("future", &self.future())
            .finish()
    }
}
