//! Execution contexts
//!
//! A context is a dispatch queue with thread affinity: every job handed to it
//! runs on the thread that owns the context. Continuations use contexts to
//! decide where a callback runs, and treat the closing of a context as the
//! cancellation of any continuation that has not run yet.
//!
//! Two kinds of contexts exist:
//!
//! - [`Context::spawn`] starts a dedicated thread that drains the queue.
//! - [`Context::local`] keeps the queue on the calling thread; jobs only run
//!   when the owner calls [`Context::tick`] or [`Context::run_until`].
//!
//! A context is closed by [`ContextHandle::close`] or by dropping the owning
//! [`Context`]. Closing runs every registered close hook once, drops queued
//! jobs without running them and rejects later dispatches.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle as ThreadJoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::config::CONTEXT_RECV_TIMEOUT_MS;
use crate::error::{Error, Result};

/// A unit of work queued on a context
pub type Job = Box<dyn FnOnce() + Send>;

type CloseHook = Box<dyn FnOnce() + Send>;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u64);

/// Identifies a close hook registered with [`ContextHandle::on_close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Messages delivered to a context queue
enum ContextMessage {
    /// Run a job on the context thread
    Run(Job),
    /// Stop the context loop
    Shutdown,
}

impl fmt::Debug for ContextMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextMessage::Run(_) => f.debug_tuple("Run").field(&"<Job>").finish(),
            ContextMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

struct Inner {
    id: ContextId,
    name: String,
    sender: Sender<ContextMessage>,
    closed: AtomicBool,
    hooks: Mutex<HookTable>,
    thread: Mutex<Option<ThreadId>>,
}

#[derive(Default)]
struct HookTable {
    next: u64,
    hooks: HashMap<HookId, CloseHook>,
}

impl Inner {
    fn hooks(&self) -> MutexGuard<'_, HookTable> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A cheap, cloneable reference to a context
///
/// Handles do not keep the context open: once the owning [`Context`] is
/// dropped or the context is closed, dispatching through any handle fails.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<Inner>,
}

impl ContextHandle {
    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// The thread jobs of this context run on
    pub fn thread_id(&self) -> Option<ThreadId> {
        *self
            .inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// True when called from the context's own thread
    pub fn is_current(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    /// Queue a job on the context
    pub fn dispatch<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::ContextClosed);
        }
        self.inner
            .sender
            .send(ContextMessage::Run(Box::new(job)))
            .map_err(|_| Error::ContextClosed)
    }

    /// Register a hook that runs once when the context closes.
    ///
    /// If the context is already closed the hook runs immediately and `None`
    /// is returned.
    pub fn on_close<F>(&self, hook: F) -> Option<HookId>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut table = self.inner.hooks();
            if !self.is_closed() {
                let id = HookId(table.next);
                table.next += 1;
                table.hooks.insert(id, Box::new(hook));
                return Some(id);
            }
        }
        hook();
        None
    }

    /// Unregister a close hook; a no-op if it already ran
    pub fn remove_close_hook(&self, id: HookId) {
        self.inner.hooks().hooks.remove(&id);
    }

    /// Close the context.
    ///
    /// Runs close hooks on the calling thread, then stops the context loop.
    /// Jobs still queued are dropped without running.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let hooks = mem::take(&mut self.inner.hooks().hooks);
        tracing::debug!(
            "Context {} ({:?}) closing, {} close hooks",
            self.inner.name,
            self.inner.id,
            hooks.len()
        );
        for (_, hook) in hooks {
            hook();
        }

        if self.inner.sender.send(ContextMessage::Shutdown).is_err() {
            tracing::trace!("Context {} loop already stopped", self.inner.name);
        }
    }

    fn set_thread(&self, id: ThreadId) {
        *self
            .inner
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    fn handle_message(&self, message: ContextMessage) -> bool {
        match message {
            ContextMessage::Run(job) => {
                if self.is_closed() {
                    tracing::trace!("Context {} dropping job after close", self.inner.name);
                    return true;
                }
                // Poll the job, catching any panics
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    tracing::error!("Job on context {} panicked", self.inner.name);
                }
                true
            }
            ContextMessage::Shutdown => false,
        }
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ContextHandle {}

impl fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Owner of an execution context; dropping it closes the context
pub struct Context {
    handle: ContextHandle,
    /// Present for local contexts, drained by `tick`
    receiver: Option<Receiver<ContextMessage>>,
    thread_handle: Option<ThreadJoinHandle<()>>,
}

impl Context {
    fn create(name: String) -> (ContextHandle, Receiver<ContextMessage>) {
        let (sender, receiver) = unbounded();
        let handle = ContextHandle {
            inner: Arc::new(Inner {
                id: ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed)),
                name,
                sender,
                closed: AtomicBool::new(false),
                hooks: Mutex::new(HookTable::default()),
                thread: Mutex::new(None),
            }),
        };
        (handle, receiver)
    }

    /// Start a context backed by a dedicated thread
    pub fn spawn(name: impl Into<String>) -> Result<Context> {
        let name = name.into();
        let (handle, receiver) = Self::create(name.clone());

        let loop_handle = handle.clone();
        let thread_handle = thread::Builder::new()
            .name(name)
            .spawn(move || run_loop(loop_handle, receiver))?;
        handle.set_thread(thread_handle.thread().id());

        Ok(Context {
            handle,
            receiver: None,
            thread_handle: Some(thread_handle),
        })
    }

    /// Create a context bound to the current thread.
    ///
    /// Queued jobs run only inside [`Context::tick`] or [`Context::run_until`].
    pub fn local(name: impl Into<String>) -> Context {
        let (handle, receiver) = Self::create(name.into());
        handle.set_thread(thread::current().id());
        Context {
            handle,
            receiver: Some(receiver),
            thread_handle: None,
        }
    }

    pub fn handle(&self) -> ContextHandle {
        self.handle.clone()
    }

    /// Run the jobs queued on a local context so far.
    ///
    /// Jobs queued while ticking wait for the next tick. Returns whether any
    /// job ran. Always false for spawned contexts.
    pub fn tick(&self) -> bool {
        let Some(receiver) = &self.receiver else {
            return false;
        };

        let mut made_progress = false;
        for _ in 0..receiver.len() {
            let Ok(message) = receiver.try_recv() else {
                break;
            };
            if !self.handle.handle_message(message) {
                break;
            }
            made_progress = true;
        }
        made_progress
    }

    /// Run jobs until the queue stays empty, including jobs queued by jobs.
    ///
    /// Returns the number of rounds that made progress.
    pub fn run_until_idle(&self) -> usize {
        let mut rounds = 0;
        while self.tick() {
            rounds += 1;
        }
        rounds
    }

    /// Pump a local context until `condition` holds or `timeout` elapses.
    ///
    /// Returns the final value of `condition`.
    pub fn run_until<F>(&self, mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> bool,
    {
        let Some(receiver) = &self.receiver else {
            return condition();
        };

        let deadline = Instant::now() + timeout;
        loop {
            self.tick();
            if condition() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline || self.handle.is_closed() {
                return condition();
            }
            let wait = (deadline - now).min(Duration::from_millis(CONTEXT_RECV_TIMEOUT_MS));
            if let Ok(message) = receiver.recv_timeout(wait) {
                self.handle.handle_message(message);
            }
        }
    }
}

impl Deref for Context {
    type Target = ContextHandle;

    fn deref(&self) -> &ContextHandle {
        &self.handle
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("handle", &self.handle)
            .field("local", &self.receiver.is_some())
            .finish()
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.handle.close();

        if let Some(thread_handle) = self.thread_handle.take() {
            if thread_handle.thread().id() == thread::current().id() {
                // Dropped from one of its own jobs; the loop exits on its own.
                return;
            }
            if thread_handle.join().is_err() {
                tracing::warn!("Context {} thread panicked", self.handle.name());
            }
        }
    }
}

/// Main loop of a spawned context
fn run_loop(handle: ContextHandle, receiver: Receiver<ContextMessage>) {
    tracing::info!("Context {} starting event loop", handle.name());

    while !handle.is_closed() {
        match receiver.recv_timeout(Duration::from_millis(CONTEXT_RECV_TIMEOUT_MS)) {
            Ok(message) => {
                if !handle.handle_message(message) {
                    break;
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                // Loop to check the closed flag
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    tracing::info!("Context {} shutting down", handle.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn test_local_context_runs_on_tick() {
        let context = Context::local("local");
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = counter.clone();
        context
            .dispatch(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(context.tick());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!context.tick());
        assert!(context.is_current());
    }

    #[test]
    fn test_run_until_idle_drains_nested_jobs() {
        let context = Context::local("nested");
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = context.handle();
        let counter_clone = counter.clone();
        context
            .dispatch(move || {
                let inner = counter_clone.clone();
                handle
                    .dispatch(move || {
                        inner.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
            })
            .unwrap();

        assert_eq!(context.run_until_idle(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawned_context_runs_on_its_thread() {
        let context = Context::spawn("worker-context").unwrap();
        let (tx, rx) = mpsc::channel();

        let handle = context.handle();
        context
            .dispatch(move || {
                tx.send(handle.is_current()).unwrap();
            })
            .unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        assert!(!context.is_current());
    }

    #[test]
    fn test_close_runs_hooks_once_and_rejects_dispatch() {
        let context = Context::local("closing");
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = hits.clone();
        let kept = context.on_close(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert!(kept.is_some());

        let removed_hits = hits.clone();
        let removed = context
            .on_close(move || {
                removed_hits.fetch_add(100, Ordering::SeqCst);
            })
            .unwrap();
        context.remove_close_hook(removed);

        context.close();
        context.close();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(matches!(context.dispatch(|| {}), Err(Error::ContextClosed)));

        // Late hooks run immediately
        let late = hits.clone();
        assert!(context
            .on_close(move || {
                late.fetch_add(1, Ordering::SeqCst);
            })
            .is_none());
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_drops_queued_jobs() {
        let context = Context::local("dropping");
        let ran = Arc::new(AtomicBool::new(false));

        let ran_clone = ran.clone();
        context
            .dispatch(move || ran_clone.store(true, Ordering::SeqCst))
            .unwrap();
        context.close();
        context.tick();

        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_job_is_isolated() {
        let context = Context::local("panics");
        let ran = Arc::new(AtomicBool::new(false));

        context.dispatch(|| panic!("job failure")).unwrap();
        let ran_clone = ran.clone();
        context
            .dispatch(move || ran_clone.store(true, Ordering::SeqCst))
            .unwrap();

        context.tick();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_drop_closes_context() {
        let context = Context::spawn("short-lived").unwrap();
        let handle = context.handle();
        drop(context);

        assert!(handle.is_closed());
        assert!(handle.dispatch(|| {}).is_err());
    }

    #[test]
    fn test_context_ids_are_unique() {
        let a = Context::local("a");
        let b = Context::local("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.handle(), a.handle());
        assert_ne!(a.handle(), b.handle());
    }
}
