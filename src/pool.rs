//! Host thread pool
//!
//! Runs blocking closures on worker threads and hands back a [`Future`] for
//! their results. Workers pull jobs from a shared `crossbeam-channel` queue.
//!
//! The pool is a producer of futures, nothing in the continuation machinery
//! depends on it.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;

use crate::config::{POOL_MIN_THREADS, POOL_THREAD_NAME_PREFIX};
use crate::error::{Error, Result};
use crate::future::{Future, Producer};

type Job = Box<dyn FnOnce() + Send>;

static GLOBAL_POOL: Lazy<ThreadPool> = Lazy::new(|| {
    PoolBuilder::new()
        .threads(num_cpus::get().max(POOL_MIN_THREADS))
        .build()
        .expect("Failed to start the global thread pool")
});

/// A fixed-size pool of worker threads
pub struct ThreadPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    size: usize,
}

/// Builder for customizing a [`ThreadPool`]
#[derive(Debug, Clone, Default)]
pub struct PoolBuilder {
    threads: Option<usize>,
    name: Option<String>,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers (at least one)
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads.max(1));
        self
    }

    /// Set the worker thread name prefix
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Start the workers
    pub fn build(self) -> Result<ThreadPool> {
        let size = self.threads.unwrap_or_else(num_cpus::get).max(1);
        let name = self
            .name
            .unwrap_or_else(|| POOL_THREAD_NAME_PREFIX.to_string());
        let (sender, receiver) = unbounded::<Job>();

        let mut workers = Vec::with_capacity(size);
        for index in 0..size {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || worker_loop(receiver))?;
            workers.push(handle);
        }

        tracing::info!("Thread pool {} started with {} workers", name, size);

        Ok(ThreadPool {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            size,
        })
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    // Ends once the pool drops its sender and the queue drains
    while let Ok(job) = receiver.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("Pool job panicked");
        }
    }
    tracing::debug!("Pool worker exiting");
}

impl ThreadPool {
    /// Start a pool with `threads` workers
    pub fn new(threads: usize) -> Result<ThreadPool> {
        PoolBuilder::new().threads(threads).build()
    }

    /// The lazily started process-wide pool
    pub fn global() -> &'static ThreadPool {
        &GLOBAL_POOL
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Queue a raw job
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(sender) => sender.send(Box::new(job)).map_err(|_| Error::PoolShutdown),
            None => Err(Error::PoolShutdown),
        }
    }

    /// Run `f` on a worker and return a future for its result.
    ///
    /// A future canceled before the job starts finishes without running `f`.
    /// A panic inside `f` cancels the future.
    pub fn run<T, F>(&self, f: F) -> Future<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (future, producer) = Future::new();
        let job_producer = producer.clone();

        let queued = self.execute(move || {
            let producer = job_producer;
            if producer.is_canceled() {
                producer.report_finished();
                return;
            }
            producer.report_started();
            match catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => producer.report_result(value),
                Err(_) => {
                    tracing::warn!("Pool job panicked, canceling its future");
                    producer.report_canceled();
                }
            }
            producer.report_finished();
        });

        if let Err(e) = queued {
            tracing::warn!("Failed to queue job on pool {}: {}", self.name, e);
            abort(&producer);
        }
        future
    }

    /// Apply `f` to every item on the pool.
    ///
    /// The future carries one result per item at the item's index. Its
    /// progress range is `(0, items)` and advances by one per processed item.
    /// Once the future is canceled, items not yet started are skipped.
    pub fn mapped<I, R, F>(&self, items: Vec<I>, f: F) -> Future<R>
    where
        I: Send + 'static,
        R: Send + 'static,
        F: Fn(I) -> R + Send + Sync + 'static,
    {
        let (future, producer) = Future::new();
        let total = items.len();
        producer.report_started();
        producer.set_progress_range(0, total as i32);
        if total == 0 {
            producer.report_finished();
            return future;
        }

        let f = Arc::new(f);
        let done = Arc::new(AtomicUsize::new(0));

        for (index, item) in items.into_iter().enumerate() {
            let job_producer = producer.clone();
            let job_done = done.clone();
            let f = f.clone();

            let queued = self.execute(move || {
                if !job_producer.is_canceled() {
                    match catch_unwind(AssertUnwindSafe(|| (*f)(item))) {
                        Ok(value) => job_producer.report_result_at(index, value),
                        Err(_) => {
                            tracing::warn!("Mapped job {} panicked, canceling", index);
                            job_producer.report_canceled();
                        }
                    }
                }
                item_done(&job_producer, &job_done, total);
            });

            if queued.is_err() {
                producer.report_canceled();
                item_done(&producer, &done, total);
            }
        }

        future
    }

    /// Stop accepting jobs and wait for queued jobs to finish
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let current = thread::current().id();
        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("Pool {} worker panicked", self.name);
            }
        }
        tracing::info!("Thread pool {} shut down", self.name);
    }
}

fn item_done<R>(producer: &Producer<R>, done: &AtomicUsize, total: usize) {
    let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
    producer.set_progress_value(finished as i32);
    if finished == total {
        producer.report_finished();
    }
}

fn abort<T>(producer: &Producer<T>) {
    producer.report_canceled();
    producer.report_finished();
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Run `f` on the global pool
pub fn run<T, F>(f: F) -> Future<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    ThreadPool::global().run(f)
}

/// Map `items` through `f` on the global pool
pub fn mapped<I, R, F>(items: Vec<I>, f: F) -> Future<R>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> R + Send + Sync + 'static,
{
    ThreadPool::global().mapped(items, f)
}
