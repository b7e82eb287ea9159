//! Configuration constants
//!
//! Tunable parameters for execution contexts and the host thread pool.

/// How long a context thread waits for a job before re-checking whether it was closed
///
/// Closing a context also sends a shutdown message, so this only bounds the
/// delay when that message cannot be delivered. Smaller values make shutdown
/// more responsive at the cost of more wakeups on idle contexts.
pub const CONTEXT_RECV_TIMEOUT_MS: u64 = 10;

/// Prefix for the names of pool worker threads
pub const POOL_THREAD_NAME_PREFIX: &str = "deferred-pool";

/// Lower bound on the number of workers in the global pool
///
/// Jobs that wait on futures produced by other jobs need at least two workers
/// to make progress on single-core machines.
pub const POOL_MIN_THREADS: usize = 2;
