//! FIFO serialization of asynchronous critical sections
//!
//! The device correlates replies only by topic name, so two exchanges in
//! flight on the same transport cannot be told apart. [`Locksmith`] admits
//! one unit of work at a time, in the order the callers started waiting.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::trace;

/// Mutex queue for asynchronous work
///
/// Built on [`tokio::sync::Mutex`], whose waiters are woken strictly in
/// FIFO order. A unit's completion, whether it succeeds, fails or panics,
/// always releases the lock to the next waiter.
#[derive(Debug, Default)]
pub struct Locksmith {
    lock: Mutex<()>,
    waiting: AtomicUsize,
}

impl Locksmith {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` once every previously queued unit has completed
    ///
    /// If the queue is idle the work runs immediately. The result (or error)
    /// of `work` is returned unchanged; a failing unit does not affect its
    /// successors.
    pub async fn execute_exclusively<F, Fut, T>(&self, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = self.lock.lock().await;
        let queued = self.waiting.fetch_sub(1, Ordering::SeqCst) - 1;
        trace!(queued, "Locksmith admitted work");

        let result = work().await;
        drop(guard);
        result
    }

    /// Number of units waiting for the lock (excluding the one running)
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Check whether a unit currently holds the lock
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}
