//! Synchronization utilities for blocking host threads on asynchronous work.
//!
//! # Key Components
//!
//! - [`CompletionSemaphore`] - A counting semaphore a host thread blocks on while the
//!   interceptor chain runs on the async runtime

use std::{
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// A counting semaphore built on a mutex and a condition variable.
///
/// The thread executing an interception shim cannot await a future: it is a plain host
/// thread in the middle of managed code. It creates a semaphore with zero permits, hands a
/// clone to the task that runs the interceptor chain and calls [`CompletionSemaphore::acquire`];
/// the task calls [`CompletionSemaphore::release`] when the chain is done.
///
/// # Examples
///
/// ```rust
/// use jitscope::CompletionSemaphore;
/// use std::sync::Arc;
/// use std::thread;
///
/// let done = Arc::new(CompletionSemaphore::new(0));
/// let signal = Arc::clone(&done);
///
/// let worker = thread::spawn(move || signal.release());
/// done.acquire();
/// worker.join().unwrap();
/// assert_eq!(done.available(), 0);
/// ```
pub struct CompletionSemaphore {
    /// Permits currently available
    permits: Mutex<usize>,
    /// Wakes threads blocked in `acquire`
    condvar: Condvar,
}

impl CompletionSemaphore {
    /// Creates a semaphore holding `initial` permits.
    #[must_use]
    pub fn new(initial: usize) -> Self {
        Self {
            permits: Mutex::new(initial),
            condvar: Condvar::new(),
        }
    }

    /// Blocks until a permit is available and takes it.
    pub fn acquire(&self) {
        let guard = lock!(self.permits);
        let mut guard = self
            .condvar
            .wait_while(guard, |permits| *permits == 0)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard -= 1;
    }

    /// Blocks for at most `timeout` waiting for a permit.
    ///
    /// # Returns
    ///
    /// `true` if a permit was taken, `false` if the timeout expired first.
    pub fn acquire_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = lock!(self.permits);

        while *guard == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (next, _) = self
                .condvar
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = next;
        }

        *guard -= 1;
        true
    }

    /// Takes a permit if one is available without blocking.
    pub fn try_acquire(&self) -> bool {
        let mut guard = lock!(self.permits);
        if *guard == 0 {
            return false;
        }

        *guard -= 1;
        true
    }

    /// Returns a permit and wakes one waiting thread.
    pub fn release(&self) {
        let mut guard = lock!(self.permits);
        *guard += 1;
        self.condvar.notify_one();
    }

    /// Number of permits currently available.
    pub fn available(&self) -> usize {
        *lock!(self.permits)
    }
}

impl Default for CompletionSemaphore {
    fn default() -> Self {
        Self::new(0)
    }
}
