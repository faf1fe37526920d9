//! Synchronization primitives with an abort-on-failure policy.
//!
//! The rest of the crate treats primitive failures as programming errors: a
//! mutex or condition variable operation that fails indicates undefined
//! behavior in the threading layer, and recovery is illusory. [`Mutex`] and
//! [`Condvar`] come from `parking_lot`, whose operations are infallible by
//! construction, which realizes that policy without a wrapper. [`Semaphore`]
//! and [`Thread`] add the two primitives `parking_lot` does not provide;
//! their misuse paths (`join` on the calling thread, spawn failure) abort
//! the process rather than returning an error.

pub use parking_lot::{Condvar, Mutex};

use std::process::abort;
use std::thread;

/// A counting semaphore built from a mutex and a condition variable.
///
/// The count starts at zero; [`acquire`](Self::acquire) blocks until a
/// matching [`release`](Self::release) has happened.
pub struct Semaphore {
    count: Mutex<usize>,
    posted: Condvar,
}

impl Semaphore {
    /// Create a semaphore with a count of zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: Mutex::new(0),
            posted: Condvar::new(),
        }
    }

    /// Block until the count is positive, then decrement it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();

        while *count == 0 {
            self.posted.wait(&mut count);
        }

        *count -= 1;
    }

    /// Increment the count and wake one waiter.
    pub fn release(&self) {
        let mut count = self.count.lock();

        *count += 1;
        self.posted.notify_one();
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// A joinable thread.
///
/// Unlike `std::thread::JoinHandle`, dropping a `Thread` without joining it
/// is considered a bug in debug builds: every thread this crate spawns has a
/// defined join point. Joining from the thread itself aborts the process, as
/// does a spawn failure or a join on a thread that panicked.
pub struct Thread {
    handle: Option<thread::JoinHandle<()>>,
}

impl Thread {
    /// Spawn a named thread running `function`.
    ///
    /// Aborts the process if the OS refuses to create the thread.
    pub fn spawn<F>(name: &str, function: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(function)
            .unwrap_or_else(|_| abort());

        Self {
            handle: Some(handle),
        }
    }

    /// Wait for the thread to finish.
    ///
    /// Aborts the process when called from the thread itself or when the
    /// thread panicked; both indicate a bug in the caller.
    pub fn join(mut self) {
        let handle = match self.handle.take() {
            Some(handle) => handle,
            None => abort(),
        };

        if handle.thread().id() == thread::current().id() {
            abort();
        }

        if handle.join().is_err() {
            abort();
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        debug_assert!(self.handle.is_none(), "thread dropped without join");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_semaphore_release_before_acquire() {
        let semaphore = Semaphore::new();
        semaphore.release();
        semaphore.release();
        semaphore.acquire();
        semaphore.acquire();
    }

    #[test]
    fn test_semaphore_wakes_blocked_acquirer() {
        let semaphore = Arc::new(Semaphore::new());
        let acquired = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let semaphore = Arc::clone(&semaphore);
            let acquired = Arc::clone(&acquired);

            Thread::spawn("semaphore-waiter", move || {
                semaphore.acquire();
                acquired.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(acquired.load(Ordering::SeqCst), 0);

        semaphore.release();
        waiter.join();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_thread_runs_and_joins() {
        let counter = Arc::new(AtomicUsize::new(0));
        let thread = {
            let counter = Arc::clone(&counter);
            Thread::spawn("test-worker", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        thread.join();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
