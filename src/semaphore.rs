//! Blocking counting semaphore for OS threads.
//!
//! Used both as the connection limiter of the accept loop and as the
//! produce/consume counters of the command queue.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Counting semaphore built on a mutex-guarded counter and a condition variable.
pub struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` units.
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Take one unit, blocking until one is available.
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.available.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take one unit without blocking.
    #[cfg(test)]
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Give one unit back and wake a single waiter.
    pub fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.available.notify_one();
    }

    /// Take one unit and tie its release to the returned guard.
    pub fn acquire_owned(self: &Arc<Self>) -> OwnedPermit {
        self.acquire();
        OwnedPermit {
            semaphore: Arc::clone(self),
        }
    }

    /// Units currently available.
    #[cfg(test)]
    pub fn available_permits(&self) -> usize {
        *self.permits.lock()
    }
}

/// A unit taken from a shared [`Semaphore`], returned when dropped.
///
/// Owned so that it can move into the thread it accounts for.
pub struct OwnedPermit {
    semaphore: Arc<Semaphore>,
}

impl Drop for OwnedPermit {
    fn drop(&mut self) {
        self.semaphore.release();
    }
}
