//! Condition variable for blocking waits on a predicate.
//!
//! Used by the VFS request pipeline for caller-side waits on asynchronous
//! completion. Waiters park on the condvar's own address; wakers bump a
//! sequence counter first so a notification between unlock and park is
//! never lost.

use core::sync::atomic::{AtomicU32, Ordering};

use super::mutex::MutexGuard;
use super::parking::park_ops;

/// A condition variable.
///
/// Must always be used together with a [`Mutex`](super::Mutex) protecting
/// the predicate. Waits may return spuriously; callers loop on their
/// predicate.
pub struct Condvar {
    seq: AtomicU32,
}

impl Condvar {
    /// Creates a new condition variable.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            seq: AtomicU32::new(0),
        }
    }

    /// The parking token for this condvar: the address of the counter.
    fn token(&self) -> usize {
        core::ptr::from_ref(&self.seq) as usize
    }

    /// Atomically releases the guard's mutex and blocks until notified,
    /// then re-acquires the mutex.
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        let seq = self.seq.load(Ordering::Acquire);
        drop(guard);
        // Park only while no notification has arrived since we sampled.
        while self.seq.load(Ordering::Acquire) == seq {
            park_ops().park(self.token());
        }
        mutex.lock()
    }

    /// Wakes one waiting thread.
    pub fn notify_one(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        park_ops().unpark_one(self.token());
    }

    /// Wakes all waiting threads.
    pub fn notify_all(&self) {
        self.seq.fetch_add(1, Ordering::Release);
        park_ops().unpark_all(self.token());
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
