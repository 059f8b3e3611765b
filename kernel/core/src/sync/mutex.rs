//! Blocking mutual exclusion lock.
//!
//! Unlike [`SpinLock`](super::SpinLock), a contended [`Mutex`] parks the
//! calling thread (through the registered parking hook) instead of spinning,
//! allowing the scheduler to run other work. Must never be acquired from
//! interrupt context.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

use super::parking::park_ops;

/// Lock is free.
const FREE: u32 = 0;
/// Lock is held, no waiters recorded.
const HELD: u32 = 1;
/// Lock is held and at least one thread parked (or about to park).
const CONTENDED: u32 = 2;

/// A blocking mutual exclusion lock.
///
/// Const-constructable for use in `static` items. The lock word doubles as
/// the parking token, so waiters rendezvous on the lock's own address.
pub struct Mutex<T> {
    state: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: The Mutex ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different threads.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new unlocked `Mutex` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicU32::new(FREE),
            data: UnsafeCell::new(value),
        }
    }

    /// The parking token for this lock: the address of the state word.
    fn token(&self) -> usize {
        core::ptr::from_ref(&self.state) as usize
    }

    /// Acquires the lock, parking the calling thread while it is contended.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        // Fast path: uncontended acquisition.
        if self
            .state
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return MutexGuard { mutex: self };
        }

        // Slow path: mark contended so unlock knows to wake us, then park.
        loop {
            let prev = self.state.swap(CONTENDED, Ordering::Acquire);
            if prev == FREE {
                // We took the lock; it stays CONTENDED so unlock wakes the
                // next waiter even if none remain (a harmless spurious wake).
                return MutexGuard { mutex: self };
            }
            park_ops().park(self.token());
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .state
            .compare_exchange(FREE, HELD, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(MutexGuard { mutex: self })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data.
    ///
    /// No locking is needed because `&mut self` guarantees exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn unlock(&self) {
        if self.state.swap(FREE, Ordering::Release) == CONTENDED {
            park_ops().unpark_one(self.token());
        }
    }
}

/// RAII guard that releases the [`Mutex`] when dropped.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// Returns a reference to the underlying [`Mutex`].
    ///
    /// Used by [`Condvar::wait`](super::Condvar::wait) to re-acquire after
    /// release.
    pub fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}
