//! The global sleep queue.
//!
//! One queue holds every blocked thread regardless of core. Threads
//! rendezvous with wakers through pointer-sized tokens; the timer tick
//! decrements deadlines and the first writer of `woken_at` (signal or
//! timeout) decides the wake reason.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use muon_core::id::CoreId;
use muon_core::sync::SpinLock;

use crate::thread::{Thread, ThreadFlags, ThreadLocation};

/// The shared sleep queue.
pub struct SleepQueue {
    inner: SpinLock<VecDeque<Arc<Thread>>>,
}

impl SleepQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(VecDeque::new()),
        }
    }

    /// Enqueues `thread` as a sleeper.
    ///
    /// With `atomic_check = Some((atomic, expected))` the comparison happens
    /// inside the queue lock: when the atomic no longer holds `expected`
    /// the thread is not enqueued and `false` is returned, establishing the
    /// happens-before edge `atomic_sleep` promises — a writer that stores a
    /// different value before our enqueue is observed here, and one that
    /// stores after it will find us with `signal_token`.
    pub fn enqueue(
        &self,
        thread: &Arc<Thread>,
        token: usize,
        timeout_ms: u64,
        atomic_check: Option<(&AtomicU32, u32)>,
    ) -> bool {
        let mut queue = self.inner.lock();
        debug_assert!(
            !queue.iter().any(|t| Arc::ptr_eq(t, thread)),
            "thread {} already sleeping",
            thread.id()
        );

        if let Some((atomic, expected)) = atomic_check {
            if atomic.load(Ordering::SeqCst) != expected {
                return false;
            }
        }

        thread.sleep.remaining_ms.store(timeout_ms, Ordering::Relaxed);
        thread.sleep.timed_out.store(false, Ordering::Relaxed);
        thread.sleep.wake_token.store(token, Ordering::Relaxed);
        thread.sleep.woken_at.store(0, Ordering::Relaxed);

        assert!(
            thread.location() != ThreadLocation::Ready,
            "sleeping thread {} still on a run queue",
            thread.id()
        );
        thread.force_location(ThreadLocation::Sleeping);
        thread.set_flags(ThreadFlags::BLOCKED | ThreadFlags::REQUEUE);
        queue.push_back(thread.clone());
        true
    }

    /// Marks a pending sleeper woken. Returns `false` if the thread is not
    /// on the queue or its wake was already decided.
    pub fn signal_thread(&self, thread: &Thread, now: u64) -> bool {
        let queue = self.inner.lock();
        let pending = queue
            .iter()
            .any(|t| core::ptr::eq(Arc::as_ptr(t), thread) && t.sleep.woken_at.load(Ordering::Relaxed) == 0);
        if pending {
            thread.sleep.woken_at.store(now.max(1), Ordering::Release);
        }
        pending
    }

    /// Wakes the first pending sleeper whose token matches.
    pub fn signal_token(&self, token: usize, now: u64) -> Option<Arc<Thread>> {
        let queue = self.inner.lock();
        for thread in queue.iter() {
            if thread.sleep.woken_at.load(Ordering::Relaxed) == 0
                && thread.sleep.wake_token.load(Ordering::Relaxed) == token
            {
                thread.sleep.woken_at.store(now.max(1), Ordering::Release);
                return Some(thread.clone());
            }
        }
        None
    }

    /// Advances sleep accounting by `elapsed_ms`.
    ///
    /// Returns the threads whose deadline was reached by this tick, for
    /// core synchronization. A sleeper with a non-null token that times out
    /// has `timed_out` set; untimed waits (remaining 0) are never touched.
    pub fn tick(&self, elapsed_ms: u64, now: u64) -> Vec<Arc<Thread>> {
        let queue = self.inner.lock();
        let mut expired = Vec::new();
        for thread in queue.iter() {
            if thread.sleep.woken_at.load(Ordering::Relaxed) != 0 {
                continue;
            }
            let remaining = thread.sleep.remaining_ms.load(Ordering::Relaxed);
            if remaining == 0 {
                continue;
            }
            let next = remaining.saturating_sub(elapsed_ms);
            thread.sleep.remaining_ms.store(next, Ordering::Relaxed);
            if next == 0 {
                if thread.sleep.wake_token.load(Ordering::Relaxed) != 0 {
                    thread.sleep.timed_out.store(true, Ordering::Relaxed);
                }
                thread.sleep.woken_at.store(now.max(1), Ordering::Release);
                expired.push(thread.clone());
            }
        }
        expired
    }

    /// Removes and returns the woken sleepers placed on `core`, skipping
    /// idle threads (they are never requeued).
    pub fn take_woken_for_core(&self, core: CoreId) -> Vec<Arc<Thread>> {
        let mut queue = self.inner.lock();
        let mut taken = Vec::new();
        queue.retain(|t| {
            let woken = t.sleep.woken_at.load(Ordering::Relaxed) != 0;
            if woken && t.core() == core {
                t.force_location(ThreadLocation::Detached);
                if !t.has_flags(ThreadFlags::IDLE) {
                    taken.push(t.clone());
                }
                false
            } else {
                true
            }
        });
        taken
    }

    /// Removes `thread` if it is still queued. Returns whether it was.
    pub fn remove(&self, thread: &Arc<Thread>) -> bool {
        let mut queue = self.inner.lock();
        let before = queue.len();
        queue.retain(|t| !Arc::ptr_eq(t, thread));
        queue.len() != before
    }

    /// Whether `thread` is on the queue.
    #[must_use]
    pub fn contains(&self, thread: &Arc<Thread>) -> bool {
        self.inner.lock().iter().any(|t| Arc::ptr_eq(t, thread))
    }

    /// Number of queued sleepers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for SleepQueue {
    fn default() -> Self {
        Self::new()
    }
}
