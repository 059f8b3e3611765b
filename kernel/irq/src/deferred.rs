//! The deferred-interrupt queue.
//!
//! Fast handlers run with interrupts disabled and must not block; work
//! that needs a thread (user notification, blocking locks, address-space
//! access) is pushed here and drained by a dedicated kernel thread. The
//! drain loop impersonates the owning thread's address space around each
//! full handler.
//!
//! The queue is a fixed-capacity ring under a spin lock; pushes from
//! interrupt context never allocate. Waking the drain thread goes through
//! a registered callback so this crate stays below the scheduler in the
//! dependency order.

use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use muon_core::id::ThreadId;
use muon_core::sync::SpinLock;
use planck_noalloc::ringbuf::RingBuf;

use crate::{DeferredHandler, InterruptId};

/// Ring capacity (one slot is kept empty by the ring's index scheme).
const QUEUE_SLOTS: usize = 64;

/// One unit of deferred work.
#[derive(Debug, Clone, Copy)]
pub struct DeferredInterrupt {
    /// The registration that raised it.
    pub id: InterruptId,
    /// The thread whose address space the handler runs under.
    pub thread: ThreadId,
    /// The threaded handler.
    pub handler: DeferredHandler,
    /// Opaque handler context.
    pub context: usize,
}

/// Address-space impersonation used by the drain loop.
pub trait Impersonation: Sync {
    /// Switches to the address space of `thread` if it differs from the
    /// current one. Returns whether a switch happened.
    fn enter(&self, thread: ThreadId) -> bool;

    /// Restores the address space active before [`enter`](Self::enter).
    fn leave(&self);
}

/// The deferred queue.
pub struct DeferredQueue {
    ring: SpinLock<RingBuf<DeferredInterrupt, QUEUE_SLOTS>>,
    /// Bumped on every push; the drain thread sleeps against it.
    pending: AtomicU32,
    /// Callback waking the drain thread; null until the kernel wires it.
    waker: AtomicPtr<()>,
    /// Pushes dropped because the ring was full.
    overruns: AtomicU32,
}

/// Drain-thread wake callback signature.
pub type WakeFn = fn(token: usize);

impl DeferredQueue {
    /// Creates an empty queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ring: SpinLock::new(RingBuf::new()),
            pending: AtomicU32::new(0),
            waker: AtomicPtr::new(core::ptr::null_mut()),
            overruns: AtomicU32::new(0),
        }
    }

    /// The token the drain thread sleeps on: the pending counter's address,
    /// matching what `atomic_sleep` on that counter uses.
    #[must_use]
    pub fn token(&self) -> usize {
        core::ptr::from_ref(&self.pending) as usize
    }

    /// The pending counter the drain thread parks against.
    #[must_use]
    pub fn pending_word(&self) -> &AtomicU32 {
        &self.pending
    }

    /// Registers the callback that kicks the drain thread after a push.
    pub fn register_waker(&self, wake: WakeFn) {
        self.waker.store(wake as *mut (), Ordering::Release);
    }

    /// Queues deferred work. Safe from interrupt context: bounded, no
    /// allocation, spin lock only.
    ///
    /// # Errors
    ///
    /// Returns the item back when the ring is full (the interrupt is
    /// effectively dropped; the overrun counter records it).
    pub fn push(&self, item: DeferredInterrupt) -> Result<(), DeferredInterrupt> {
        let result = self.ring.lock().try_push(item);
        match result {
            Ok(()) => {
                self.pending.fetch_add(1, Ordering::SeqCst);
                let ptr = self.waker.load(Ordering::Acquire);
                if !ptr.is_null() {
                    // SAFETY: stored by `register_waker` from a valid WakeFn.
                    let wake: WakeFn = unsafe { core::mem::transmute(ptr) };
                    wake(self.token());
                }
                Ok(())
            }
            Err(item) => {
                self.overruns.fetch_add(1, Ordering::Relaxed);
                Err(item)
            }
        }
    }

    /// Pops one item.
    #[must_use]
    pub fn pop(&self) -> Option<DeferredInterrupt> {
        self.ring.lock().pop()
    }

    /// Processes one queued item under impersonation. Returns whether an
    /// item was processed.
    pub fn drain_one(&self, impersonation: &dyn Impersonation) -> bool {
        let Some(item) = self.pop() else {
            return false;
        };
        let switched = impersonation.enter(item.thread);
        (item.handler)(item.context);
        if switched {
            impersonation.leave();
        }
        true
    }

    /// Processes everything currently queued. Returns the item count.
    pub fn drain_all(&self, impersonation: &dyn Impersonation) -> usize {
        let mut count = 0;
        while self.drain_one(impersonation) {
            count += 1;
        }
        count
    }

    /// Number of pushes dropped on a full ring.
    #[must_use]
    pub fn overruns(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }
}

impl Default for DeferredQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static RAN: AtomicUsize = AtomicUsize::new(0);
    static SWITCHES: AtomicUsize = AtomicUsize::new(0);

    fn handler(context: usize) {
        RAN.fetch_add(context, Ordering::SeqCst);
    }

    struct TestImpersonation {
        /// Threads considered "foreign" (require a switch).
        foreign: ThreadId,
    }

    impl Impersonation for TestImpersonation {
        fn enter(&self, thread: ThreadId) -> bool {
            if thread == self.foreign {
                SWITCHES.fetch_add(1, Ordering::SeqCst);
                true
            } else {
                false
            }
        }

        fn leave(&self) {}
    }

    fn item(context: usize, thread: u64) -> DeferredInterrupt {
        DeferredInterrupt {
            id: InterruptId::new(0, 33),
            thread: ThreadId::new(thread),
            handler,
            context,
        }
    }

    #[test]
    fn push_pop_fifo() {
        let queue = DeferredQueue::new();
        queue.push(item(1, 1)).unwrap();
        queue.push(item(2, 1)).unwrap();
        assert_eq!(queue.pop().unwrap().context, 1);
        assert_eq!(queue.pop().unwrap().context, 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn drain_runs_handlers_with_impersonation() {
        let queue = DeferredQueue::new();
        let imp = TestImpersonation {
            foreign: ThreadId::new(7),
        };
        queue.push(item(10, 7)).unwrap();
        queue.push(item(100, 1)).unwrap();

        let ran = RAN.load(Ordering::SeqCst);
        let switches = SWITCHES.load(Ordering::SeqCst);
        assert_eq!(queue.drain_all(&imp), 2);
        assert_eq!(RAN.load(Ordering::SeqCst) - ran, 110);
        // Only the foreign thread's item forced a switch.
        assert_eq!(SWITCHES.load(Ordering::SeqCst) - switches, 1);
    }

    #[test]
    fn full_ring_reports_overrun() {
        let queue = DeferredQueue::new();
        let mut pushed = 0;
        while queue.push(item(1, 1)).is_ok() {
            pushed += 1;
        }
        // Ring keeps one slot free by construction.
        assert_eq!(pushed, QUEUE_SLOTS - 1);
        assert_eq!(queue.overruns(), 1);
    }

    #[test]
    fn waker_fires_on_push() {
        use std::sync::atomic::AtomicUsize as StdAtomicUsize;
        static WOKEN: StdAtomicUsize = StdAtomicUsize::new(0);
        fn wake(_token: usize) {
            WOKEN.fetch_add(1, Ordering::SeqCst);
        }

        let queue = DeferredQueue::new();
        queue.push(item(1, 1)).unwrap();
        let before = WOKEN.load(Ordering::SeqCst);
        queue.register_waker(wake);
        queue.push(item(2, 1)).unwrap();
        assert_eq!(WOKEN.load(Ordering::SeqCst) - before, 1);
    }
}
