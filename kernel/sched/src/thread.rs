//! Thread objects and the global thread table.
//!
//! A [`Thread`] carries identity, scheduling state, per-level saved
//! contexts, a sleep block, and a reference to its address space. Mutable
//! scheduling state lives in atomics so the sleep queue and the per-core
//! run queues can update it under their own locks.
//!
//! Every thread tracks its [`ThreadLocation`]; queue operations move it
//! with compare-and-swap transitions, which makes the "a thread is on at
//! most one queue at a time" invariant checkable at the API instead of by
//! convention.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use muon_core::id::{CoreId, ProcessId, ThreadId};
use muon_core::sync::SpinLock;
use muon_mm::address_space::AddressSpace;

bitflags::bitflags! {
    /// Thread mode and lifecycle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Per-core idle thread.
        const IDLE            = 1 << 0;
        /// Runs in kernel mode.
        const KERNEL          = 1 << 1;
        /// Driver thread (kernel mode, user address space).
        const DRIVER          = 1 << 2;
        /// Runs in user mode.
        const USER            = 1 << 3;
        /// Pinned to its core; placement never moves it.
        const BOUND           = 1 << 4;
        /// Nobody will join this thread; the reaper frees it.
        const DETACHED        = 1 << 5;
        /// The thread has exited and awaits the reaper.
        const FINISHED        = 1 << 6;
        /// The thread is blocked on the sleep queue.
        const BLOCKED         = 1 << 7;
        /// The thread queued itself elsewhere; the scheduler must not
        /// requeue it on switch-out.
        const REQUEUE         = 1 << 8;
        /// The next context switch drops the thread to user mode.
        const TRANSITION_USER = 1 << 9;
    }
}

/// Where a thread currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadLocation {
    /// Not on any queue (being created or torn down).
    Detached = 0,
    /// On some core's run queue.
    Ready = 1,
    /// On the global sleep queue.
    Sleeping = 2,
    /// Current thread of some core.
    Running = 3,
}

impl ThreadLocation {
    fn from_u8(val: u8) -> Self {
        match val {
            1 => Self::Ready,
            2 => Self::Sleeping,
            3 => Self::Running,
            _ => Self::Detached,
        }
    }
}

/// Sleep bookkeeping; fields are written under the sleep-queue lock and by
/// the tick handler.
#[derive(Debug, Default)]
pub struct SleepBlock {
    /// Milliseconds until the deadline; 0 means no deadline.
    pub remaining_ms: AtomicU64,
    /// Deadline reached while a wake token was armed.
    pub timed_out: AtomicBool,
    /// Rendezvous token; 0 when sleeping without one.
    pub wake_token: AtomicUsize,
    /// Timestamp of the wake decision; 0 while still pending.
    pub woken_at: AtomicU64,
}

/// A saved execution context.
///
/// The architecture layer owns the interpretation; the scheduler only
/// stores and hands these out per [`ContextSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Context {
    /// Saved instruction pointer.
    pub ip: u64,
    /// Saved stack pointer.
    pub sp: u64,
    /// First argument register for entry trampolines.
    pub arg: u64,
}

/// The four per-thread context slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextSlot {
    /// Kernel-mode execution (level 0).
    Kernel = 0,
    /// User-mode execution (level 1).
    User = 1,
    /// Kernel-mode signal delivery.
    KernelSignal = 2,
    /// User-mode signal delivery.
    UserSignal = 3,
}

/// A kernel, driver, or user thread.
pub struct Thread {
    id: ThreadId,
    process: ProcessId,
    parent: Option<ThreadId>,
    name: String,
    flags: AtomicU32,
    location: AtomicU8,
    /// Current run-queue level (0 = highest priority).
    pub queue_level: AtomicUsize,
    /// Current timeslice budget in milliseconds.
    pub timeslice_ms: AtomicU32,
    /// The core this thread is placed on.
    core: AtomicU32,
    exit_code: AtomicI64,
    /// Kernel stack pointer parked here by the architecture context
    /// switch while the thread is off-CPU.
    pub kernel_rsp: AtomicU64,
    /// 0 while the thread runs, 1 once it has finished. Joiners sleep on
    /// this word with `atomic_sleep`, closing the kill/join race.
    pub finished_latch: AtomicU32,
    /// Sleep bookkeeping.
    pub sleep: SleepBlock,
    contexts: SpinLock<[Option<Context>; 4]>,
    address_space: Option<Arc<AddressSpace>>,
}

impl Thread {
    /// Creates a thread object; it is not yet known to any scheduler.
    pub fn new(
        id: ThreadId,
        process: ProcessId,
        parent: Option<ThreadId>,
        name: &str,
        flags: ThreadFlags,
        address_space: Option<Arc<AddressSpace>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            process,
            parent,
            name: String::from(name),
            flags: AtomicU32::new(flags.bits()),
            location: AtomicU8::new(ThreadLocation::Detached as u8),
            queue_level: AtomicUsize::new(0),
            timeslice_ms: AtomicU32::new(0),
            core: AtomicU32::new(0),
            exit_code: AtomicI64::new(0),
            kernel_rsp: AtomicU64::new(0),
            finished_latch: AtomicU32::new(0),
            sleep: SleepBlock::default(),
            contexts: SpinLock::new([None; 4]),
            address_space,
        })
    }

    /// Thread id.
    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Owning process id.
    #[must_use]
    pub fn process(&self) -> ProcessId {
        self.process
    }

    /// Creator's thread id, if any.
    #[must_use]
    pub fn parent(&self) -> Option<ThreadId> {
        self.parent
    }

    /// Thread name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The thread's address space, if it has one of its own.
    #[must_use]
    pub fn address_space(&self) -> Option<&Arc<AddressSpace>> {
        self.address_space.as_ref()
    }

    /// Current flag set.
    #[must_use]
    pub fn flags(&self) -> ThreadFlags {
        ThreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    /// Sets the given flags.
    pub fn set_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clears the given flags.
    pub fn clear_flags(&self, flags: ThreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Tests a flag.
    #[must_use]
    pub fn has_flags(&self, flags: ThreadFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Current location.
    #[must_use]
    pub fn location(&self) -> ThreadLocation {
        ThreadLocation::from_u8(self.location.load(Ordering::Acquire))
    }

    /// Moves the thread from `from` to `to`; fails if it is anywhere else.
    ///
    /// Queue code panics on failure: a failed transition means the thread
    /// was about to appear on two queues at once.
    pub fn transition(&self, from: ThreadLocation, to: ThreadLocation) -> bool {
        self.location
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditionally sets the location (boot-time only).
    pub fn force_location(&self, location: ThreadLocation) {
        self.location.store(location as u8, Ordering::Release);
    }

    /// Core the thread is placed on.
    #[must_use]
    pub fn core(&self) -> CoreId {
        CoreId::new(self.core.load(Ordering::Acquire))
    }

    /// Re-places the thread onto `core`.
    pub fn set_core(&self, core: CoreId) {
        self.core.store(core.as_u32(), Ordering::Release);
    }

    /// Stores the exit code.
    pub fn set_exit_code(&self, code: i64) {
        self.exit_code.store(code, Ordering::Release);
    }

    /// The exit code (valid once finished).
    #[must_use]
    pub fn exit_code(&self) -> i64 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// The sleep/wake rendezvous token joiners and killers agree on: the
    /// address of the finished latch, so `atomic_sleep` on the latch and
    /// `signal_token` from the killer meet at the same key.
    #[must_use]
    pub fn join_token(&self) -> usize {
        core::ptr::from_ref(&self.finished_latch) as usize
    }

    /// Stores a context in `slot`.
    pub fn set_context(&self, slot: ContextSlot, context: Context) {
        self.contexts.lock()[slot as usize] = Some(context);
    }

    /// Loads the context in `slot`.
    #[must_use]
    pub fn context(&self, slot: ContextSlot) -> Option<Context> {
        self.contexts.lock()[slot as usize]
    }
}

// ---------------------------------------------------------------------------
// Thread table
// ---------------------------------------------------------------------------

/// Global id-keyed thread table with a reaper.
pub struct ThreadTable {
    inner: SpinLock<Vec<Arc<Thread>>>,
}

impl ThreadTable {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Vec::new()),
        }
    }

    /// Adds a thread.
    pub fn insert(&self, thread: Arc<Thread>) {
        let mut inner = self.inner.lock();
        debug_assert!(
            !inner.iter().any(|t| t.id() == thread.id()),
            "duplicate thread id {}",
            thread.id()
        );
        inner.push(thread);
    }

    /// Looks up a thread by id.
    #[must_use]
    pub fn get(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.inner.lock().iter().find(|t| t.id() == id).cloned()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Removes finished threads from the table and returns them.
    ///
    /// Each finished thread leaves the table exactly once; callers drop the
    /// returned handles to release the final references.
    pub fn reap(&self) -> Vec<Arc<Thread>> {
        let mut inner = self.inner.lock();
        let mut reaped = Vec::new();
        inner.retain(|t| {
            if t.has_flags(ThreadFlags::FINISHED) && t.location() == ThreadLocation::Detached {
                reaped.push(t.clone());
                false
            } else {
                true
            }
        });
        reaped
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}
