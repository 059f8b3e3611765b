//! Per-CPU state.
//!
//! One statically allocated block per core, indexed by the logical core
//! id. The BSP is core 0; application cores mark themselves online during
//! bring-up. The current-core resolver is registered at boot (it reads the
//! local APIC id); before registration everything runs as core 0, which is
//! correct for the single-core boot phase and for host tests.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use muon_core::id::{CoreId, DomainId};
use muon_core::sync::SpinLock;
use muon_sched::thread::Thread;

/// Maximum supported cores.
pub const MAX_CPUS: usize = 64;

/// Core lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuState {
    /// Not brought up.
    Offline = 0,
    /// Executing its boot path.
    Booting = 1,
    /// Scheduling normally.
    Running = 2,
}

/// Per-core block.
pub struct PerCpu {
    state: AtomicU32,
    /// The thread currently executing on this core.
    current: SpinLock<Option<Arc<Thread>>>,
    /// This core's idle thread.
    idle: SpinLock<Option<Arc<Thread>>>,
    /// NUMA domain (from the SRAT; BOOT before discovery).
    domain: AtomicU32,
    /// Set while the core executes in interrupt context.
    interrupt_depth: AtomicU32,
    /// Outstanding TLB shoot-down acknowledgements this core owes.
    tlb_pending: AtomicU32,
    /// Milliseconds left of the running thread's timeslice.
    quantum_left: AtomicU32,
}

impl PerCpu {
    const fn new() -> Self {
        Self {
            state: AtomicU32::new(CpuState::Offline as u32),
            current: SpinLock::new(None),
            idle: SpinLock::new(None),
            domain: AtomicU32::new(0),
            interrupt_depth: AtomicU32::new(0),
            tlb_pending: AtomicU32::new(0),
            quantum_left: AtomicU32::new(0),
        }
    }

    /// Core lifecycle state.
    #[must_use]
    pub fn state(&self) -> CpuState {
        match self.state.load(Ordering::Acquire) {
            1 => CpuState::Booting,
            2 => CpuState::Running,
            _ => CpuState::Offline,
        }
    }

    /// Advances the lifecycle state.
    pub fn set_state(&self, state: CpuState) {
        self.state.store(state as u32, Ordering::Release);
    }

    /// The current thread, if scheduling has started.
    #[must_use]
    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.current.lock().clone()
    }

    /// Installs the current thread.
    pub fn set_current_thread(&self, thread: Arc<Thread>) {
        *self.current.lock() = Some(thread);
    }

    /// This core's idle thread.
    #[must_use]
    pub fn idle_thread(&self) -> Option<Arc<Thread>> {
        self.idle.lock().clone()
    }

    /// Registers the idle thread.
    pub fn set_idle_thread(&self, thread: Arc<Thread>) {
        *self.idle.lock() = Some(thread);
    }

    /// Whether the core is running its idle thread.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let current = self.current.lock();
        let idle = self.idle.lock();
        match (current.as_ref(), idle.as_ref()) {
            (Some(c), Some(i)) => Arc::ptr_eq(c, i),
            _ => false,
        }
    }

    /// NUMA domain.
    #[must_use]
    pub fn domain(&self) -> DomainId {
        DomainId::new(self.domain.load(Ordering::Relaxed))
    }

    /// Assigns the NUMA domain.
    pub fn set_domain(&self, domain: DomainId) {
        self.domain.store(domain.as_u32(), Ordering::Relaxed);
    }

    /// Enters interrupt context.
    pub fn enter_interrupt(&self) {
        self.interrupt_depth.fetch_add(1, Ordering::AcqRel);
    }

    /// Leaves interrupt context.
    pub fn leave_interrupt(&self) {
        self.interrupt_depth.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether the core is inside an interrupt handler.
    #[must_use]
    pub fn in_interrupt(&self) -> bool {
        self.interrupt_depth.load(Ordering::Acquire) != 0
    }

    /// The shoot-down acknowledgement counter.
    #[must_use]
    pub fn tlb_pending(&self) -> &AtomicU32 {
        &self.tlb_pending
    }

    /// Grants the running thread a fresh timeslice.
    pub fn set_quantum(&self, ms: u32) {
        self.quantum_left.store(ms, Ordering::Relaxed);
    }

    /// Burns `elapsed_ms` of the running thread's timeslice; returns
    /// `true` when the quantum has expired.
    pub fn quantum_tick(&self, elapsed_ms: u32) -> bool {
        let left = self.quantum_left.load(Ordering::Relaxed);
        let next = left.saturating_sub(elapsed_ms);
        self.quantum_left.store(next, Ordering::Relaxed);
        next == 0
    }
}

static PERCPU: [PerCpu; MAX_CPUS] = [const { PerCpu::new() }; MAX_CPUS];

/// Number of cores discovered at boot.
static ONLINE_LIMIT: AtomicUsize = AtomicUsize::new(1);

/// Resolver from "this CPU" to its logical id; null until registered.
static CURRENT_CORE_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the current-core resolver (reads the local APIC id).
pub fn register_current_core(f: fn() -> CoreId) {
    CURRENT_CORE_FN.store(f as *mut (), Ordering::Release);
}

/// Records how many cores the MADT reported.
pub fn set_core_count(count: usize) {
    ONLINE_LIMIT.store(count.clamp(1, MAX_CPUS), Ordering::Release);
}

/// Number of cores known to the system.
#[must_use]
pub fn core_count() -> usize {
    ONLINE_LIMIT.load(Ordering::Acquire)
}

/// The logical id of the calling core (0 before registration).
#[must_use]
pub fn current_core() -> CoreId {
    let ptr = CURRENT_CORE_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return CoreId::new(0);
    }
    // SAFETY: stored by `register_current_core` from a valid fn pointer.
    let f: fn() -> CoreId = unsafe { core::mem::transmute(ptr) };
    f()
}

/// The per-CPU block of `core`.
#[must_use]
pub fn get(core: CoreId) -> &'static PerCpu {
    &PERCPU[core.as_usize() % MAX_CPUS]
}

/// The calling core's block.
#[must_use]
pub fn current() -> &'static PerCpu {
    get(current_core())
}
