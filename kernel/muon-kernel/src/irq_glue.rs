//! Interrupt dispatch wiring.
//!
//! Owns the global interrupt table and the deferred queue, provides the
//! common entry the architecture vector stubs call, runs the deferred
//! drain thread, and implements the cross-core TLB shoot-down protocol
//! behind the callback the memory manager invokes.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use muon_core::addr::VirtAddr;
use muon_core::id::ThreadId;
use muon_core::sync::SpinLock;
use muon_irq::controller::{InterruptController, IpiKind};
use muon_irq::deferred::{DeferredQueue, Impersonation};
use muon_irq::table::InterruptTable;
use muon_mm::PAGE_SIZE;

use crate::apic::{self, IPI_TLB_VECTOR, IPI_YIELD_VECTOR};
use crate::{arch, percpu, platform};

/// The system-wide deferred interrupt queue.
pub static DEFERRED: DeferredQueue = DeferredQueue::new();

static TABLE: AtomicPtr<InterruptTable> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the interrupt table. Called once from boot.
pub fn install_table(table: InterruptTable) {
    TABLE.store(Box::into_raw(Box::new(table)), Ordering::Release);
}

/// The system interrupt table.
///
/// # Panics
///
/// Panics before [`install_table`].
#[must_use]
pub fn table() -> &'static InterruptTable {
    let ptr = TABLE.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "interrupt table not installed");
    // SAFETY: installed once from a leaked box, never freed.
    unsafe { &*ptr }
}

/// Common entry for hardware interrupts; the architecture vector stubs
/// call this with interrupts disabled on the local core.
pub fn dispatch_interrupt(vector: u16) {
    let cpu = percpu::current();
    cpu.enter_interrupt();

    let mut want_reschedule = false;
    match vector {
        v if v == u16::from(IPI_YIELD_VECTOR) => want_reschedule = true,
        v if v == u16::from(IPI_TLB_VECTOR) => shootdown_acknowledge(),
        _ => {
            let _ = table().dispatch(vector);
        }
    }

    if let Some(controller) = apic::controller() {
        controller.eoi(vector);
    }
    cpu.leave_interrupt();

    if want_reschedule {
        platform::reschedule(true);
    }
}

// ---------------------------------------------------------------------------
// Deferred drain thread
// ---------------------------------------------------------------------------

/// Address-space impersonation for the drain loop: adopt the target
/// thread's root around the full handler, restore afterwards.
struct ThreadImpersonation {
    saved_root: SpinLock<Option<muon_core::addr::PhysAddr>>,
}

static IMPERSONATION: ThreadImpersonation = ThreadImpersonation {
    saved_root: SpinLock::new(None),
};

impl Impersonation for ThreadImpersonation {
    fn enter(&self, thread: ThreadId) -> bool {
        let Some(sched) = platform::scheduler_if_installed() else {
            return false;
        };
        let Some(target) = sched.table().get(thread) else {
            return false;
        };
        let Some(space) = target.address_space() else {
            return false;
        };
        let current = arch::current_root();
        if space.root_phys() == current {
            return false;
        }
        *self.saved_root.lock() = Some(current);
        // SAFETY: the target space maps the kernel half identically.
        unsafe { arch::load_root(space.root_phys()) };
        true
    }

    fn leave(&self) {
        if let Some(root) = self.saved_root.lock().take() {
            // SAFETY: restoring the root we were running on.
            unsafe { arch::load_root(root) };
        }
    }
}

/// Wakes the drain thread after a push from interrupt context.
fn wake_drain_thread(token: usize) {
    if let Some(sched) = platform::scheduler_if_installed() {
        sched.signal_token(token);
    }
}

/// The drain thread: runs every queued deferred interrupt, sleeping on
/// the queue's pending counter when idle.
extern "C" fn deferred_drain_entry(_arg: usize) {
    let sched = platform::scheduler();
    let current = percpu::current()
        .current_thread()
        .expect("drain thread without identity");
    loop {
        let observed = DEFERRED.pending_word().load(Ordering::SeqCst);
        if DEFERRED.drain_one(&IMPERSONATION) {
            continue;
        }
        let _ = sched.atomic_sleep(&current, DEFERRED.pending_word(), observed, 0);
    }
}

/// Queues the deferred half of a registration from its fast handler.
///
/// Looks the descriptor up by id and pushes its threaded handler; a full
/// ring drops the work (the overrun counter records it).
pub fn defer(id: muon_irq::InterruptId) {
    let Some(descriptor) = table().get(id) else {
        return;
    };
    let Some(handler) = descriptor.deferred_handler() else {
        return;
    };
    let _ = DEFERRED.push(muon_irq::deferred::DeferredInterrupt {
        id,
        thread: descriptor.owner_thread(),
        handler,
        context: descriptor.context(),
    });
}

/// Removes a registration and masks the line at the controller when the
/// vector lost its last user (NMI lines are never masked).
///
/// # Errors
///
/// Propagates [`muon_irq::IrqError::DoesNotExist`] for unknown ids.
pub fn unregister_interrupt(id: muon_irq::InterruptId) -> Result<(), muon_irq::IrqError> {
    let source = table().get(id).and_then(|d| d.source());
    let idle = table().unregister(id)?;
    if idle {
        if let (Some(line), Some(controller)) = (source, apic::controller()) {
            controller.mask(line);
        }
    }
    Ok(())
}

/// Starts the deferred drain thread and connects the queue's waker.
pub fn start_deferred_thread() {
    DEFERRED.register_waker(wake_drain_thread);
    platform::spawn(
        "irq-deferred",
        deferred_drain_entry,
        0,
        muon_sched::thread::ThreadFlags::empty(),
    );
}

// ---------------------------------------------------------------------------
// TLB shoot-down
// ---------------------------------------------------------------------------

/// Range the current shoot-down round covers.
static SHOOTDOWN_BASE: AtomicU64 = AtomicU64::new(0);
static SHOOTDOWN_PAGES: AtomicUsize = AtomicUsize::new(0);
/// Serializes initiators.
static SHOOTDOWN_LOCK: SpinLock<()> = SpinLock::new(());

/// The flush callback registered with the memory manager: invalidate
/// locally, then run the IPI protocol against every other running core
/// and wait for each acknowledgement.
pub fn tlb_flush(virt: VirtAddr, pages: usize) {
    for page in 0..pages {
        arch::invalidate_page(virt + (page * PAGE_SIZE) as u64);
    }

    let Some(controller) = apic::controller() else {
        return;
    };
    let _guard = SHOOTDOWN_LOCK.lock();
    SHOOTDOWN_BASE.store(virt.as_u64(), Ordering::Release);
    SHOOTDOWN_PAGES.store(pages, Ordering::Release);

    let me = percpu::current_core();
    let mut marked = alloc::vec::Vec::new();
    for index in 0..percpu::core_count() {
        let core = muon_core::id::CoreId::new(index as u32);
        if core == me || percpu::get(core).state() != percpu::CpuState::Running {
            continue;
        }
        percpu::get(core).tlb_pending().store(1, Ordering::Release);
        controller.send_ipi(core, IpiKind::TlbShootdown);
        marked.push(core);
    }
    for core in marked {
        while percpu::get(core).tlb_pending().load(Ordering::Acquire) != 0 {
            core::hint::spin_loop();
        }
    }
}

/// Responder side, called from the shoot-down IPI vector.
pub fn shootdown_acknowledge() {
    let base = SHOOTDOWN_BASE.load(Ordering::Acquire);
    let pages = SHOOTDOWN_PAGES.load(Ordering::Acquire);
    for page in 0..pages {
        arch::invalidate_page(VirtAddr::new(base) + (page * PAGE_SIZE) as u64);
    }
    percpu::current().tlb_pending().store(0, Ordering::Release);
}
