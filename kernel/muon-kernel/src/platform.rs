//! Scheduler and blocking-primitive glue.
//!
//! Implements the scheduler's [`Platform`] over per-CPU state, the APIC,
//! and the system timer; drives the context switch; and wires the
//! blocking primitives' parking hooks onto token sleeps. Everything is
//! installed once during boot bring-up.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, Ordering};

use muon_core::id::{CoreId, ProcessId, ThreadId, ThreadIdAllocator};
use muon_core::sync::{ParkOps, SpinLock, register_parking};
use muon_irq::controller::{InterruptController, IpiKind};
use muon_sched::Platform;
use muon_sched::scheduler::Scheduler;
use muon_sched::thread::{Context, ContextSlot, Thread, ThreadFlags};

use crate::{apic, arch, percpu, time};

/// Kernel thread stack size.
const KERNEL_STACK_SIZE: usize = 16 * 1024;

static SCHEDULER: AtomicPtr<Arc<Scheduler>> = AtomicPtr::new(core::ptr::null_mut());

static THREAD_IDS: ThreadIdAllocator = ThreadIdAllocator::new();

/// Kernel stacks owned on behalf of live threads; freed by the reaper.
static STACKS: SpinLock<Vec<(ThreadId, Box<[u8]>)>> = SpinLock::new(Vec::new());

/// Installs the system scheduler. Called once from boot.
pub fn install_scheduler(sched: Arc<Scheduler>) {
    let boxed = Box::new(sched);
    SCHEDULER.store(Box::into_raw(boxed), Ordering::Release);
}

/// The system scheduler.
///
/// # Panics
///
/// Panics before [`install_scheduler`].
#[must_use]
pub fn scheduler() -> &'static Arc<Scheduler> {
    let ptr = SCHEDULER.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "scheduler not installed");
    // SAFETY: installed once from a leaked box, never freed.
    unsafe { &*ptr }
}

pub(crate) fn scheduler_if_installed() -> Option<&'static Arc<Scheduler>> {
    let ptr = SCHEDULER.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: as in `scheduler`.
        Some(unsafe { &*ptr })
    }
}

// ---------------------------------------------------------------------------
// Platform implementation
// ---------------------------------------------------------------------------

/// The kernel-side scheduler platform.
pub struct KernelPlatform;

/// The platform instance handed to the scheduler at boot.
pub static PLATFORM: KernelPlatform = KernelPlatform;

impl Platform for KernelPlatform {
    fn current_core(&self) -> CoreId {
        percpu::current_core()
    }

    fn yield_to_scheduler(&self, _thread: &Thread) {
        reschedule(false);
    }

    fn notify_core(&self, core: CoreId) {
        if let Some(controller) = apic::controller() {
            controller.send_ipi(core, IpiKind::Yield);
        }
    }

    fn now_ms(&self) -> u64 {
        time::now_ms().max(1)
    }

    fn core_is_idle(&self, core: CoreId) -> bool {
        percpu::get(core).is_idle()
    }

    fn core_is_online(&self, core: CoreId) -> bool {
        percpu::get(core).state() == percpu::CpuState::Running
    }
}

// ---------------------------------------------------------------------------
// Context switching
// ---------------------------------------------------------------------------

/// Runs the scheduling decision for this core and switches to the chosen
/// thread. `preemptive` marks timer-driven entry.
pub fn reschedule(preemptive: bool) {
    let Some(sched) = scheduler_if_installed() else {
        return;
    };
    let cpu = percpu::current();
    let outgoing = cpu.current_thread();

    let Some(next) = sched.schedule(outgoing.as_ref(), preemptive) else {
        return;
    };
    if let Some(out) = &outgoing {
        if Arc::ptr_eq(out, &next) {
            return;
        }
    }

    cpu.set_current_thread(next.clone());
    cpu.set_quantum(next.timeslice_ms.load(Ordering::Relaxed));

    // Address-space switch, when the incoming thread carries its own.
    if let Some(space) = next.address_space() {
        let root = space.root_phys();
        if root != arch::current_root() {
            // SAFETY: the space maps the kernel half identically.
            unsafe { arch::load_root(root) };
        }
    }

    #[cfg(target_arch = "x86_64")]
    {
        // Park the outgoing stack pointer directly in the thread object;
        // a first-ever switch (boot stack) dumps it into a scratch slot.
        static BOOT_RSP: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);
        let save = outgoing
            .as_ref()
            .map_or(BOOT_RSP.as_ptr(), |out| out.kernel_rsp.as_ptr());
        let next_rsp = next.kernel_rsp.load(Ordering::Acquire);
        // SAFETY: `save` points at stable storage and `next_rsp` was parked
        // by the same switch (or prepared by `spawn`).
        unsafe { arch::muon_context_switch(save, next_rsp) };
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = next;
}

/// First code every new thread runs after its first switch-in.
///
/// Kernel threads call their entry function directly; user threads get a
/// user-level context built and are flagged for the mode transition on
/// their next dispatch. A returning entry function finishes the thread.
extern "C" fn thread_entry_trampoline() -> ! {
    let thread = percpu::current()
        .current_thread()
        .expect("trampoline without current thread");
    arch::interrupts_enable();

    let context = thread
        .context(ContextSlot::Kernel)
        .expect("thread started without an entry context");

    if thread.has_flags(ThreadFlags::USER) {
        // Build the user-level context; the dispatch path drops privilege
        // when it sees the transition flag.
        thread.set_context(
            ContextSlot::User,
            Context {
                ip: context.ip,
                sp: 0,
                arg: context.arg,
            },
        );
        thread.set_flags(ThreadFlags::TRANSITION_USER);
    }

    // SAFETY: `spawn` stored a valid entry function pointer.
    let entry: extern "C" fn(usize) = unsafe { core::mem::transmute(context.ip as usize) };
    entry(context.arg as usize);

    // The entry returned: finish and yield forever.
    scheduler().exit_current(&thread, 0);
    loop {
        reschedule(false);
        arch::wait_for_interrupt();
    }
}

/// Creates and starts a kernel thread (spec lifecycle: allocate id, sleep
/// block, stack and contexts, table insert, enqueue on the placed core).
pub fn spawn(name: &str, entry: extern "C" fn(usize), arg: usize, flags: ThreadFlags) -> Arc<Thread> {
    let sched = scheduler();
    let parent = percpu::current().current_thread().map(|t| t.id());
    let thread = Thread::new(
        THREAD_IDS.next(),
        ProcessId::KERNEL,
        parent,
        name,
        flags | ThreadFlags::KERNEL,
        None,
    );

    let mut stack = alloc::vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
    // SAFETY: the stack box outlives the thread (held in STACKS until
    // reaped) and has room for the switch frame.
    let rsp = unsafe {
        let top = stack.as_mut_ptr().add(KERNEL_STACK_SIZE).cast::<u64>();
        arch::prepare_thread_stack(top, thread_entry_trampoline)
    };
    thread.kernel_rsp.store(rsp, Ordering::Release);
    thread.set_context(
        ContextSlot::Kernel,
        Context {
            ip: entry as usize as u64,
            sp: rsp,
            arg: arg as u64,
        },
    );
    STACKS.lock().push((thread.id(), stack));

    sched.start(&thread);
    thread
}

/// Reaps finished threads and frees their kernel stacks.
pub fn reap_threads() -> usize {
    let reaped = scheduler().reap();
    if reaped > 0 {
        let sched = scheduler();
        STACKS
            .lock()
            .retain(|(id, _)| sched.table().get(*id).is_some());
    }
    reaped
}

// ---------------------------------------------------------------------------
// Parking hooks for the blocking primitives
// ---------------------------------------------------------------------------

struct SchedulerPark;

static SCHEDULER_PARK: SchedulerPark = SchedulerPark;

impl ParkOps for SchedulerPark {
    fn park(&self, token: usize) {
        let Some(sched) = scheduler_if_installed() else {
            core::hint::spin_loop();
            return;
        };
        let Some(current) = percpu::current().current_thread() else {
            // Early boot: no thread context to sleep, spin instead.
            core::hint::spin_loop();
            return;
        };
        let _ = sched.sleep(&current, token, 0);
    }

    fn unpark_one(&self, token: usize) {
        if let Some(sched) = scheduler_if_installed() {
            sched.signal_token(token);
        }
    }

    fn unpark_all(&self, token: usize) {
        if let Some(sched) = scheduler_if_installed() {
            sched.signal_token_all(token);
        }
    }
}

/// Routes mutex/condvar parking through the scheduler's token sleeps.
/// Called once after the scheduler is installed.
pub fn install_parking() {
    register_parking(&SCHEDULER_PARK);
}
