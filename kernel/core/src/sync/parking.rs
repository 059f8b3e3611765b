//! Pluggable thread parking used by the blocking primitives.
//!
//! [`Mutex`](super::Mutex) and [`Condvar`](super::Condvar) park contended
//! threads on a pointer-sized token. How a thread parks depends on the
//! environment: in the kernel it sleeps on the token through the scheduler,
//! on the host (tests, early boot) it spins. The kernel installs its
//! implementation once with [`register_parking`].

use core::sync::atomic::{AtomicPtr, Ordering};

/// Parking operations the blocking primitives dispatch through.
pub trait ParkOps: Sync {
    /// Blocks the calling thread until `unpark_one`/`unpark_all` is invoked
    /// with the same token. Spurious returns are permitted; callers re-check
    /// their predicate in a loop.
    fn park(&self, token: usize);

    /// Wakes one thread parked on `token`, if any.
    fn unpark_one(&self, token: usize);

    /// Wakes every thread parked on `token`.
    fn unpark_all(&self, token: usize);
}

/// Fallback used before the kernel registers its scheduler-backed
/// implementation: parking degrades to a spin hint, which keeps the
/// primitives correct (callers loop) at the cost of burning cycles.
struct SpinPark;

impl ParkOps for SpinPark {
    fn park(&self, _token: usize) {
        core::hint::spin_loop();
    }

    fn unpark_one(&self, _token: usize) {}

    fn unpark_all(&self, _token: usize) {}
}

static SPIN_PARK: SpinPark = SpinPark;

static PARK_OPS: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the parking implementation. Called once by the kernel after the
/// scheduler can service token sleeps; test harnesses may register a
/// host-thread implementation instead.
pub fn register_parking(ops: &'static dyn ParkOps) {
    let fat: *const dyn ParkOps = ops;
    // Store the thin data pointer and the vtable in two words is not
    // possible in a single atomic; box the fat pointer indirection instead.
    let boxed = alloc::boxed::Box::new(fat);
    PARK_OPS.store(alloc::boxed::Box::into_raw(boxed).cast(), Ordering::Release);
}

/// Returns the active parking implementation.
pub(crate) fn park_ops() -> &'static dyn ParkOps {
    let ptr = PARK_OPS.load(Ordering::Acquire);
    if ptr.is_null() {
        return &SPIN_PARK;
    }
    // SAFETY: The pointer was produced by `register_parking` from a leaked
    // box holding a `*const dyn ParkOps` with 'static lifetime.
    unsafe { &**ptr.cast::<*const dyn ParkOps>() }
}
