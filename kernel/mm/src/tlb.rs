//! TLB invalidation hooks.
//!
//! The architecture-specific shoot-down step is registered at boot; before
//! registration flushes are no-ops, which is safe in early boot where no
//! stale translations exist, and in host tests where there is no TLB at all.
//!
//! The registered callback is responsible for the cross-core protocol: the
//! kernel's implementation invalidates locally, marks remote cores that may
//! cache the range, sends them a yield IPI, and waits for each to
//! acknowledge. Only operations that clear or downgrade an entry invoke it;
//! permission upgrades need no shoot-down.

use core::sync::atomic::{AtomicPtr, Ordering};

use muon_core::addr::VirtAddr;

/// Flush function signature: invalidate `pages` pages starting at `virt`.
pub type FlushFn = fn(VirtAddr, usize);

static FLUSH_FN: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Registers the architecture flush routine. Must be called before any page
/// table modification that can leave stale translations behind.
pub fn register_flush(f: FlushFn) {
    FLUSH_FN.store(f as *mut (), Ordering::Release);
}

/// Invalidates `pages` pages starting at `virt` through the registered
/// routine; a no-op before registration.
pub fn flush_range(virt: VirtAddr, pages: usize) {
    let ptr = FLUSH_FN.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: the pointer was stored by `register_flush` from a valid FlushFn.
    let f: FlushFn = unsafe { core::mem::transmute(ptr) };
    f(virt, pages);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static FLUSHED_PAGES: AtomicUsize = AtomicUsize::new(0);

    fn counting_flush(_virt: VirtAddr, pages: usize) {
        FLUSHED_PAGES.fetch_add(pages, Ordering::Relaxed);
    }

    #[test]
    fn unregistered_flush_is_noop() {
        flush_range(VirtAddr::new(0x1000), 4);
    }

    #[test]
    fn registered_flush_receives_ranges() {
        register_flush(counting_flush);
        let before = FLUSHED_PAGES.load(Ordering::Relaxed);
        flush_range(VirtAddr::new(0x4000), 3);
        assert_eq!(FLUSHED_PAGES.load(Ordering::Relaxed) - before, 3);
    }
}
