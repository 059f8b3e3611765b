//! Virtual address space layout.
//!
//! The kernel half is the upper 256 root-table slots and maps identically in
//! every address space (shared via inherited root entries). One designated
//! root slot in the user half is the thread-local range: it is never
//! inherited, so every address space gets a private mid-level table there.

use muon_core::addr::VirtAddr;

/// First kernel virtual address (root slots 256..512 are kernel).
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Root-table slot index of the thread-local range (last user slot).
pub const THREAD_LOCAL_SLOT: usize = 255;

/// Base of the thread-local range (slot 255: 510 GiB..512 GiB of user space).
pub const THREAD_LOCAL_BASE: u64 = (THREAD_LOCAL_SLOT as u64) << 39;

/// Size of the thread-local range (one root slot).
pub const THREAD_LOCAL_SIZE: u64 = 1 << 39;

/// Base the kernel image is mapped at (top 2 GiB, root slot 511); the
/// image's physical offset is added below this.
pub const KERNEL_IMAGE_BASE: u64 = 0xFFFF_FFFF_8000_0000;

/// Base of the global kernel heap range (root slot 288).
pub const GLOBAL_HEAP_BASE: u64 = 0xFFFF_9000_0000_0000;

/// Size of the global kernel heap range.
pub const GLOBAL_HEAP_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Base of the per-process heap range (root slot 32).
pub const PROCESS_HEAP_BASE: u64 = 32u64 << 39;

/// Size of the per-process heap range.
pub const PROCESS_HEAP_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Returns `true` for addresses in the kernel half.
#[must_use]
pub const fn is_kernel_address(virt: u64) -> bool {
    virt >= KERNEL_BASE
}

/// Returns `true` for addresses in the thread-local range.
#[must_use]
pub const fn is_thread_local_address(virt: u64) -> bool {
    virt >= THREAD_LOCAL_BASE && virt < THREAD_LOCAL_BASE + THREAD_LOCAL_SIZE
}

/// A contiguous virtual address region.
#[derive(Debug, Clone, Copy)]
pub struct VirtRegion {
    base: VirtAddr,
    size: u64,
}

impl VirtRegion {
    /// Creates a region covering `[base, base + size)`.
    #[must_use]
    pub const fn new(base: VirtAddr, size: u64) -> Self {
        Self { base, size }
    }

    /// Returns the region base.
    #[must_use]
    pub const fn base(&self) -> VirtAddr {
        self.base
    }

    /// Returns the region size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Returns `true` if `virt` falls inside the region.
    #[must_use]
    pub fn contains(&self, virt: VirtAddr) -> bool {
        virt >= self.base && (virt - self.base) < self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::table_index;

    #[test]
    fn kernel_boundary() {
        assert!(is_kernel_address(KERNEL_BASE));
        assert!(is_kernel_address(GLOBAL_HEAP_BASE));
        assert!(!is_kernel_address(PROCESS_HEAP_BASE));
    }

    #[test]
    fn thread_local_slot_is_user_half() {
        assert_eq!(table_index(THREAD_LOCAL_BASE, 4), THREAD_LOCAL_SLOT);
        assert!(THREAD_LOCAL_SLOT < 256);
        assert!(is_thread_local_address(THREAD_LOCAL_BASE));
        assert!(!is_thread_local_address(PROCESS_HEAP_BASE));
    }

    #[test]
    fn heap_bases_decompose() {
        // Global heap lives in the kernel half, process heap in the user half.
        assert!(table_index(GLOBAL_HEAP_BASE, 4) >= 256);
        assert!(table_index(PROCESS_HEAP_BASE, 4) < 256);
        assert_ne!(table_index(PROCESS_HEAP_BASE, 4), THREAD_LOCAL_SLOT);
    }

    #[test]
    fn kernel_ranges_use_distinct_root_slots() {
        // Image (slot 511), global heap (slot 288), and the conventional
        // direct map (slot 256) never share a root slot.
        assert_eq!(table_index(KERNEL_IMAGE_BASE, 4), 511);
        let heap_slot = table_index(GLOBAL_HEAP_BASE, 4);
        let direct_slot = table_index(KERNEL_BASE, 4);
        assert_ne!(heap_slot, 511);
        assert_ne!(direct_slot, 511);
        assert_ne!(heap_slot, direct_slot);
    }

    #[test]
    fn region_contains() {
        let region = VirtRegion::new(VirtAddr::new(0x1000), 0x2000);
        assert!(region.contains(VirtAddr::new(0x1000)));
        assert!(region.contains(VirtAddr::new(0x2FFF)));
        assert!(!region.contains(VirtAddr::new(0x3000)));
        assert!(!region.contains(VirtAddr::new(0xFFF)));
    }
}
