//! Memory management for the muon kernel.
//!
//! Three layers, bottom up:
//!
//! - [`pmm`]: bitmap-based physical frame allocator with a low-memory
//!   reservation for DMA-capable devices.
//! - [`address_space`] / [`paging`]: per-process four-level page tables with
//!   kernel-half sharing, selective user-half inheritance, and lock-free
//!   intermediate table installation.
//! - [`region`]: reference-counted shared memory buffers mappable into
//!   multiple address spaces.
//!
//! All page table access goes through an [`MmEnv`] that translates physical
//! frame addresses into dereferencable pointers (the kernel's direct map).
//! Host tests provide an `MmEnv` backed by `std` allocations, so the same
//! walker code runs against real page tables in the kernel and against heap
//! memory under `cargo test`.

#![cfg_attr(not(any(test, feature = "testing")), no_std)]

extern crate alloc;

use core::fmt;

use muon_core::addr::{PhysAddr, VirtAddr};

pub mod address_space;
pub mod layout;
pub mod paging;
pub mod pmm;
pub mod range_alloc;
pub mod region;
pub mod tlb;

/// Size of a physical frame and of a virtual page.
pub const PAGE_SIZE: usize = 4096;

/// `PAGE_SIZE - 1`, for alignment arithmetic.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Number of 4 KiB pages needed to back `bytes`.
#[must_use]
pub const fn page_count(bytes: u64) -> usize {
    bytes.div_ceil(PAGE_SIZE as u64) as usize
}

/// Errors from the physical frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmmError {
    /// No frame satisfying the request is free.
    OutOfMemory,
    /// The address is outside the tracked range.
    InvalidFrame,
}

impl fmt::Display for PmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::InvalidFrame => write!(f, "frame outside tracked range"),
        }
    }
}

/// Errors from the virtual memory layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmError {
    /// Allocation of a frame or virtual range failed.
    OutOfMemory,
    /// A fixed-placement request collided with an existing mapping.
    Exists,
    /// The requested address is not mapped.
    NotMapped,
    /// API misuse (zero length, bad alignment, offset out of range, …).
    InvalidParameters,
    /// The operation is not supported (e.g. shrinking a region).
    NotSupported,
    /// The caller's view does not permit the operation.
    NotPermitted,
}

impl fmt::Display for VmmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Exists => write!(f, "mapping already exists"),
            Self::NotMapped => write!(f, "address not mapped"),
            Self::InvalidParameters => write!(f, "invalid parameters"),
            Self::NotSupported => write!(f, "operation not supported"),
            Self::NotPermitted => write!(f, "operation not permitted"),
        }
    }
}

/// A physical memory range from the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct PhysMemoryRegion {
    /// Base physical address.
    pub base: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Whether the range is usable RAM.
    pub usable: bool,
}

/// Environment the memory manager runs against.
///
/// The kernel implements this over the global PMM and the direct map; host
/// tests implement it over `std` allocations with an identity translation.
/// Implementations must return zeroed frames from [`MmEnv::alloc_frame`].
pub trait MmEnv: Sync {
    /// Allocates one zeroed 4 KiB frame.
    ///
    /// # Errors
    ///
    /// [`PmmError::OutOfMemory`] on exhaustion.
    fn alloc_frame(&self) -> Result<PhysAddr, PmmError>;

    /// Returns a frame to the allocator.
    fn free_frame(&self, frame: PhysAddr);

    /// Translates a physical address into a dereferencable virtual address.
    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! A host-side [`MmEnv`] backed by `std` allocations.
    //!
    //! "Physical addresses" are the addresses of page-aligned heap blocks,
    //! so `phys_to_virt` is the identity. Available to dependent crates'
    //! tests through the `testing` feature.

    use super::*;
    use std::alloc::Layout;
    use std::sync::Mutex;

    /// Test environment tracking its outstanding frames.
    pub struct TestEnv {
        allocated: Mutex<Vec<u64>>,
    }

    impl TestEnv {
        pub fn new() -> Self {
            Self {
                allocated: Mutex::new(Vec::new()),
            }
        }

        /// Leaks a `TestEnv` to get the `&'static` the address-space layer wants.
        pub fn leak() -> &'static Self {
            Box::leak(Box::new(Self::new()))
        }

        /// Number of outstanding (not yet freed) frames.
        pub fn outstanding(&self) -> usize {
            self.allocated.lock().unwrap().len()
        }
    }

    impl MmEnv for TestEnv {
        fn alloc_frame(&self) -> Result<PhysAddr, PmmError> {
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: layout has non-zero size.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            let addr = ptr as u64;
            self.allocated.lock().unwrap().push(addr);
            Ok(PhysAddr::new(addr))
        }

        fn free_frame(&self, frame: PhysAddr) {
            let mut allocated = self.allocated.lock().unwrap();
            let pos = allocated
                .iter()
                .position(|&a| a == frame.as_u64())
                .expect("freeing frame not allocated by TestEnv (double free?)");
            allocated.swap_remove(pos);
            let layout = Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap();
            // SAFETY: the pointer came from alloc_zeroed with this layout.
            unsafe { std::alloc::dealloc(frame.as_u64() as *mut u8, layout) };
        }

        fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
            VirtAddr::new(phys.as_u64())
        }
    }
}
