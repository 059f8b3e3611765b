//! The kernel's [`MmEnv`]: frames from the global PMM, access through the
//! direct map.

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_mm::{MmEnv, PAGE_SIZE, PmmError, pmm};

/// Memory environment backed by the global PMM and the loader-established
/// direct map at a fixed offset.
pub struct KernelMmEnv {
    direct_map_offset: u64,
}

impl KernelMmEnv {
    /// Creates the environment for a direct map at `offset`.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self {
            direct_map_offset: offset,
        }
    }
}

impl MmEnv for KernelMmEnv {
    fn alloc_frame(&self) -> Result<PhysAddr, PmmError> {
        let frame = pmm::with(|pmm| pmm.alloc(u64::MAX))?;
        // The PMM hands frames out as-is; the env contract requires zeroed
        // memory.
        let virt = self.phys_to_virt(frame);
        // SAFETY: the frame is freshly allocated and direct-mapped.
        unsafe { core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE) };
        Ok(frame)
    }

    fn free_frame(&self, frame: PhysAddr) {
        pmm::with(|pmm| pmm.free(frame));
    }

    fn phys_to_virt(&self, phys: PhysAddr) -> VirtAddr {
        VirtAddr::new(self.direct_map_offset + phys.as_u64())
    }
}
