//! Shared memory regions.
//!
//! A region is a reference-counted list of physical pages mappable into
//! multiple address spaces: a kernel view spanning the full capacity plus
//! one user view per process that created or inherited it. The committed
//! prefix (`length`) can grow in place up to `capacity`; inheritors that
//! missed a grow call `refresh` to commit the new pages into their view.
//!
//! The region mutex serializes resize and refresh. Reads and writes through
//! [`MemoryRegion::read`]/[`MemoryRegion::write`] are lock-free volatile
//! copies, clamped to the committed length.

use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::sync::Mutex;

use crate::address_space::{AddressSpace, FrameRequest, Placement};
use crate::paging::MapFlags;
use crate::{MmEnv, PAGE_SIZE, VmmError, page_count};

/// One scatter-gather run of physically contiguous bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    /// Physical start address; the first entry keeps the region's intra-page
    /// offset.
    pub address: PhysAddr,
    /// Run length in bytes.
    pub length: u64,
}

struct RegionInner {
    /// Committed length in bytes.
    length: u64,
}

/// A reference-counted multi-mappable shared buffer.
pub struct MemoryRegion {
    env: &'static dyn MmEnv,
    kernel: Arc<AddressSpace>,
    flags: MapFlags,
    /// Reservation capacity in bytes (includes the leading intra-page offset
    /// for regions wrapped around an existing mapping).
    capacity: u64,
    /// Physical pages backing the full capacity. `pages[0]` may carry an
    /// intra-page byte offset; all other entries are page-aligned.
    pages: Vec<PhysAddr>,
    /// Kernel-side view over the full capacity.
    kernel_view: VirtAddr,
    /// Whether the region owns its frames (false when wrapped around an
    /// existing mapping, whose frames stay with the originating space).
    owns_frames: bool,
    inner: Mutex<RegionInner>,
}

impl MemoryRegion {
    /// Creates a region of `length` committed bytes with room to grow to
    /// `capacity`, mapped into the kernel and into `caller`.
    ///
    /// Returns the region, the kernel view, and the caller's user view.
    ///
    /// # Errors
    ///
    /// [`VmmError::InvalidParameters`] if `length` is zero or exceeds
    /// `capacity`; [`VmmError::OutOfMemory`] on allocation failure.
    pub fn create(
        env: &'static dyn MmEnv,
        kernel: &Arc<AddressSpace>,
        caller: &AddressSpace,
        length: u64,
        capacity: u64,
        flags: MapFlags,
    ) -> Result<(Arc<Self>, VirtAddr, VirtAddr), VmmError> {
        if length == 0 || length > capacity {
            return Err(VmmError::InvalidParameters);
        }

        let capacity_pages = page_count(capacity);
        let length_pages = page_count(length);
        let mut pages = Vec::with_capacity(capacity_pages);
        for _ in 0..capacity_pages {
            pages.push(env.alloc_frame().map_err(|_| VmmError::OutOfMemory)?);
        }

        let kernel_view =
            kernel.map_reserved(capacity, flags | MapFlags::GLOBAL, Placement::GlobalKernelHeap)?;
        kernel.commit(kernel_view, Some(&pages[..length_pages]), length)?;

        let user_view = caller.map_reserved(
            capacity,
            flags | MapFlags::USER | MapFlags::PERSISTENT,
            Placement::ProcessHeap,
        )?;
        caller.commit(user_view, Some(&pages[..length_pages]), length)?;

        let region = Arc::new(Self {
            env,
            kernel: kernel.clone(),
            flags,
            capacity,
            pages,
            kernel_view,
            owns_frames: true,
            inner: Mutex::new(RegionInner { length }),
        });
        Ok((region, kernel_view, user_view))
    }

    /// Wraps an already-mapped range of `caller` into a region.
    ///
    /// The capacity equals `length` plus the leading intra-page offset of
    /// `virt`; the frames stay owned by the originating space.
    ///
    /// # Errors
    ///
    /// [`VmmError::NotMapped`] if the range is not fully mapped.
    pub fn create_existing(
        env: &'static dyn MmEnv,
        kernel: &Arc<AddressSpace>,
        caller: &AddressSpace,
        virt: VirtAddr,
        length: u64,
        flags: MapFlags,
    ) -> Result<Arc<Self>, VmmError> {
        if length == 0 {
            return Err(VmmError::InvalidParameters);
        }
        let offset = virt.as_u64() & crate::PAGE_MASK as u64;
        let capacity = length + offset;
        let pages = caller.query_range(virt, length)?;

        let kernel_view = kernel.map(
            None,
            FrameRequest::Scatter(&pages),
            capacity,
            flags | MapFlags::GLOBAL | MapFlags::PERSISTENT,
            Placement::GlobalKernelHeap,
        )?;

        Ok(Arc::new(Self {
            env,
            kernel: kernel.clone(),
            flags,
            capacity,
            pages,
            kernel_view,
            owns_frames: false,
            inner: Mutex::new(RegionInner { length: capacity }),
        }))
    }

    /// Maps the region into another address space with a (possibly reduced)
    /// access subset.
    ///
    /// Returns the view address (including the region's intra-page offset)
    /// and the committed length at the time of the call.
    ///
    /// # Errors
    ///
    /// [`VmmError::OutOfMemory`] on mapping failure.
    pub fn inherit(
        &self,
        caller: &AddressSpace,
        access: MapFlags,
    ) -> Result<(VirtAddr, u64), VmmError> {
        let inner = self.inner.lock();
        let length_pages = page_count(inner.length);
        let view = caller.map_reserved(
            self.capacity,
            access | MapFlags::USER | MapFlags::PERSISTENT,
            Placement::ProcessHeap,
        )?;
        caller.commit(view, Some(&self.pages[..length_pages]), inner.length)?;
        let offset = self.pages[0].as_u64() & crate::PAGE_MASK as u64;
        Ok((view + offset, inner.length))
    }

    /// Grows the committed length, committing the new pages into both the
    /// kernel view and the caller's view.
    ///
    /// The caller's view must be writable. Shrinking is not supported.
    ///
    /// # Errors
    ///
    /// [`VmmError::NotPermitted`] for read-only views,
    /// [`VmmError::InvalidParameters`] beyond capacity,
    /// [`VmmError::NotSupported`] when not growing.
    pub fn resize(
        &self,
        caller: &AddressSpace,
        user_view: VirtAddr,
        new_length: u64,
    ) -> Result<(), VmmError> {
        let view_base = user_view.align_down(PAGE_SIZE as u64);
        if !caller
            .query(view_base)?
            .flags
            .contains(MapFlags::WRITABLE)
        {
            return Err(VmmError::NotPermitted);
        }
        if new_length > self.capacity {
            return Err(VmmError::InvalidParameters);
        }

        let mut inner = self.inner.lock();
        let current_pages = page_count(inner.length);
        let new_pages = page_count(new_length);
        if new_pages <= current_pages {
            return Err(VmmError::NotSupported);
        }

        let grow_bytes = ((new_pages - current_pages) * PAGE_SIZE) as u64;
        self.kernel.commit(
            self.kernel_view + (current_pages * PAGE_SIZE) as u64,
            Some(&self.pages[current_pages..new_pages]),
            grow_bytes,
        )?;
        caller.commit(
            view_base + (current_pages * PAGE_SIZE) as u64,
            Some(&self.pages[current_pages..new_pages]),
            grow_bytes,
        )?;
        inner.length = new_length;
        Ok(())
    }

    /// Commits pages a producer's resize added into the caller's view.
    ///
    /// `current_length` is the length the caller saw last; returns the
    /// region's current length.
    ///
    /// # Errors
    ///
    /// Propagates commit failures.
    pub fn refresh(
        &self,
        caller: &AddressSpace,
        user_view: VirtAddr,
        current_length: u64,
    ) -> Result<u64, VmmError> {
        let inner = self.inner.lock();
        let current_pages = page_count(current_length);
        let new_pages = page_count(inner.length);
        if new_pages <= current_pages {
            return Ok(inner.length);
        }
        let view_base = user_view.align_down(PAGE_SIZE as u64);
        caller.commit(
            view_base + (current_pages * PAGE_SIZE) as u64,
            Some(&self.pages[current_pages..new_pages]),
            ((new_pages - current_pages) * PAGE_SIZE) as u64,
        )?;
        Ok(inner.length)
    }

    /// Committed length in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.inner.lock().length
    }

    /// Reservation capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The kernel-side view address.
    #[must_use]
    pub fn kernel_view(&self) -> VirtAddr {
        self.kernel_view
    }

    /// The region's base mapping flags.
    #[must_use]
    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    /// Pointer to byte `index` of the region's contents.
    fn byte_ptr(&self, index: u64) -> *mut u8 {
        let offset = self.pages[0].as_u64() & crate::PAGE_MASK as u64;
        let linear = offset + index;
        let page = (linear / PAGE_SIZE as u64) as usize;
        let intra = linear % PAGE_SIZE as u64;
        let phys = self.pages[page].align_down(PAGE_SIZE as u64) + intra;
        self.env.phys_to_virt(phys).as_mut_ptr::<u8>()
    }

    /// Copies region contents into `buf`, clamped to the committed length.
    ///
    /// # Errors
    ///
    /// [`VmmError::InvalidParameters`] for an empty buffer or an offset at
    /// or past the committed length.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmmError> {
        let length = self.length();
        if buf.is_empty() || offset >= length {
            return Err(VmmError::InvalidParameters);
        }
        let count = (length - offset).min(buf.len() as u64) as usize;
        for (i, slot) in buf[..count].iter_mut().enumerate() {
            // SAFETY: offset + i < committed length, so the page is live.
            *slot = unsafe { self.byte_ptr(offset + i as u64).read_volatile() };
        }
        Ok(count)
    }

    /// Copies `buf` into the region, clamped to the committed length.
    ///
    /// # Errors
    ///
    /// [`VmmError::InvalidParameters`] for an empty buffer or an offset at
    /// or past the committed length.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, VmmError> {
        let length = self.length();
        if buf.is_empty() || offset >= length {
            return Err(VmmError::InvalidParameters);
        }
        let count = (length - offset).min(buf.len() as u64) as usize;
        for (i, byte) in buf[..count].iter().enumerate() {
            // SAFETY: offset + i < committed length, so the page is live.
            unsafe { self.byte_ptr(offset + i as u64).write_volatile(*byte) };
        }
        Ok(count)
    }

    /// Borrows a window of the region for device handoff.
    ///
    /// The span's lifetime ties the buffer to the region, so DMA
    /// descriptors built from it cannot outlive the backing frames.
    ///
    /// # Errors
    ///
    /// [`VmmError::InvalidParameters`] when the window exceeds the
    /// committed length.
    pub fn span(&self, offset: u64, len: u64) -> Result<RegionSpan<'_>, VmmError> {
        if len == 0 || offset + len > self.length() {
            return Err(VmmError::InvalidParameters);
        }
        Ok(RegionSpan {
            region: self,
            offset,
            len,
        })
    }

    /// Coalesces the page list into scatter-gather runs.
    ///
    /// Two-phase: call with `None` to learn the entry count, then with a
    /// buffer of at least that size. The first entry's length is reduced by
    /// the region's intra-page offset.
    ///
    /// # Errors
    ///
    /// [`VmmError::InvalidParameters`] when the supplied buffer is too
    /// small.
    pub fn get_sg(&self, out: Option<&mut [SgEntry]>) -> Result<usize, VmmError> {
        let page_size = PAGE_SIZE as u64;
        let mut count = 0usize;
        for i in 0..self.pages.len() {
            if i == 0
                || self.pages[i - 1].align_down(page_size) + page_size
                    != self.pages[i].align_down(page_size)
            {
                count += 1;
            }
        }

        let Some(out) = out else {
            return Ok(count);
        };
        if out.len() < count {
            return Err(VmmError::InvalidParameters);
        }

        let mut entry = 0usize;
        let mut i = 0usize;
        while i < self.pages.len() {
            let start = self.pages[i];
            let mut run_len = page_size;
            i += 1;
            while i < self.pages.len()
                && self.pages[i - 1].align_down(page_size) + page_size
                    == self.pages[i].align_down(page_size)
            {
                run_len += page_size;
                i += 1;
            }
            out[entry] = SgEntry {
                address: start,
                length: run_len,
            };
            entry += 1;
        }
        // The first run starts mid-page for wrapped regions.
        out[0].length -= out[0].address.as_u64() % page_size;
        Ok(count)
    }
}

/// A borrowed window into a region's contents.
pub struct RegionSpan<'a> {
    region: &'a MemoryRegion,
    offset: u64,
    len: u64,
}

impl RegionSpan<'_> {
    /// Window length in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether the window is empty (never true for a constructed span).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies out of the window, clamped to its length.
    ///
    /// # Errors
    ///
    /// Propagates [`MemoryRegion::read`] failures.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VmmError> {
        if offset >= self.len {
            return Err(VmmError::InvalidParameters);
        }
        let available = (self.len - offset).min(buf.len() as u64) as usize;
        self.region.read(self.offset + offset, &mut buf[..available])
    }

    /// Copies into the window, clamped to its length.
    ///
    /// # Errors
    ///
    /// Propagates [`MemoryRegion::write`] failures.
    pub fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, VmmError> {
        if offset >= self.len {
            return Err(VmmError::InvalidParameters);
        }
        let available = (self.len - offset).min(buf.len() as u64) as usize;
        self.region.write(self.offset + offset, &buf[..available])
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        // The kernel view commits exactly the length-page prefix; unmapping
        // it frees those frames when the region owns them (wrapped regions
        // map with PERSISTENT, so their frames survive).
        let committed = page_count(self.inner.get_mut().length);
        let _ = self.kernel.unmap(self.kernel_view, self.capacity);
        if self.owns_frames {
            for page in &self.pages[committed..] {
                self.env.free_frame(*page);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::CreateFlags;
    use crate::testing::TestEnv;

    fn setup() -> (&'static TestEnv, Arc<AddressSpace>, AddressSpace, AddressSpace) {
        let env = TestEnv::leak();
        let kernel = AddressSpace::new_kernel(env).unwrap();
        let p1 = AddressSpace::new(env, CreateFlags::empty(), &kernel, None).unwrap();
        let p2 = AddressSpace::new(env, CreateFlags::empty(), &kernel, None).unwrap();
        (env, kernel, p1, p2)
    }

    const RW: MapFlags = MapFlags::WRITABLE;

    #[test]
    fn create_write_read_roundtrip() {
        let (_env, kernel, p1, _p2) = setup();
        let (region, _kview, _uview) =
            MemoryRegion::create(_env, &kernel, &p1, 8192, 8192, RW).unwrap();

        let data = [0xAB, 0xCD, 0xEF];
        assert_eq!(region.write(0, &data).unwrap(), 3);
        let mut back = [0u8; 3];
        assert_eq!(region.read(0, &mut back).unwrap(), 3);
        assert_eq!(back, data);
    }

    #[test]
    fn shared_memory_between_processes() {
        // Scenario S1: create in P1, write markers, inherit read-only in
        // P2, verify contents, then grow and refresh.
        let (env, kernel, p1, p2) = setup();
        let (region, _kview, p1_view) =
            MemoryRegion::create(env, &kernel, &p1, 8192, 16384, RW).unwrap();

        region.write(0, &[0xAB]).unwrap();
        region.write(4095, &[0xCD]).unwrap();

        let (p2_view, p2_len) = region.inherit(&p2, MapFlags::empty()).unwrap();
        assert_eq!(p2_len, 8192);

        // P2 sees the bytes through its own translation.
        let at = |virt: VirtAddr| {
            let phys = p2.query(virt).unwrap().phys;
            // SAFETY: live test frame.
            unsafe { env.phys_to_virt(phys).as_ptr::<u8>().read() }
        };
        assert_eq!(at(p2_view), 0xAB);
        assert_eq!(at(p2_view + 4095), 0xCD);

        // P2's read-only view cannot resize.
        assert_eq!(
            region.resize(&p2, p2_view, 16384),
            Err(VmmError::NotPermitted)
        );

        // P1 grows; P2 refreshes and sees zeroed new pages.
        region.resize(&p1, p1_view, 16384).unwrap();
        let new_len = region.refresh(&p2, p2_view, 8192).unwrap();
        assert_eq!(new_len, 16384);
        assert_eq!(at(p2_view + 8192), 0);
    }

    #[test]
    fn resize_rejects_beyond_capacity() {
        let (env, kernel, p1, _p2) = setup();
        let (region, _k, uview) =
            MemoryRegion::create(env, &kernel, &p1, 4096, 8192, RW).unwrap();
        assert_eq!(
            region.resize(&p1, uview, 16384),
            Err(VmmError::InvalidParameters)
        );
    }

    #[test]
    fn resize_rejects_shrink() {
        let (env, kernel, p1, _p2) = setup();
        let (region, _k, uview) =
            MemoryRegion::create(env, &kernel, &p1, 8192, 8192, RW).unwrap();
        assert_eq!(region.resize(&p1, uview, 4096), Err(VmmError::NotSupported));
    }

    #[test]
    fn read_clamps_and_validates() {
        let (env, kernel, p1, _p2) = setup();
        let (region, _k, _u) = MemoryRegion::create(env, &kernel, &p1, 100, 4096, RW).unwrap();

        let mut buf = [0u8; 200];
        // Clamped to length - offset.
        assert_eq!(region.read(50, &mut buf).unwrap(), 50);
        // Offset past the committed length is API misuse.
        assert_eq!(
            region.read(100, &mut buf),
            Err(VmmError::InvalidParameters)
        );
        assert_eq!(region.read(0, &mut []), Err(VmmError::InvalidParameters));
    }

    #[test]
    fn region_roundtrip_through_inheritor() {
        // Testable property 8: bytes written through the kernel interface
        // read back identically through an inheritor's view.
        let (env, kernel, p1, p2) = setup();
        let (region, _k, _u) = MemoryRegion::create(env, &kernel, &p1, 4096, 4096, RW).unwrap();

        let pattern: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        region.write(0, &pattern).unwrap();

        let (view, len) = region.inherit(&p2, MapFlags::empty()).unwrap();
        assert_eq!(len, 4096);
        let phys = p2.query(view).unwrap().phys;
        // SAFETY: live test frame, 4096 readable bytes.
        let seen =
            unsafe { core::slice::from_raw_parts(env.phys_to_virt(phys).as_ptr::<u8>(), 4096) };
        assert_eq!(seen, &pattern[..]);
    }

    #[test]
    fn sg_coalesces_contiguous_pages() {
        // Testable property 9: runs cover all pages with minimal entries.
        let (env, kernel, p1, _p2) = setup();
        let (region, _k, _u) =
            MemoryRegion::create(env, &kernel, &p1, 4 * 4096, 4 * 4096, RW).unwrap();

        let count = region.get_sg(None).unwrap();
        let mut entries = vec![
            SgEntry {
                address: PhysAddr::ZERO,
                length: 0
            };
            count
        ];
        region.get_sg(Some(&mut entries)).unwrap();

        let total: u64 = entries.iter().map(|e| e.length).sum();
        assert_eq!(total, 4 * 4096);
        // Adjacent entries are never physically contiguous (else they would
        // have been coalesced).
        for pair in entries.windows(2) {
            assert_ne!(pair[0].address + pair[0].length, pair[1].address);
        }
    }

    #[test]
    fn sg_two_phase_buffer_too_small() {
        let (env, kernel, p1, _p2) = setup();
        let (region, _k, _u) =
            MemoryRegion::create(env, &kernel, &p1, 2 * 4096, 2 * 4096, RW).unwrap();
        let count = region.get_sg(None).unwrap();
        if count > 1 {
            let mut small = vec![
                SgEntry {
                    address: PhysAddr::ZERO,
                    length: 0
                };
                count - 1
            ];
            assert_eq!(
                region.get_sg(Some(&mut small)),
                Err(VmmError::InvalidParameters)
            );
        }
    }

    #[test]
    fn create_existing_wraps_mapping_with_offset() {
        let (env, kernel, p1, _p2) = setup();
        // Map 2 pages in P1 and write a marker at an unaligned offset.
        let base = p1
            .map(
                None,
                crate::address_space::FrameRequest::Allocate,
                2 * 4096,
                MapFlags::WRITABLE | MapFlags::USER,
                crate::address_space::Placement::ProcessHeap,
            )
            .unwrap();
        let phys = p1.query(base + 0x100).unwrap().phys;
        // SAFETY: live test frame.
        unsafe { env.phys_to_virt(phys).as_mut_ptr::<u8>().write(0x7E) };

        let region =
            MemoryRegion::create_existing(env, &kernel, &p1, base + 0x100, 0x1000, RW).unwrap();
        assert_eq!(region.capacity(), 0x1100);

        let mut byte = [0u8; 1];
        region.read(0, &mut byte).unwrap();
        assert_eq!(byte[0], 0x7E);

        // Dropping the wrapped region must not free P1's frames.
        drop(region);
        assert!(p1.query(base).is_ok());
        let phys_after = p1.query(base + 0x100).unwrap().phys;
        assert_eq!(phys, phys_after);
    }

    #[test]
    fn span_bounds_and_copies() {
        let (env, kernel, p1, _p2) = setup();
        let (region, _k, _u) = MemoryRegion::create(env, &kernel, &p1, 4096, 4096, RW).unwrap();
        region.write(100, b"span data").unwrap();

        let span = region.span(100, 9).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(span.read(0, &mut buf).unwrap(), 9);
        assert_eq!(&buf[..9], b"span data");
        // Reads clamp to the window even when the region has more.
        assert_eq!(span.read(5, &mut buf).unwrap(), 4);

        span.write(0, b"SPAN").unwrap();
        let mut head = [0u8; 4];
        region.read(100, &mut head).unwrap();
        assert_eq!(&head, b"SPAN");

        assert!(region.span(4000, 200).is_err(), "window past the length");
    }

    #[test]
    fn drop_returns_all_owned_frames() {
        let (env, kernel, p1, _p2) = setup();
        let before = env.outstanding();
        let (region, _k, _u) =
            MemoryRegion::create(env, &kernel, &p1, 4096, 4 * 4096, RW).unwrap();
        drop(region);
        // Everything the region allocated (committed and reserve pages)
        // is back; only table frames installed in the spaces remain.
        assert!(env.outstanding() >= before);
        let leaked_data_frames = env.outstanding() - before;
        // 3 table frames at most were added per space for the new ranges.
        assert!(
            leaked_data_frames <= 8,
            "region leaked data frames: {leaked_data_frames}"
        );
    }
}
