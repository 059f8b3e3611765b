//! Address space management.
//!
//! Each address space owns a four-level page table root. The kernel half
//! (upper 256 root slots) is shared from the domain's kernel space through
//! entries tagged `INHERITED`; the thread-local root slot always gets a
//! private mid-level table; the rest of the user half may be inherited from
//! a parent on request.
//!
//! Inheritance is copy-on-inherit at table granularity: a child that needs
//! to modify a mapping reached through an `INHERITED` link first replaces
//! the link with a private copy of the ancestor table (whose entries are in
//! turn tagged `INHERITED`), cascading one level at a time until the write
//! touches only tables the child owns. Replacing an inherited leaf frame
//! copies the page contents, so the parent's view never changes.
//!
//! Missing intermediate tables are installed with a release compare-exchange
//! on the parent slot: two cores racing to populate the same slot end with
//! one winner, and the loser frees its spare frame. Observing a present
//! entry with acquire ordering therefore guarantees the subtable is seen
//! fully initialized.

use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::sync::SpinLock;

use crate::layout::{
    GLOBAL_HEAP_BASE, GLOBAL_HEAP_SIZE, KERNEL_BASE, PROCESS_HEAP_BASE, PROCESS_HEAP_SIZE,
    THREAD_LOCAL_SLOT, VirtRegion,
};
use crate::paging::{
    ENTRIES_PER_TABLE, MapFlags, PageEntry, PageTable, PteFlags, table_index,
};
use crate::range_alloc::RangeAllocator;
use crate::{MmEnv, PAGE_SIZE, VmmError, page_count, tlb};

/// Free-hole capacity of the per-space range allocators.
const RANGE_HOLES: usize = 64;

bitflags::bitflags! {
    /// Address space creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CreateFlags: u32 {
        /// Copy the parent's user-half mappings (shared, copy-on-inherit).
        const INHERIT = 1 << 0;
    }
}

/// Where a mapping's virtual range comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Caller supplies the exact virtual address.
    Fixed,
    /// Allocated from the space's process heap range.
    ProcessHeap,
    /// Allocated from the domain kernel space's global range.
    GlobalKernelHeap,
}

/// Source of physical frames for a mapping.
#[derive(Debug, Clone, Copy)]
pub enum FrameRequest<'a> {
    /// Allocate fresh zeroed frames.
    Allocate,
    /// Contiguous physical range starting here (device MMIO).
    Contiguous(PhysAddr),
    /// Caller-supplied frame list, one entry per page (shared regions).
    Scatter(&'a [PhysAddr]),
}

/// Result of [`AddressSpace::query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Physical address the query address translates to.
    pub phys: PhysAddr,
    /// Access flags of the mapping.
    pub flags: MapFlags,
}

/// An address space: a page-table root plus virtual range allocators.
pub struct AddressSpace {
    env: &'static dyn MmEnv,
    root: PhysAddr,
    /// Global kernel range allocator; present on the kernel space only.
    global_heap: Option<SpinLock<RangeAllocator<RANGE_HOLES>>>,
    /// Per-process heap range allocator.
    process_heap: SpinLock<RangeAllocator<RANGE_HOLES>>,
    /// The domain kernel space; `None` when this *is* the kernel space.
    kernel_space: Option<Arc<AddressSpace>>,
}

impl AddressSpace {
    /// Creates the domain kernel space.
    ///
    /// Pre-populates every kernel-half root slot with an owned mid-level
    /// table so that child spaces can share them by copying root entries:
    /// later kernel mappings only ever edit tables below the root and stay
    /// visible in every address space.
    ///
    /// # Errors
    ///
    /// [`VmmError::OutOfMemory`] if table frames cannot be allocated.
    pub fn new_kernel(env: &'static dyn MmEnv) -> Result<Arc<Self>, VmmError> {
        let root = env.alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
        let this = Self {
            env,
            root,
            global_heap: Some(SpinLock::new(RangeAllocator::new(VirtRegion::new(
                VirtAddr::new(GLOBAL_HEAP_BASE),
                GLOBAL_HEAP_SIZE,
            )))),
            process_heap: SpinLock::new(RangeAllocator::new(VirtRegion::new(
                VirtAddr::new(PROCESS_HEAP_BASE),
                PROCESS_HEAP_SIZE,
            ))),
            kernel_space: None,
        };
        let table = this.table(root);
        for index in (ENTRIES_PER_TABLE / 2)..ENTRIES_PER_TABLE {
            let frame = env.alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
            table.store(
                index,
                PageEntry::new(frame, PteFlags::PRESENT | PteFlags::WRITABLE),
            );
        }
        Ok(Arc::new(this))
    }

    /// Creates an address space below `kernel`, optionally inheriting the
    /// user half of `parent`.
    ///
    /// The kernel half shares `kernel`'s root entries (tagged `INHERITED`);
    /// the thread-local slot receives a fresh private table and is never
    /// inherited.
    ///
    /// # Errors
    ///
    /// [`VmmError::OutOfMemory`] if table frames cannot be allocated.
    pub fn new(
        env: &'static dyn MmEnv,
        flags: CreateFlags,
        kernel: &Arc<AddressSpace>,
        parent: Option<&AddressSpace>,
    ) -> Result<Self, VmmError> {
        let root = env.alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
        let this = Self {
            env,
            root,
            global_heap: None,
            process_heap: SpinLock::new(RangeAllocator::new(VirtRegion::new(
                VirtAddr::new(PROCESS_HEAP_BASE),
                PROCESS_HEAP_SIZE,
            ))),
            kernel_space: Some(kernel.clone()),
        };

        let table = this.table(root);
        let kernel_table = this.table(kernel.root);
        for index in (ENTRIES_PER_TABLE / 2)..ENTRIES_PER_TABLE {
            let entry = kernel_table.load(index);
            if !entry.is_empty() {
                table.store(
                    index,
                    PageEntry::new(entry.frame(), entry.flags() | PteFlags::INHERITED),
                );
            }
        }

        let thread_local = env.alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
        table.store(
            THREAD_LOCAL_SLOT,
            PageEntry::new(
                thread_local,
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER,
            ),
        );

        if flags.contains(CreateFlags::INHERIT) {
            if let Some(parent) = parent {
                let parent_table = this.table(parent.root);
                for index in 0..(ENTRIES_PER_TABLE / 2) {
                    if index == THREAD_LOCAL_SLOT {
                        continue;
                    }
                    let entry = parent_table.load(index);
                    if entry.is_present() {
                        table.store(
                            index,
                            PageEntry::new(entry.frame(), entry.flags() | PteFlags::INHERITED),
                        );
                    }
                }
            }
        }

        Ok(this)
    }

    /// Physical address of the root table (loaded on context switch).
    #[must_use]
    pub fn root_phys(&self) -> PhysAddr {
        self.root
    }

    /// Returns `true` for the domain kernel space.
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.kernel_space.is_none()
    }

    fn table(&self, phys: PhysAddr) -> &PageTable {
        // SAFETY: `phys` is a table frame owned by this space hierarchy and
        // the env translation yields a dereferencable, 4 KiB-aligned pointer.
        unsafe { &*self.env.phys_to_virt(phys).as_ptr::<PageTable>() }
    }

    /// Copies an ancestor-owned table so this space can modify it.
    ///
    /// Present entries in the copy are tagged `INHERITED`: whatever they
    /// point to still belongs to the ancestor.
    fn copy_table(&self, source: PhysAddr) -> Result<PhysAddr, VmmError> {
        let frame = self.env.alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
        let src = self.table(source);
        let dst = self.table(frame);
        for index in 0..ENTRIES_PER_TABLE {
            let entry = src.load(index);
            if entry.is_present() {
                dst.store(
                    index,
                    PageEntry::new(entry.frame(), entry.flags() | PteFlags::INHERITED),
                );
            } else if !entry.is_empty() {
                dst.store(index, entry);
            }
        }
        Ok(frame)
    }

    /// Walks to the leaf table covering `virt`.
    ///
    /// `create` installs missing intermediate tables (CAS, loser frees its
    /// spare). `break_inherit` replaces inherited links with private copies
    /// on the way down; it is only honored in the user half — kernel-half
    /// links are shared on purpose, so edits there land in the kernel
    /// space's own tables and become visible everywhere.
    ///
    /// Returns `None` when the path does not exist and `create` is false;
    /// otherwise the leaf table plus whether it was reached through an
    /// inherited (ancestor-owned) link.
    fn walk(
        &self,
        virt: u64,
        create: bool,
        break_inherit: bool,
    ) -> Result<Option<(PhysAddr, bool)>, VmmError> {
        let kernel_half = virt >= KERNEL_BASE;
        let mut table_phys = self.root;
        let mut inherited_path = false;
        for level in (2..=4).rev() {
            let table = self.table(table_phys);
            let index = table_index(virt, level);
            let mut entry = table.load(index);

            if break_inherit && !kernel_half {
                while entry.is_present() && entry.flags().contains(PteFlags::INHERITED) {
                    let copy = self.copy_table(entry.frame())?;
                    let new_entry =
                        PageEntry::new(copy, entry.flags() - PteFlags::INHERITED);
                    match table.compare_exchange(index, entry, new_entry) {
                        Ok(()) => entry = new_entry,
                        Err(seen) => {
                            // Another core broke this link first; our copy
                            // owns nothing, so drop just the frame.
                            self.env.free_frame(copy);
                            entry = seen;
                        }
                    }
                }
            }

            if !entry.is_present() {
                if !create {
                    return Ok(None);
                }
                let frame = self.env.alloc_frame().map_err(|_| VmmError::OutOfMemory)?;
                let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE;
                if !kernel_half {
                    flags |= PteFlags::USER;
                }
                let new_entry = PageEntry::new(frame, flags);
                match table.compare_exchange(index, entry, new_entry) {
                    Ok(()) => entry = new_entry,
                    Err(seen) => {
                        self.env.free_frame(frame);
                        entry = seen;
                    }
                }
            }

            // Kernel-half sharing is intentional and not treated as foreign.
            if !kernel_half {
                inherited_path |= entry.flags().contains(PteFlags::INHERITED);
            }
            table_phys = entry.frame();
        }
        Ok(Some((table_phys, inherited_path)))
    }

    fn heap_alloc(&self, length: u64, placement: Placement) -> Result<VirtAddr, VmmError> {
        match placement {
            Placement::Fixed => Err(VmmError::InvalidParameters),
            Placement::ProcessHeap => self
                .process_heap
                .lock()
                .allocate(length)
                .ok_or(VmmError::OutOfMemory),
            Placement::GlobalKernelHeap => {
                let space = self.kernel_space.as_deref().unwrap_or(self);
                space
                    .global_heap
                    .as_ref()
                    .ok_or(VmmError::InvalidParameters)?
                    .lock()
                    .allocate(length)
                    .ok_or(VmmError::OutOfMemory)
            }
        }
    }

    fn heap_free(&self, base: VirtAddr, length: u64) {
        if base.as_u64() >= PROCESS_HEAP_BASE
            && base.as_u64() < PROCESS_HEAP_BASE + PROCESS_HEAP_SIZE
        {
            let _ = self.process_heap.lock().free(base, length);
        } else if base.as_u64() >= GLOBAL_HEAP_BASE
            && base.as_u64() < GLOBAL_HEAP_BASE + GLOBAL_HEAP_SIZE
        {
            let space = self.kernel_space.as_deref().unwrap_or(self);
            if let Some(heap) = space.global_heap.as_ref() {
                let _ = heap.lock().free(base, length);
            }
        }
    }

    /// Maps `length` bytes with the given flags.
    ///
    /// With [`Placement::Fixed`], `virt` names the page-aligned target and a
    /// collision with an existing owned mapping reports [`VmmError::Exists`]
    /// (already-mapped pages from this call are rolled back). A collision
    /// with an *inherited* leaf and [`FrameRequest::Allocate`] instead
    /// performs the copy-on-inherit break: the page is replaced with a
    /// private copy of its contents.
    ///
    /// # Errors
    ///
    /// [`VmmError::OutOfMemory`], [`VmmError::Exists`], or
    /// [`VmmError::InvalidParameters`] on misuse.
    pub fn map(
        &self,
        virt: Option<VirtAddr>,
        frames: FrameRequest<'_>,
        length: u64,
        flags: MapFlags,
        placement: Placement,
    ) -> Result<VirtAddr, VmmError> {
        if length == 0 {
            return Err(VmmError::InvalidParameters);
        }
        let pages = page_count(length);
        if let FrameRequest::Scatter(list) = frames {
            if list.len() < pages {
                return Err(VmmError::InvalidParameters);
            }
        }
        let base = match placement {
            Placement::Fixed => {
                let virt = virt.ok_or(VmmError::InvalidParameters)?;
                if !virt.is_aligned(PAGE_SIZE as u64) {
                    return Err(VmmError::InvalidParameters);
                }
                virt
            }
            _ => self.heap_alloc(length, placement)?,
        };

        let pte = flags.to_pte() | PteFlags::PRESENT;
        let mut replaced_any = false;

        for page in 0..pages {
            let va = base.as_u64() + (page * PAGE_SIZE) as u64;
            let result = (|| -> Result<bool, VmmError> {
                let leaf_phys = self
                    .walk(va, true, true)?
                    .expect("walk with create returned no table")
                    .0;
                let leaf = self.table(leaf_phys);
                let index = table_index(va, 1);
                let entry = leaf.load(index);

                let frame = match frames {
                    FrameRequest::Allocate => {
                        self.env.alloc_frame().map_err(|_| VmmError::OutOfMemory)?
                    }
                    FrameRequest::Contiguous(start) => start + (page * PAGE_SIZE) as u64,
                    FrameRequest::Scatter(list) => list[page].align_down(PAGE_SIZE as u64),
                };

                if entry.is_present() {
                    let inherited = entry.flags().contains(PteFlags::INHERITED);
                    if inherited && matches!(frames, FrameRequest::Allocate) {
                        // Copy-on-inherit: preserve the ancestor's contents
                        // in our private frame.
                        self.copy_page_contents(entry.frame(), frame);
                        leaf.store(index, PageEntry::new(frame, pte));
                        return Ok(true);
                    }
                    if matches!(frames, FrameRequest::Allocate) {
                        self.env.free_frame(frame);
                    }
                    return Err(VmmError::Exists);
                }

                leaf.store(index, PageEntry::new(frame, pte));
                Ok(false)
            })();

            match result {
                Ok(replaced) => replaced_any |= replaced,
                Err(err) => {
                    // Roll back the pages this call already installed.
                    let owned = matches!(frames, FrameRequest::Allocate);
                    self.unmap_pages(base.as_u64(), page, owned);
                    if placement != Placement::Fixed {
                        self.heap_free(base, length);
                    }
                    return Err(err);
                }
            }
        }

        if replaced_any {
            // A replaced page may be cached with its old translation.
            tlb::flush_range(base, pages);
        }
        Ok(base)
    }

    fn copy_page_contents(&self, from: PhysAddr, to: PhysAddr) {
        let src = self.env.phys_to_virt(from).as_ptr::<u8>();
        let dst = self.env.phys_to_virt(to).as_mut_ptr::<u8>();
        // SAFETY: both frames are live, page-sized, and disjoint (`to` was
        // just allocated).
        unsafe { core::ptr::copy_nonoverlapping(src, dst, PAGE_SIZE) };
    }

    /// Reserves `length` bytes of virtual range without committing frames.
    ///
    /// The final access flags are recorded in the reserved entries; a later
    /// [`commit`](Self::commit) turns them into present mappings.
    ///
    /// # Errors
    ///
    /// [`VmmError::OutOfMemory`] or [`VmmError::InvalidParameters`] when
    /// `placement` is [`Placement::Fixed`] (reservations always come from a
    /// range allocator).
    pub fn map_reserved(
        &self,
        length: u64,
        flags: MapFlags,
        placement: Placement,
    ) -> Result<VirtAddr, VmmError> {
        if length == 0 {
            return Err(VmmError::InvalidParameters);
        }
        let base = self.heap_alloc(length, placement)?;
        let pte = flags.to_pte() | PteFlags::RESERVED;
        for page in 0..page_count(length) {
            let va = base.as_u64() + (page * PAGE_SIZE) as u64;
            let leaf_phys = self
                .walk(va, true, true)?
                .expect("walk with create returned no table")
                .0;
            let leaf = self.table(leaf_phys);
            leaf.store(table_index(va, 1), PageEntry::new(PhysAddr::ZERO, pte));
        }
        Ok(base)
    }

    /// Commits frames into a reserved range.
    ///
    /// `frames` supplies the physical pages (shared regions); `None`
    /// allocates fresh zeroed frames. The access flags were fixed at
    /// reservation time.
    ///
    /// # Errors
    ///
    /// [`VmmError::Exists`] if a page is already committed,
    /// [`VmmError::InvalidParameters`] if it was never reserved.
    pub fn commit(
        &self,
        virt: VirtAddr,
        frames: Option<&[PhysAddr]>,
        length: u64,
    ) -> Result<(), VmmError> {
        if length == 0 {
            return Err(VmmError::InvalidParameters);
        }
        let pages = page_count(length);
        if let Some(list) = frames {
            if list.len() < pages {
                return Err(VmmError::InvalidParameters);
            }
        }
        let base = virt.align_down(PAGE_SIZE as u64);
        for page in 0..pages {
            let va = base.as_u64() + (page * PAGE_SIZE) as u64;
            let leaf_phys = self
                .walk(va, true, true)?
                .expect("walk with create returned no table")
                .0;
            let leaf = self.table(leaf_phys);
            let index = table_index(va, 1);
            let entry = leaf.load(index);
            if entry.is_present() {
                return Err(VmmError::Exists);
            }
            if !entry.is_reserved() {
                return Err(VmmError::InvalidParameters);
            }
            let frame = match frames {
                Some(list) => list[page].align_down(PAGE_SIZE as u64),
                None => self.env.alloc_frame().map_err(|_| VmmError::OutOfMemory)?,
            };
            let flags = (entry.flags() - PteFlags::RESERVED) | PteFlags::PRESENT;
            leaf.store(index, PageEntry::new(frame, flags));
        }
        Ok(())
    }

    /// Clears `count` leaf entries starting at `base_va`, freeing owned
    /// frames when `free_frames` and the entry is neither inherited,
    /// persistent, nor a system mapping.
    fn unmap_pages(&self, base_va: u64, count: usize, free_frames: bool) {
        for page in 0..count {
            let va = base_va + (page * PAGE_SIZE) as u64;
            let Ok(Some((leaf_phys, inherited_path))) = self.walk(va, false, false) else {
                continue;
            };
            if inherited_path {
                // The leaf table belongs to an ancestor; clearing entries
                // there would tear down the parent's mappings too. The
                // child's view is shared, so there is nothing of its own to
                // release.
                continue;
            }
            let leaf = self.table(leaf_phys);
            let index = table_index(va, 1);
            let entry = leaf.load(index);
            if entry.is_empty() {
                continue;
            }
            leaf.store(index, PageEntry::EMPTY);
            let flags = entry.flags();
            if free_frames
                && entry.is_present()
                && !flags.contains(PteFlags::INHERITED)
                && !flags.contains(PteFlags::PERSISTENT)
                && !flags.contains(PteFlags::SYSTEM_MAP)
            {
                self.env.free_frame(entry.frame());
            }
        }
    }

    /// Unmaps `[virt, virt + length)`.
    ///
    /// Frames not marked persistent, inherited, or system are freed; the
    /// covered range is TLB-invalidated and, when it came from a heap
    /// placement, returned to the range allocator. Unmapping an unmapped
    /// range is silently accepted.
    ///
    /// # Errors
    ///
    /// [`VmmError::InvalidParameters`] on zero length.
    pub fn unmap(&self, virt: VirtAddr, length: u64) -> Result<(), VmmError> {
        if length == 0 {
            return Err(VmmError::InvalidParameters);
        }
        let base = virt.align_down(PAGE_SIZE as u64);
        let pages = page_count(length + (virt.as_u64() - base.as_u64()));
        self.unmap_pages(base.as_u64(), pages, true);
        tlb::flush_range(base, pages);
        self.heap_free(base, (pages * PAGE_SIZE) as u64);
        Ok(())
    }

    /// Resolves one virtual address.
    ///
    /// # Errors
    ///
    /// [`VmmError::NotMapped`] when no present translation exists.
    pub fn query(&self, virt: VirtAddr) -> Result<Mapping, VmmError> {
        let Some((leaf_phys, _)) = self.walk(virt.as_u64(), false, false)? else {
            return Err(VmmError::NotMapped);
        };
        let leaf = self.table(leaf_phys);
        let entry = leaf.load(table_index(virt.as_u64(), 1));
        if !entry.is_present() {
            return Err(VmmError::NotMapped);
        }
        Ok(Mapping {
            phys: entry.frame() + (virt.as_u64() & crate::PAGE_MASK as u64),
            flags: MapFlags::from_pte(entry.flags()),
        })
    }

    /// Collects the physical frames backing `[virt, virt + length)`.
    ///
    /// The first entry keeps the intra-page byte offset of `virt`, the rest
    /// are page-aligned — the convention shared regions expect.
    ///
    /// # Errors
    ///
    /// [`VmmError::NotMapped`] if any page in the range lacks a translation.
    pub fn query_range(&self, virt: VirtAddr, length: u64) -> Result<Vec<PhysAddr>, VmmError> {
        if length == 0 {
            return Err(VmmError::InvalidParameters);
        }
        let offset = virt.as_u64() & crate::PAGE_MASK as u64;
        let base = virt.align_down(PAGE_SIZE as u64);
        let pages = page_count(length + offset);
        let mut result = Vec::with_capacity(pages);
        for page in 0..pages {
            let va = base + (page * PAGE_SIZE) as u64;
            let mapping = self.query(va)?;
            if page == 0 {
                result.push(mapping.phys + offset);
            } else {
                result.push(mapping.phys);
            }
        }
        Ok(result)
    }

    /// Replaces the access flags of `[virt, virt + length)`.
    ///
    /// Returns the previous flags of the first page. Downgrades (removing
    /// write, execute, or user access) trigger a shoot-down; upgrades do
    /// not.
    ///
    /// # Errors
    ///
    /// [`VmmError::NotMapped`] if any page lacks a translation.
    pub fn change_protection(
        &self,
        virt: VirtAddr,
        length: u64,
        flags: MapFlags,
    ) -> Result<MapFlags, VmmError> {
        if length == 0 {
            return Err(VmmError::InvalidParameters);
        }
        let base = virt.align_down(PAGE_SIZE as u64);
        let pages = page_count(length + (virt.as_u64() - base.as_u64()));
        let mut previous = None;
        let mut downgraded = false;
        for page in 0..pages {
            let va = base.as_u64() + (page * PAGE_SIZE) as u64;
            let (leaf_phys, _) = self
                .walk(va, false, true)?
                .ok_or(VmmError::NotMapped)?;
            let leaf = self.table(leaf_phys);
            let index = table_index(va, 1);
            let entry = leaf.load(index);
            if !entry.is_present() {
                return Err(VmmError::NotMapped);
            }
            let old = MapFlags::from_pte(entry.flags());
            previous.get_or_insert(old);
            downgraded |= old.contains(MapFlags::WRITABLE) && !flags.contains(MapFlags::WRITABLE)
                || old.contains(MapFlags::EXECUTABLE) && !flags.contains(MapFlags::EXECUTABLE)
                || old.contains(MapFlags::USER) && !flags.contains(MapFlags::USER);
            // Keep the OS bookkeeping bits, replace the access bits.
            let keep = entry.flags()
                & (PteFlags::PRESENT
                    | PteFlags::ACCESSED
                    | PteFlags::DIRTY
                    | PteFlags::SYSTEM_MAP
                    | PteFlags::INHERITED
                    | PteFlags::PERSISTENT);
            leaf.store(index, PageEntry::new(entry.frame(), keep | flags.to_pte()));
        }
        if downgraded {
            tlb::flush_range(base, pages);
        }
        Ok(previous.expect("at least one page processed"))
    }

    /// Maps the frames backing `[src_virt, src_virt + length)` of `src`
    /// into this space with the given flags.
    ///
    /// The new mappings are tagged persistent: the frames stay owned by the
    /// source, so teardown here must not free them. Returns the destination
    /// address including the source's intra-page offset.
    ///
    /// # Errors
    ///
    /// [`VmmError::NotMapped`] if the source range is incomplete,
    /// [`VmmError::Exists`] on fixed-placement collision.
    pub fn clone_mapping(
        &self,
        src: &AddressSpace,
        src_virt: VirtAddr,
        dst_virt: Option<VirtAddr>,
        length: u64,
        flags: MapFlags,
        placement: Placement,
    ) -> Result<VirtAddr, VmmError> {
        let frames = src.query_range(src_virt, length)?;
        let offset = src_virt.as_u64() & crate::PAGE_MASK as u64;
        let base = self.map(
            dst_virt,
            FrameRequest::Scatter(&frames),
            (frames.len() * PAGE_SIZE) as u64,
            flags | MapFlags::PERSISTENT,
            placement,
        )?;
        Ok(base + offset)
    }

    /// Frees a table subtree, skipping everything tagged inherited.
    fn free_table_recursive(&self, table_phys: PhysAddr, level: usize) {
        let table = self.table(table_phys);
        for index in 0..ENTRIES_PER_TABLE {
            let entry = table.load(index);
            if entry.is_empty() || entry.flags().contains(PteFlags::INHERITED) {
                continue;
            }
            if level > 1 {
                if entry.is_present() {
                    self.free_table_recursive(entry.frame(), level - 1);
                }
            } else if entry.is_present()
                && !entry.flags().contains(PteFlags::PERSISTENT)
                && !entry.flags().contains(PteFlags::SYSTEM_MAP)
            {
                self.env.free_frame(entry.frame());
            }
        }
        self.env.free_frame(table_phys);
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Walk only entries this space owns: inherited links point into an
        // ancestor's tables and must never be freed here.
        let table = self.table(self.root);
        for index in 0..ENTRIES_PER_TABLE {
            let entry = table.load(index);
            if entry.is_empty() || entry.flags().contains(PteFlags::INHERITED) {
                continue;
            }
            if entry.is_present() {
                self.free_table_recursive(entry.frame(), 3);
            }
        }
        self.env.free_frame(self.root);
    }
}
