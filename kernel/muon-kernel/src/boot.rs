//! Boot bring-up.
//!
//! [`kernel_main`] receives the loader's flat descriptor and initializes
//! the subsystems bottom-up: serial log, physical frame allocator (from
//! the memory map plus the descriptor's explicit reserved list), the early
//! heap in the direct map, the kernel address space, interrupt table and
//! APICs, per-core scheduling, the timer tick, the deferred-interrupt
//! thread, and finally the file service over the boot ramdisk. The BSP
//! then parks in the idle loop; application cores enter [`ap_main`].
//!
//! Nothing here allocates before the heap is donated: early collections
//! use fixed-capacity vectors.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, Ordering};

use muon_core::addr::{PhysAddr, VirtAddr};
use muon_core::handle::HandleRegistry;
use muon_core::id::{CoreId, DomainId, ProcessId, ThreadId};
use muon_core::sync::SpinLock;
use muon_core::{info, warn};
use muon_fs::mount::Mount;
use muon_fs::pipeline::VfsService;
use muon_fs::ramfs::RamFs;
use muon_fs::request::VfsRequest;
use muon_fs::scope::{FilesystemScope, VerbSet};
use muon_irq::table::{InterruptTable, IrqOverride};
use muon_mm::address_space::{AddressSpace, FrameRequest, Placement};
use muon_mm::paging::MapFlags;
use muon_mm::pmm::{FrameBitmap, ReservedRange};
use muon_mm::{PAGE_SIZE, PhysMemoryRegion, pmm, tlb};
use muon_sched::config::SchedulerConfig;
use muon_sched::scheduler::Scheduler;
use muon_sched::thread::{Thread, ThreadFlags, ThreadLocation};
use planck_noalloc::vec::ArrayVec;

use crate::apic::{self, Apic};
use crate::env::KernelMmEnv;
use crate::fs::ramdisk::RamdiskFs;
use crate::{arch, heap, irq_glue, log, percpu, platform, time};

/// Early heap donated from the direct map before the VMM exists.
const EARLY_HEAP_SIZE: u64 = 4 * 1024 * 1024;

/// How many file-service worker threads to start.
const VFS_WORKERS: usize = 2;

/// Memory map entry types the loader reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKind {
    /// Usable RAM.
    Available,
    /// Firmware-reserved or device memory.
    Reserved,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable,
}

/// One entry of the loader's memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryMapEntry {
    /// Base physical address.
    pub base: PhysAddr,
    /// Length in bytes.
    pub length: u64,
    /// Entry type.
    pub kind: MemoryKind,
}

/// The flat descriptor the loader places for the kernel.
pub struct BootDescriptor<'a> {
    /// The physical memory map.
    pub memory_map: &'a [MemoryMapEntry],
    /// Explicit reserved ranges (kernel image, trampolines, ramdisk, …);
    /// the frame allocator consumes this verbatim instead of hard-coding
    /// a trap-page set.
    pub reserved: &'a [ReservedRange],
    /// Boot ramdisk location, if the loader placed one.
    pub ramdisk: Option<(PhysAddr, u64)>,
    /// Kernel image placement.
    pub kernel: (PhysAddr, u64),
    /// Loader-selected video mode.
    pub video_mode: u32,
    /// Framebuffer base, when `video_mode` names a linear mode.
    pub framebuffer: PhysAddr,
    /// Physical address of the ACPI RSDP.
    pub acpi_rsdp: PhysAddr,
    /// Virtual offset of the loader-established direct map.
    pub direct_map_offset: u64,
    /// The MADT span, located by the platform layer from `acpi_rsdp`.
    pub madt: Option<&'a [u8]>,
    /// The SRAT span, if the platform has one.
    pub srat: Option<&'a [u8]>,
}

impl BootDescriptor<'_> {
    /// The classic reserved set for loaders that do not supply their own
    /// list: the first page, the SMP trampoline pages, the kernel stack
    /// area, the kernel image, and the ramdisk.
    #[must_use]
    pub fn reserved_defaults(
        kernel: (PhysAddr, u64),
        ramdisk: Option<(PhysAddr, u64)>,
    ) -> ArrayVec<ReservedRange, 8> {
        let mut reserved = ArrayVec::new();
        reserved.push(ReservedRange {
            base: PhysAddr::new(0),
            length: PAGE_SIZE as u64,
        });
        reserved.push(ReservedRange {
            base: PhysAddr::new(0x4000),
            length: 0x9000 - 0x4000,
        });
        reserved.push(ReservedRange {
            base: PhysAddr::new(0x90000),
            length: 0xF000,
        });
        reserved.push(ReservedRange {
            base: kernel.0,
            length: kernel.1,
        });
        if let Some((base, length)) = ramdisk {
            reserved.push(ReservedRange { base, length });
        }
        reserved
    }
}

/// Converts the loader map into allocator regions.
fn to_phys_regions(map: &[MemoryMapEntry]) -> ArrayVec<PhysMemoryRegion, 64> {
    let mut regions = ArrayVec::new();
    for entry in map {
        if regions.is_full() {
            break;
        }
        regions.push(PhysMemoryRegion {
            base: entry.base,
            size: entry.length,
            usable: entry.kind == MemoryKind::Available,
        });
    }
    regions
}

/// Finds `bytes` of available physical memory above 1 MiB that overlaps
/// no reserved range. Used to place the frame bitmap and the early heap
/// before the allocator exists.
fn find_carve_spot(
    map: &[MemoryMapEntry],
    reserved: &[ReservedRange],
    bytes: u64,
) -> Option<PhysAddr> {
    const LOW_LIMIT: u64 = 1024 * 1024;
    for entry in map.iter().filter(|e| e.kind == MemoryKind::Available) {
        let mut candidate = entry.base.as_u64().max(LOW_LIMIT).next_multiple_of(PAGE_SIZE as u64);
        let end = entry.base.as_u64() + entry.length;
        'candidate: while candidate + bytes <= end {
            for range in reserved {
                let r_start = range.base.as_u64();
                let r_end = r_start + range.length;
                if candidate < r_end && r_start < candidate + bytes {
                    candidate = r_end.next_multiple_of(PAGE_SIZE as u64);
                    continue 'candidate;
                }
            }
            return Some(PhysAddr::new(candidate));
        }
    }
    None
}

/// Collects interrupt-source overrides from the MADT.
fn collect_overrides(madt: &muon_acpi::madt::Madt<'_>) -> Vec<IrqOverride> {
    use muon_acpi::madt::MadtEntry;
    let mut overrides = Vec::new();
    for entry in madt.entries() {
        if let MadtEntry::InterruptSourceOverride { source, gsi, flags } = entry {
            overrides.push(IrqOverride {
                source,
                gsi,
                active_low: MadtEntry::inti_active_low(flags),
                level_triggered: MadtEntry::inti_level_triggered(flags),
            });
        }
    }
    overrides
}

/// Derives the core list (local APIC ids in discovery order) and each
/// core's NUMA domain from the MADT and SRAT.
fn discover_topology(
    madt: &muon_acpi::madt::Madt<'_>,
    srat: Option<&muon_acpi::srat::Srat<'_>>,
) -> (Vec<u8>, Vec<DomainId>) {
    use muon_acpi::madt::MadtEntry;
    use muon_acpi::srat::SratEntry;

    let mut apic_ids = Vec::new();
    for entry in madt.entries() {
        if let MadtEntry::LocalApic { apic_id, flags, .. } = entry {
            if flags & 1 != 0 {
                apic_ids.push(apic_id);
            }
        }
    }
    if apic_ids.is_empty() {
        apic_ids.push(0);
    }

    let domains = apic_ids
        .iter()
        .map(|&apic_id| {
            let domain = srat.and_then(|srat| {
                srat.entries().find_map(|entry| match entry {
                    SratEntry::ProcessorAffinity {
                        apic_id: id,
                        domain,
                        flags,
                    } if id == apic_id && flags & 1 != 0 => Some(domain),
                    _ => None,
                })
            });
            DomainId::new(domain.unwrap_or(0))
        })
        .collect();
    (apic_ids, domains)
}

// ---------------------------------------------------------------------------
// Global service handles
// ---------------------------------------------------------------------------

static VFS: AtomicPtr<Arc<VfsService>> = AtomicPtr::new(core::ptr::null_mut());
static APIC_IDS: SpinLock<Vec<u8>> = SpinLock::new(Vec::new());

/// The file service.
///
/// # Panics
///
/// Panics before boot wires it.
#[must_use]
pub fn vfs() -> &'static Arc<VfsService> {
    let ptr = VFS.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "file service not started");
    // SAFETY: installed once from a leaked box, never freed.
    unsafe { &*ptr }
}

/// Submits a file-service request on behalf of a process.
pub fn submit_request(request: VfsRequest) -> Arc<VfsRequest> {
    vfs().submit(request)
}

fn resolve_current_core() -> CoreId {
    let Some(controller) = apic::controller() else {
        return CoreId::new(0);
    };
    let apic_id = controller.local().id();
    let ids = APIC_IDS.lock();
    let index = ids.iter().position(|&id| id == apic_id).unwrap_or(0);
    CoreId::new(index as u32)
}

extern "C" fn vfs_worker_entry(_arg: usize) {
    let sched = platform::scheduler();
    let service = vfs();
    let me = percpu::current()
        .current_thread()
        .expect("worker without identity");
    service.tasks().run_worker(sched, &me);
}

fn make_idle_thread(core: CoreId, sched: &Scheduler) -> Arc<Thread> {
    let idle = Thread::new(
        ThreadId::new(u64::from(core.as_u32()) + 1_000_000),
        ProcessId::KERNEL,
        None,
        "idle",
        ThreadFlags::KERNEL | ThreadFlags::IDLE | ThreadFlags::BOUND,
        None,
    );
    idle.force_location(ThreadLocation::Running);
    sched.table().insert(idle.clone());
    sched.set_idle(core, idle.clone());
    percpu::get(core).set_idle_thread(idle.clone());
    percpu::get(core).set_current_thread(idle.clone());
    idle
}

/// Bootstrap processor entry. Initializes every subsystem in dependency
/// order and never returns.
///
/// # Panics
///
/// Panics when the machine cannot satisfy a hard requirement (no memory
/// for the frame bitmap, malformed ACPI tables).
pub fn kernel_main(boot: &BootDescriptor<'_>) -> ! {
    log::init_early();
    info!("muon: booting");

    // --- A: physical frame allocator -----------------------------------
    let regions = to_phys_regions(boot.memory_map);
    let total_bytes: u64 = regions
        .iter()
        .filter(|r| r.usable)
        .map(|r| r.base.as_u64() + r.size)
        .max()
        .unwrap_or(0);
    let bitmap_bytes =
        ((total_bytes / PAGE_SIZE as u64).div_ceil(64) * 8).next_multiple_of(PAGE_SIZE as u64);

    let mut reserved: ArrayVec<ReservedRange, 32> = ArrayVec::new();
    for range in boot.reserved {
        reserved.push(*range);
    }
    let bitmap_phys = find_carve_spot(boot.memory_map, reserved.as_slice(), bitmap_bytes)
        .expect("no memory for the frame bitmap");
    reserved.push(ReservedRange {
        base: bitmap_phys,
        length: bitmap_bytes,
    });
    let heap_phys = find_carve_spot(boot.memory_map, reserved.as_slice(), EARLY_HEAP_SIZE)
        .expect("no memory for the early heap");
    reserved.push(ReservedRange {
        base: heap_phys,
        length: EARLY_HEAP_SIZE,
    });

    // SAFETY: the carve spot is usable RAM reachable through the direct
    // map and now reserved for the bitmap's exclusive use.
    let bitmap_storage = unsafe {
        core::slice::from_raw_parts_mut(
            (boot.direct_map_offset + bitmap_phys.as_u64()) as *mut u64,
            bitmap_bytes as usize / 8,
        )
    };
    bitmap_storage.fill(0);
    // SAFETY: storage is exclusively owned; the map describes the machine.
    let bitmap =
        unsafe { FrameBitmap::new(bitmap_storage, regions.as_slice(), reserved.as_slice()) };
    info!(
        "pmm: {} frames, {} used",
        bitmap.total_frames(),
        bitmap.used_frames()
    );
    pmm::init(bitmap);

    // Early heap straight out of the direct map; the allocator works from
    // here on.
    // SAFETY: the carved range is reserved, writable, direct-mapped.
    unsafe {
        heap::HEAP.init(
            (boot.direct_map_offset + heap_phys.as_u64()) as *mut u8,
            EARLY_HEAP_SIZE as usize,
        );
    }

    // --- B: the kernel address space ------------------------------------
    let env: &'static KernelMmEnv = Box::leak(Box::new(KernelMmEnv::new(boot.direct_map_offset)));
    let kernel_space = AddressSpace::new_kernel(env).expect("kernel address space");

    // The kernel image keeps its loaded placement, mapped in the top
    // 2 GiB; the direct map gets its own root slot, so the two never
    // collide.
    let (kernel_phys, kernel_length) = boot.kernel;
    kernel_space
        .map(
            Some(VirtAddr::new(
                muon_mm::layout::KERNEL_IMAGE_BASE + kernel_phys.as_u64(),
            )),
            FrameRequest::Contiguous(kernel_phys),
            kernel_length,
            MapFlags::WRITABLE | MapFlags::EXECUTABLE | MapFlags::GLOBAL | MapFlags::SYSTEM_MAP,
            Placement::Fixed,
        )
        .expect("map kernel image");
    // The direct map covers all of RAM.
    kernel_space
        .map(
            Some(VirtAddr::new(boot.direct_map_offset)),
            FrameRequest::Contiguous(PhysAddr::new(0)),
            total_bytes,
            MapFlags::WRITABLE | MapFlags::GLOBAL | MapFlags::SYSTEM_MAP,
            Placement::Fixed,
        )
        .expect("map direct map");
    // SAFETY: the new root maps the executing kernel and the direct map.
    unsafe { arch::load_root(kernel_space.root_phys()) };
    tlb::register_flush(irq_glue::tlb_flush);

    // --- ACPI topology ---------------------------------------------------
    let madt = boot
        .madt
        .map(|span| muon_acpi::madt::Madt::parse(span).expect("malformed MADT"));
    let srat = boot
        .srat
        .map(|span| muon_acpi::srat::Srat::parse(span).expect("malformed SRAT"));

    let (apic_ids, domains) = match &madt {
        Some(madt) => discover_topology(madt, srat.as_ref()),
        None => (alloc::vec![0u8], alloc::vec![DomainId::BOOT]),
    };
    info!("smp: {} cores", apic_ids.len());
    percpu::set_core_count(apic_ids.len());
    for (index, domain) in domains.iter().enumerate() {
        percpu::get(CoreId::new(index as u32)).set_domain(*domain);
    }
    *APIC_IDS.lock() = apic_ids.clone();

    // --- D: interrupt table and APIC bring-up ---------------------------
    let table = InterruptTable::new();
    if let Some(madt) = &madt {
        table.set_overrides(collect_overrides(madt));
    }
    irq_glue::install_table(table);

    if let Some(madt) = &madt {
        Apic::disable_imcr();
        let lapic_virt = kernel_space
            .map(
                None,
                FrameRequest::Contiguous(PhysAddr::new(u64::from(madt.local_apic_address))),
                PAGE_SIZE as u64,
                MapFlags::WRITABLE | MapFlags::GLOBAL | MapFlags::CACHE_DISABLE
                    | MapFlags::SYSTEM_MAP,
                Placement::GlobalKernelHeap,
            )
            .expect("map local APIC");
        // SAFETY: just mapped, cache-disabled.
        let local = unsafe { apic::local::LocalApic::new(lapic_virt) };
        local.init();
        for entry in madt.entries() {
            if let muon_acpi::madt::MadtEntry::LocalApicNmi {
                acpi_processor_id,
                flags,
                lint,
            } = entry
            {
                if acpi_processor_id == 0xFF || acpi_processor_id == 0 {
                    local.apply_nmi(
                        lint,
                        muon_acpi::madt::MadtEntry::inti_active_low(flags),
                        muon_acpi::madt::MadtEntry::inti_level_triggered(flags),
                    );
                }
            }
        }

        let mut io_apics = Vec::new();
        for entry in madt.entries() {
            if let muon_acpi::madt::MadtEntry::IoApic {
                address, gsi_base, ..
            } = entry
            {
                let virt = kernel_space
                    .map(
                        None,
                        FrameRequest::Contiguous(PhysAddr::new(u64::from(address))),
                        PAGE_SIZE as u64,
                        MapFlags::WRITABLE | MapFlags::GLOBAL | MapFlags::CACHE_DISABLE
                            | MapFlags::SYSTEM_MAP,
                        Placement::GlobalKernelHeap,
                    )
                    .expect("map I/O APIC");
                // SAFETY: just mapped, cache-disabled.
                let ioapic = unsafe { apic::io::IoApic::new(virt, gsi_base) };
                if let Some(extint_gsi) = ioapic.mask_all() {
                    // The 8259 pin is claimed so allocation never uses it.
                    irq_glue::table().claim_vector(extint_gsi as u16);
                }
                io_apics.push(ioapic);
            }
        }
        apic::install(Apic::new(local, io_apics, apic_ids));
        percpu::register_current_core(resolve_current_core);
    } else {
        warn!("acpi: no MADT span; running without APIC routing");
    }

    // --- E/F: scheduler and the BSP idle thread --------------------------
    let sched = Arc::new(Scheduler::new(
        &platform::PLATFORM,
        SchedulerConfig::default(),
        &domains,
    ));
    platform::install_scheduler(sched.clone());
    platform::install_parking();

    let bsp = CoreId::new(0);
    percpu::get(bsp).set_state(percpu::CpuState::Running);
    make_idle_thread(bsp, &sched);

    // 1 ms scheduler tick off the system timer.
    time::register_tick_callback(scheduler_tick, 1);

    // --- D: deferred interrupt thread ------------------------------------
    irq_glue::start_deferred_thread();

    // --- G/H/I: handle registry, file service, root scope ----------------
    let registry = Arc::new(HandleRegistry::new());
    let service = VfsService::new(sched.clone(), registry);

    let scope = FilesystemScope::new(ProcessId::KERNEL, VerbSet::all());
    scope.attach(Mount::new("/", RamFs::new("root")));
    if let Some((ramdisk_phys, ramdisk_length)) = boot.ramdisk {
        // SAFETY: the ramdisk is loader-reserved memory in the direct map,
        // untouched for the system's lifetime.
        let blob = unsafe {
            core::slice::from_raw_parts(
                (boot.direct_map_offset + ramdisk_phys.as_u64()) as *const u8,
                ramdisk_length as usize,
            )
        };
        match RamdiskFs::new(blob, "initfs") {
            Ok(fs) => scope.attach(Mount::new("/initfs", fs)),
            Err(err) => warn!("initfs: {err}"),
        }
    }
    service.scopes().insert(scope);
    VFS.store(Box::into_raw(Box::new(service)), Ordering::Release);

    for _ in 0..VFS_WORKERS {
        platform::spawn("vfs-worker", vfs_worker_entry, 0, ThreadFlags::empty());
    }

    info!("muon: bring-up complete");
    arch::interrupts_enable();
    idle_loop()
}

/// Application processor entry, after the trampoline put the core into
/// long mode on the kernel address space.
pub fn ap_main(core: CoreId) -> ! {
    let sched = platform::scheduler();
    percpu::get(core).set_state(percpu::CpuState::Running);
    make_idle_thread(core, sched);
    arch::interrupts_enable();
    idle_loop()
}

fn scheduler_tick(elapsed_ms: u64) {
    if let Some(sched) = platform::scheduler_if_installed() {
        sched.tick(elapsed_ms);
    }
    // Preempt only when the running thread's quantum is spent.
    if percpu::current().quantum_tick(elapsed_ms as u32) {
        platform::reschedule(true);
    }
}

fn idle_loop() -> ! {
    loop {
        platform::reap_threads();
        platform::reschedule(false);
        arch::wait_for_interrupt();
    }
}

// ---------------------------------------------------------------------------
// Panic path
// ---------------------------------------------------------------------------

/// Kernel panic: log the report with a hexdump of the faulting thread's
/// top stack bytes, then halt.
#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    use muon_core::error;

    arch::interrupts_disable();
    error!("kernel panic: {info}");

    // Hexdump the top 128 bytes of the current stack.
    let marker = 0u8;
    let stack_top = core::ptr::from_ref(&marker) as usize & !0xF;
    for row in 0..8 {
        let base = stack_top + row * 16;
        // SAFETY: reading our own live stack.
        let bytes = unsafe { core::slice::from_raw_parts(base as *const u8, 16) };
        error!(
            "  {:#018x}: {:02x?}",
            base,
            bytes
        );
    }

    loop {
        arch::wait_for_interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_entry(base: u64, length: u64, kind: MemoryKind) -> MemoryMapEntry {
        MemoryMapEntry {
            base: PhysAddr::new(base),
            length,
            kind,
        }
    }

    #[test]
    fn reserved_defaults_cover_the_classic_set() {
        let reserved = BootDescriptor::reserved_defaults(
            (PhysAddr::new(0x10_0000), 0x8_0000),
            Some((PhysAddr::new(0x20_0000), 0x4_0000)),
        );
        let covers = |addr: u64| {
            reserved
                .iter()
                .any(|r| addr >= r.base.as_u64() && addr < r.base.as_u64() + r.length)
        };
        assert!(covers(0), "first page");
        assert!(covers(0x4000) && covers(0x8FFF), "trampolines");
        assert!(covers(0x90000), "kernel stack area");
        assert!(covers(0x10_0000), "kernel image");
        assert!(covers(0x20_0000), "ramdisk");
        assert!(!covers(0x9000), "gap above trampolines stays free");
    }

    #[test]
    fn carve_spot_avoids_reserved_ranges() {
        let map = [
            map_entry(0, 0x9F000, MemoryKind::Available),
            map_entry(0x100000, 0x40_0000, MemoryKind::Available),
        ];
        let reserved = [
            ReservedRange {
                base: PhysAddr::new(0x100000),
                length: 0x2_0000,
            },
            ReservedRange {
                base: PhysAddr::new(0x13_0000),
                length: 0x1_0000,
            },
        ];
        let spot = find_carve_spot(&map, &reserved, 0x1_0000).unwrap();
        // Must skip the kernel at 1 MiB; fits between the two reservations.
        assert_eq!(spot.as_u64(), 0x12_0000);

        // Asking for more than the gap pushes past the second reservation.
        let big = find_carve_spot(&map, &reserved, 0x10_0000).unwrap();
        assert_eq!(big.as_u64(), 0x14_0000);
    }

    #[test]
    fn carve_spot_requires_room() {
        let map = [map_entry(0x100000, 0x10000, MemoryKind::Available)];
        assert!(find_carve_spot(&map, &[], 0x20000).is_none());
    }

    #[test]
    fn carve_spot_ignores_low_memory() {
        let map = [map_entry(0, 0x9F000, MemoryKind::Available)];
        assert!(find_carve_spot(&map, &[], 0x1000).is_none());
    }

    #[test]
    fn regions_mark_usability() {
        let map = [
            map_entry(0, 0x1000, MemoryKind::Available),
            map_entry(0x1000, 0x1000, MemoryKind::Reserved),
            map_entry(0x2000, 0x1000, MemoryKind::AcpiReclaimable),
        ];
        let regions = to_phys_regions(&map);
        assert_eq!(regions.len(), 3);
        assert!(regions[0].usable);
        assert!(!regions[1].usable);
        assert!(!regions[2].usable);
    }

    fn build_madt_with_cpus(cpus: &[(u8, u32)]) -> Vec<u8> {
        // SDT header + MADT fixed fields + one LocalApic entry per cpu.
        let mut entries = Vec::new();
        for (index, (apic_id, flags)) in cpus.iter().enumerate() {
            entries.extend_from_slice(&[0, 8, index as u8, *apic_id]);
            entries.extend_from_slice(&flags.to_le_bytes());
        }

        let mut payload = Vec::new();
        payload.extend_from_slice(&0xFEE0_0000u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&entries);

        let length = 36 + payload.len();
        let mut table = vec![0u8; length];
        table[0..4].copy_from_slice(b"APIC");
        table[4..8].copy_from_slice(&(length as u32).to_le_bytes());
        table[36..].copy_from_slice(&payload);
        let sum: u8 = table.iter().fold(0u8, |s, b| s.wrapping_add(*b));
        table[9] = 0u8.wrapping_sub(sum);
        table
    }

    #[test]
    fn topology_skips_disabled_cpus() {
        let span = build_madt_with_cpus(&[(0, 1), (1, 0), (2, 1)]);
        let madt = muon_acpi::madt::Madt::parse(&span).unwrap();
        let (apic_ids, domains) = discover_topology(&madt, None);
        assert_eq!(apic_ids, vec![0, 2]);
        assert_eq!(domains, vec![DomainId::new(0), DomainId::new(0)]);
    }
}
