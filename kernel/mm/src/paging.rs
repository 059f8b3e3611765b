//! Page table structures and entry encoding.
//!
//! Four levels of 512-entry tables. Entries are `AtomicU64` so intermediate
//! tables can be installed with compare-and-swap instead of a table lock:
//! two cores racing to create a missing mid-level table end with one winner,
//! and the loser frees its spare frame.
//!
//! Besides the architecture bits, entries carry three OS-defined semantic
//! bits in the ignored range:
//!
//! - `SYSTEM_MAP`: permanent device MMIO mapping, never freed.
//! - `INHERITED`: the table or frame behind this entry is owned by an
//!   ancestor address space and must never be freed here.
//! - `PERSISTENT`: frame exempt from process teardown (shared regions).
//!
//! A fourth marker, `RESERVED`, tags non-present entries whose virtual range
//! has been reserved but not committed.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use muon_core::addr::PhysAddr;

/// Entries per table at every level.
pub const ENTRIES_PER_TABLE: usize = 512;

/// Number of table levels (root = level 4, leaf = level 1).
pub const TABLE_LEVELS: usize = 4;

bitflags! {
    /// Raw page table entry bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        /// Entry is present (translation valid).
        const PRESENT       = 1 << 0;
        /// Page is writable.
        const WRITABLE      = 1 << 1;
        /// Page is accessible from user mode.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by hardware on access.
        const ACCESSED      = 1 << 5;
        /// Set by hardware on write.
        const DIRTY         = 1 << 6;
        /// Global page (survives address-space switches).
        const GLOBAL        = 1 << 8;
        /// OS: permanent device MMIO mapping.
        const SYSTEM_MAP    = 1 << 9;
        /// OS: owned by an ancestor space; never freed here.
        const INHERITED     = 1 << 10;
        /// OS: exempt from process teardown.
        const PERSISTENT    = 1 << 11;
        /// OS: virtual range reserved, frame not yet committed.
        const RESERVED      = 1 << 52;
        /// No-execute.
        const NO_EXECUTE    = 1 << 63;
    }
}

/// Mask extracting the physical frame address from an entry.
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Architecture-independent mapping flags used by the address-space API.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Mapping is writable.
        const WRITABLE      = 1 << 0;
        /// Mapping is executable.
        const EXECUTABLE    = 1 << 1;
        /// Mapping is accessible from user mode.
        const USER          = 1 << 2;
        /// Global mapping (kernel range).
        const GLOBAL        = 1 << 3;
        /// Caching disabled (device memory).
        const CACHE_DISABLE = 1 << 4;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 5;
        /// Permanent device MMIO mapping.
        const SYSTEM_MAP    = 1 << 6;
        /// Frame exempt from process teardown.
        const PERSISTENT    = 1 << 7;
    }
}

impl MapFlags {
    /// Encodes these flags as leaf-entry bits (without the present bit).
    #[must_use]
    pub fn to_pte(self) -> PteFlags {
        let mut pte = PteFlags::empty();
        if self.contains(Self::WRITABLE) {
            pte |= PteFlags::WRITABLE;
        }
        if !self.contains(Self::EXECUTABLE) {
            pte |= PteFlags::NO_EXECUTE;
        }
        if self.contains(Self::USER) {
            pte |= PteFlags::USER;
        }
        if self.contains(Self::GLOBAL) {
            pte |= PteFlags::GLOBAL;
        }
        if self.contains(Self::CACHE_DISABLE) {
            pte |= PteFlags::CACHE_DISABLE;
        }
        if self.contains(Self::WRITE_THROUGH) {
            pte |= PteFlags::WRITE_THROUGH;
        }
        if self.contains(Self::SYSTEM_MAP) {
            pte |= PteFlags::SYSTEM_MAP;
        }
        if self.contains(Self::PERSISTENT) {
            pte |= PteFlags::PERSISTENT;
        }
        pte
    }

    /// Decodes leaf-entry bits back into mapping flags.
    #[must_use]
    pub fn from_pte(pte: PteFlags) -> Self {
        let mut flags = Self::empty();
        if pte.contains(PteFlags::WRITABLE) {
            flags |= Self::WRITABLE;
        }
        if !pte.contains(PteFlags::NO_EXECUTE) {
            flags |= Self::EXECUTABLE;
        }
        if pte.contains(PteFlags::USER) {
            flags |= Self::USER;
        }
        if pte.contains(PteFlags::GLOBAL) {
            flags |= Self::GLOBAL;
        }
        if pte.contains(PteFlags::CACHE_DISABLE) {
            flags |= Self::CACHE_DISABLE;
        }
        if pte.contains(PteFlags::WRITE_THROUGH) {
            flags |= Self::WRITE_THROUGH;
        }
        if pte.contains(PteFlags::SYSTEM_MAP) {
            flags |= Self::SYSTEM_MAP;
        }
        if pte.contains(PteFlags::PERSISTENT) {
            flags |= Self::PERSISTENT;
        }
        flags
    }
}

/// A decoded page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry(pub u64);

impl PageEntry {
    /// The empty (non-present, non-reserved) entry.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry from a frame address and flags.
    #[must_use]
    pub fn new(frame: PhysAddr, flags: PteFlags) -> Self {
        Self((frame.as_u64() & ADDR_MASK) | flags.bits())
    }

    /// Returns the entry's flag bits.
    #[must_use]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    /// Returns the physical frame address.
    #[must_use]
    pub fn frame(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Present bit set?
    #[must_use]
    pub fn is_present(self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    /// Reserved-but-uncommitted marker?
    #[must_use]
    pub fn is_reserved(self) -> bool {
        !self.is_present() && self.flags().contains(PteFlags::RESERVED)
    }

    /// Completely unused?
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// A 4 KiB page table: 512 atomic entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [AtomicU64; ENTRIES_PER_TABLE],
}

impl PageTable {
    /// Loads entry `index` with acquire ordering (pairs with the release CAS
    /// installing subtables, so an observed table is seen zero-initialized).
    #[must_use]
    pub fn load(&self, index: usize) -> PageEntry {
        PageEntry(self.entries[index].load(Ordering::Acquire))
    }

    /// Stores entry `index`. Leaf writes use relaxed ordering; visibility to
    /// other cores is established by the TLB shoot-down protocol.
    pub fn store(&self, index: usize, entry: PageEntry) {
        self.entries[index].store(entry.0, Ordering::Relaxed);
    }

    /// Compare-and-swap on entry `index` with release ordering on success.
    ///
    /// # Errors
    ///
    /// Returns the observed entry when it differs from `current`.
    pub fn compare_exchange(
        &self,
        index: usize,
        current: PageEntry,
        new: PageEntry,
    ) -> Result<(), PageEntry> {
        self.entries[index]
            .compare_exchange(current.0, new.0, Ordering::Release, Ordering::Acquire)
            .map(|_| ())
            .map_err(PageEntry)
    }
}

/// Index of the level-`level` table entry for `virt` (level 4 = root).
#[must_use]
pub fn table_index(virt: u64, level: usize) -> usize {
    debug_assert!((1..=TABLE_LEVELS).contains(&level));
    ((virt >> (12 + 9 * (level - 1))) & 0x1FF) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let frame = PhysAddr::new(0xABCD_E000);
        let entry = PageEntry::new(frame, PteFlags::PRESENT | PteFlags::WRITABLE);
        assert_eq!(entry.frame(), frame);
        assert!(entry.is_present());
        assert!(entry.flags().contains(PteFlags::WRITABLE));
    }

    #[test]
    fn reserved_marker_is_not_present() {
        let entry = PageEntry::new(PhysAddr::ZERO, PteFlags::RESERVED | PteFlags::USER);
        assert!(!entry.is_present());
        assert!(entry.is_reserved());
        assert!(!entry.is_empty());
    }

    #[test]
    fn os_bits_do_not_clobber_address() {
        let frame = PhysAddr::new(0x1234_5000);
        let entry = PageEntry::new(
            frame,
            PteFlags::PRESENT | PteFlags::SYSTEM_MAP | PteFlags::INHERITED | PteFlags::PERSISTENT,
        );
        assert_eq!(entry.frame(), frame);
        assert!(entry.flags().contains(PteFlags::INHERITED));
    }

    #[test]
    fn map_flags_pte_roundtrip() {
        let flags = MapFlags::WRITABLE | MapFlags::USER | MapFlags::PERSISTENT;
        let pte = flags.to_pte();
        assert!(pte.contains(PteFlags::NO_EXECUTE), "non-exec by default");
        assert_eq!(MapFlags::from_pte(pte), flags);
    }

    #[test]
    fn executable_clears_nx() {
        let pte = (MapFlags::WRITABLE | MapFlags::EXECUTABLE).to_pte();
        assert!(!pte.contains(PteFlags::NO_EXECUTE));
    }

    #[test]
    fn table_indices() {
        // 0xFFFF_8000_0000_0000-style canonical addresses decompose into
        // 9-bit slices starting at bit 12.
        let virt = (1u64 << 39) | (2 << 30) | (3 << 21) | (4 << 12);
        assert_eq!(table_index(virt, 4), 1);
        assert_eq!(table_index(virt, 3), 2);
        assert_eq!(table_index(virt, 2), 3);
        assert_eq!(table_index(virt, 1), 4);
    }

    #[test]
    fn cas_install_single_winner() {
        use std::sync::Arc;

        // Two threads race to install an entry; exactly one wins.
        let table: Arc<PageTable> = Arc::new(unsafe { core::mem::zeroed() });
        let winners: Vec<_> = (0..2)
            .map(|i| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let entry = PageEntry::new(
                        PhysAddr::new(0x1000 * (i + 1)),
                        PteFlags::PRESENT,
                    );
                    table.compare_exchange(7, PageEntry::EMPTY, entry).is_ok()
                })
            })
            .map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners.iter().filter(|&&w| w).count(), 1);
        assert!(table.load(7).is_present());
    }
}
