//! System Resource Affinity Table (SRAT) parsing.
//!
//! The SRAT assigns processors and memory ranges to proximity domains;
//! the scheduler uses it to group cores into NUMA domains at bring-up.

use crate::sdt::{self, SdtHeader};
use crate::{AcpiError, read_u32, read_u64};

/// SRAT table signature.
pub const SRAT_SIGNATURE: &[u8; 4] = b"SRAT";

/// Parsed SRAT borrowing the entry span.
pub struct Srat<'a> {
    entries: &'a [u8],
}

impl<'a> Srat<'a> {
    /// Reserved fixed fields after the SDT header.
    const FIELDS_SIZE: usize = 12;

    /// Parses an SRAT from a full table span.
    ///
    /// # Errors
    ///
    /// Standard validation errors.
    pub fn parse(data: &'a [u8]) -> Result<Self, AcpiError> {
        let (_, table) = sdt::validate(data, SRAT_SIGNATURE)?;
        let entries = table
            .get(SdtHeader::SIZE + Self::FIELDS_SIZE..)
            .unwrap_or(&[]);
        Ok(Self { entries })
    }

    /// Iterates the affinity entries.
    #[must_use]
    pub fn entries(&self) -> SratEntryIter<'a> {
        SratEntryIter {
            data: self.entries,
        }
    }
}

/// A single SRAT affinity structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SratEntry {
    /// Type 0: Processor Local APIC affinity.
    ProcessorAffinity {
        /// Local APIC id.
        apic_id: u8,
        /// Proximity (NUMA) domain.
        domain: u32,
        /// Bit 0: entry enabled.
        flags: u32,
    },
    /// Type 1: Memory affinity.
    MemoryAffinity {
        /// Range base address.
        base: u64,
        /// Range length in bytes.
        length: u64,
        /// Proximity (NUMA) domain.
        domain: u32,
        /// Bit 0: enabled, bit 1: hot-pluggable, bit 2: non-volatile.
        flags: u32,
    },
    /// Any entry type the kernel does not consume.
    Unknown {
        /// The entry type byte.
        entry_type: u8,
        /// The entry length including the 2-byte header.
        length: u8,
    },
}

/// Iterator over SRAT subtables.
pub struct SratEntryIter<'a> {
    data: &'a [u8],
}

impl Iterator for SratEntryIter<'_> {
    type Item = SratEntry;

    fn next(&mut self) -> Option<SratEntry> {
        if self.data.len() < 2 {
            return None;
        }
        let entry_type = self.data[0];
        let length = self.data[1] as usize;
        if length < 2 || length > self.data.len() {
            self.data = &[];
            return None;
        }
        let entry = &self.data[..length];
        self.data = &self.data[length..];

        Some(match entry_type {
            0 if length >= 16 => {
                // The domain is split: byte 2 holds bits 0..8, bytes 9..12
                // hold bits 8..32.
                let low = u32::from(entry[2]);
                let high = read_u32(entry, 8)? & 0xFFFF_FF00;
                SratEntry::ProcessorAffinity {
                    apic_id: entry[3],
                    domain: high | low,
                    flags: read_u32(entry, 4)?,
                }
            }
            1 if length >= 40 => SratEntry::MemoryAffinity {
                domain: read_u32(entry, 2)?,
                base: read_u64(entry, 8)?,
                length: read_u64(entry, 16)?,
                flags: read_u32(entry, 28)?,
            },
            other => SratEntry::Unknown {
                entry_type: other,
                length: length as u8,
            },
        })
    }
}
