//! Multiple APIC Description Table (MADT) parsing.
//!
//! The MADT describes the interrupt controller topology: local APICs,
//! I/O APICs, interrupt source overrides, and NMI sources. Entries share
//! a 2-byte `{type, length}` subtable header.

use crate::sdt::{self, SdtHeader};
use crate::{AcpiError, read_u16, read_u32};

/// MADT table signature.
pub const MADT_SIGNATURE: &[u8; 4] = b"APIC";

/// Bit 0 of the MADT flags: dual 8259 PICs are installed.
pub const MADT_PCAT_COMPAT: u32 = 1;

/// Parsed MADT table borrowing the entry span.
#[derive(Debug)]
pub struct Madt<'a> {
    /// Physical address of the local APIC.
    pub local_apic_address: u32,
    /// MADT flags.
    pub flags: u32,
    entries: &'a [u8],
}

impl<'a> Madt<'a> {
    /// Size of the fixed MADT fields after the SDT header.
    const FIELDS_SIZE: usize = 8;

    /// Parses a MADT from a full table span.
    ///
    /// # Errors
    ///
    /// Standard validation errors plus [`AcpiError::TruncatedData`] when
    /// the fixed fields are missing.
    pub fn parse(data: &'a [u8]) -> Result<Self, AcpiError> {
        let (_, table) = sdt::validate(data, MADT_SIGNATURE)?;
        let local_apic_address =
            read_u32(table, SdtHeader::SIZE).ok_or(AcpiError::TruncatedData)?;
        let flags = read_u32(table, SdtHeader::SIZE + 4).ok_or(AcpiError::TruncatedData)?;
        let entries = table
            .get(SdtHeader::SIZE + Self::FIELDS_SIZE..)
            .unwrap_or(&[]);
        Ok(Self {
            local_apic_address,
            flags,
            entries,
        })
    }

    /// Iterates the interrupt controller entries.
    #[must_use]
    pub fn entries(&self) -> MadtEntryIter<'a> {
        MadtEntryIter {
            data: self.entries,
        }
    }
}

/// A single MADT interrupt controller structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadtEntry {
    /// Type 0: Processor Local APIC.
    LocalApic {
        /// ACPI processor UID.
        acpi_processor_id: u8,
        /// The processor's local APIC id.
        apic_id: u8,
        /// Flags (bit 0: enabled, bit 1: online capable).
        flags: u32,
    },
    /// Type 1: I/O APIC.
    IoApic {
        /// The I/O APIC id.
        io_apic_id: u8,
        /// Physical register base.
        address: u32,
        /// First global system interrupt this I/O APIC serves.
        gsi_base: u32,
    },
    /// Type 2: Interrupt Source Override.
    InterruptSourceOverride {
        /// ISA source line.
        source: u8,
        /// Global system interrupt it maps to.
        gsi: u32,
        /// MPS INTI flags (polarity, trigger).
        flags: u16,
    },
    /// Type 3: NMI Source.
    NmiSource {
        /// MPS INTI flags.
        flags: u16,
        /// Global system interrupt.
        gsi: u32,
    },
    /// Type 4: Local APIC NMI (LINT pin wiring).
    LocalApicNmi {
        /// ACPI processor UID (0xFF = all processors).
        acpi_processor_id: u8,
        /// MPS INTI flags.
        flags: u16,
        /// LINT pin (0 or 1).
        lint: u8,
    },
    /// Any entry type the kernel does not consume.
    Unknown {
        /// The entry type byte.
        entry_type: u8,
        /// The entry length including the 2-byte header.
        length: u8,
    },
}

/// MPS INTI flag decoding shared by overrides and NMI entries.
impl MadtEntry {
    /// Polarity mask of the MPS INTI flags.
    pub const POLARITY_MASK: u16 = 0b11;
    /// Active-low polarity value.
    pub const POLARITY_ACTIVE_LOW: u16 = 0b11;
    /// Trigger mask of the MPS INTI flags.
    pub const TRIGGER_MASK: u16 = 0b11 << 2;
    /// Level-triggered value.
    pub const TRIGGER_LEVEL: u16 = 0b11 << 2;

    /// Decodes the active-low bit of MPS INTI flags.
    #[must_use]
    pub fn inti_active_low(flags: u16) -> bool {
        flags & Self::POLARITY_MASK == Self::POLARITY_ACTIVE_LOW
    }

    /// Decodes the level-triggered bit of MPS INTI flags.
    #[must_use]
    pub fn inti_level_triggered(flags: u16) -> bool {
        flags & Self::TRIGGER_MASK == Self::TRIGGER_LEVEL
    }
}

/// Iterator over MADT subtables.
pub struct MadtEntryIter<'a> {
    data: &'a [u8],
}

impl Iterator for MadtEntryIter<'_> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<MadtEntry> {
        if self.data.len() < 2 {
            return None;
        }
        let entry_type = self.data[0];
        let length = self.data[1] as usize;
        if length < 2 || length > self.data.len() {
            // Malformed entry: stop iterating rather than run off the span.
            self.data = &[];
            return None;
        }
        let entry = &self.data[..length];
        self.data = &self.data[length..];

        Some(match entry_type {
            0 if length >= 8 => MadtEntry::LocalApic {
                acpi_processor_id: entry[2],
                apic_id: entry[3],
                flags: read_u32(entry, 4)?,
            },
            1 if length >= 12 => MadtEntry::IoApic {
                io_apic_id: entry[2],
                address: read_u32(entry, 4)?,
                gsi_base: read_u32(entry, 8)?,
            },
            2 if length >= 10 => MadtEntry::InterruptSourceOverride {
                source: entry[3],
                gsi: read_u32(entry, 4)?,
                flags: read_u16(entry, 8)?,
            },
            3 if length >= 8 => MadtEntry::NmiSource {
                flags: read_u16(entry, 2)?,
                gsi: read_u32(entry, 4)?,
            },
            4 if length >= 6 => MadtEntry::LocalApicNmi {
                acpi_processor_id: entry[2],
                flags: read_u16(entry, 3)?,
                lint: entry[5],
            },
            other => MadtEntry::Unknown {
                entry_type: other,
                length: length as u8,
            },
        })
    }
}
