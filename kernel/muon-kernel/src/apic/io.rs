//! I/O APIC programming.
//!
//! Register access is indirect: write the register index to `IOREGSEL`,
//! then read or write `IOWIN`. Each input pin has a 64-bit redirection
//! entry split across two registers.

use muon_core::addr::VirtAddr;
use muon_core::sync::SpinLock;

/// Register select window offset.
const IOREGSEL: u64 = 0x00;
/// Register data window offset.
const IOWIN: u64 = 0x10;

/// Version register (bits 16..24 hold max redirection entry).
const REG_VERSION: u32 = 0x01;
/// First redirection entry register pair.
const REG_REDIR_BASE: u32 = 0x10;

/// Redirection entry delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryMode {
    /// Deliver the programmed vector.
    Fixed = 0b000,
    /// Lowest-priority delivery.
    LowPriority = 0b001,
    /// Non-maskable interrupt.
    Nmi = 0b100,
    /// Legacy 8259-routed interrupt.
    ExtInt = 0b111,
}

impl DeliveryMode {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0b001 => Self::LowPriority,
            0b100 => Self::Nmi,
            0b111 => Self::ExtInt,
            _ => Self::Fixed,
        }
    }
}

/// A decoded redirection table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectionEntry {
    /// Interrupt vector (32..=255).
    pub vector: u8,
    /// Delivery mode.
    pub delivery: DeliveryMode,
    /// Logical (true) or physical (false) destination.
    pub logical_destination: bool,
    /// Active-low polarity.
    pub active_low: bool,
    /// Level-triggered.
    pub level_triggered: bool,
    /// Pin masked.
    pub masked: bool,
    /// Destination APIC id.
    pub destination: u8,
}

/// Remote-IRR bit (read-only latch for level-triggered interrupts).
const REMOTE_IRR: u64 = 1 << 14;

impl RedirectionEntry {
    /// Encodes the entry into its 64-bit register form.
    #[must_use]
    pub fn encode(&self) -> u64 {
        let mut value = u64::from(self.vector);
        value |= u64::from(self.delivery as u8) << 8;
        if self.logical_destination {
            value |= 1 << 11;
        }
        if self.active_low {
            value |= 1 << 13;
        }
        if self.level_triggered {
            value |= 1 << 15;
        }
        if self.masked {
            value |= 1 << 16;
        }
        value |= u64::from(self.destination) << 56;
        value
    }

    /// Decodes a 64-bit register value.
    #[must_use]
    pub fn decode(value: u64) -> Self {
        Self {
            vector: value as u8,
            delivery: DeliveryMode::from_bits(((value >> 8) & 0b111) as u8),
            logical_destination: value & (1 << 11) != 0,
            active_low: value & (1 << 13) != 0,
            level_triggered: value & (1 << 15) != 0,
            masked: value & (1 << 16) != 0,
            destination: (value >> 56) as u8,
        }
    }
}

/// A mapped I/O APIC.
pub struct IoApic {
    base: VirtAddr,
    gsi_base: u32,
    pin_count: u8,
    /// Serializes the select/window register pair.
    window: SpinLock<()>,
}

impl IoApic {
    /// Wraps a mapped I/O APIC and reads its redirection count.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address of the register pair, mapped
    /// with caching disabled.
    #[must_use]
    pub unsafe fn new(base: VirtAddr, gsi_base: u32) -> Self {
        let mut this = Self {
            base,
            gsi_base,
            pin_count: 0,
            window: SpinLock::new(()),
        };
        this.pin_count = ((this.read(REG_VERSION) >> 16) & 0xFF) as u8 + 1;
        this
    }

    fn read(&self, register: u32) -> u32 {
        let _guard = self.window.lock();
        // SAFETY: the construction contract guarantees a valid mapping.
        unsafe {
            (self.base + IOREGSEL).as_mut_ptr::<u32>().write_volatile(register);
            (self.base + IOWIN).as_ptr::<u32>().read_volatile()
        }
    }

    fn write(&self, register: u32, value: u32) {
        let _guard = self.window.lock();
        // SAFETY: the construction contract guarantees a valid mapping.
        unsafe {
            (self.base + IOREGSEL).as_mut_ptr::<u32>().write_volatile(register);
            (self.base + IOWIN).as_mut_ptr::<u32>().write_volatile(value);
        }
    }

    /// Number of input pins.
    #[must_use]
    pub fn pin_count(&self) -> u8 {
        self.pin_count
    }

    /// First global system interrupt this I/O APIC serves.
    #[must_use]
    pub fn gsi_base(&self) -> u32 {
        self.gsi_base
    }

    /// The pin serving `gsi`, if it belongs to this I/O APIC.
    #[must_use]
    pub fn pin_for_gsi(&self, gsi: u32) -> Option<u8> {
        let offset = gsi.checked_sub(self.gsi_base)?;
        if offset < u32::from(self.pin_count) {
            Some(offset as u8)
        } else {
            None
        }
    }

    /// Reads one redirection entry.
    #[must_use]
    pub fn read_redirection(&self, pin: u8) -> RedirectionEntry {
        let register = REG_REDIR_BASE + u32::from(pin) * 2;
        let low = u64::from(self.read(register));
        let high = u64::from(self.read(register + 1));
        RedirectionEntry::decode(low | (high << 32))
    }

    /// Writes one redirection entry (high half first so a partially
    /// written entry is never unmasked at a stale destination).
    pub fn write_redirection(&self, pin: u8, entry: RedirectionEntry) {
        let register = REG_REDIR_BASE + u32::from(pin) * 2;
        let value = entry.encode();
        self.write(register + 1, (value >> 32) as u32);
        self.write(register, value as u32);
    }

    /// Bring-up pass over all pins: remember which pin the firmware wired
    /// as the 8259 ExtINT, then mask every pin and write it back, which
    /// also clears any latched remote-IRR state.
    ///
    /// Returns the ExtINT pin as a global system interrupt number so the
    /// caller can claim its vector against future allocations.
    pub fn mask_all(&self) -> Option<u32> {
        let mut extint_gsi = None;
        for pin in 0..self.pin_count {
            let raw = {
                let register = REG_REDIR_BASE + u32::from(pin) * 2;
                let low = u64::from(self.read(register));
                let high = u64::from(self.read(register + 1));
                low | (high << 32)
            };
            let mut entry = RedirectionEntry::decode(raw);
            if entry.delivery == DeliveryMode::ExtInt {
                extint_gsi = Some(self.gsi_base + u32::from(pin));
            }
            entry.masked = true;
            // The remote-IRR latch is read-only but clears when the entry
            // is rewritten masked.
            debug_assert_eq!(entry.encode() & REMOTE_IRR, 0);
            self.write_redirection(pin, entry);
        }
        extint_gsi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_encode_decode_roundtrip() {
        let entry = RedirectionEntry {
            vector: 0x31,
            delivery: DeliveryMode::Fixed,
            logical_destination: false,
            active_low: true,
            level_triggered: true,
            masked: false,
            destination: 4,
        };
        assert_eq!(RedirectionEntry::decode(entry.encode()), entry);
    }

    #[test]
    fn encode_known_bits() {
        let entry = RedirectionEntry {
            vector: 0x20,
            delivery: DeliveryMode::ExtInt,
            logical_destination: true,
            active_low: false,
            level_triggered: false,
            masked: true,
            destination: 0xAB,
        };
        let value = entry.encode();
        assert_eq!(value & 0xFF, 0x20);
        assert_eq!((value >> 8) & 0b111, 0b111);
        assert_ne!(value & (1 << 11), 0);
        assert_ne!(value & (1 << 16), 0);
        assert_eq!(value >> 56, 0xAB);
    }

    #[test]
    fn decode_never_reports_remote_irr_in_encode() {
        // A latched remote-IRR bit in hardware state must not survive an
        // encode of the decoded entry.
        let raw = 0x31u64 | REMOTE_IRR | (1 << 15);
        let entry = RedirectionEntry::decode(raw);
        assert_eq!(entry.encode() & REMOTE_IRR, 0);
    }

    #[test]
    fn pin_for_gsi_ranges() {
        // Exercise the GSI arithmetic without touching hardware.
        let fake = IoApic {
            base: VirtAddr::ZERO,
            gsi_base: 24,
            pin_count: 24,
            window: SpinLock::new(()),
        };
        assert_eq!(fake.pin_for_gsi(23), None);
        assert_eq!(fake.pin_for_gsi(24), Some(0));
        assert_eq!(fake.pin_for_gsi(47), Some(23));
        assert_eq!(fake.pin_for_gsi(48), None);
    }
}
