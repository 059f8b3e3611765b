//! Local APIC programming.
//!
//! The LAPIC is mapped into the kernel's global range during bring-up;
//! all access is 32-bit volatile MMIO at fixed register offsets.

use muon_core::addr::VirtAddr;

/// APIC id register.
const REG_ID: usize = 0x20;
/// End-of-interrupt register.
const REG_EOI: usize = 0xB0;
/// Spurious interrupt vector register.
const REG_SVR: usize = 0xF0;
/// Interrupt command register, low half.
const REG_ICR_LOW: usize = 0x300;
/// Interrupt command register, high half (destination).
const REG_ICR_HIGH: usize = 0x310;
/// Local vector table: timer.
const REG_LVT_TIMER: usize = 0x320;
/// Local vector table: thermal sensor.
const REG_LVT_THERMAL: usize = 0x330;
/// Local vector table: performance counters.
const REG_LVT_PERF: usize = 0x340;
/// Local vector table: LINT0 pin.
const REG_LVT_LINT0: usize = 0x350;
/// Local vector table: LINT1 pin.
const REG_LVT_LINT1: usize = 0x360;
/// Local vector table: error.
const REG_LVT_ERROR: usize = 0x370;

/// LVT mask bit.
const LVT_MASKED: u32 = 1 << 16;
/// Level-triggered bit.
const LVT_LEVEL: u32 = 1 << 15;
/// Active-low polarity bit.
const LVT_ACTIVE_LOW: u32 = 1 << 13;

/// LVT/ICR delivery modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Delivery {
    /// Deliver the programmed vector.
    Fixed = 0b000,
    /// Non-maskable interrupt.
    Nmi = 0b100,
    /// Legacy 8259-routed interrupt.
    ExtInt = 0b111,
}

/// Encodes a local vector table entry.
#[must_use]
pub fn lvt_entry(
    vector: u8,
    delivery: Delivery,
    masked: bool,
    active_low: bool,
    level_triggered: bool,
) -> u32 {
    let mut entry = u32::from(vector) | ((delivery as u32) << 8);
    if masked {
        entry |= LVT_MASKED;
    }
    if active_low {
        entry |= LVT_ACTIVE_LOW;
    }
    if level_triggered {
        entry |= LVT_LEVEL;
    }
    entry
}

/// A mapped local APIC.
pub struct LocalApic {
    base: VirtAddr,
}

impl LocalApic {
    /// Wraps the mapped register page.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address the LAPIC register page is
    /// mapped at, with caching disabled.
    #[must_use]
    pub const unsafe fn new(base: VirtAddr) -> Self {
        Self { base }
    }

    fn read(&self, register: usize) -> u32 {
        // SAFETY: the construction contract guarantees a valid mapping.
        unsafe { (self.base + register as u64).as_ptr::<u32>().read_volatile() }
    }

    fn write(&self, register: usize, value: u32) {
        // SAFETY: the construction contract guarantees a valid mapping.
        unsafe {
            (self.base + register as u64)
                .as_mut_ptr::<u32>()
                .write_volatile(value);
        }
    }

    /// This core's APIC id.
    #[must_use]
    pub fn id(&self) -> u8 {
        (self.read(REG_ID) >> 24) as u8
    }

    /// Early bring-up: software-enable with a spurious vector, mask and
    /// clear every LVT entry, then wire LINT0 as ExtINT and LINT1 as NMI
    /// (the defaults when the MADT carries no NMI entries).
    pub fn init(&self) {
        self.write(REG_SVR, (1 << 8) | 0xFF);
        for register in [REG_LVT_TIMER, REG_LVT_THERMAL, REG_LVT_PERF, REG_LVT_ERROR] {
            self.write(register, LVT_MASKED);
        }
        self.write(REG_LVT_LINT0, lvt_entry(0, Delivery::ExtInt, false, false, false));
        self.write(REG_LVT_LINT1, lvt_entry(0, Delivery::Nmi, false, false, false));
    }

    /// Applies one MADT local-APIC-NMI entry to a LINT pin.
    pub fn apply_nmi(&self, lint: u8, active_low: bool, level_triggered: bool) {
        let register = if lint == 0 { REG_LVT_LINT0 } else { REG_LVT_LINT1 };
        self.write(
            register,
            lvt_entry(0, Delivery::Nmi, false, active_low, level_triggered),
        );
    }

    /// Signals end-of-interrupt.
    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    /// Sends a fixed-delivery IPI to `apic_id`.
    pub fn send_ipi(&self, apic_id: u8, vector: u8) {
        self.write(REG_ICR_HIGH, u32::from(apic_id) << 24);
        self.write(REG_ICR_LOW, u32::from(vector));
    }
}
