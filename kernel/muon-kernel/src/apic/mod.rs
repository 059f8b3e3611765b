//! APIC bring-up and the interrupt controller implementation.
//!
//! Early bring-up disables the legacy IMCR routing, maps and programs the
//! local APIC (LVTs cleared and masked, LINT pins wired from the MADT NMI
//! entries), and walks every I/O APIC: read the redirection count, mask
//! every pin, clear latched state, and claim the 8259 ExtINT pin against
//! future allocations.

pub mod io;
pub mod local;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, Ordering};

use muon_core::id::CoreId;
use muon_core::sync::SpinLock;
use muon_irq::controller::{InterruptController, IpiKind};

use crate::arch;
use io::IoApic;
use local::LocalApic;

/// Vector carried by yield IPIs.
pub const IPI_YIELD_VECTOR: u8 = 0xFD;

/// Vector carried by TLB shoot-down IPIs.
pub const IPI_TLB_VECTOR: u8 = 0xFC;

/// Shadow state of one programmed I/O APIC input.
struct PinState {
    ioapic: usize,
    pin: u8,
    vector: u8,
}

/// The system's interrupt controller: one local APIC view plus every
/// discovered I/O APIC.
pub struct Apic {
    local: LocalApic,
    io_apics: Vec<IoApic>,
    /// Programmed pins, for vector-based mask/unmask.
    pins: SpinLock<Vec<PinState>>,
    /// Logical core id -> local APIC id.
    core_apic_ids: Vec<u8>,
}

impl Apic {
    /// Builds the controller from the mapped local APIC and I/O APICs.
    #[must_use]
    pub fn new(local: LocalApic, io_apics: Vec<IoApic>, core_apic_ids: Vec<u8>) -> Self {
        Self {
            local,
            io_apics,
            pins: SpinLock::new(Vec::new()),
            core_apic_ids,
        }
    }

    /// Switches the platform from PIC-routed to APIC-routed interrupts by
    /// programming the IMCR (only present on older chipsets; writing it on
    /// others is a no-op).
    pub fn disable_imcr() {
        // SAFETY: IMCR select/data ports, standard PC sequence.
        unsafe {
            arch::outb(0x22, 0x70);
            arch::outb(0x23, 0x01);
        }
    }

    /// The local APIC view of the calling core.
    #[must_use]
    pub fn local(&self) -> &LocalApic {
        &self.local
    }

    /// Routes a global system interrupt to a vector on the BSP and
    /// records the pin for later mask/unmask by vector.
    pub fn configure_gsi(&self, gsi: u32, vector: u8, active_low: bool, level_triggered: bool) {
        for (index, ioapic) in self.io_apics.iter().enumerate() {
            if let Some(pin) = ioapic.pin_for_gsi(gsi) {
                let entry = io::RedirectionEntry {
                    vector,
                    delivery: io::DeliveryMode::Fixed,
                    logical_destination: false,
                    active_low,
                    level_triggered,
                    masked: false,
                    destination: self.core_apic_ids.first().copied().unwrap_or(0),
                };
                ioapic.write_redirection(pin, entry);
                self.pins.lock().push(PinState {
                    ioapic: index,
                    pin,
                    vector,
                });
                return;
            }
        }
    }

    fn set_pin_mask(&self, vector: u16, masked: bool) {
        let pins = self.pins.lock();
        for state in pins.iter() {
            if u16::from(state.vector) == vector {
                let ioapic = &self.io_apics[state.ioapic];
                let mut entry = ioapic.read_redirection(state.pin);
                entry.masked = masked;
                ioapic.write_redirection(state.pin, entry);
            }
        }
    }
}

impl InterruptController for Apic {
    fn mask(&self, vector: u16) {
        self.set_pin_mask(vector, true);
    }

    fn unmask(&self, vector: u16) {
        self.set_pin_mask(vector, false);
    }

    fn eoi(&self, _vector: u16) {
        self.local.eoi();
    }

    fn send_ipi(&self, core: CoreId, kind: IpiKind) {
        let Some(&apic_id) = self.core_apic_ids.get(core.as_usize()) else {
            return;
        };
        let vector = match kind {
            IpiKind::Yield => IPI_YIELD_VECTOR,
            IpiKind::TlbShootdown => IPI_TLB_VECTOR,
        };
        self.local.send_ipi(apic_id, vector);
    }
}

// ---------------------------------------------------------------------------
// Global controller
// ---------------------------------------------------------------------------

static CONTROLLER: AtomicPtr<Apic> = AtomicPtr::new(core::ptr::null_mut());

/// Installs the controller. Called once from boot.
pub fn install(apic: Apic) {
    CONTROLLER.store(Box::into_raw(Box::new(apic)), Ordering::Release);
}

/// The installed controller, if bring-up has run.
#[must_use]
pub fn controller() -> Option<&'static Apic> {
    let ptr = CONTROLLER.load(Ordering::Acquire);
    if ptr.is_null() {
        None
    } else {
        // SAFETY: installed once from a leaked box, never freed.
        Some(unsafe { &*ptr })
    }
}
