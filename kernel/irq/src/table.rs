//! The interrupt descriptor table.
//!
//! One slot per vector, each holding a chain of descriptors, a penalty
//! counter (number of registrations using the vector), and a sharable
//! bit. Allocation resolves the slot from ACPI interrupt-source overrides,
//! a pinned vector, or — for MSI — a freshly assigned vector, preferring
//! lightly loaded slots when the caller supplies alternatives.

use alloc::sync::Arc;
use alloc::vec::Vec;

use muon_core::id::{ProcessId, ThreadId};
use muon_core::sync::SpinLock;

use crate::{
    DeferredHandler, FastHandler, HandlerResult, InterruptFlags, InterruptId, IrqError,
    MAX_INTERRUPTS,
};

/// First vector handed out for message-signalled interrupts.
const MSI_VECTOR_BASE: u16 = 0xA0;

/// One past the last MSI vector.
const MSI_VECTOR_LIMIT: u16 = 0xF0;

/// An ISA interrupt-source override recorded from the MADT.
#[derive(Debug, Clone, Copy)]
pub struct IrqOverride {
    /// ISA source line.
    pub source: u8,
    /// Global system interrupt it maps to.
    pub gsi: u32,
    /// Active-low polarity.
    pub active_low: bool,
    /// Level-triggered.
    pub level_triggered: bool,
}

/// A live interrupt registration.
pub struct InterruptDescriptor {
    id: InterruptId,
    /// The hardware line whose penalty this registration contributes to
    /// (`None` for software interrupts).
    source: Option<u16>,
    owner: ProcessId,
    owner_thread: ThreadId,
    flags: InterruptFlags,
    fast_handler: FastHandler,
    deferred_handler: Option<DeferredHandler>,
    context: usize,
}

impl InterruptDescriptor {
    /// The registration id.
    #[must_use]
    pub fn id(&self) -> InterruptId {
        self.id
    }

    /// The hardware line this registration loads (`None` for software
    /// interrupts); the line the caller masks when the vector goes idle.
    #[must_use]
    pub fn source(&self) -> Option<u16> {
        self.source
    }

    /// The owning process.
    #[must_use]
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// The thread whose address space deferred handling runs in.
    #[must_use]
    pub fn owner_thread(&self) -> ThreadId {
        self.owner_thread
    }

    /// Registration flags.
    #[must_use]
    pub fn flags(&self) -> InterruptFlags {
        self.flags
    }

    /// The threaded handler, if one was registered.
    #[must_use]
    pub fn deferred_handler(&self) -> Option<DeferredHandler> {
        self.deferred_handler
    }

    /// The opaque handler context.
    #[must_use]
    pub fn context(&self) -> usize {
        self.context
    }
}

/// Everything needed to allocate an interrupt.
pub struct RegisterRequest {
    /// Pinned hardware line; translated through the override table.
    pub line: Option<u16>,
    /// Driver-supplied alternative vectors, tried by ascending penalty
    /// when no line is pinned.
    pub candidates: Vec<u16>,
    /// Allocation flags.
    pub flags: InterruptFlags,
    /// In-line handler (interrupt context).
    pub fast_handler: FastHandler,
    /// Optional threaded handler run from the deferred queue.
    pub deferred_handler: Option<DeferredHandler>,
    /// Opaque context passed to both handlers.
    pub context: usize,
    /// Owning process.
    pub owner: ProcessId,
    /// Thread whose address space deferred handling impersonates.
    pub owner_thread: ThreadId,
}

struct TableSlot {
    descriptors: Vec<Arc<InterruptDescriptor>>,
    penalty: u32,
    sharable: bool,
}

impl TableSlot {
    const fn new() -> Self {
        Self {
            descriptors: Vec::new(),
            penalty: 0,
            sharable: true,
        }
    }

    /// A slot is usable unless an exclusive owner (a registration or a
    /// platform claim) already loads it.
    fn usable(&self) -> bool {
        self.sharable || self.penalty == 0
    }
}

struct TableInner {
    slots: Vec<TableSlot>,
    overrides: Vec<IrqOverride>,
    next_generation: u16,
    next_msi: u16,
}

/// The interrupt table.
pub struct InterruptTable {
    inner: SpinLock<TableInner>,
}

impl InterruptTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_INTERRUPTS);
        for _ in 0..MAX_INTERRUPTS {
            slots.push(TableSlot::new());
        }
        Self {
            inner: SpinLock::new(TableInner {
                slots,
                overrides: Vec::new(),
                next_generation: 0,
                next_msi: MSI_VECTOR_BASE,
            }),
        }
    }

    /// Records the MADT interrupt-source overrides used for line
    /// translation.
    pub fn set_overrides(&self, overrides: Vec<IrqOverride>) {
        self.inner.lock().overrides = overrides;
    }

    /// Translates an ISA line through the override table.
    #[must_use]
    pub fn translate_line(&self, line: u16) -> u16 {
        let inner = self.inner.lock();
        inner
            .overrides
            .iter()
            .find(|o| u16::from(o.source) == line)
            .map_or(line, |o| o.gsi as u16)
    }

    /// Marks a vector as claimed by the platform (e.g. the 8259 ExtINT
    /// pin), so allocation never hands it out.
    pub fn claim_vector(&self, vector: u16) {
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[vector as usize];
        slot.sharable = false;
        slot.penalty += 1;
    }

    /// Picks the lowest-penalty usable vector from a candidate list.
    #[must_use]
    pub fn get_least_loaded(&self, candidates: &[u16]) -> Option<u16> {
        let inner = self.inner.lock();
        let mut best: Option<(u16, u32)> = None;
        for &candidate in candidates {
            let Some(slot) = inner.slots.get(candidate as usize) else {
                continue;
            };
            if !slot.usable() {
                continue;
            }
            if best.is_none_or(|(_, p)| slot.penalty < p) {
                best = Some((candidate, slot.penalty));
            }
        }
        best.map(|(v, _)| v)
    }

    /// Allocates an interrupt.
    ///
    /// The slot is resolved from the pinned line (through the override
    /// table), the candidate list (least loaded first), or a fresh MSI
    /// vector. The first registration on a slot fixes its sharable bit.
    ///
    /// # Errors
    ///
    /// [`IrqError::VectorUnavailable`] when sharing rules forbid the slot,
    /// [`IrqError::NoVector`] when nothing could be resolved,
    /// [`IrqError::Exhausted`] when the MSI range is full.
    pub fn register(&self, request: RegisterRequest) -> Result<InterruptId, IrqError> {
        let mut inner = self.inner.lock();

        let index: u16 = if request.flags.contains(InterruptFlags::MSI) {
            // MSI wants a fresh vector: skip occupied and claimed slots.
            let mut vector = inner.next_msi;
            while (vector as usize) < MSI_VECTOR_LIMIT as usize
                && (!inner.slots[vector as usize].descriptors.is_empty()
                    || !inner.slots[vector as usize].usable())
            {
                vector += 1;
            }
            if vector >= MSI_VECTOR_LIMIT {
                return Err(IrqError::Exhausted);
            }
            inner.next_msi = vector + 1;
            vector
        } else if request.flags.contains(InterruptFlags::SOFTWARE) {
            // Software interrupts carry their slot directly.
            request.line.ok_or(IrqError::NoVector)?
        } else if let Some(line) = request.line {
            inner
                .overrides
                .iter()
                .find(|o| u16::from(o.source) == line)
                .map_or(line, |o| o.gsi as u16)
        } else {
            // No pinned line: lowest penalty among the candidates.
            let mut best: Option<(u16, u32)> = None;
            for &candidate in &request.candidates {
                let Some(slot) = inner.slots.get(candidate as usize) else {
                    continue;
                };
                if !slot.usable() {
                    continue;
                }
                if best.is_none_or(|(_, p)| slot.penalty < p) {
                    best = Some((candidate, slot.penalty));
                }
            }
            best.map(|(v, _)| v).ok_or(IrqError::NoVector)?
        };

        if index as usize >= MAX_INTERRUPTS {
            return Err(IrqError::NoVector);
        }

        // Sharing rules: an exclusive request needs an empty slot, and a
        // slot with an exclusive owner takes nobody else.
        let slot = &inner.slots[index as usize];
        if request.flags.contains(InterruptFlags::NOT_SHARABLE) && !slot.descriptors.is_empty() {
            return Err(IrqError::VectorUnavailable);
        }
        if !slot.sharable && slot.penalty > 0 {
            return Err(IrqError::VectorUnavailable);
        }

        let generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1);
        let id = InterruptId::new(generation, index);

        let source = if request.flags.contains(InterruptFlags::SOFTWARE) {
            None
        } else {
            Some(index)
        };
        let descriptor = Arc::new(InterruptDescriptor {
            id,
            source,
            owner: request.owner,
            owner_thread: request.owner_thread,
            flags: request.flags,
            fast_handler: request.fast_handler,
            deferred_handler: request.deferred_handler,
            context: request.context,
        });

        let slot = &mut inner.slots[index as usize];
        if slot.descriptors.is_empty() {
            slot.sharable = !request.flags.contains(InterruptFlags::NOT_SHARABLE);
            slot.penalty = 1;
        } else {
            slot.penalty += 1;
        }
        slot.descriptors.push(descriptor);
        Ok(id)
    }

    /// Removes a registration.
    ///
    /// Returns `true` when the vector has no users left; the caller masks
    /// the line at the controller then (NMI lines excepted).
    ///
    /// # Errors
    ///
    /// [`IrqError::DoesNotExist`] for an unknown id.
    pub fn unregister(&self, id: InterruptId) -> Result<bool, IrqError> {
        let mut inner = self.inner.lock();
        let index = id.index();
        if index >= MAX_INTERRUPTS {
            return Err(IrqError::DoesNotExist);
        }
        let slot = &mut inner.slots[index];
        let before = slot.descriptors.len();
        slot.descriptors.retain(|d| d.id != id);
        if slot.descriptors.len() == before {
            return Err(IrqError::DoesNotExist);
        }
        slot.penalty -= 1;
        if slot.descriptors.is_empty() {
            slot.sharable = true;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Walks the vector's descriptor chain, stopping at the first handler
    /// reporting [`HandlerResult::Handled`].
    ///
    /// The caller runs this with local interrupts disabled.
    pub fn dispatch(&self, vector: u16) -> HandlerResult {
        let chain: Vec<Arc<InterruptDescriptor>> = {
            let inner = self.inner.lock();
            match inner.slots.get(vector as usize) {
                Some(slot) => slot.descriptors.clone(),
                None => return HandlerResult::NotHandled,
            }
        };
        for descriptor in chain {
            if (descriptor.fast_handler)(descriptor.context) == HandlerResult::Handled {
                return HandlerResult::Handled;
            }
        }
        HandlerResult::NotHandled
    }

    /// Looks up a live registration by id.
    #[must_use]
    pub fn get(&self, id: InterruptId) -> Option<Arc<InterruptDescriptor>> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(id.index())?
            .descriptors
            .iter()
            .find(|d| d.id == id)
            .cloned()
    }

    /// The penalty of a vector, or `None` for an unusable one.
    #[must_use]
    pub fn penalty(&self, vector: u16) -> Option<u32> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(vector as usize)?;
        if !slot.usable() {
            return None;
        }
        Some(slot.penalty)
    }

    /// Sum of all penalties (equals the number of live registrations plus
    /// platform-claimed vectors).
    #[must_use]
    pub fn total_penalty(&self) -> u64 {
        let inner = self.inner.lock();
        inner.slots.iter().map(|s| u64::from(s.penalty)).sum()
    }

    /// Number of live registrations.
    #[must_use]
    pub fn registrations(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.iter().map(|s| s.descriptors.len()).sum()
    }
}

impl Default for InterruptTable {
    fn default() -> Self {
        Self::new()
    }
}
