//! Interrupt allocation and dispatch.
//!
//! A fixed-size table of interrupt descriptors with penalty accounting
//! ([`table`]), a deferred-interrupt queue bridging hard IRQs to a threaded
//! drain loop ([`deferred`]), and the controller contract the rest of the
//! kernel programs lines and IPIs through ([`controller`]).

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use core::fmt;

pub mod controller;
pub mod deferred;
pub mod table;

/// Number of interrupt table slots.
pub const MAX_INTERRUPTS: usize = 256;

bitflags::bitflags! {
    /// Registration flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptFlags: u32 {
        /// Kernel-owned handler.
        const KERNEL       = 1 << 0;
        /// Registered on behalf of a user process.
        const USER         = 1 << 1;
        /// Software interrupt; carries no hardware line.
        const SOFTWARE     = 1 << 2;
        /// Message-signalled; the table assigns a fresh vector.
        const MSI          = 1 << 3;
        /// Refuse to share the vector with other descriptors.
        const NOT_SHARABLE = 1 << 4;
    }
}

/// Opaque interrupt registration id: generation in the high half, table
/// index in the low half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct InterruptId(u32);

impl InterruptId {
    /// Builds an id from its parts.
    #[must_use]
    pub const fn new(generation: u16, index: u16) -> Self {
        Self(((generation as u32) << 16) | index as u32)
    }

    /// The table index the id refers to.
    #[must_use]
    pub const fn index(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    /// The generation counter the id was minted with.
    #[must_use]
    pub const fn generation(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// The raw 32-bit value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InterruptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Errors from interrupt allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// The requested vector exists but cannot be shared.
    VectorUnavailable,
    /// No vector could be resolved from the request.
    NoVector,
    /// The id does not name a live registration.
    DoesNotExist,
    /// The MSI vector range is exhausted.
    Exhausted,
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VectorUnavailable => write!(f, "vector cannot be shared"),
            Self::NoVector => write!(f, "no usable vector in request"),
            Self::DoesNotExist => write!(f, "no such interrupt registration"),
            Self::Exhausted => write!(f, "message-signalled vector range exhausted"),
        }
    }
}

/// What a fast handler reports back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// The interrupt belonged to this handler; stop walking the chain.
    Handled,
    /// Not ours; try the next descriptor on the vector.
    NotHandled,
}

/// Fast-handler signature: runs with interrupts disabled, must not block,
/// may push work onto the deferred queue.
pub type FastHandler = fn(context: usize) -> HandlerResult;

/// Deferred (threaded) handler signature.
pub type DeferredHandler = fn(context: usize);
