//! Process-wide handle registry.
//!
//! Maps opaque 32-bit handle ids to typed, reference-counted kernel objects
//! (memory regions, address spaces, threads, open files, request buffers).
//! A slot is destroyed when its reference count drops to zero; the payload's
//! `Drop` impl acts as the destructor. Ids are never shared by two live
//! objects; a destroyed slot's id may be reused.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;

use crate::sync::SpinLock;

/// Opaque handle id handed out by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Handle(u32);

impl Handle {
    /// Creates a handle from its raw id (for ABI crossings).
    #[must_use]
    pub const fn from_raw(val: u32) -> Self {
        Self(val)
    }

    /// Returns the raw 32-bit id.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Type tag stored next to each payload; lookups must name the expected tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleTag {
    /// A shared memory region.
    MemoryRegion,
    /// An address space.
    AddressSpace,
    /// A thread.
    Thread,
    /// An open file.
    File,
    /// A file-service request buffer.
    Request,
}

/// Errors from registry operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleError {
    /// No live object with this id.
    DoesNotExist,
    /// The slot exists but carries a different type tag.
    WrongType,
}

impl fmt::Display for HandleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoesNotExist => write!(f, "handle does not exist"),
            Self::WrongType => write!(f, "handle type mismatch"),
        }
    }
}

struct Slot {
    tag: HandleTag,
    refs: usize,
    payload: Arc<dyn Any + Send + Sync>,
}

struct RegistryInner {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
}

/// The handle registry.
///
/// All operations are thread-safe; the registry lock is a spin lock held
/// only for table manipulation, never across payload destruction (the last
/// `Arc` reference is dropped after the lock is released).
pub struct HandleRegistry {
    inner: SpinLock<RegistryInner>,
}

impl HandleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(RegistryInner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Registers `payload` under `tag` with an initial reference count of 1.
    pub fn create(&self, tag: HandleTag, payload: Arc<dyn Any + Send + Sync>) -> Handle {
        let mut inner = self.inner.lock();
        let slot = Slot {
            tag,
            refs: 1,
            payload,
        };
        let index = if let Some(index) = inner.free.pop() {
            debug_assert!(inner.slots[index].is_none(), "free list points at live slot");
            inner.slots[index] = Some(slot);
            index
        } else {
            inner.slots.push(Some(slot));
            inner.slots.len() - 1
        };
        Handle(u32::try_from(index).expect("handle table exceeded 2^32 slots"))
    }

    /// Increments the reference count of a live handle.
    ///
    /// # Errors
    ///
    /// [`HandleError::DoesNotExist`] if the slot is free.
    pub fn acquire(&self, handle: Handle) -> Result<(), HandleError> {
        let mut inner = self.inner.lock();
        let slot = inner
            .slots
            .get_mut(handle.0 as usize)
            .and_then(Option::as_mut)
            .ok_or(HandleError::DoesNotExist)?;
        slot.refs += 1;
        Ok(())
    }

    /// Decrements the reference count; the last release destroys the object.
    ///
    /// # Errors
    ///
    /// [`HandleError::DoesNotExist`] if the slot is free.
    pub fn release(&self, handle: Handle) -> Result<(), HandleError> {
        // The payload must drop outside the lock: destructors may take
        // blocking locks or re-enter the registry.
        let _destroyed;
        {
            let mut inner = self.inner.lock();
            let index = handle.0 as usize;
            let slot = inner
                .slots
                .get_mut(index)
                .and_then(Option::as_mut)
                .ok_or(HandleError::DoesNotExist)?;
            slot.refs -= 1;
            if slot.refs > 0 {
                return Ok(());
            }
            _destroyed = inner.slots[index].take();
            inner.free.push(index);
        }
        Ok(())
    }

    /// Looks up a live handle, asserting its type tag, and returns the
    /// payload downcast to `T`.
    ///
    /// # Errors
    ///
    /// [`HandleError::DoesNotExist`] if the slot is free,
    /// [`HandleError::WrongType`] on tag or type mismatch.
    pub fn lookup<T: Any + Send + Sync>(
        &self,
        handle: Handle,
        tag: HandleTag,
    ) -> Result<Arc<T>, HandleError> {
        let inner = self.inner.lock();
        let slot = inner
            .slots
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(HandleError::DoesNotExist)?;
        if slot.tag != tag {
            return Err(HandleError::WrongType);
        }
        slot.payload
            .clone()
            .downcast::<T>()
            .map_err(|_| HandleError::WrongType)
    }

    /// Returns the number of live handles.
    #[must_use]
    pub fn live(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}
