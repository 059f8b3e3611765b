//! Synchronization primitives.
//!
//! Two tiers, per the kernel's lock taxonomy:
//!
//! - [`SpinLock`]: non-blocking, held only across O(1) sections. Safe from
//!   interrupt context (the kernel disables local interrupts around it).
//! - [`Mutex`] / [`Condvar`]: blocking; contended acquisition parks the
//!   calling thread through a registered parking hook. Must never be taken
//!   from interrupt context.
//!
//! The parking hook is registered once by the kernel after the scheduler is
//! up ([`register_parking`]); it maps park/unpark onto the scheduler's
//! token sleep and signal operations. Before registration (and in host
//! tests) the primitives degrade to spinning, which preserves correctness.

mod condvar;
mod mutex;
mod parking;
mod spinlock;

pub use condvar::Condvar;
pub use mutex::{Mutex, MutexGuard};
pub use parking::{ParkOps, register_parking};
pub use spinlock::{SpinLock, SpinLockGuard};
