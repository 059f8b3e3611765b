//! Core types and synchronization primitives for the muon kernel.
//!
//! This crate contains host-testable abstractions shared by every other
//! kernel crate: address and identifier newtypes, the logging facade, spin
//! and blocking synchronization primitives, and the process-wide handle
//! registry.
//!
//! By living outside the kernel crate, these types can be tested with
//! `cargo test` on the host without a kernel target.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod handle;
pub mod id;
pub mod log;
pub mod sync;
