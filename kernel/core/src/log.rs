//! Kernel logging facade.
//!
//! Subsystem crates log through this facade without knowing where the output
//! goes. The kernel registers a sink function during early boot (serial at
//! first, the full logger once the heap is up); before registration every
//! message is dropped, which is safe for the very first instructions.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Severity of a log message. Lower ordinal = more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Unrecoverable or data-loss conditions.
    Error = 0,
    /// Suspicious conditions the system can survive.
    Warn = 1,
    /// High-level progress messages.
    Info = 2,
    /// Detailed diagnostics.
    Debug = 3,
    /// Per-operation tracing.
    Trace = 4,
}

/// Sink function signature: receives the level and the formatted arguments.
pub type SinkFn = fn(LogLevel, fmt::Arguments<'_>);

/// Registered sink. Null until [`register_sink`] is called.
static SINK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Maximum level that is forwarded to the sink (default `Info`).
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Registers the output sink. Replaces any previous sink.
pub fn register_sink(sink: SinkFn) {
    SINK.store(sink as *mut (), Ordering::Release);
}

/// Sets the maximum level forwarded to the sink.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Dispatches a message to the registered sink, if any.
///
/// Not intended to be called directly; use the level macros.
pub fn dispatch(level: LogLevel, args: fmt::Arguments<'_>) {
    if level as u8 > MAX_LEVEL.load(Ordering::Relaxed) {
        return;
    }
    let ptr = SINK.load(Ordering::Acquire);
    if ptr.is_null() {
        return;
    }
    // SAFETY: The pointer was stored via `register_sink` which takes a
    // valid `SinkFn`.
    let sink: SinkFn = unsafe { core::mem::transmute(ptr) };
    sink(level, args);
}

/// Logs at [`LogLevel::Error`].
#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Error, core::format_args!($($arg)*))
    };
}

/// Logs at [`LogLevel::Warn`].
#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Warn, core::format_args!($($arg)*))
    };
}

/// Logs at [`LogLevel::Info`].
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Info, core::format_args!($($arg)*))
    };
}

/// Logs at [`LogLevel::Debug`].
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Debug, core::format_args!($($arg)*))
    };
}

/// Logs at [`LogLevel::Trace`].
#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::log::dispatch($crate::log::LogLevel::Trace, core::format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting_sink(_level: LogLevel, _args: fmt::Arguments<'_>) {
        CALLS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn sink_receives_messages_up_to_max_level() {
        register_sink(counting_sink);
        set_max_level(LogLevel::Info);

        let before = CALLS.load(Ordering::Relaxed);
        dispatch(LogLevel::Error, format_args!("boom"));
        dispatch(LogLevel::Info, format_args!("hello"));
        // Above max level: dropped.
        dispatch(LogLevel::Trace, format_args!("noise"));

        assert_eq!(CALLS.load(Ordering::Relaxed) - before, 2);
    }

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Error < LogLevel::Trace);
        assert!(LogLevel::Warn < LogLevel::Debug);
    }
}
