//! The system timer facade.
//!
//! A timer driver (HPET or similar, outside the core) registers itself as
//! the time source; consumers read monotonic ticks and register periodic
//! callbacks. The scheduler's 1 ms tick and the sleep-queue accounting
//! both hang off callbacks registered here, driven from the timer
//! interrupt via [`on_timer_interrupt`].

use alloc::vec::Vec;
use core::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use muon_core::sync::SpinLock;

/// A registered time source.
pub trait TimerSource: Send + Sync {
    /// Monotonic counter value.
    fn now_ticks(&self) -> u64;

    /// Counter period as `(numerator, denominator)` femtoseconds per tick.
    fn frequency(&self) -> (u64, u64);
}

struct Callback {
    callback: fn(elapsed_ms: u64),
    period_ms: u64,
    elapsed: u64,
}

static SOURCE: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());
static CALLBACKS: SpinLock<Vec<Callback>> = SpinLock::new(Vec::new());
/// Milliseconds accumulated by timer interrupts (fallback clock, and the
/// reference the scheduler reads).
static UPTIME_MS: AtomicU64 = AtomicU64::new(0);

/// Installs the time source. Called once by the timer driver.
pub fn register_source(source: &'static dyn TimerSource) {
    let fat: *const dyn TimerSource = source;
    let boxed = alloc::boxed::Box::new(fat);
    SOURCE.store(alloc::boxed::Box::into_raw(boxed).cast(), Ordering::Release);
}

/// The installed time source, if any.
#[must_use]
pub fn source() -> Option<&'static dyn TimerSource> {
    let ptr = SOURCE.load(Ordering::Acquire);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: stored by `register_source` from a leaked fat pointer.
    Some(unsafe { &**ptr.cast::<*const dyn TimerSource>() })
}

/// Raw counter ticks from the source (0 before registration).
#[must_use]
pub fn now_ticks() -> u64 {
    source().map_or(0, TimerSource::now_ticks)
}

/// Milliseconds since boot, driven by the periodic interrupt.
#[must_use]
pub fn now_ms() -> u64 {
    UPTIME_MS.load(Ordering::Relaxed)
}

/// Registers a periodic callback with millisecond granularity.
pub fn register_tick_callback(callback: fn(u64), period_ms: u64) {
    CALLBACKS.lock().push(Callback {
        callback,
        period_ms: period_ms.max(1),
        elapsed: 0,
    });
}

/// Advances time by `elapsed_ms`; invoked from the timer interrupt path
/// (and by tests). Due callbacks run outside the registry lock.
pub fn on_timer_interrupt(elapsed_ms: u64) {
    UPTIME_MS.fetch_add(elapsed_ms, Ordering::Relaxed);

    let mut due = Vec::new();
    {
        let mut callbacks = CALLBACKS.lock();
        for entry in callbacks.iter_mut() {
            entry.elapsed += elapsed_ms;
            if entry.elapsed >= entry.period_ms {
                due.push((entry.callback, entry.elapsed));
                entry.elapsed = 0;
            }
        }
    }
    for (callback, elapsed) in due {
        callback(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64 as StdAtomicU64;

    static MS_SEEN: StdAtomicU64 = StdAtomicU64::new(0);
    static SLOW_CALLS: StdAtomicU64 = StdAtomicU64::new(0);

    fn every_ms(elapsed: u64) {
        MS_SEEN.fetch_add(elapsed, Ordering::Relaxed);
    }

    fn every_ten(_elapsed: u64) {
        SLOW_CALLS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn interrupts_drive_uptime_and_callbacks() {
        // One test body: the callback registry and uptime counter are
        // process-global, so interleaved tests would skew the deltas.
        register_tick_callback(every_ms, 1);
        register_tick_callback(every_ten, 10);

        let base_uptime = now_ms();
        let base_ms = MS_SEEN.load(Ordering::Relaxed);
        let base_slow = SLOW_CALLS.load(Ordering::Relaxed);
        for _ in 0..20 {
            on_timer_interrupt(1);
        }
        assert_eq!(MS_SEEN.load(Ordering::Relaxed) - base_ms, 20);
        assert_eq!(SLOW_CALLS.load(Ordering::Relaxed) - base_slow, 2);
        assert!(now_ms() >= base_uptime + 20);
    }

    struct FixedSource;

    impl TimerSource for FixedSource {
        fn now_ticks(&self) -> u64 {
            1234
        }

        fn frequency(&self) -> (u64, u64) {
            // 100 ns per tick, expressed in femtoseconds.
            (100_000_000, 1)
        }
    }

    #[test]
    fn source_registration() {
        static FIXED: FixedSource = FixedSource;
        register_source(&FIXED);
        assert_eq!(now_ticks(), 1234);
        assert_eq!(source().unwrap().frequency(), (100_000_000, 1));
    }
}
