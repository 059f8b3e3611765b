//! The multi-level feedback scheduler.
//!
//! Per core: [`config::LEVELS`] FIFO queues, each under its own spin lock,
//! plus bandwidth accounting used for thread placement. Level 0 runs first
//! with the shortest timeslice; preempted threads are demoted one level,
//! voluntary yielders keep theirs, and a periodic boost moves everything
//! back to level 0 so no runnable thread starves longer than one boost
//! period.
//!
//! The sleep side is a single shared queue (see [`crate::sleep`]); the
//! scheduler stitches the two together in [`Scheduler::schedule`], which
//! the context-switch path calls with the outgoing thread.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use muon_core::id::{CoreId, DomainId};
use muon_core::sync::SpinLock;

use crate::config::{LEVELS, MigrationPolicy, SchedulerConfig, WakePolicy};
use crate::sleep::SleepQueue;
use crate::thread::{Thread, ThreadFlags, ThreadLocation, ThreadTable};
use crate::{Platform, SleepOutcome};

/// Per-core scheduling state.
struct CoreState {
    /// One FIFO per level; each queue has its own lock so enqueue and
    /// dequeue stay O(1) critical sections.
    queues: [SpinLock<VecDeque<Arc<Thread>>>; LEVELS],
    /// Sum of the timeslices of the threads placed on this core.
    bandwidth: AtomicU64,
    /// Number of threads placed on this core.
    thread_count: AtomicU32,
    /// Timestamp of the last boost pass.
    last_boost: AtomicU64,
    /// This core's idle thread, parked outside the queues.
    idle: SpinLock<Option<Arc<Thread>>>,
    /// NUMA domain the core belongs to.
    domain: DomainId,
}

impl CoreState {
    fn new(domain: DomainId) -> Self {
        Self {
            queues: [const { SpinLock::new(VecDeque::new()) }; LEVELS],
            bandwidth: AtomicU64::new(0),
            thread_count: AtomicU32::new(0),
            last_boost: AtomicU64::new(0),
            idle: SpinLock::new(None),
            domain,
        }
    }
}

/// The system scheduler: all cores, the shared sleep queue, and the global
/// thread table.
pub struct Scheduler {
    cores: Vec<CoreState>,
    sleep_queue: SleepQueue,
    config: SchedulerConfig,
    platform: &'static dyn Platform,
    table: ThreadTable,
}

impl Scheduler {
    /// Creates a scheduler for the given cores (`core_domains[i]` is the
    /// domain of core `i`).
    #[must_use]
    pub fn new(
        platform: &'static dyn Platform,
        config: SchedulerConfig,
        core_domains: &[DomainId],
    ) -> Self {
        Self {
            cores: core_domains.iter().map(|d| CoreState::new(*d)).collect(),
            sleep_queue: SleepQueue::new(),
            config,
            platform,
            table: ThreadTable::new(),
        }
    }

    /// The global thread table.
    #[must_use]
    pub fn table(&self) -> &ThreadTable {
        &self.table
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Number of threads currently on the sleep queue.
    #[must_use]
    pub fn sleepers(&self) -> usize {
        self.sleep_queue.len()
    }

    /// Registers `thread` as the idle thread of `core`.
    pub fn set_idle(&self, core: CoreId, thread: Arc<Thread>) {
        thread.set_flags(ThreadFlags::IDLE | ThreadFlags::BOUND);
        thread.set_core(core);
        thread
            .queue_level
            .store(LEVELS - 1, Ordering::Relaxed);
        thread
            .timeslice_ms
            .store(self.config.timeslice_ms(LEVELS - 1), Ordering::Relaxed);
        *self.cores[core.as_usize()].idle.lock() = Some(thread);
    }

    /// Picks the online core with the lowest bandwidth for a new thread.
    ///
    /// With [`MigrationPolicy::Pinned`] only cores in the creator's domain
    /// are considered; the thread never leaves that domain afterwards.
    fn place(&self) -> CoreId {
        let creator = self.platform.current_core();
        let domain = self.cores[creator.as_usize()].domain;
        let mut best: Option<(CoreId, u64)> = None;
        for (index, core) in self.cores.iter().enumerate() {
            let id = CoreId::new(index as u32);
            if !self.platform.core_is_online(id) {
                continue;
            }
            if self.config.migration == MigrationPolicy::Pinned && core.domain != domain {
                continue;
            }
            let bandwidth = core.bandwidth.load(Ordering::Relaxed);
            if best.is_none_or(|(_, b)| bandwidth < b) {
                best = Some((id, bandwidth));
            }
        }
        best.map_or(creator, |(id, _)| id)
    }

    /// Initializes scheduling state for a new thread, places it, and makes
    /// it runnable. The thread also enters the global table.
    pub fn start(&self, thread: &Arc<Thread>) {
        self.table.insert(thread.clone());

        if thread.has_flags(ThreadFlags::IDLE) {
            // Idle threads are core-bound and add no pressure.
            self.set_idle(self.platform.current_core(), thread.clone());
            return;
        }

        thread.queue_level.store(0, Ordering::Relaxed);
        thread
            .timeslice_ms
            .store(self.config.quantum_ms, Ordering::Relaxed);
        let core = self.place();
        thread.set_core(core);
        let state = &self.cores[core.as_usize()];
        state
            .bandwidth
            .fetch_add(u64::from(self.config.quantum_ms), Ordering::Relaxed);
        state.thread_count.fetch_add(1, Ordering::Relaxed);

        self.enqueue(thread);
    }

    /// Removes a thread's pressure from its core (reap path).
    pub fn finish(&self, thread: &Thread) {
        if thread.has_flags(ThreadFlags::IDLE) {
            return;
        }
        let state = &self.cores[thread.core().as_usize()];
        state.bandwidth.fetch_sub(
            u64::from(thread.timeslice_ms.load(Ordering::Relaxed)),
            Ordering::Relaxed,
        );
        state.thread_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Makes `thread` runnable on its core at its current level.
    pub fn enqueue(&self, thread: &Arc<Thread>) {
        let core = thread.core();
        thread.clear_flags(ThreadFlags::BLOCKED);

        let location = thread.location();
        assert!(
            location != ThreadLocation::Ready && location != ThreadLocation::Sleeping,
            "thread {} is already queued ({location:?})",
            thread.id()
        );
        thread.force_location(ThreadLocation::Ready);

        let level = thread.queue_level.load(Ordering::Relaxed);
        self.cores[core.as_usize()].queues[level]
            .lock()
            .push_back(thread.clone());

        if core != self.platform.current_core() {
            self.kick_if_idle(core);
        }
    }

    fn kick_if_idle(&self, core: CoreId) {
        if self.platform.core_is_online(core) && self.platform.core_is_idle(core) {
            self.platform.notify_core(core);
        }
    }

    /// Adjusts a thread's level and the core bandwidth it contributes.
    fn update_pressure(&self, core: &CoreState, thread: &Thread, new_level: usize) {
        let old_level = thread.queue_level.load(Ordering::Relaxed);
        if old_level == new_level {
            return;
        }
        let old_slice = u64::from(thread.timeslice_ms.load(Ordering::Relaxed));
        let new_slice = self.config.timeslice_ms(new_level);
        core.bandwidth.fetch_sub(old_slice, Ordering::Relaxed);
        thread.queue_level.store(new_level, Ordering::Relaxed);
        thread.timeslice_ms.store(new_slice, Ordering::Relaxed);
        core.bandwidth
            .fetch_add(u64::from(new_slice), Ordering::Relaxed);
    }

    /// Moves every thread in levels 1.. back to level 0 (aging).
    fn boost(&self, core: &CoreState) {
        for level in 1..LEVELS {
            let mut drained: VecDeque<Arc<Thread>> = {
                let mut queue = core.queues[level].lock();
                core::mem::take(&mut *queue)
            };
            if !drained.is_empty() {
                let mut target = core.queues[0].lock();
                target.append(&mut drained);
            }
        }
    }

    /// Picks the next thread for the current core.
    ///
    /// `outgoing` is the thread leaving the CPU, if any; `preemptive` says
    /// whether the switch was forced by the timer. Returns the core's idle
    /// thread when no queue has work, or `None` before the idle thread is
    /// registered.
    pub fn schedule(&self, outgoing: Option<&Arc<Thread>>, preemptive: bool) -> Option<Arc<Thread>> {
        let core_id = self.platform.current_core();
        let core = &self.cores[core_id.as_usize()];

        // 1. Park or requeue the outgoing thread. A thread that queued
        //    itself elsewhere (sleep) carries REQUEUE and is left alone.
        if let Some(out) = outgoing {
            if out.has_flags(ThreadFlags::REQUEUE) {
                out.clear_flags(ThreadFlags::REQUEUE);
            } else if !out.has_flags(ThreadFlags::IDLE) {
                if preemptive {
                    let level = out.queue_level.load(Ordering::Relaxed);
                    if level < LEVELS - 1 {
                        self.update_pressure(core, out, level + 1);
                    }
                }
                self.enqueue(out);
            } else {
                out.force_location(ThreadLocation::Detached);
            }
        }

        // 2. Requeue woken sleepers placed on this core.
        for thread in self.sleep_queue.take_woken_for_core(core_id) {
            self.enqueue(&thread);
        }

        // 3. Periodic boost.
        let now = self.platform.now_ms();
        let last = core.last_boost.load(Ordering::Relaxed);
        if last == 0 {
            core.last_boost.store(now, Ordering::Relaxed);
        } else if now.saturating_sub(last) >= self.config.boost_period_ms {
            self.boost(core);
            core.last_boost.store(now, Ordering::Relaxed);
        }

        // 4. Head of the lowest non-empty queue, else idle.
        for level in 0..LEVELS {
            let popped = core.queues[level].lock().pop_front();
            if let Some(thread) = popped {
                self.update_pressure(core, &thread, level);
                assert!(
                    thread.transition(ThreadLocation::Ready, ThreadLocation::Running),
                    "picked thread {} was not ready",
                    thread.id()
                );
                return Some(thread);
            }
        }

        let idle = self.cores[core_id.as_usize()].idle.lock().clone();
        if let Some(idle) = &idle {
            idle.force_location(ThreadLocation::Running);
        }
        idle
    }

    // -----------------------------------------------------------------------
    // Sleep / wake
    // -----------------------------------------------------------------------

    /// Blocks the calling thread on `token` for up to `timeout_ms`
    /// milliseconds (0 = no deadline).
    pub fn sleep(&self, current: &Arc<Thread>, token: usize, timeout_ms: u64) -> SleepOutcome {
        let enqueued = self.sleep_queue.enqueue(current, token, timeout_ms, None);
        assert!(enqueued, "unconditional sleep enqueue failed");
        self.platform.yield_to_scheduler(current);
        self.finish_sleep(current)
    }

    /// Like [`sleep`](Self::sleep), but only goes to sleep if `atomic`
    /// still holds `expected` at enqueue time (checked inside the sleep
    /// queue lock). Otherwise reports [`SleepOutcome::SyncFailed`] without
    /// yielding.
    pub fn atomic_sleep(
        &self,
        current: &Arc<Thread>,
        atomic: &AtomicU32,
        expected: u32,
        timeout_ms: u64,
    ) -> SleepOutcome {
        let token = core::ptr::from_ref(atomic) as usize;
        if !self
            .sleep_queue
            .enqueue(current, token, timeout_ms, Some((atomic, expected)))
        {
            return SleepOutcome::SyncFailed;
        }
        self.platform.yield_to_scheduler(current);
        self.finish_sleep(current)
    }

    fn finish_sleep(&self, current: &Arc<Thread>) -> SleepOutcome {
        // When the wake goes through schedule() the thread has already left
        // the queue; the removal here covers paths (tests, early boot)
        // where the platform resumed us directly.
        if self.sleep_queue.remove(current) {
            current.force_location(ThreadLocation::Running);
        }
        current.clear_flags(ThreadFlags::BLOCKED | ThreadFlags::REQUEUE);

        if current.sleep.timed_out.swap(false, Ordering::AcqRel) {
            return SleepOutcome::Timeout;
        }
        if current.sleep.remaining_ms.load(Ordering::Relaxed) > 0 {
            return match self.config.wake_policy {
                WakePolicy::Interrupted => SleepOutcome::Interrupted,
                WakePolicy::Ok => SleepOutcome::Ok,
            };
        }
        SleepOutcome::Ok
    }

    fn sync_thread_core(&self, thread: &Thread) {
        self.kick_if_idle(thread.core());
    }

    /// Wakes a specific sleeping thread. Returns whether it was pending.
    pub fn signal(&self, thread: &Arc<Thread>) -> bool {
        let woken = self
            .sleep_queue
            .signal_thread(thread, self.platform.now_ms());
        if woken {
            self.sync_thread_core(thread);
        }
        woken
    }

    /// Wakes the first sleeper waiting on `token`. Returns whether one was
    /// found.
    pub fn signal_token(&self, token: usize) -> bool {
        match self.sleep_queue.signal_token(token, self.platform.now_ms()) {
            Some(thread) => {
                self.sync_thread_core(&thread);
                true
            }
            None => false,
        }
    }

    /// Wakes every sleeper waiting on `token`; returns how many.
    pub fn signal_token_all(&self, token: usize) -> usize {
        let mut count = 0;
        while self.signal_token(token) {
            count += 1;
        }
        count
    }

    /// Advances sleep accounting; called from the 1 ms system tick.
    pub fn tick(&self, elapsed_ms: u64) {
        let now = self.platform.now_ms();
        for thread in self.sleep_queue.tick(elapsed_ms, now) {
            self.sync_thread_core(&thread);
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Terminates `target`: stores the exit code, marks it finished, wakes
    /// joiners, and (with `instant`) kicks its core to reschedule at once.
    pub fn kill(&self, target: &Arc<Thread>, exit_code: i64, instant: bool) {
        target.set_exit_code(exit_code);
        target.finished_latch.store(1, Ordering::SeqCst);
        target.set_flags(ThreadFlags::FINISHED);
        self.signal_token_all(target.join_token());
        // A sleeping target is woken so it can run to its exit path.
        self.signal(target);
        if instant {
            self.platform.notify_core(target.core());
        }
    }

    /// Exit path for the calling thread (the entry trampoline's return).
    pub fn exit_current(&self, current: &Arc<Thread>, exit_code: i64) {
        self.kill(current, exit_code, false);
    }

    /// Waits for `target` to finish and returns its exit code.
    ///
    /// # Errors
    ///
    /// The sleep outcome when the wait ended without the target finishing
    /// (timeout or interruption).
    pub fn join(
        &self,
        current: &Arc<Thread>,
        target: &Arc<Thread>,
        timeout_ms: u64,
    ) -> Result<i64, SleepOutcome> {
        match self.atomic_sleep(current, &target.finished_latch, 0, timeout_ms) {
            // The latch had already flipped: the target is done.
            SleepOutcome::SyncFailed => Ok(target.exit_code()),
            outcome => {
                if target.has_flags(ThreadFlags::FINISHED) {
                    Ok(target.exit_code())
                } else {
                    Err(outcome)
                }
            }
        }
    }

    /// Frees finished threads exactly once, removing their pressure.
    pub fn reap(&self) -> usize {
        let reaped = self.table.reap();
        for thread in &reaped {
            self.finish(thread);
        }
        reaped.len()
    }

    /// Counts the queues `thread` currently appears on (test support for
    /// the at-most-one-queue invariant).
    #[cfg(test)]
    fn occurrences(&self, thread: &Arc<Thread>) -> usize {
        let mut count = 0;
        for core in &self.cores {
            for queue in &core.queues {
                count += queue.lock().iter().filter(|t| Arc::ptr_eq(t, thread)).count();
            }
        }
        if self.sleep_queue.contains(thread) {
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPlatform;
    use muon_core::id::{ProcessId, ThreadId};

    fn single_core(config: SchedulerConfig) -> (&'static TestPlatform, Arc<Scheduler>) {
        let platform = TestPlatform::leak();
        let sched = Arc::new(Scheduler::new(platform, config, &[DomainId::BOOT]));
        (platform, sched)
    }

    fn make_thread(id: u64) -> Arc<Thread> {
        Thread::new(
            ThreadId::new(id),
            ProcessId::KERNEL,
            None,
            "worker",
            ThreadFlags::KERNEL,
            None,
        )
    }

    // -----------------------------------------------------------------------
    // Run queues, demotion, boost
    // -----------------------------------------------------------------------

    #[test]
    fn schedule_returns_threads_in_fifo_order() {
        let (_p, sched) = single_core(SchedulerConfig::default());
        let a = make_thread(1);
        let b = make_thread(2);
        sched.start(&a);
        sched.start(&b);

        let first = sched.schedule(None, false).unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        let second = sched.schedule(Some(&first), false).unwrap();
        assert!(Arc::ptr_eq(&second, &b));
    }

    #[test]
    fn voluntary_yield_keeps_level() {
        let (_p, sched) = single_core(SchedulerConfig::default());
        let a = make_thread(1);
        sched.start(&a);

        let mut current = sched.schedule(None, false).unwrap();
        for _ in 0..5 {
            current = sched.schedule(Some(&current), false).unwrap();
            assert_eq!(current.queue_level.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn preemption_demotes_one_level() {
        let (_p, sched) = single_core(SchedulerConfig::default());
        let a = make_thread(1);
        sched.start(&a);

        let mut current = sched.schedule(None, false).unwrap();
        for round in 1..=3 {
            current = sched.schedule(Some(&current), true).unwrap();
            assert_eq!(current.queue_level.load(Ordering::Relaxed), round);
        }
    }

    #[test]
    fn demotion_saturates_at_lowest_level() {
        let (_p, sched) = single_core(SchedulerConfig::default());
        let a = make_thread(1);
        sched.start(&a);

        let mut current = sched.schedule(None, false).unwrap();
        for _ in 0..(LEVELS + 3) {
            current = sched.schedule(Some(&current), true).unwrap();
        }
        assert_eq!(current.queue_level.load(Ordering::Relaxed), LEVELS - 1);
    }

    #[test]
    fn demotion_then_boost_restores_level_zero() {
        // Scenario S5: CPU-bound threads sink under preemption, then one
        // boost period later everything is back at level 0.
        let (platform, sched) = single_core(SchedulerConfig::default());
        let threads: Vec<_> = (1..=3).map(make_thread).collect();
        for t in &threads {
            sched.start(t);
        }

        let mut current = sched.schedule(None, false).unwrap();
        for _ in 0..12 {
            platform.advance(10);
            current = sched.schedule(Some(&current), true).unwrap();
        }
        // Every thread has been preempted repeatedly and sits at level >= 2.
        for t in &threads {
            assert!(
                t.queue_level.load(Ordering::Relaxed) >= 2,
                "thread {} not demoted",
                t.id()
            );
        }

        // One boost period later, the next scheduling pass re-promotes.
        platform.advance(sched.config().boost_period_ms);
        current = sched.schedule(Some(&current), true).unwrap();
        let mut seen = vec![current];
        for _ in 0..2 {
            let next = sched
                .schedule(Some(seen.last().unwrap()), false)
                .unwrap();
            seen.push(next);
        }
        for t in &seen {
            assert_eq!(t.queue_level.load(Ordering::Relaxed), 0);
        }
    }

    #[test]
    fn idle_thread_returned_when_empty() {
        let (_p, sched) = single_core(SchedulerConfig::default());
        assert!(sched.schedule(None, false).is_none());

        let idle = Thread::new(
            ThreadId::new(99),
            ProcessId::KERNEL,
            None,
            "idle",
            ThreadFlags::KERNEL | ThreadFlags::IDLE,
            None,
        );
        sched.set_idle(CoreId::new(0), idle.clone());
        let picked = sched.schedule(None, false).unwrap();
        assert!(Arc::ptr_eq(&picked, &idle));

        // The idle thread is never queued, even when switched out.
        let a = make_thread(1);
        sched.start(&a);
        let next = sched.schedule(Some(&picked), true).unwrap();
        assert!(Arc::ptr_eq(&next, &a));
        assert_eq!(sched.occurrences(&idle), 0);
    }

    #[test]
    fn bandwidth_tracks_queue_levels() {
        let (_p, sched) = single_core(SchedulerConfig::default());
        let a = make_thread(1);
        sched.start(&a);
        let base = u64::from(sched.config().quantum_ms);
        assert_eq!(sched.cores[0].bandwidth.load(Ordering::Relaxed), base);

        let current = sched.schedule(None, false).unwrap();
        let _ = sched.schedule(Some(&current), true).unwrap();
        // Demoted to level 1: bandwidth reflects the longer timeslice.
        assert_eq!(
            sched.cores[0].bandwidth.load(Ordering::Relaxed),
            u64::from(sched.config().timeslice_ms(1))
        );
    }

    // -----------------------------------------------------------------------
    // Sleep and wake
    // -----------------------------------------------------------------------

    #[test]
    fn sleep_times_out_after_deadline() {
        // Scenario S2: 50 ms sleep, no signal, wakes with Timeout.
        let (platform, sched) = single_core(SchedulerConfig::default());
        let sleeper = make_thread(1);

        let worker = {
            let sched = sched.clone();
            let sleeper = sleeper.clone();
            std::thread::spawn(move || sched.sleep(&sleeper, 0xDEAD, 50))
        };

        while sched.sleepers() == 0 {
            std::thread::yield_now();
        }
        for _ in 0..50 {
            platform.advance(1);
            sched.tick(1);
        }
        assert_eq!(worker.join().unwrap(), SleepOutcome::Timeout);
    }

    #[test]
    fn sleep_interrupted_by_signal() {
        // Scenario S3: signalled at 20 ms of a 100 ms sleep. The default
        // wake policy reports Interrupted.
        let (platform, sched) = single_core(SchedulerConfig::default());
        let sleeper = make_thread(1);

        let worker = {
            let sched = sched.clone();
            let sleeper = sleeper.clone();
            std::thread::spawn(move || sched.sleep(&sleeper, 0xBEEF, 100))
        };

        while sched.sleepers() == 0 {
            std::thread::yield_now();
        }
        for _ in 0..20 {
            platform.advance(1);
            sched.tick(1);
        }
        assert!(sched.signal_token(0xBEEF));
        assert_eq!(worker.join().unwrap(), SleepOutcome::Interrupted);
    }

    #[test]
    fn wake_policy_ok_reports_ok() {
        let config = SchedulerConfig {
            wake_policy: WakePolicy::Ok,
            ..SchedulerConfig::default()
        };
        let (_platform, sched) = single_core(config);
        let sleeper = make_thread(1);

        let worker = {
            let sched = sched.clone();
            let sleeper = sleeper.clone();
            std::thread::spawn(move || sched.sleep(&sleeper, 0xBEEF, 100))
        };

        while sched.sleepers() == 0 {
            std::thread::yield_now();
        }
        assert!(sched.signal_token(0xBEEF));
        assert_eq!(worker.join().unwrap(), SleepOutcome::Ok);
    }

    #[test]
    fn untimed_sleep_woken_by_signal_reports_ok() {
        let (_platform, sched) = single_core(SchedulerConfig::default());
        let sleeper = make_thread(1);

        let worker = {
            let sched = sched.clone();
            let sleeper = sleeper.clone();
            std::thread::spawn(move || sched.sleep(&sleeper, 0xCAFE, 0))
        };

        while sched.sleepers() == 0 {
            std::thread::yield_now();
        }
        assert!(sched.signal_token(0xCAFE));
        assert_eq!(worker.join().unwrap(), SleepOutcome::Ok);
    }

    #[test]
    fn atomic_sleep_sync_failure_does_not_yield() {
        let (_platform, sched) = single_core(SchedulerConfig::default());
        let sleeper = make_thread(1);
        let atomic = AtomicU32::new(5);

        // Value changed: no sleep, no queue entry.
        let outcome = sched.atomic_sleep(&sleeper, &atomic, 4, 100);
        assert_eq!(outcome, SleepOutcome::SyncFailed);
        assert_eq!(sched.sleepers(), 0);
        assert_eq!(sched.occurrences(&sleeper), 0);
    }

    #[test]
    fn atomic_sleep_wakes_on_token_signal() {
        let (_platform, sched) = single_core(SchedulerConfig::default());
        let sleeper = make_thread(1);
        let atomic = Arc::new(AtomicU32::new(0));
        let token = core::ptr::from_ref(atomic.as_ref()) as usize;

        let worker = {
            let sched = sched.clone();
            let sleeper = sleeper.clone();
            let atomic = atomic.clone();
            std::thread::spawn(move || sched.atomic_sleep(&sleeper, &atomic, 0, 0))
        };

        while sched.sleepers() == 0 {
            std::thread::yield_now();
        }
        atomic.store(1, Ordering::SeqCst);
        assert!(sched.signal_token(token));
        assert_eq!(worker.join().unwrap(), SleepOutcome::Ok);
    }

    #[test]
    fn signal_token_all_wakes_every_waiter() {
        let (_platform, sched) = single_core(SchedulerConfig::default());
        let workers: Vec<_> = (1..=3)
            .map(|i| {
                let sched = sched.clone();
                let thread = make_thread(i);
                std::thread::spawn(move || sched.sleep(&thread, 0x7777, 0))
            })
            .collect();

        while sched.sleepers() < 3 {
            std::thread::yield_now();
        }
        assert_eq!(sched.signal_token_all(0x7777), 3);
        for w in workers {
            assert_eq!(w.join().unwrap(), SleepOutcome::Ok);
        }
    }

    // -----------------------------------------------------------------------
    // At-most-one-queue invariant
    // -----------------------------------------------------------------------

    #[test]
    fn thread_is_on_at_most_one_queue() {
        let (platform, sched) = single_core(SchedulerConfig::default());
        let a = make_thread(1);
        let b = make_thread(2);
        sched.start(&a);
        sched.start(&b);
        assert_eq!(sched.occurrences(&a), 1);
        assert_eq!(sched.occurrences(&b), 1);

        // a running, b queued.
        let current = sched.schedule(None, false).unwrap();
        assert_eq!(sched.occurrences(&current), 0);
        assert_eq!(sched.occurrences(&b), 1);

        // a goes to sleep: on the sleep queue only; schedule leaves it there.
        let sleeper = {
            let sched = sched.clone();
            let a = a.clone();
            std::thread::spawn(move || sched.sleep(&a, 0x42, 0))
        };
        while sched.sleepers() == 0 {
            std::thread::yield_now();
        }
        assert_eq!(sched.occurrences(&a), 1);
        // The switch away from the sleeper picks b and leaves a queued
        // exactly once (on the sleep queue).
        let next = sched.schedule(Some(&a), false).unwrap();
        assert!(Arc::ptr_eq(&next, &b));
        assert_eq!(sched.occurrences(&a), 1, "sleeper stays on sleep queue");
        assert_eq!(sched.occurrences(&b), 0, "running thread is unqueued");

        // Wake it: the sleeper leaves the sleep queue and is never on two
        // queues at once.
        platform.advance(1);
        sched.signal_token(0x42);
        sleeper.join().unwrap();
        assert!(sched.occurrences(&a) <= 1);
    }

    // -----------------------------------------------------------------------
    // Kill / join / reap
    // -----------------------------------------------------------------------

    #[test]
    fn join_already_finished_thread() {
        let (_platform, sched) = single_core(SchedulerConfig::default());
        let target = make_thread(1);
        let joiner = make_thread(2);
        sched.kill(&target, 42, false);
        assert_eq!(sched.join(&joiner, &target, 100), Ok(42));
    }

    #[test]
    fn join_waits_for_kill() {
        let (_platform, sched) = single_core(SchedulerConfig::default());
        let target = make_thread(1);
        let joiner = make_thread(2);

        let waiter = {
            let sched = sched.clone();
            let target = target.clone();
            let joiner = joiner.clone();
            std::thread::spawn(move || sched.join(&joiner, &target, 0))
        };

        while sched.sleepers() == 0 {
            std::thread::yield_now();
        }
        sched.kill(&target, 7, false);
        assert_eq!(waiter.join().unwrap(), Ok(7));
    }

    #[test]
    fn join_times_out() {
        let (platform, sched) = single_core(SchedulerConfig::default());
        let target = make_thread(1);
        let joiner = make_thread(2);

        let waiter = {
            let sched = sched.clone();
            let target = target.clone();
            let joiner = joiner.clone();
            std::thread::spawn(move || sched.join(&joiner, &target, 10))
        };

        while sched.sleepers() == 0 {
            std::thread::yield_now();
        }
        for _ in 0..10 {
            platform.advance(1);
            sched.tick(1);
        }
        assert_eq!(waiter.join().unwrap(), Err(SleepOutcome::Timeout));
    }

    #[test]
    fn reap_frees_finished_threads_once() {
        let (_platform, sched) = single_core(SchedulerConfig::default());
        let a = make_thread(1);
        sched.start(&a);

        // Run it, then kill it while it is off-queue.
        let current = sched.schedule(None, false).unwrap();
        sched.kill(&current, 0, false);
        current.force_location(ThreadLocation::Detached);

        assert_eq!(sched.reap(), 1);
        assert_eq!(sched.reap(), 0);
        assert!(sched.table().get(ThreadId::new(1)).is_none());
        assert_eq!(sched.cores[0].thread_count.load(Ordering::Relaxed), 0);
    }

    // -----------------------------------------------------------------------
    // Multi-core placement
    // -----------------------------------------------------------------------

    #[test]
    fn placement_prefers_lowest_bandwidth() {
        let platform = TestPlatform::leak();
        let sched = Scheduler::new(
            platform,
            SchedulerConfig::default(),
            &[DomainId::BOOT, DomainId::BOOT],
        );

        let a = make_thread(1);
        let b = make_thread(2);
        sched.start(&a);
        sched.start(&b);
        // The second thread lands on the other (now lighter) core.
        assert_ne!(a.core(), b.core());
    }

    #[test]
    fn pinned_policy_keeps_domain() {
        let platform = TestPlatform::leak();
        // Core 0 in domain 0, core 1 in domain 1. The creator runs on
        // core 0, so pinned placement must never choose core 1.
        let sched = Scheduler::new(
            platform,
            SchedulerConfig::default(),
            &[DomainId::new(0), DomainId::new(1)],
        );
        for i in 1..=4 {
            let t = make_thread(i);
            sched.start(&t);
            assert_eq!(t.core(), CoreId::new(0));
        }
    }

    #[test]
    fn global_policy_spreads_across_domains() {
        let platform = TestPlatform::leak();
        let config = SchedulerConfig {
            migration: MigrationPolicy::Global,
            ..SchedulerConfig::default()
        };
        let sched = Scheduler::new(platform, config, &[DomainId::new(0), DomainId::new(1)]);
        let a = make_thread(1);
        let b = make_thread(2);
        sched.start(&a);
        sched.start(&b);
        assert_ne!(a.core(), b.core());
    }
}
