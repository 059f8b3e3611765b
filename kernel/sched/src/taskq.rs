//! Cooperative task queue.
//!
//! A FIFO of boxed jobs drained by a small pool of worker kernel threads.
//! Each worker runs an event loop: pop a job, run it to its next
//! completion, and when the queue is empty go to sleep on the queue's
//! pending counter with `atomic_sleep` — a producer that races the worker
//! bumps the counter first, so the sleep attempt fails instead of missing
//! the wakeup.
//!
//! The file-service request pipeline queues its handlers here; handlers
//! block through the ordinary thread primitives at I/O suspension points,
//! which yields the worker thread to the scheduler.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use muon_core::sync::SpinLock;

use crate::scheduler::Scheduler;
use crate::thread::Thread;

type Job = Box<dyn FnOnce() + Send>;

/// A queue of cooperative jobs plus the worker wake state.
pub struct TaskQueue {
    jobs: SpinLock<VecDeque<Job>>,
    /// Bumped on every enqueue; workers sleep against it.
    pending: AtomicU32,
    running: AtomicBool,
}

impl TaskQueue {
    /// Creates an empty, running queue.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            jobs: SpinLock::new(VecDeque::new()),
            pending: AtomicU32::new(0),
            running: AtomicBool::new(true),
        }
    }

    /// The token workers and producers rendezvous on.
    fn token(&self) -> usize {
        core::ptr::from_ref(&self.pending) as usize
    }

    /// Enqueues a job and wakes one worker.
    pub fn queue(&self, sched: &Scheduler, job: impl FnOnce() + Send + 'static) {
        self.jobs.lock().push_back(Box::new(job));
        self.pending.fetch_add(1, Ordering::SeqCst);
        sched.signal_token(self.token());
    }

    /// Number of jobs waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Whether no jobs are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// Stops the queue; workers drain what is left and exit their loops.
    pub fn stop(&self, sched: &Scheduler) {
        self.running.store(false, Ordering::SeqCst);
        self.pending.fetch_add(1, Ordering::SeqCst);
        sched.signal_token_all(self.token());
    }

    /// Worker event loop; runs until [`stop`](Self::stop).
    pub fn run_worker(&self, sched: &Scheduler, worker: &Arc<Thread>) {
        loop {
            let observed = self.pending.load(Ordering::SeqCst);
            let job = self.jobs.lock().pop_front();
            if let Some(job) = job {
                job();
                continue;
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            // Sleep only if nothing was queued since `observed`; a
            // concurrent producer makes the atomic check fail and we loop.
            let _ = sched.atomic_sleep(worker, &self.pending, observed, 0);
        }
    }

    /// Runs every queued job inline on the caller (synchronous pump used
    /// by boot paths and tests). Returns the number of jobs run.
    pub fn drain(&self) -> usize {
        let mut count = 0;
        loop {
            let job = self.jobs.lock().pop_front();
            match job {
                Some(job) => {
                    job();
                    count += 1;
                }
                None => return count,
            }
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}
