//! Work-stealing scheduler
//!
//! Every worker owns a bounded deque of ready tokens. A worker pops from its
//! own deque first, then steals round-robin from the others, then falls back
//! to the global injection queue (root token, reactivated tokens, overflow).
//! Idle workers back off and finally park on a condition variable with a
//! bounded timeout; injections wake them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use super::Shared;
use super::deque::{Steal, Stealer, Worker, deque};
use super::interpreter;
use super::token::Token;

/// Shared scheduling state.
pub(crate) struct Scheduler {
    injector: Mutex<VecDeque<Box<Token>>>,
    stealers: Vec<Stealer<Box<Token>>>,
    sleep: Mutex<()>,
    wake: Condvar,
    sleeping: AtomicUsize,
    /// Tokens queued or running.
    active: AtomicUsize,
    halted: AtomicBool,
    idle_park: Duration,
}

impl Scheduler {
    /// Build a scheduler for `workers` threads; returns the owner ends of the
    /// per-worker deques, one per worker in index order.
    pub(crate) fn new(
        workers: usize,
        capacity: usize,
        idle_park: Duration,
    ) -> (Self, Vec<Worker<Box<Token>>>) {
        let (locals, stealers): (Vec<_>, Vec<_>) = (0..workers.max(1)).map(|_| deque(capacity)).unzip();
        let scheduler = Self {
            injector: Mutex::new(VecDeque::new()),
            stealers,
            sleep: Mutex::new(()),
            wake: Condvar::new(),
            sleeping: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            halted: AtomicBool::new(false),
            idle_park,
        };
        (scheduler, locals)
    }

    /// Queue a token from any thread.
    pub(crate) fn inject(&self, token: Box<Token>) {
        if self.is_halted() {
            return;
        }
        self.active.fetch_add(1, Ordering::AcqRel);
        self.injector.lock().push_back(token);
        self.notify();
    }

    fn notify(&self) {
        if self.sleeping.load(Ordering::Acquire) > 0 {
            let _guard = self.sleep.lock();
            self.wake.notify_one();
        }
    }

    /// Stop all workers.
    pub(crate) fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        let _guard = self.sleep.lock();
        self.wake.notify_all();
    }

    pub(crate) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Whether any token is queued or currently running.
    pub(crate) fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire) > 0
    }

    /// Remove everything still sitting in the injection queue.
    pub(crate) fn drain_injector(&self) -> Vec<Box<Token>> {
        let drained: Vec<_> = self.injector.lock().drain(..).collect();
        self.active.fetch_sub(drained.len(), Ordering::AcqRel);
        drained
    }

    fn has_visible_work(&self) -> bool {
        !self.injector.lock().is_empty() || self.stealers.iter().any(|s| !s.is_empty())
    }

    fn finish_one(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A worker's view of the scheduler, handed to the interpreter.
pub(crate) struct WorkerContext {
    pub(crate) index: usize,
    local: Worker<Box<Token>>,
    pub(crate) shared: Arc<Shared>,
}

impl WorkerContext {
    pub(crate) fn new(index: usize, local: Worker<Box<Token>>, shared: Arc<Shared>) -> Self {
        Self {
            index,
            local,
            shared,
        }
    }

    /// Make a token runnable, preferring the local deque.
    pub(crate) fn spawn(&self, token: Box<Token>) {
        let scheduler = &self.shared.scheduler;
        if scheduler.is_halted() {
            return;
        }
        scheduler.active.fetch_add(1, Ordering::AcqRel);
        match self.local.push(token) {
            Ok(()) => scheduler.notify(),
            Err(token) => {
                trace!(worker = self.index, "local deque full, injecting");
                scheduler.active.fetch_sub(1, Ordering::AcqRel);
                scheduler.inject(token);
            }
        }
    }

    fn find_work(&self) -> Option<Box<Token>> {
        if let Some(token) = self.local.pop() {
            return Some(token);
        }
        let scheduler = &self.shared.scheduler;
        let victims = scheduler.stealers.len();
        for offset in 1..victims {
            let victim = (self.index + offset) % victims;
            match scheduler.stealers[victim].steal() {
                Steal::Success(token) => {
                    trace!(worker = self.index, victim, "stole token");
                    return Some(token);
                }
                // Lost a race; try the next victim this round.
                Steal::Retry | Steal::Empty => {}
            }
        }
        scheduler.injector.lock().pop_front()
    }

    fn park(&self) {
        let scheduler = &self.shared.scheduler;
        let mut guard = scheduler.sleep.lock();
        scheduler.sleeping.fetch_add(1, Ordering::AcqRel);
        if !scheduler.is_halted() && !scheduler.has_visible_work() {
            scheduler.wake.wait_for(&mut guard, scheduler.idle_park);
        }
        scheduler.sleeping.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Body of one worker thread.
pub(crate) fn run_worker(shared: Arc<Shared>, index: usize, local: Worker<Box<Token>>) {
    debug!(worker = index, "worker started");
    let ctx = WorkerContext::new(index, local, shared);
    let scheduler = &ctx.shared.scheduler;
    let backoff = Backoff::new();

    while !scheduler.is_halted() {
        match ctx.find_work() {
            Some(token) => {
                backoff.reset();
                interpreter::run(&ctx, token);
                scheduler.finish_one();
            }
            None if backoff.is_completed() => {
                ctx.park();
                backoff.reset();
            }
            None => backoff.snooze(),
        }
    }

    let mut dropped = 0usize;
    while let Some(token) = ctx.local.pop() {
        drop(token);
        scheduler.finish_one();
        dropped += 1;
    }
    debug!(worker = index, dropped, "worker stopped");
}
