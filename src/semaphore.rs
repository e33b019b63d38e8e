//! The global parallelism budget (§4.3.1, §5).
//!
//! A counting semaphore implemented with a mutex-guarded counter and a
//! condvar, matching the lock-plus-condvar idiom the rest of this crate
//! uses rather than pulling in a dedicated semaphore crate. Permits are
//! represented as an RAII guard so that every acquisition has a release on
//! every exit path, including unwinding.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// How often a cancellable wait re-checks the cancellation token between
/// condvar wakeups. Short enough that cancellation feels prompt (§5),
/// without spinning.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(10);

pub(crate) struct Semaphore {
    available: Mutex<usize>,
    condvar: Condvar,
}

impl Semaphore {
    pub(crate) fn new(capacity: usize) -> Self {
        Semaphore {
            available: Mutex::new(capacity),
            condvar: Condvar::new(),
        }
    }

    /// Block until a permit is available, then take it.
    pub(crate) fn acquire(&self) {
        let mut available = self.available.lock();
        while *available == 0 {
            self.condvar.wait(&mut available);
        }
        *available -= 1;
    }

    /// Like [`Semaphore::acquire`], but gives up and returns `false` (taking
    /// no permit) once `should_stop` reports true, instead of blocking
    /// indefinitely (§5, "workers awaiting permits must return promptly
    /// with the cancellation cause").
    pub(crate) fn acquire_unless(&self, should_stop: impl Fn() -> bool) -> bool {
        let mut available = self.available.lock();
        while *available == 0 {
            if should_stop() {
                return false;
            }
            self.condvar.wait_for(&mut available, CANCEL_POLL_INTERVAL);
        }
        *available -= 1;
        true
    }

    /// Return a permit to the pool and wake one waiter.
    pub(crate) fn release(&self) {
        {
            let mut available = self.available.lock();
            *available += 1;
        }
        self.condvar.notify_one();
    }
}

/// One unit of the parallelism budget, held for as long as a task is
/// actively executing (not suspended on a dependency).
///
/// This is the "explicit resource token" of the design notes (§9): rather
/// than threading a movable token object through the call graph, the same
/// `&PermitSlot` is reused across synchronous, same-thread `resolve` calls
/// (the caller and callee share one stack frame chain, hence one permit),
/// while a subquery dispatched onto its own worker thread acquires an
/// independent `PermitSlot` of its own. Conservation (two permits never
/// existing for one logical slot) falls out of ownership rather than being
/// tracked by hand.
pub(crate) struct PermitSlot<'a> {
    semaphore: &'a Semaphore,
    held: bool,
}

impl<'a> PermitSlot<'a> {
    /// Acquire a fresh permit from `semaphore`.
    pub(crate) fn acquire(semaphore: &'a Semaphore) -> Self {
        semaphore.acquire();
        PermitSlot {
            semaphore,
            held: true,
        }
    }

    /// Release the permit early, e.g. before blocking on a dependency's
    /// completion (§4.3.4). Must be paired with [`PermitSlot::reacquire`]
    /// before the slot is dropped or used again.
    pub(crate) fn release(&mut self) {
        if self.held {
            self.semaphore.release();
            self.held = false;
        }
    }

    /// Reacquire a permit after a prior [`PermitSlot::release`].
    pub(crate) fn reacquire(&mut self) {
        if !self.held {
            self.semaphore.acquire();
            self.held = true;
        }
    }

    /// Like [`PermitSlot::reacquire`], but gives up once `should_stop`
    /// reports true, returning `false` without taking a permit.
    pub(crate) fn reacquire_unless(&mut self, should_stop: impl Fn() -> bool) -> bool {
        if self.held {
            return true;
        }
        if self.semaphore.acquire_unless(should_stop) {
            self.held = true;
            true
        } else {
            false
        }
    }
}

impl Drop for PermitSlot<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
