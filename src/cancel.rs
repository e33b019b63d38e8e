//! Unified cancellation-cause plumbing (§9, "cancellation + panic
//! unification").
//!
//! A single cause — user cancellation, timeout, a propagated panic, or an
//! `abort` call — is observed by every blocking point in a run. It is set
//! at most once per run; the first cause to land wins and later ones are
//! dropped, since only the first is what actually stopped the run.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CancelCause, PanicInfo};

/// A long-lived handle a caller holds across (potentially) many calls to
/// [`crate::run`], so that cancellation can be requested from another
/// thread while a run is in flight.
#[derive(Clone, Default)]
pub struct RunContext {
    cause: Arc<Mutex<Option<CancelCause>>>,
}

impl RunContext {
    pub fn new() -> Self {
        RunContext::default()
    }

    /// Request cancellation of whatever run is currently using this
    /// context. Idempotent; only the first call has an effect.
    pub fn cancel(&self) {
        self.set(CancelCause::UserCancel);
    }

    /// Like [`RunContext::cancel`], but recorded as a timeout rather than a
    /// user-initiated cancellation.
    pub fn cancel_with_timeout(&self) {
        self.set(CancelCause::Timeout);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cause.lock().is_some()
    }

    fn set(&self, cause: CancelCause) {
        let mut guard = self.cause.lock();
        if guard.is_none() {
            *guard = Some(cause);
        }
    }
}

/// The cancellation token actually threaded through one run (§4.7 step 3,
/// "a cancellation-cause child of ctx"). Reads check this run's own cause
/// first (set by an in-run panic or `abort`), falling back to the parent
/// [`RunContext`] so external cancellation is visible everywhere.
pub(crate) struct CancelToken {
    parent: Arc<Mutex<Option<CancelCause>>>,
    local: Mutex<Option<CancelCause>>,
}

impl CancelToken {
    pub(crate) fn child_of(ctx: &RunContext) -> Self {
        CancelToken {
            parent: ctx.cause.clone(),
            local: Mutex::new(None),
        }
    }

    pub(crate) fn set_panic(&self, info: PanicInfo) {
        self.set(CancelCause::Panic(info));
    }

    pub(crate) fn set_abort(&self, message: String) {
        self.set(CancelCause::Abort(message));
    }

    fn set(&self, cause: CancelCause) {
        let mut guard = self.local.lock();
        if guard.is_none() {
            *guard = Some(cause);
        }
    }

    pub(crate) fn cause(&self) -> Option<CancelCause> {
        if let Some(cause) = self.local.lock().clone() {
            return Some(cause);
        }
        self.parent.lock().clone()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cause().is_some()
    }
}

/// Read-only cancellation view handed to query bodies via
/// [`crate::context::TaskContext::context`].
pub struct CancelView<'a>(pub(crate) &'a CancelToken);

impl CancelView<'_> {
    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }

    pub fn cause(&self) -> Option<CancelCause> {
        self.0.cause()
    }
}

/// The panic payload used internally by [`crate::context::TaskContext::abort`]
/// so that the executor's panic handler can tell an explicit abort apart
/// from an ordinary propagated panic (§7.4).
pub(crate) struct AbortSignal(pub(crate) String);
