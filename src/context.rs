//! The per-invocation handle passed to query bodies (C6, §4.5).

use std::cell::RefCell;
use std::sync::Arc;

use crate::arena::TaskId;
use crate::cancel::{AbortSignal, CancelToken, CancelView};
use crate::error::Fatal;
use crate::executor::Executor;
use crate::query::{Query, QueryOutcome};
use crate::semaphore::PermitSlot;

/// Handed to [`crate::Query::execute`]. A `TaskContext` is only valid for
/// the duration of that call: nothing on it should be retained past
/// `execute` returning (§4.5, "using a context after its `execute` returned
/// is a programmer error").
pub struct TaskContext<'a> {
    pub(crate) executor: &'a Executor,
    pub(crate) task: TaskId,
    pub(crate) run_id: u64,
    pub(crate) permit: &'a RefCell<PermitSlot<'a>>,
    pub(crate) cancel: &'a CancelToken,
    pub(crate) diagnostics: RefCell<Vec<String>>,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(
        executor: &'a Executor,
        task: TaskId,
        run_id: u64,
        permit: &'a RefCell<PermitSlot<'a>>,
        cancel: &'a CancelToken,
    ) -> Self {
        TaskContext {
            executor,
            task,
            run_id,
            permit,
            cancel,
            diagnostics: RefCell::new(Vec::new()),
        }
    }

    /// A read-only view of this run's cancellation state.
    pub fn context(&self) -> CancelView<'_> {
        CancelView(self.cancel)
    }

    /// Record a non-fatal diagnostic belonging to this task.
    pub fn report(&self, message: impl Into<String>) {
        self.diagnostics.borrow_mut().push(message.into());
    }

    /// Convenience wrapper around [`TaskContext::report`] for anything
    /// `Display`-able, typically an error a dependency declined to treat
    /// as fatal.
    pub fn non_fatal(&self, err: impl std::fmt::Display) {
        self.report(err.to_string());
    }

    /// The sole entry point back into the scheduler (§6). `queries` are all
    /// of the same concrete [`Query`] type; the first is executed
    /// synchronously on this thread, the rest dispatched to worker threads
    /// (§4.3.3).
    pub fn resolve<Q: Query>(&self, queries: &[Q]) -> Vec<QueryOutcome<Q::Value>> {
        self.executor
            .resolve_batch(Some(self.task), queries, self.run_id, self.cancel, self.permit)
            .into_iter()
            .map(|(_, outcome)| outcome)
            .collect()
    }

    /// Like [`TaskContext::resolve`], but tolerant of absent entries: a
    /// `None` at index `i` never reaches the scheduler and comes back as a
    /// `Fatal::NilQuery { index: i }` outcome, in the same position it was
    /// passed in.
    pub fn resolve_optional<Q: Query>(&self, queries: &[Option<Q>]) -> Vec<QueryOutcome<Q::Value>> {
        let present: Vec<Q> = queries.iter().filter_map(|q| q.clone()).collect();
        let mut resolved = self.resolve(&present).into_iter();

        queries
            .iter()
            .enumerate()
            .map(|(index, q)| match q {
                Some(_) => resolved.next().expect("increc: one outcome per present query"),
                None => QueryOutcome {
                    value: None,
                    fatal: Some(Arc::new(Fatal::NilQuery { index })),
                    changed: true,
                },
            })
            .collect()
    }

    pub(crate) fn take_diagnostics(self) -> Vec<String> {
        self.diagnostics.into_inner()
    }

    /// Unrecoverable signal (§4.5): cancels the whole run and unwinds this
    /// thread with a payload the leader's panic handler recognizes as an
    /// abort rather than an ordinary panic (§7.4).
    pub fn abort(&self, message: impl Into<String>) -> ! {
        let message = message.into();
        self.cancel.set_abort(message.clone());
        std::panic::panic_any(AbortSignal(message))
    }
}
