//! The scheduler (C4, §4.3): turns a batch of queries into either a cache
//! hit, a new leader execution, a cross-thread wait, or a synthetic cycle
//! error, and fans the rest of a batch out onto worker threads.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::arena::{GraphState, ResolveOutcome, TaskId, TaskResult, TaskResultInner};
use crate::cancel::{AbortSignal, CancelToken};
use crate::context::TaskContext;
use crate::error::{CancelCause, Fatal, PanicInfo};
use crate::key::Key;
use crate::local_state;
use crate::query::{downcast, Query, QueryOutcome};
use crate::semaphore::{PermitSlot, Semaphore};

/// Panic payload used to unwind a thread that was waiting on a dependency
/// whose leader panicked or aborted elsewhere (§5): that dependency's
/// record is gone by the time the wait ends, so there is no result to
/// return and this waiter must fail the same way rather than block forever
/// or read a missing slot.
struct CancelledWhileWaiting;

/// Wraps a non-panicking cancellation cause (`UserCancel`/`Timeout`) as a
/// [`Fatal`] for the one dependent that was waiting on a permit at the
/// moment cancellation landed (§5).
#[derive(Debug)]
struct CancelledError(CancelCause);

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for CancelledError {}

/// Owns the task arena and the parallelism budget for one logical cache
/// (§2). Cheap to share: every public entry point takes `&Executor`.
pub struct Executor {
    pub(crate) graph: GraphState,
    semaphore: Semaphore,
    next_run_id: AtomicU64,
    /// Shared (many concurrent runs) / exclusive (eviction, §4.2) lock over
    /// the whole arena, distinct from the fine-grained `graph_lock`.
    pub(crate) run_evict_lock: RwLock<()>,
}

impl Executor {
    pub(crate) fn new(parallelism: usize) -> Self {
        Executor {
            graph: GraphState::new(),
            semaphore: Semaphore::new(parallelism.max(1)),
            next_run_id: AtomicU64::new(1),
            run_evict_lock: RwLock::new(()),
        }
    }

    pub(crate) fn fresh_run_id(&self) -> u64 {
        self.next_run_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn acquire_root_permit(&self) -> PermitSlot<'_> {
        PermitSlot::acquire(&self.semaphore)
    }

    /// Resolve a batch of same-type queries on behalf of `caller` (`None`
    /// for a top-level run root). The first query runs synchronously,
    /// reusing the calling thread's own permit; the rest are dispatched to
    /// worker threads, each acquiring its own permit (§4.3.3).
    pub(crate) fn resolve_batch<Q: Query>(
        &self,
        caller: Option<TaskId>,
        queries: &[Q],
        run_id: u64,
        cancel: &CancelToken,
        permit: &RefCell<PermitSlot<'_>>,
    ) -> Vec<(TaskId, QueryOutcome<Q::Value>)> {
        if queries.is_empty() {
            return Vec::new();
        }

        let (first, rest) = queries.split_first().expect("checked non-empty above");

        if rest.is_empty() {
            return vec![self.resolve_one(caller, first, run_id, cancel, permit)];
        }

        let mut results: Vec<Option<(TaskId, QueryOutcome<Q::Value>)>> =
            (0..queries.len()).map(|_| None).collect();

        std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(rest.len());
            for (offset, query) in rest.iter().enumerate() {
                handles.push((
                    offset + 1,
                    scope.spawn(move || {
                        let worker_permit = RefCell::new(PermitSlot::acquire(&self.semaphore));
                        self.resolve_one(caller, query, run_id, cancel, &worker_permit)
                    }),
                ));
            }

            results[0] = Some(self.resolve_one(caller, first, run_id, cancel, permit));

            // The rest of this batch dispatched onto worker threads; this
            // thread is now merely waiting on a join counter; it must give up
            // its own permit for that, exactly as the `Wait` arm of
            // `resolve_one` does, or a deep enough fan-out exhausts the
            // semaphore with every holder parked right here (§4.3.3, §4.3.4).
            permit.borrow_mut().release();
            for (index, handle) in handles {
                let outcome = match handle.join() {
                    Ok(outcome) => outcome,
                    Err(payload) => panic::resume_unwind(payload),
                };
                results[index] = Some(outcome);
            }
            permit.borrow_mut().reacquire_unless(|| cancel.is_cancelled());
        });

        results.into_iter().map(|r| r.expect("every slot filled above")).collect()
    }

    fn resolve_one<Q: Query>(
        &self,
        caller: Option<TaskId>,
        query: &Q,
        run_id: u64,
        cancel: &CancelToken,
        permit: &RefCell<PermitSlot<'_>>,
    ) -> (TaskId, QueryOutcome<Q::Value>) {
        let key = query.key();
        match self.graph.resolve_edge(caller, &key, || Box::new(query.clone())) {
            ResolveOutcome::Done(id, result) => (id, to_outcome(&result, run_id)),
            ResolveOutcome::Cycle(id, fatal) => (
                id,
                QueryOutcome {
                    value: None,
                    fatal: Some(Arc::new(fatal)),
                    changed: true,
                },
            ),
            ResolveOutcome::Execute(id) => {
                let result = self.execute_leader(id, &key, query, run_id, cancel, permit);
                (id, to_outcome(&result, run_id))
            }
            ResolveOutcome::Wait(id) => {
                permit.borrow_mut().release();
                let result = self.graph.wait_until_done(id);
                let reacquired = permit.borrow_mut().reacquire_unless(|| cancel.is_cancelled());
                match result {
                    None => {
                        // The leader we were waiting on panicked or aborted
                        // and never reached `done`; its record is gone.
                        // Unwind this thread too so the cancellation
                        // propagates along every dependent chain, not only
                        // the one that panicked.
                        panic::resume_unwind(Box::new(CancelledWhileWaiting))
                    }
                    Some(_) if !reacquired => (
                        id,
                        QueryOutcome {
                            value: None,
                            fatal: Some(Arc::new(Fatal::Custom(Box::new(
                                CancelledError(cancel.cause().expect("reacquire only gives up once cancelled")),
                            )))),
                            changed: true,
                        },
                    ),
                    Some(result) => (id, to_outcome(&result, run_id)),
                }
            }
        }
    }

    fn execute_leader<Q: Query>(
        &self,
        id: TaskId,
        key: &Key,
        query: &Q,
        run_id: u64,
        cancel: &CancelToken,
        permit: &RefCell<PermitSlot<'_>>,
    ) -> TaskResult {
        let _stack_guard = local_state::ActiveQueryGuard::push(id);
        let ctx = TaskContext::new(self, id, run_id, permit, cancel);

        match panic::catch_unwind(AssertUnwindSafe(|| query.execute(&ctx))) {
            Ok((value, fatal)) => {
                let diagnostics = ctx.take_diagnostics();
                let result = TaskResult(Arc::new(TaskResultInner {
                    run_id,
                    value: Arc::new(value) as Arc<dyn Any + Send + Sync>,
                    fatal: fatal.map(Arc::new),
                }));
                self.graph.complete(id, result.clone(), diagnostics);
                result
            }
            Err(payload) => {
                if let Some(abort) = payload.downcast_ref::<AbortSignal>() {
                    log::warn!("task {} aborted: {}", key, abort.0);
                    cancel.set_abort(abort.0.clone());
                } else {
                    let message = panic_message(&payload);
                    log::warn!("task {} panicked: {}", key, message);
                    let info = PanicInfo {
                        query: key.clone(),
                        payload: message,
                        backtrace: None,
                    };
                    cancel.set_panic(info);
                }
                self.graph.evict_in_progress(id);
                panic::resume_unwind(payload);
            }
        }
    }
}

fn to_outcome<V: Send + Sync + 'static>(result: &TaskResult, run_id: u64) -> QueryOutcome<V> {
    QueryOutcome {
        value: Some(downcast::<V>(result.0.value.clone())),
        fatal: result.0.fatal.clone(),
        changed: result.0.run_id == run_id,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
