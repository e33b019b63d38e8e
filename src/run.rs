//! The top-level run controller (C8, §4.7).

use std::cell::RefCell;

use crate::cancel::{CancelToken, RunContext};
use crate::error::CancelCause;
use crate::executor::Executor;
use crate::query::{Query, RunOutcome};

/// Resolve `queries` against `executor`, under `ctx`'s cancellation scope.
///
/// Returns `Err` (never `Ok`) if the run was cancelled by a panic or an
/// explicit [`crate::context::TaskContext::abort`] call; the underlying
/// panic is then re-raised on this thread rather than swallowed (§7.4, §4.7
/// step 8). `Ok` results additionally carry, per query, the transitively
/// aggregated non-fatal diagnostics of everything that query (transitively)
/// depended on.
pub fn run<Q: Query>(
    ctx: &RunContext,
    executor: &Executor,
    queries: &[Q],
) -> Result<Vec<RunOutcome<Q::Value>>, CancelCause> {
    let _run_share = executor.run_evict_lock.read();
    let _reentrancy = crate::local_state::ReentrancyGuard::enter(executor as *const Executor as usize);

    let cancel = CancelToken::child_of(ctx);
    let run_id = executor.fresh_run_id();
    log::debug!("run {} starting with {} quer{}", run_id, queries.len(), if queries.len() == 1 { "y" } else { "ies" });

    let permit = RefCell::new(executor.acquire_root_permit());
    let resolved = executor.resolve_batch(None, queries, run_id, &cancel, &permit);

    // A `Panic`/`Abort` cause never reaches this point as a plain return:
    // the leader that set it always keeps unwinding (directly, or via a
    // waiter re-panicking, §4.3.4) all the way through `resolve_batch`
    // above. Only `UserCancel`/`Timeout`, which nothing unwinds for, can
    // still be sitting in `cancel` once `resolve_batch` returns normally.
    if let Some(cause) = cancel.cause() {
        log::warn!("run {} cancelled: {}", run_id, cause);
        return Err(cause);
    }

    let results = resolved
        .into_iter()
        .map(|(id, outcome)| {
            let non_fatals = executor.graph.collect_transitive_diagnostics(&[id]);
            RunOutcome {
                value: outcome.value,
                fatal: outcome.fatal,
                changed: outcome.changed,
                non_fatals,
            }
        })
        .collect();

    log::debug!("run {} finished", run_id);
    Ok(results)
}
