//! Per-thread state: the active-query stack used for cheap same-thread
//! cycle detection, this thread's [`RuntimeId`], and the reentrancy marker
//! described in §4.5 and §9.

use std::cell::RefCell;
use std::collections::HashSet;

use crate::arena::TaskId;
use crate::wait_graph::RuntimeId;

thread_local! {
    static RUNTIME_ID: RuntimeId = RuntimeId::fresh();
    static QUERY_STACK: RefCell<Vec<TaskId>> = RefCell::new(Vec::new());
    static RUNNING_EXECUTORS: RefCell<HashSet<usize>> = RefCell::new(HashSet::new());
}

/// The `RuntimeId` assigned to whichever OS thread calls this. Stable for
/// the lifetime of the thread; used as the node identity in the
/// cross-thread [`crate::wait_graph::WaitGraph`].
pub(crate) fn current_runtime_id() -> RuntimeId {
    RUNTIME_ID.with(|id| *id)
}

/// True if `id` is already on this thread's active-query stack, i.e. this
/// thread's own call chain resolves `id` again (the same-thread half of
/// C5's two-tier detection).
pub(crate) fn stack_contains(id: TaskId) -> bool {
    QUERY_STACK.with(|stack| stack.borrow().contains(&id))
}

/// Snapshot of this thread's active-query stack, oldest first, used as the
/// `local_path` argument when reconstructing a cross-thread cycle.
pub(crate) fn current_stack() -> Vec<TaskId> {
    QUERY_STACK.with(|stack| stack.borrow().clone())
}

/// RAII guard pushing `id` onto this thread's active-query stack for the
/// duration of its leader execution. Ported conceptually from the
/// push/pop-on-drop `ActiveQueryGuard` pattern used for the same purpose in
/// this crate's lineage.
pub(crate) struct ActiveQueryGuard {
    id: TaskId,
}

impl ActiveQueryGuard {
    pub(crate) fn push(id: TaskId) -> Self {
        QUERY_STACK.with(|stack| stack.borrow_mut().push(id));
        ActiveQueryGuard { id }
    }
}

impl Drop for ActiveQueryGuard {
    fn drop(&mut self) {
        QUERY_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            debug_assert_eq!(stack.last().copied(), Some(self.id));
            stack.pop();
        });
    }
}

/// RAII reentrancy guard (§4.5): a `run` call installs this for the
/// duration of the run, keyed by the executor's address; a nested `run` on
/// the same executor from within a query body is a programmer error and
/// panics immediately rather than deadlocking on `run_evict_lock`.
pub(crate) struct ReentrancyGuard {
    executor_addr: usize,
}

impl ReentrancyGuard {
    pub(crate) fn enter(executor_addr: usize) -> Self {
        let inserted =
            RUNNING_EXECUTORS.with(|set| set.borrow_mut().insert(executor_addr));
        if !inserted {
            panic!(
                "increc: `run` was called reentrantly on the same executor from within a query body"
            );
        }
        ReentrancyGuard { executor_addr }
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        RUNNING_EXECUTORS.with(|set| {
            set.borrow_mut().remove(&self.executor_addr);
        });
    }
}
