#![warn(rust_2018_idioms)]

//! increc is a thread-safe, caching executor for a DAG of on-demand
//! queries. A [`Query`] supplies a stable [`Key`] and a body that
//! computes a value, optionally resolving other queries through the
//! [`TaskContext`] handed to it; the engine memoizes results, deduplicates
//! concurrent requests for the same key, detects both same-thread and
//! cross-thread cycles, and runs independent queries in parallel up to a
//! configurable budget.

mod arena;
mod cancel;
mod context;
mod error;
mod executor;
mod key;
mod local_state;
mod query;
mod run;
mod semaphore;
mod wait_graph;

use std::num::NonZeroUsize;

pub use crate::arena::TaskId;
pub use crate::cancel::{CancelView, RunContext};
pub use crate::context::TaskContext;
pub use crate::error::{CancelCause, CycleError, Fatal, PanicInfo};
pub use crate::executor::Executor;
pub use crate::key::{Key, KeyData};
pub use crate::query::{Query, QueryOutcome, RunOutcome};
pub use crate::run::run;

/// How many tasks may execute concurrently (§2a, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parallelism {
    /// Use the host's available parallelism at construction time.
    Default,
    /// Use exactly this many concurrent slots.
    Fixed(NonZeroUsize),
}

impl Default for Parallelism {
    fn default() -> Self {
        Parallelism::Default
    }
}

/// Construction-time configuration for [`new_executor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorOptions {
    pub parallelism: Parallelism,
}

impl ExecutorOptions {
    pub fn with_parallelism(n: NonZeroUsize) -> Self {
        ExecutorOptions {
            parallelism: Parallelism::Fixed(n),
        }
    }
}

/// Allocate a new, empty executor (C1-C8's shared state). Never starts any
/// threads; worker threads are spawned on demand per [`resolve`] dispatch
/// and never outlive it (§4.8).
pub fn new_executor(options: ExecutorOptions) -> Executor {
    let parallelism = match options.parallelism {
        Parallelism::Default => std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1),
        Parallelism::Fixed(n) => n.get(),
    };
    Executor::new(parallelism)
}

/// Resolve further queries from inside a running [`Query::execute`] body.
/// Calling this from anywhere else is a programmer error; see
/// [`TaskContext::resolve`].
pub fn resolve<Q: Query>(task_ctx: &TaskContext<'_>, queries: &[Q]) -> Vec<QueryOutcome<Q::Value>> {
    task_ctx.resolve(queries)
}

/// Remove `keys` and everything that transitively depends on them from the
/// cache (C7, §4.6). Missing keys are silent no-ops. Takes `run_evict_lock`
/// exclusively, so it never runs concurrently with a live run.
pub fn evict(executor: &Executor, keys: &[Key]) {
    let _exclusive = executor.run_evict_lock.write();
    executor.graph.evict(keys);
}

/// A sorted snapshot of every currently-cached (completed) task's rendered
/// key (C1).
pub fn keys(executor: &Executor) -> Vec<String> {
    executor.graph.keys()
}
