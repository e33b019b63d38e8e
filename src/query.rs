//! The user-facing [`Query`] trait and its type-erased form.

use std::any::Any;
use std::sync::Arc;

use crate::context::TaskContext;
use crate::error::Fatal;
use crate::key::Key;

/// A unit of incremental computation. Implementors provide a stable,
/// hashable [`Key`] and a body that may itself resolve other queries
/// through the [`TaskContext`] it is handed.
///
/// `key()` equality MUST imply that `execute()` would, if run, produce
/// semantically equal output for both instances — the engine relies on
/// this to deduplicate concurrent and repeated requests for the same key.
///
/// `Clone` is required so the scheduler can hand a leader-bound copy to
/// the arena (for storage alongside the task record, per §3's data model)
/// while the caller's own borrowed reference keeps driving execution.
pub trait Query: Clone + Send + Sync {
    /// The query's output type. Must be `'static` so it can be stored
    /// behind the engine's type-erased cache.
    type Value: Send + Sync + 'static;

    fn key(&self) -> Key;

    /// Compute this query's value. `ctx` is the sole way to resolve other
    /// queries, report non-fatal diagnostics, or observe cancellation.
    fn execute(&self, ctx: &TaskContext<'_>) -> (Self::Value, Option<Fatal>);
}

/// Object-safe counterpart of [`Query`] used at the scheduler boundary,
/// where queries of unrelated concrete types and `Value`s are stored
/// side by side in one arena (§9, "dynamic value type erasure").
pub(crate) trait ErasedQuery: Send + Sync {
    fn key(&self) -> Key;
    fn execute_erased(&self, ctx: &TaskContext<'_>) -> (Arc<dyn Any + Send + Sync>, Option<Fatal>);
}

impl<Q: Query> ErasedQuery for Q {
    fn key(&self) -> Key {
        Query::key(self)
    }

    fn execute_erased(&self, ctx: &TaskContext<'_>) -> (Arc<dyn Any + Send + Sync>, Option<Fatal>) {
        let (value, fatal) = Query::execute(self, ctx);
        (Arc::new(value) as Arc<dyn Any + Send + Sync>, fatal)
    }
}

/// The result handed back from [`crate::context::TaskContext::resolve`].
///
/// `value` is populated whenever a leader actually ran and produced one,
/// even alongside a `Some(fatal)` — a query body always returns a value
/// together with its optional fatal. It is `None` only for a synthetic
/// cycle outcome, where no leader ever ran. Cloning is cheap: the
/// underlying value is reference-counted, not copied.
#[derive(Clone)]
pub struct QueryOutcome<V: ?Sized> {
    pub value: Option<Arc<V>>,
    pub fatal: Option<Arc<Fatal>>,
    pub changed: bool,
}

/// The result handed back from the top-level [`crate::run`], additionally
/// carrying the transitively-aggregated non-fatal diagnostics (§4.7 step 7).
#[derive(Clone)]
pub struct RunOutcome<V: ?Sized> {
    pub value: Option<Arc<V>>,
    pub fatal: Option<Arc<Fatal>>,
    pub changed: bool,
    pub non_fatals: Vec<String>,
}

pub(crate) fn downcast<V: Send + Sync + 'static>(value: Arc<dyn Any + Send + Sync>) -> Arc<V> {
    value
        .downcast::<V>()
        .unwrap_or_else(|_| panic!("increc: a Key was reused across incompatible Query::Value types"))
}
