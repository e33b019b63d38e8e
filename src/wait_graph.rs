//! Cross-thread cycle detection (the general case of C5).
//!
//! Same-thread cycles (a chain kept on one OS thread by the synchronous
//! dispatch path of §4.3.3 resolving its own key again) are caught cheaply
//! by [`crate::local_state`]'s thread-local query stack. This module
//! handles the rarer case where the cycle only closes across two or more
//! OS threads, each blocked waiting on the other's chain. The structure and
//! algorithm are a direct, near-verbatim port of the wait-for graph used
//! for the same purpose in this crate's lineage, generalized from a
//! database-key index to this crate's [`Key`].

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::key::Key;

static NEXT_RUNTIME_ID: AtomicUsize = AtomicUsize::new(0);

/// Identifies an OS thread currently participating in a resolve chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RuntimeId {
    counter: usize,
}

impl RuntimeId {
    pub(crate) fn fresh() -> Self {
        RuntimeId {
            counter: NEXT_RUNTIME_ID.fetch_add(1, Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
struct Edge {
    id: RuntimeId,
    path: Vec<Key>,
}

/// A `(from -> to)` edge means the thread `from` is blocked waiting for a
/// task whose leader is running on thread `to`. This must stay acyclic or a
/// deadlock results; [`WaitGraph::add_edge`] refuses edges that would close
/// a cycle and reports the rejection to the caller, who turns it into a
/// `Cycle` fatal instead of blocking.
#[derive(Debug, Default)]
pub(crate) struct WaitGraph {
    edges: FxHashMap<RuntimeId, SmallVec<[Edge; 1]>>,
    labels: FxHashMap<Key, SmallVec<[RuntimeId; 4]>>,
}

impl WaitGraph {
    fn can_add_edge(&self, from_id: RuntimeId, to_id: RuntimeId) -> bool {
        !self.find_edge(from_id, to_id, &mut |_| ())
    }

    fn find_edge(&self, from_id: RuntimeId, to_id: RuntimeId, f: &mut impl FnMut(RuntimeId)) -> bool {
        if from_id == to_id {
            return true;
        }
        if let Some(qs) = self.edges.get(&to_id) {
            return qs.iter().any(|q| {
                if self.find_edge(from_id, q.id, f) {
                    f(q.id);
                    true
                } else {
                    false
                }
            });
        }
        false
    }

    /// Attempt to record that `from_id` is now blocked on `to_id` while
    /// waiting for `key`. Returns `false` (and records nothing) if doing so
    /// would close a cycle.
    pub(crate) fn add_edge(
        &mut self,
        from_id: RuntimeId,
        key: &Key,
        to_id: RuntimeId,
        local_path: impl IntoIterator<Item = Key>,
    ) -> bool {
        assert_ne!(from_id, to_id);

        if !self.can_add_edge(from_id, to_id) {
            return false;
        }

        self.edges.entry(from_id).or_default().push(Edge {
            id: to_id,
            path: local_path.into_iter().chain(Some(key.clone())).collect(),
        });
        self.labels.entry(key.clone()).or_default().push(from_id);
        true
    }

    /// Remove the edge(s) that were blocking other threads on `key`'s
    /// leader (`to_id`), called once that leader completes.
    pub(crate) fn remove_edge(&mut self, key: &Key, to_id: RuntimeId) {
        let blocked: SmallVec<[RuntimeId; 4]> = self.labels.remove(key).unwrap_or_default();
        for from_id in &blocked {
            if let Some(edges) = self.edges.get_mut(from_id) {
                if let Some(i) = edges.iter().position(|edge| edge.id == to_id) {
                    edges.swap_remove(i);
                }
                if edges.is_empty() {
                    self.edges.remove(from_id);
                }
            }
        }
    }

    /// Reconstruct the ordered key path of the cycle that would be formed
    /// by `from` waiting on `to` while resolving `key`, given the caller's
    /// own (same-thread) query stack as `local_path`.
    pub(crate) fn get_cycle_path<'a>(
        &'a self,
        key: &'a Key,
        from: RuntimeId,
        to: RuntimeId,
        local_path: impl IntoIterator<Item = &'a Key>,
    ) -> impl Iterator<Item = &'a Key> {
        let mut chain = Vec::new();
        assert!(self.find_edge(from, to, &mut |id| chain.push(id)));
        chain.push(to);

        let mut current = Some(std::slice::from_ref(key));
        let mut last = None;
        let mut local_path = Some(local_path);
        let mut chain_iter = chain.into_iter().rev().peekable();

        std::iter::from_fn(move || match current.take() {
            Some(path) => {
                let id = chain_iter.next()?;
                let link_key = path.last().unwrap();

                current = self.edges.get(&id).and_then(|out_edges| {
                    let next_id = chain_iter.peek()?;
                    let edge = out_edges.iter().find(|edge| edge.id == *next_id)?;
                    Some(
                        edge.path
                            .iter()
                            .rposition(|p| p == link_key)
                            .map(|i| &edge.path[i + 1..])
                            .unwrap_or(&edge.path[..]),
                    )
                });

                if current.is_none() {
                    last = local_path.take().map(|local_path| {
                        local_path
                            .into_iter()
                            .skip_while(move |p| *p != link_key)
                            .skip(1)
                    });
                }

                Some(path)
            }
            None => match &mut last {
                Some(iter) => iter.next().map(std::slice::from_ref),
                None => None,
            },
        })
        .flat_map(|x| x)
    }
}
