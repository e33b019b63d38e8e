//! The task arena (C1, C2, C3): key registry, task records, and the
//! dependency graph, all behind one coarse `graph_lock` (§4.2, §5).
//!
//! Tasks are allocated in a slab and referenced by the integer handle
//! [`TaskId`] rather than by owning pointers (§9, "self-referential
//! graph"), which keeps eviction a matter of freeing a slot rather than
//! untangling a reference cycle.

use std::any::Any;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{CycleError, Fatal};
use crate::key::Key;
use crate::local_state;
use crate::query::ErasedQuery;
use crate::wait_graph::{RuntimeId, WaitGraph};

/// A handle into the task arena. Carries a generation so that a handle
/// into a freed-then-reused slot is never mistaken for the new occupant.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: u32,
    generation: u32,
}

impl TaskId {
    #[cfg(test)]
    pub(crate) fn for_test(index: u32) -> Self {
        TaskId {
            index,
            generation: 0,
        }
    }
}

pub(crate) struct TaskResultInner {
    pub(crate) run_id: u64,
    pub(crate) value: Arc<dyn Any + Send + Sync>,
    pub(crate) fatal: Option<Arc<Fatal>>,
}

/// A completed task's payload, cheaply shareable between every caller that
/// observes the same `done` signal (I4).
#[derive(Clone)]
pub(crate) struct TaskResult(pub(crate) Arc<TaskResultInner>);

enum TaskState {
    InProgress,
    Done(TaskResult),
}

struct TaskRecord {
    key: Key,
    #[allow(dead_code)]
    query: Box<dyn ErasedQuery>,
    leader_runtime: RuntimeId,
    state: TaskState,
    diagnostics: Vec<String>,
    deps: FxHashSet<TaskId>,
    dependents: FxHashSet<TaskId>,
}

struct Slot {
    generation: u32,
    record: Option<TaskRecord>,
}

struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    registry: FxHashMap<Key, TaskId>,
    wait_graph: WaitGraph,
}

impl Arena {
    fn new() -> Self {
        Arena {
            slots: Vec::new(),
            free: Vec::new(),
            registry: FxHashMap::default(),
            wait_graph: WaitGraph::default(),
        }
    }

    fn get(&self, id: TaskId) -> &TaskRecord {
        let slot = &self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "increc: stale task handle");
        slot.record.as_ref().expect("increc: task slot already evicted")
    }

    /// Like [`Arena::get`], but `None` instead of panicking if `id`'s slot
    /// has since been freed (its leader panicked, or it was evicted).
    fn try_get(&self, id: TaskId) -> Option<&TaskRecord> {
        let slot = &self.slots[id.index as usize];
        if slot.generation != id.generation {
            return None;
        }
        slot.record.as_ref()
    }

    fn get_mut(&mut self, id: TaskId) -> &mut TaskRecord {
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "increc: stale task handle");
        slot.record.as_mut().expect("increc: task slot already evicted")
    }

    fn insert(&mut self, key: Key, query: Box<dyn ErasedQuery>, leader_runtime: RuntimeId) -> TaskId {
        let record = TaskRecord {
            key: key.clone(),
            query,
            leader_runtime,
            state: TaskState::InProgress,
            diagnostics: Vec::new(),
            deps: FxHashSet::default(),
            dependents: FxHashSet::default(),
        };

        let id = if let Some(index) = self.free.pop() {
            let generation = self.slots[index as usize].generation;
            self.slots[index as usize].record = Some(record);
            TaskId { index, generation }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                record: Some(record),
            });
            TaskId {
                index,
                generation: 0,
            }
        };

        self.registry.insert(key, id);
        id
    }

    /// Remove a record and free its slot for reuse. Returns `false` if the
    /// handle was already stale (already evicted).
    fn remove(&mut self, id: TaskId) -> bool {
        let slot = &mut self.slots[id.index as usize];
        if slot.generation != id.generation {
            return false;
        }
        match slot.record.take() {
            Some(record) => {
                self.registry.remove(&record.key);
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index);
                true
            }
            None => false,
        }
    }

    fn link(&mut self, caller: TaskId, target: TaskId) {
        self.get_mut(caller).deps.insert(target);
        self.get_mut(target).dependents.insert(caller);
    }
}

/// What a `resolve_edge` call decided to do with one key, under the graph
/// lock (§4.3.2).
pub(crate) enum ResolveOutcome {
    /// The record was already done; here is its (shared) result.
    Done(TaskId, TaskResult),
    /// This call created the record and is now its leader.
    Execute(TaskId),
    /// The record is in flight and no cycle was found; block on `done`.
    Wait(TaskId),
    /// Waiting on this record would form a cycle.
    Cycle(TaskId, Fatal),
}

/// The single coarse lock guarding task-map insertion, edge mutation, cycle
/// detection, and the result write that precedes `done` (§4.2, §5).
pub(crate) struct GraphState {
    inner: Mutex<Arena>,
    done_condvar: Condvar,
}

impl GraphState {
    pub(crate) fn new() -> Self {
        GraphState {
            inner: Mutex::new(Arena::new()),
            done_condvar: Condvar::new(),
        }
    }

    /// Perform the leader-election / cycle-detection protocol of §4.3.2
    /// for one key, recording an edge from `caller` (if any) to it.
    pub(crate) fn resolve_edge(
        &self,
        caller: Option<TaskId>,
        key: &Key,
        make_query: impl FnOnce() -> Box<dyn ErasedQuery>,
    ) -> ResolveOutcome {
        let this_runtime = local_state::current_runtime_id();
        let mut arena = self.inner.lock();

        let (target, created) = match arena.registry.get(key).copied() {
            Some(id) => (id, false),
            None => {
                let id = arena.insert(key.clone(), make_query(), this_runtime);
                (id, true)
            }
        };

        if let Some(caller) = caller {
            arena.link(caller, target);
        }

        if created {
            log::trace!("task {} created, this thread leads", key);
            return ResolveOutcome::Execute(target);
        }

        if let TaskState::Done(result) = &arena.get(target).state {
            log::trace!("task {} served from cache", key);
            return ResolveOutcome::Done(target, result.clone());
        }

        let target_leader = arena.get(target).leader_runtime;
        if target_leader == this_runtime {
            let path = local_cycle_path(&arena, target);
            log::warn!("same-thread cycle detected waiting on {}", key);
            return ResolveOutcome::Cycle(target, Fatal::Cycle(CycleError { path }));
        }

        let local_path: Vec<Key> = local_state::current_stack()
            .into_iter()
            .map(|id| arena.get(id).key.clone())
            .collect();
        let target_key = arena.get(target).key.clone();

        if arena
            .wait_graph
            .add_edge(this_runtime, &target_key, target_leader, local_path.clone())
        {
            log::trace!("task {} in flight, this thread waits", target_key);
            return ResolveOutcome::Wait(target);
        }

        let path: Vec<Key> = arena
            .wait_graph
            .get_cycle_path(&target_key, this_runtime, target_leader, local_path.iter())
            .cloned()
            .chain(std::iter::once(target_key))
            .collect();
        log::warn!("cross-thread cycle detected waiting on {}", key);
        ResolveOutcome::Cycle(target, Fatal::Cycle(CycleError { path }))
    }

    /// Block until `target` is done, returning its shared result. `None`
    /// means `target`'s leader never reached `done`: it panicked or was
    /// aborted, and its in-progress record was evicted out from under this
    /// waiter (§5, "in-flight leaders... evict their own record rather
    /// than cache a partial/erroneous value").
    pub(crate) fn wait_until_done(&self, target: TaskId) -> Option<TaskResult> {
        let mut arena = self.inner.lock();
        loop {
            match arena.try_get(target).map(|record| &record.state) {
                Some(TaskState::Done(result)) => return Some(result.clone()),
                Some(TaskState::InProgress) => self.done_condvar.wait(&mut arena),
                None => return None,
            }
        }
    }

    /// Leader completion (§4.3.5 step 3): store the result and diagnostics,
    /// signal `done`, and unblock any cross-thread waiters.
    pub(crate) fn complete(&self, target: TaskId, result: TaskResult, diagnostics: Vec<String>) {
        let run_id = result.0.run_id;
        let key = {
            let mut arena = self.inner.lock();
            let leader_runtime = arena.get(target).leader_runtime;
            let record = arena.get_mut(target);
            record.diagnostics = diagnostics;
            record.state = TaskState::Done(result);
            let key = record.key.clone();
            arena.wait_graph.remove_edge(&key, leader_runtime);
            key
        };
        log::trace!("task {} done (run {})", key, run_id);
        self.done_condvar.notify_all();
    }

    /// Evict a panicked/aborted leader's own (never-completed) record so it
    /// is not cached across runs (I7).
    pub(crate) fn evict_in_progress(&self, target: TaskId) {
        let mut arena = self.inner.lock();
        let leader_runtime = arena.get(target).leader_runtime;
        let key = arena.get(target).key.clone();
        arena.wait_graph.remove_edge(&key, leader_runtime);
        arena.remove(target);
        drop(arena);
        log::trace!("task {} evicted after its leader panicked or aborted", key);
        self.done_condvar.notify_all();
    }

    /// C7: evict `keys` and their transitive dependents. Missing keys are
    /// silent no-ops.
    pub(crate) fn evict(&self, keys: &[Key]) {
        let mut arena = self.inner.lock();
        let mut queue: Vec<TaskId> = keys
            .iter()
            .filter_map(|k| arena.registry.get(k).copied())
            .collect();
        let mut collected = FxHashSet::default();
        while let Some(id) = queue.pop() {
            if !collected.insert(id) {
                continue;
            }
            for dependent in arena.get(id).dependents.clone() {
                queue.push(dependent);
            }
        }
        for id in &collected {
            log::trace!("task {} evicted", arena.get(*id).key);
        }
        for id in collected {
            arena.remove(id);
        }
    }

    /// C1's `keys()`: a sorted snapshot of every completed task's rendered
    /// key.
    pub(crate) fn keys(&self) -> Vec<String> {
        let arena = self.inner.lock();
        let mut rendered: Vec<String> = arena
            .slots
            .iter()
            .filter_map(|slot| slot.record.as_ref())
            .filter(|record| matches!(record.state, TaskState::Done(_)))
            .map(|record| record.key.to_string())
            .collect();
        rendered.sort();
        rendered
    }

    /// Walk `roots`' transitive dependency set (BFS over `deps`),
    /// collecting each visited task's own diagnostics exactly once (§4.7
    /// step 7, P8).
    pub(crate) fn collect_transitive_diagnostics(&self, roots: &[TaskId]) -> Vec<String> {
        let arena = self.inner.lock();
        let mut seen = FxHashSet::default();
        let mut queue: Vec<TaskId> = roots.to_vec();
        let mut out = Vec::new();
        while let Some(id) = queue.pop() {
            if !seen.insert(id) {
                continue;
            }
            out.extend(arena.get(id).diagnostics.iter().cloned());
            for dep in &arena.get(id).deps {
                queue.push(*dep);
            }
        }
        out
    }
}

fn local_cycle_path(arena: &Arena, target: TaskId) -> Vec<Key> {
    let stack = local_state::current_stack();
    let start = stack
        .iter()
        .position(|&id| id == target)
        .expect("increc: same-thread cycle target must be on this thread's own query stack");
    let mut path: Vec<Key> = stack[start..].iter().map(|&id| arena.get(id).key.clone()).collect();
    path.push(arena.get(target).key.clone());
    path
}
