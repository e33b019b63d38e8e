//! Randomized concurrent stress test: many threads issuing random `run`/
//! `evict` calls (some single-query, some batched) against a shared
//! executor, checking only that nothing panics, deadlocks, or produces a
//! value inconsistent with the dependency it was computed from.

use std::fmt;
use std::sync::Arc;

use rand::Rng;

use increc::{evict, new_executor, run, ExecutorOptions, Fatal, Key, Query, RunContext, TaskContext};

const N_KEYS: u32 = 6;
const N_THREADS: usize = 8;
const N_OPS_PER_THREAD: usize = 50;

#[derive(Clone, PartialEq, Eq, Hash)]
struct StressKey(u32);

impl fmt::Display for StressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stress({})", self.0)
    }
}

/// Even keys resolve the next key (mod `N_KEYS`) as a dependency; odd keys
/// are leaves. This gives every run a short dependency chain to race
/// against eviction without ever being able to form a cycle.
#[derive(Clone)]
struct StressQuery(u32);

impl Query for StressQuery {
    type Value = u32;

    fn key(&self) -> Key {
        Key::new(StressKey(self.0))
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> (u32, Option<Fatal>) {
        if self.0 % 2 == 0 {
            let next = (self.0 + 1) % N_KEYS;
            let outcomes = ctx.resolve(&[StressQuery(next)]);
            let dep_value = *outcomes[0].value.as_ref().expect("leaf never fails").as_ref();
            (self.0 + dep_value, None)
        } else {
            (self.0, None)
        }
    }
}

enum Op {
    RunOne(u32),
    RunBatch(u32, u32),
    Evict(u32),
}

fn random_op(rng: &mut impl Rng) -> Op {
    match rng.gen_range(0..10) {
        0..=4 => Op::RunOne(rng.gen_range(0..N_KEYS)),
        5..=7 => Op::RunBatch(rng.gen_range(0..N_KEYS), rng.gen_range(0..N_KEYS)),
        _ => Op::Evict(rng.gen_range(0..N_KEYS)),
    }
}

#[test]
fn concurrent_runs_and_evictions_never_panic_or_disagree_with_their_dependency() {
    let _ = env_logger::builder().is_test(true).try_init();

    let executor = Arc::new(new_executor(ExecutorOptions::default()));
    let ctx = RunContext::new();

    std::thread::scope(|scope| {
        for _ in 0..N_THREADS {
            let executor = executor.clone();
            let ctx = ctx.clone();
            scope.spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..N_OPS_PER_THREAD {
                    match random_op(&mut rng) {
                        Op::RunOne(k) => {
                            if let Ok(results) = run(&ctx, &executor, &[StressQuery(k)]) {
                                check_consistent(k, &results[0]);
                            }
                        }
                        Op::RunBatch(a, b) => {
                            if let Ok(results) = run(&ctx, &executor, &[StressQuery(a), StressQuery(b)]) {
                                check_consistent(a, &results[0]);
                                check_consistent(b, &results[1]);
                            }
                        }
                        Op::Evict(k) => {
                            evict(&executor, &[Key::new(StressKey(k))]);
                        }
                    }
                }
            });
        }
    });
}

fn check_consistent(key: u32, outcome: &increc::RunOutcome<u32>) {
    if let Some(value) = &outcome.value {
        let value = *value.as_ref();
        if key % 2 == 1 {
            assert_eq!(value, key);
        } else {
            assert!(value >= key);
        }
    }
}
