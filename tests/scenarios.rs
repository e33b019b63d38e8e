//! End-to-end scenarios: a small arithmetic query family (`Sum`/`ParseInt`)
//! and a deliberately self-cycling query, exercising memoization,
//! partial/hard failure, and cycle detection together.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use increc::{evict, keys, new_executor, run, ExecutorOptions, Fatal, Key, Query, RunContext, TaskContext};

#[derive(Debug)]
struct NegativeInt(i64);

impl fmt::Display for NegativeInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "negative integer not allowed: {}", self.0)
    }
}

impl StdError for NegativeInt {}

#[derive(Debug)]
struct DependencyFailed(String);

impl fmt::Display for DependencyFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StdError for DependencyFailed {}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ParseIntKey(String);

impl fmt::Display for ParseIntKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ParseInt({})", self.0)
    }
}

#[derive(Clone)]
struct ParseInt(String);

impl Query for ParseInt {
    type Value = i64;

    fn key(&self) -> Key {
        Key::new(ParseIntKey(self.0.clone()))
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> (i64, Option<Fatal>) {
        match self.0.trim().parse::<i64>() {
            Ok(n) if n < 0 => (0, Some(Fatal::Custom(Box::new(NegativeInt(n))))),
            Ok(n) => (n, None),
            Err(_) => {
                ctx.non_fatal(format!("could not parse {:?} as an integer", self.0));
                (0, None)
            }
        }
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct SumKey(String);

impl fmt::Display for SumKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sum({})", self.0)
    }
}

#[derive(Clone)]
struct Sum(String);

impl Query for Sum {
    type Value = i64;

    fn key(&self) -> Key {
        Key::new(SumKey(self.0.clone()))
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> (i64, Option<Fatal>) {
        let parts: Vec<ParseInt> = self.0.split(',').map(|s| ParseInt(s.to_string())).collect();
        let outcomes = ctx.resolve(&parts);

        let mut total = 0;
        for outcome in &outcomes {
            if let Some(fatal) = &outcome.fatal {
                return (total, Some(Fatal::Custom(Box::new(DependencyFailed(fatal.to_string())))));
            }
            total += *outcome.value.as_ref().unwrap().as_ref();
        }
        (total, None)
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CyclicKey {
    modulus: u32,
    step: u32,
}

impl fmt::Display for CyclicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cyclic{{mod={}, step={}}}", self.modulus, self.step)
    }
}

#[derive(Clone)]
struct Cyclic {
    modulus: u32,
    step: u32,
}

impl Query for Cyclic {
    type Value = ();

    fn key(&self) -> Key {
        Key::new(CyclicKey {
            modulus: self.modulus,
            step: self.step,
        })
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> ((), Option<Fatal>) {
        let next = Cyclic {
            modulus: self.modulus,
            step: (self.step + 1) % self.modulus,
        };
        let mut outcomes = ctx.resolve(&[next]);
        let fatal = outcomes.remove(0).fatal.map(|fatal| match fatal.as_ref() {
            Fatal::Cycle(cycle) => Fatal::Cycle(cycle.clone()),
            other => Fatal::Custom(Box::new(DependencyFailed(other.to_string()))),
        });
        ((), fatal)
    }
}

#[test]
fn sum_memoizes_and_reruns_only_the_evicted_leaf() {
    let executor = new_executor(ExecutorOptions::default());
    let ctx = RunContext::new();

    let first = run(&ctx, &executor, &[Sum("1,2,2,3,4".to_string())]).unwrap();
    assert_eq!(*first[0].value.as_ref().unwrap().as_ref(), 12);
    assert!(first[0].fatal.is_none());
    assert!(first[0].non_fatals.is_empty());
    assert!(first[0].changed);

    let second = run(&ctx, &executor, &[Sum("1,2,2,3,4".to_string())]).unwrap();
    assert!(!second[0].changed);
    assert_eq!(*second[0].value.as_ref().unwrap().as_ref(), 12);

    evict(&executor, &[Key::new(ParseIntKey("4".to_string()))]);
    let third = run(&ctx, &executor, &[Sum("1,2,2,3,4".to_string())]).unwrap();
    assert_eq!(*third[0].value.as_ref().unwrap().as_ref(), 12);
    assert!(third[0].changed);

    let rendered = keys(&executor);
    assert!(rendered.contains(&"Sum(1,2,2,3,4)".to_string()));
}

#[test]
fn partial_failure_reports_one_non_fatal_and_treats_it_as_zero() {
    let executor = new_executor(ExecutorOptions::default());
    let ctx = RunContext::new();

    let results = run(&ctx, &executor, &[Sum("1,2,2,oops,4".to_string())]).unwrap();
    assert_eq!(*results[0].value.as_ref().unwrap().as_ref(), 9);
    assert!(results[0].fatal.is_none());
    assert_eq!(results[0].non_fatals.len(), 1);
}

#[test]
fn hard_failure_surfaces_the_first_negative() {
    let executor = new_executor(ExecutorOptions::default());
    let ctx = RunContext::new();

    let results = run(&ctx, &executor, &[Sum("1,2,-3,-4".to_string())]).unwrap();
    let fatal = results[0].fatal.as_ref().expect("expected a fatal");
    assert!(fatal.to_string().contains("-3"));
}

#[test]
fn self_referential_chain_is_detected_as_a_cycle() {
    let executor = new_executor(ExecutorOptions::default());
    let ctx = RunContext::new();

    let results = run(
        &ctx,
        &executor,
        &[Cyclic {
            modulus: 5,
            step: 3,
        }],
    )
    .unwrap();

    let fatal = results[0].fatal.as_ref().expect("expected a cycle fatal");
    match fatal.as_ref() {
        Fatal::Cycle(cycle) => assert_eq!(cycle.path.len(), 6),
        other => panic!("expected Fatal::Cycle, got {:?}", other),
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct SlowKey;

impl fmt::Display for SlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slow")
    }
}

#[derive(Clone)]
struct Slow;

impl Query for Slow {
    type Value = ();

    fn key(&self) -> Key {
        Key::new(SlowKey)
    }

    fn execute(&self, _ctx: &TaskContext<'_>) -> ((), Option<Fatal>) {
        std::thread::sleep(std::time::Duration::from_millis(50));
        ((), None)
    }
}

#[test]
fn cancelling_mid_run_surfaces_the_cause() {
    let executor = new_executor(ExecutorOptions::default());
    let ctx = RunContext::new();

    std::thread::scope(|scope| {
        let canceller = ctx.clone();
        scope.spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            canceller.cancel();
        });

        let result = run(&ctx, &executor, &[Slow]);
        assert!(result.is_err());
    });
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct FanKey(u32);

impl fmt::Display for FanKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fan({})", self.0)
    }
}

#[derive(Clone)]
struct Fan(u32);

impl Query for Fan {
    type Value = u64;

    fn key(&self) -> Key {
        Key::new(FanKey(self.0))
    }

    fn execute(&self, ctx: &TaskContext<'_>) -> (u64, Option<Fatal>) {
        if self.0 == 0 {
            return (1, None);
        }
        let children = [Fan(self.0 - 1), Fan(self.0 - 1)];
        let outcomes = ctx.resolve(&children);
        let total = outcomes.iter().map(|o| *o.value.as_ref().unwrap().as_ref()).sum();
        (total, None)
    }
}

#[test]
fn deep_fan_out_completes_under_low_parallelism() {
    let executor = new_executor(ExecutorOptions::with_parallelism(
        std::num::NonZeroUsize::new(2).unwrap(),
    ));
    let ctx = RunContext::new();

    let results = run(&ctx, &executor, &[Fan(6)]).unwrap();
    assert_eq!(*results[0].value.as_ref().unwrap().as_ref(), 1 << 6);
}

#[test]
fn sixteen_parallel_runs_of_a_fresh_key_agree_on_changed() {
    let executor = Arc::new(new_executor(ExecutorOptions::default()));
    let ctx = RunContext::new();

    // Warm the cache once, then evict so the next wave of runs race to
    // recompute the same key (S5, thundering herd).
    run(&ctx, &executor, &[ParseInt("41".to_string())]).unwrap();
    evict(&executor, &[Key::new(ParseIntKey("41".to_string()))]);

    let changed_count = Arc::new(AtomicUsize::new(0));

    std::thread::scope(|scope| {
        for _ in 0..16 {
            let executor = executor.clone();
            let ctx = ctx.clone();
            let changed_count = changed_count.clone();
            scope.spawn(move || {
                let results = run(&ctx, &executor, &[ParseInt("41".to_string())]).unwrap();
                assert_eq!(*results[0].value.as_ref().unwrap().as_ref(), 41);
                if results[0].changed {
                    changed_count.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(changed_count.load(Ordering::SeqCst), 1);
}
