//! End-to-end promise scenarios: completion, listeners, cancellation
//! propagation, and delegation chains deep enough to expose recursion.

use kinet::promise::{all_as_list, transform};
use kinet::{DirectExecutor, Executor, KinetError, Promise};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn direct() -> Arc<dyn Executor> {
    Arc::new(DirectExecutor)
}

#[test]
fn listener_added_after_completion_runs_before_the_attach_returns() {
    let promise = Promise::new();
    promise.set("foo");

    let fired = Arc::new(AtomicBool::new(false));
    let witness = fired.clone();
    promise.add_listener(move || witness.store(true, Ordering::SeqCst), direct());

    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(promise.get().ok(), Some("foo"));
}

#[test]
fn cancelling_a_transform_output_cancels_the_input_and_skips_the_function() {
    let input: Promise<i32> = Promise::new();
    let called = Arc::new(AtomicBool::new(false));
    let witness = called.clone();
    let output = transform(
        &input,
        move |value: i32| {
            witness.store(true, Ordering::SeqCst);
            value
        },
        direct(),
    );

    assert!(output.cancel(true));
    assert!(input.is_cancelled());
    assert!(input.was_interrupted());
    assert!(!called.load(Ordering::SeqCst));
}

#[test]
fn all_as_list_preserves_input_order_whatever_the_completion_order() {
    let f1 = Promise::new();
    let f2 = Promise::new();
    let f3 = Promise::new();
    let aggregate = all_as_list(vec![f1.clone(), f2.clone(), f3.clone()]);

    f1.set("A");
    f3.set("C");
    f2.set("B");

    assert_eq!(aggregate.get().ok(), Some(vec!["A", "B", "C"]));
}

#[test]
fn every_listener_fires_exactly_once_across_attach_timings() {
    let promise = Promise::new();
    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let counter = fired.clone();
        promise.add_listener(move || { counter.fetch_add(1, Ordering::SeqCst); }, direct());
    }
    promise.set(1);
    for _ in 0..8 {
        let counter = fired.clone();
        promise.add_listener(move || { counter.fetch_add(1, Ordering::SeqCst); }, direct());
    }
    assert_eq!(fired.load(Ordering::SeqCst), 16);
}

#[test]
fn concurrent_getters_all_observe_the_value() {
    let promise = Promise::new();
    let mut getters = Vec::new();
    for _ in 0..8 {
        let promise = promise.clone();
        getters.push(thread::spawn(move || promise.get().ok()));
    }
    thread::sleep(Duration::from_millis(20));
    promise.set(99);
    for getter in getters {
        assert_eq!(getter.join().ok().flatten(), Some(99));
    }
}

#[test]
fn racing_setters_produce_exactly_one_winner() {
    for _ in 0..50 {
        let promise: Promise<usize> = Promise::new();
        let wins = Arc::new(AtomicUsize::new(0));
        let mut racers = Vec::new();
        for worker in 0..4 {
            let promise = promise.clone();
            let wins = wins.clone();
            racers.push(thread::spawn(move || {
                let won = match worker {
                    0 => promise.set(worker),
                    1 => promise.set_failure("racer"),
                    2 => promise.cancel(false),
                    _ => promise.set_delegate(&Promise::successful(worker)),
                };
                if won {
                    wins.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for racer in racers {
            racer.join().ok();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(promise.is_done());
    }
}

#[test]
fn chain_of_one_hundred_thousand_delegations_completes_without_recursion() {
    const DEPTH: usize = 100_000;
    let chain: Vec<Promise<u64>> = (0..DEPTH).map(|_| Promise::new()).collect();
    for outer in 0..DEPTH - 1 {
        assert!(chain[outer].set_delegate(&chain[outer + 1]));
    }

    assert!(chain[DEPTH - 1].set(7));
    assert_eq!(chain[0].get().ok(), Some(7));
    assert!(chain.iter().all(Promise::is_done));
}

#[test]
fn cancelling_the_outermost_of_a_deep_chain_reaches_the_innermost() {
    const DEPTH: usize = 100_000;
    let chain: Vec<Promise<u64>> = (0..DEPTH).map(|_| Promise::new()).collect();
    for outer in 0..DEPTH - 1 {
        assert!(chain[outer].set_delegate(&chain[outer + 1]));
    }

    assert!(chain[0].cancel(true));
    assert!(chain[0].is_cancelled());
    assert!(chain[DEPTH - 1].is_cancelled());
    assert!(chain[DEPTH - 1].was_interrupted());
}

#[test]
fn cancel_flag_laws_hold() {
    let promise: Promise<i32> = Promise::new();
    assert!(promise.cancel(true));
    assert!(!promise.cancel(false));
    assert!(promise.was_interrupted());

    let promise: Promise<i32> = Promise::new();
    assert!(promise.cancel(false));
    assert!(!promise.cancel(true));
    assert!(!promise.was_interrupted());
}

#[test]
fn timed_get_expires_then_succeeds_after_completion() {
    let promise = Promise::new();
    assert!(matches!(
        promise.get_timed(Duration::from_millis(30)),
        Err(KinetError::Timeout)
    ));
    assert!(!promise.is_done());

    let setter = promise.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        setter.set("eventually");
    });
    assert_eq!(promise.get_timed(Duration::from_secs(5)).ok(), Some("eventually"));
}
