//! Combinators over promises
//!
//! Every combinator returns a fresh promise whose completion is a function
//! of one or more input promises. Cancellation flows per combinator:
//! transforms and fallbacks forward a cancel to whichever side is still
//! live, aggregates forward it to every input, and completion-order views
//! never forward it at all.
//!
//! Closures registered on an input hold that input only weakly (the input
//! fires them itself, so it is always live at fire time); inputs hold
//! their outputs strongly until they complete. Abandoned pipelines
//! therefore free themselves instead of forming reference cycles.

use super::cell::{Outcome, WeakPromise};
use super::Promise;
use crate::error::{is_panic, panic_cause, FailureCause};
use crate::executor::{DirectExecutor, Executor};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

fn direct() -> Arc<dyn Executor> {
    Arc::new(DirectExecutor)
}

/// Map a promise's value through `function`, dispatched on `executor`.
///
/// Failure and cancellation of the input are mirrored. A panic in
/// `function` fails the output. Cancelling the output cancels the input
/// with the same interrupt flag, but only while `function` has not
/// started; a running `function` is never interrupted.
pub fn transform<T, U, F>(
    input: &Promise<T>,
    function: F,
    executor: Arc<dyn Executor>,
) -> Promise<U>
where
    T: Clone + Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> U + Send + 'static,
{
    let output = Promise::new();
    let started = Arc::new(AtomicBool::new(false));

    {
        let input = input.downgrade();
        let started = Arc::clone(&started);
        output.set_cancel_hook(move |interrupt| {
            if !started.load(Ordering::Acquire) {
                if let Some(input) = input.upgrade() {
                    input.cancel(interrupt);
                }
            }
        });
    }

    let source = input.downgrade();
    let result = output.clone();
    input.add_listener(
        move || {
            let Some(outcome) = source.upgrade().and_then(|s| s.outcome()) else {
                return;
            };
            match outcome {
                Outcome::Success(value) => {
                    if result.is_cancelled() {
                        return;
                    }
                    started.store(true, Ordering::Release);
                    match catch_unwind(AssertUnwindSafe(move || function(value))) {
                        Ok(mapped) => {
                            result.set(mapped);
                        }
                        Err(payload) => {
                            result.set_failure_cause(panic_cause(payload));
                        }
                    }
                }
                Outcome::Failure(cause) => {
                    result.set_failure_cause(cause);
                }
                Outcome::Cancelled { interrupted, .. } => {
                    result.cancel(interrupted);
                }
            }
        },
        executor,
    );
    output
}

/// Like `transform`, but `function` returns a promise the output then
/// mirrors. Cancelling the output reaches the input while it is still
/// incomplete, and the intermediate promise afterwards.
pub fn transform_async<T, U, F>(
    input: &Promise<T>,
    function: F,
    executor: Arc<dyn Executor>,
) -> Promise<U>
where
    T: Clone + Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
    F: FnOnce(T) -> Promise<U> + Send + 'static,
{
    let output = Promise::new();
    let started = Arc::new(AtomicBool::new(false));

    {
        let input = input.downgrade();
        let started = Arc::clone(&started);
        output.set_cancel_hook(move |interrupt| {
            if !started.load(Ordering::Acquire) {
                if let Some(input) = input.upgrade() {
                    input.cancel(interrupt);
                }
            }
        });
    }

    let source = input.downgrade();
    let result = output.clone();
    input.add_listener(
        move || {
            let Some(outcome) = source.upgrade().and_then(|s| s.outcome()) else {
                return;
            };
            match outcome {
                Outcome::Success(value) => {
                    if result.is_cancelled() {
                        return;
                    }
                    started.store(true, Ordering::Release);
                    match catch_unwind(AssertUnwindSafe(move || function(value))) {
                        Ok(intermediate) => {
                            // A cancel that raced the delegation forwards to
                            // the intermediate instead of being lost.
                            if !result.set_delegate(&intermediate) && result.is_cancelled() {
                                intermediate.cancel(result.was_interrupted());
                            }
                        }
                        Err(payload) => {
                            result.set_failure_cause(panic_cause(payload));
                        }
                    }
                }
                Outcome::Failure(cause) => {
                    result.set_failure_cause(cause);
                }
                Outcome::Cancelled { interrupted, .. } => {
                    result.cancel(interrupted);
                }
            }
        },
        executor,
    );
    output
}

/// Recover from a failed input: `fallback` receives the cause and returns
/// a promise the output mirrors. Cancellation reaches the input before the
/// fallback is engaged and the fallback's promise after.
pub fn with_fallback<T, F>(
    input: &Promise<T>,
    fallback: F,
    executor: Arc<dyn Executor>,
) -> Promise<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce(FailureCause) -> Promise<T> + Send + 'static,
{
    let output = Promise::new();
    let engaged = Arc::new(AtomicBool::new(false));

    {
        let input = input.downgrade();
        let engaged = Arc::clone(&engaged);
        output.set_cancel_hook(move |interrupt| {
            if !engaged.load(Ordering::Acquire) {
                if let Some(input) = input.upgrade() {
                    input.cancel(interrupt);
                }
            }
        });
    }

    let source = input.downgrade();
    let result = output.clone();
    input.add_listener(
        move || {
            let Some(outcome) = source.upgrade().and_then(|s| s.outcome()) else {
                return;
            };
            match outcome {
                Outcome::Success(value) => {
                    result.set(value);
                }
                Outcome::Failure(cause) => {
                    if result.is_cancelled() {
                        return;
                    }
                    engaged.store(true, Ordering::Release);
                    match catch_unwind(AssertUnwindSafe(move || fallback(cause))) {
                        Ok(recovery) => {
                            if !result.set_delegate(&recovery) && result.is_cancelled() {
                                recovery.cancel(result.was_interrupted());
                            }
                        }
                        Err(payload) => {
                            result.set_failure_cause(panic_cause(payload));
                        }
                    }
                }
                Outcome::Cancelled { interrupted, .. } => {
                    result.cancel(interrupted);
                }
            }
        },
        executor,
    );
    output
}

/// Collect every input's value into a list in input order.
///
/// Completes when the last input does; fails as soon as any input fails;
/// a cancelled input cancels the aggregate; cancelling the aggregate
/// cancels every input.
pub fn all_as_list<T>(inputs: Vec<Promise<T>>) -> Promise<Vec<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let output = Promise::new();
    let count = inputs.len();
    if count == 0 {
        output.set(Vec::new());
        return output;
    }

    let slots: Arc<Mutex<Vec<Option<T>>>> =
        Arc::new(Mutex::new((0..count).map(|_| None).collect()));
    let remaining = Arc::new(AtomicUsize::new(count));

    {
        let inputs: Vec<WeakPromise<T>> = inputs.iter().map(Promise::downgrade).collect();
        output.set_cancel_hook(move |interrupt| {
            for input in &inputs {
                if let Some(input) = input.upgrade() {
                    input.cancel(interrupt);
                }
            }
        });
    }

    for (index, input) in inputs.iter().enumerate() {
        let source = input.downgrade();
        let result = output.clone();
        let slots = Arc::clone(&slots);
        let remaining = Arc::clone(&remaining);
        input.add_listener(
            move || {
                let Some(outcome) = source.upgrade().and_then(|s| s.outcome()) else {
                    return;
                };
                match outcome {
                    Outcome::Success(value) => {
                        slots.lock()[index] = Some(value);
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            let values: Vec<T> =
                                slots.lock().iter_mut().filter_map(Option::take).collect();
                            result.set(values);
                        }
                    }
                    Outcome::Failure(cause) => {
                        result.set_failure_cause(cause);
                    }
                    Outcome::Cancelled { interrupted, .. } => {
                        result.cancel(interrupted);
                    }
                }
            },
            direct(),
        );
    }
    output
}

/// Like `all_as_list`, but tolerant: a failed or individually-cancelled
/// input becomes `None` in the output. Only cancelling the aggregate
/// itself cancels the result. Panic-class failures are logged; ordinary
/// failures are swallowed silently.
pub fn successful_as_list<T>(inputs: Vec<Promise<T>>) -> Promise<Vec<Option<T>>>
where
    T: Clone + Send + Sync + 'static,
{
    let output = Promise::new();
    let count = inputs.len();
    if count == 0 {
        output.set(Vec::new());
        return output;
    }

    let slots: Arc<Mutex<Vec<Option<T>>>> =
        Arc::new(Mutex::new((0..count).map(|_| None).collect()));
    let remaining = Arc::new(AtomicUsize::new(count));

    {
        let inputs: Vec<WeakPromise<T>> = inputs.iter().map(Promise::downgrade).collect();
        output.set_cancel_hook(move |interrupt| {
            for input in &inputs {
                if let Some(input) = input.upgrade() {
                    input.cancel(interrupt);
                }
            }
        });
    }

    for (index, input) in inputs.iter().enumerate() {
        let source = input.downgrade();
        let result = output.clone();
        let slots = Arc::clone(&slots);
        let remaining = Arc::clone(&remaining);
        input.add_listener(
            move || {
                let Some(outcome) = source.upgrade().and_then(|s| s.outcome()) else {
                    return;
                };
                match outcome {
                    Outcome::Success(value) => {
                        slots.lock()[index] = Some(value);
                    }
                    Outcome::Failure(cause) => {
                        if is_panic(&cause) {
                            tracing::error!(
                                target: "kinet::promise",
                                input = index,
                                %cause,
                                "input of successful_as_list failed with a panic"
                            );
                        }
                    }
                    Outcome::Cancelled { .. } => {}
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let values = std::mem::take(&mut *slots.lock());
                    // A racing aggregate cancellation wins; set then refuses.
                    result.set(values);
                }
            },
            direct(),
        );
    }
    output
}

/// Return one output promise per input such that the k-th output completes
/// with the outcome of the k-th input *to complete*, whatever its index.
/// Outputs are views: cancelling one never touches any input.
pub fn in_completion_order<T>(inputs: &[Promise<T>]) -> Vec<Promise<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let outputs: Vec<Promise<T>> = inputs.iter().map(|_| Promise::new()).collect();
    let unfilled: Arc<Mutex<VecDeque<Promise<T>>>> =
        Arc::new(Mutex::new(outputs.iter().cloned().collect()));

    for input in inputs {
        let source = input.downgrade();
        let unfilled = Arc::clone(&unfilled);
        input.add_listener(
            move || {
                let Some(outcome) = source.upgrade().and_then(|s| s.outcome()) else {
                    return;
                };
                let next = unfilled.lock().pop_front();
                if let Some(target) = next {
                    // A cancelled output just declines the delivery.
                    target.complete_mirrored(outcome);
                }
            },
            direct(),
        );
    }
    outputs
}

/// Mirror `input`'s completion, but keep cancellation local: cancelling
/// the returned promise never cancels `input`.
pub fn non_cancellation_propagating<T>(input: &Promise<T>) -> Promise<T>
where
    T: Clone + Send + Sync + 'static,
{
    let output = Promise::new();
    let source = input.downgrade();
    let result = output.clone();
    input.add_listener(
        move || {
            if let Some(outcome) = source.upgrade().and_then(|s| s.outcome()) {
                result.complete_mirrored(outcome);
            }
        },
        direct(),
    );
    output
}
