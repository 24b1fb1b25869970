//! Executor-submitted promise tasks
//!
//! Bridges a closure and an executor into a promise: the closure runs on
//! the executor's thread and its result, error or panic completes the
//! promise. Cancelling the promise with interruption raises the interrupt
//! flag of whichever thread is running the closure at that moment; a task
//! that has not started yet is skipped entirely.

use super::Promise;
use crate::error::{panic_cause, BoxError, KinetError, KinetResult};
use crate::executor::Executor;
use crate::interrupt::{self, InterruptToken};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Run `task` on `executor`, returning the promise of its result.
///
/// Rejection by the executor is reported to the submitter; nothing runs.
pub fn submit<T, F>(task: F, executor: &dyn Executor) -> KinetResult<Promise<T>>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Result<T, BoxError> + Send + 'static,
{
    let promise = Promise::new();
    let runner: Arc<Mutex<Option<InterruptToken>>> = Arc::new(Mutex::new(None));

    {
        let runner = Arc::clone(&runner);
        promise.set_cancel_hook(move |interrupt| {
            if interrupt {
                if let Some(token) = runner.lock().take() {
                    token.interrupt();
                }
            }
        });
    }

    let completion = promise.clone();
    let submitted = executor.execute(Box::new(move || {
        if completion.is_done() {
            // Cancelled before it started; never run it.
            return;
        }
        *runner.lock() = Some(interrupt::current());
        let outcome = catch_unwind(AssertUnwindSafe(task));
        // Withdraw the token before completing, then drop any stray
        // interrupt so it cannot leak into the worker's next task.
        runner.lock().take();
        interrupt::clear_interrupted();
        match outcome {
            Ok(Ok(value)) => {
                completion.set(value);
            }
            Ok(Err(err)) => {
                completion.set_failure_cause(Arc::from(err));
            }
            Err(payload) => {
                completion.set_failure_cause(panic_cause(payload));
            }
        }
    }));

    match submitted {
        Ok(()) => Ok(promise),
        Err(rejection) => Err(KinetError::Rejected(rejection.reason)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{DirectExecutor, ThreadPool};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn submitted_task_completes_the_promise() {
        let promise = submit(|| Ok("done"), &DirectExecutor).unwrap();
        assert_eq!(promise.get().ok(), Some("done"));
    }

    #[test]
    fn task_error_fails_the_promise() {
        let promise: Promise<i32> = submit(|| Err("broken".into()), &DirectExecutor).unwrap();
        assert!(matches!(promise.get(), Err(KinetError::Failed(_))));
    }

    #[test]
    fn task_panic_fails_the_promise() {
        let promise: Promise<i32> = submit(|| panic!("boom"), &DirectExecutor).unwrap();
        assert!(matches!(promise.get(), Err(KinetError::Failed(_))));
    }

    #[test]
    fn cancelled_before_start_never_runs() {
        let pool = Arc::new(ThreadPool::with_size("task-skip", 1));
        // Jam the single worker so the second submission stays queued.
        let gate = Arc::new(AtomicBool::new(false));
        let hold = gate.clone();
        crate::executor::execute(pool.as_ref(), move || {
            while !hold.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(2));
            }
        })
        .ok();

        let ran = Arc::new(AtomicBool::new(false));
        let witness = ran.clone();
        let promise: Promise<i32> = submit(
            move || {
                witness.store(true, Ordering::SeqCst);
                Ok(1)
            },
            pool.as_ref(),
        )
        .unwrap();
        assert!(promise.cancel(false));
        gate.store(true, Ordering::SeqCst);
        pool.shutdown();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn rejected_submission_is_reported() {
        let pool = ThreadPool::with_size("task-closed", 1);
        pool.shutdown();
        let result: KinetResult<Promise<i32>> = submit(|| Ok(1), &pool);
        assert!(matches!(result, Err(KinetError::Rejected(_))));
    }
}
