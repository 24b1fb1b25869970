//! Bounded-time call limiter
//!
//! Runs an operation on another thread via the supplied executor and
//! enforces a wall-clock deadline on the caller's wait. On timeout the
//! in-flight task is cancelled with interruption: the worker's interrupt
//! flag is raised so a cooperative task can bail out, while a runaway task
//! may keep running on the pool; the caller gets its timeout either way.

use crate::error::{BoxError, KinetError, KinetResult};
use crate::executor::Executor;
use crate::promise::{self, Promise};
use std::sync::Arc;
use std::time::Duration;

/// Deadline-enforcing invoker
pub struct TimeLimiter {
    executor: Arc<dyn Executor>,
}

impl TimeLimiter {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Run `task` on the executor; wait at most `timeout` for its result.
    /// Expiry cancels the task with interruption and reports `Timeout`.
    pub fn call_with_timeout<T, F>(&self, task: F, timeout: Duration) -> KinetResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        let promise = self.submit(task)?;
        match promise.get_timed(timeout) {
            Ok(value) => Ok(value),
            Err(KinetError::Timeout) => {
                promise.cancel(true);
                Err(KinetError::Timeout)
            }
            Err(other) => Err(other),
        }
    }

    /// Like `call_with_timeout`, but the caller's own interrupt never
    /// aborts the wait; the flag is preserved for the caller to see.
    pub fn call_uninterruptibly_with_timeout<T, F>(
        &self,
        task: F,
        timeout: Duration,
    ) -> KinetResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        let promise = self.submit(task)?;
        match promise.get_timed_uninterruptibly(timeout) {
            Ok(value) => Ok(value),
            Err(KinetError::Timeout) => {
                promise.cancel(true);
                Err(KinetError::Timeout)
            }
            Err(other) => Err(other),
        }
    }

    /// Void variant of `call_with_timeout`
    pub fn run_with_timeout<F>(&self, task: F, timeout: Duration) -> KinetResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_with_timeout(
            move || {
                task();
                Ok(())
            },
            timeout,
        )
    }

    /// Void variant of `call_uninterruptibly_with_timeout`
    pub fn run_uninterruptibly_with_timeout<F>(&self, task: F, timeout: Duration) -> KinetResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_uninterruptibly_with_timeout(
            move || {
                task();
                Ok(())
            },
            timeout,
        )
    }

    fn submit<T, F>(&self, task: F) -> KinetResult<Promise<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Result<T, BoxError> + Send + 'static,
    {
        promise::submit(task, self.executor.as_ref())
    }
}
