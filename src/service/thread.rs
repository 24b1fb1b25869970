//! Execution-thread service
//!
//! A service whose whole lifecycle is one dedicated worker thread:
//! `start_up`, then `run` until it returns or a stop is requested, then
//! `shut_down`. Hook failures (errors or panics) fail the service; a
//! failing `run` still gets its `shut_down`, and keeps its own cause even
//! when `shut_down` fails too.

use super::cell::{ServiceCell, StopDisposition};
use super::{Service, ServiceListener, ServiceState};
use crate::error::{panic_cause, BoxError, FailureCause, KinetError, KinetResult};
use crate::executor::Executor;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// The hooks a thread service runs on its worker
pub trait ThreadWorker: Send + Sync + 'static {
    /// One-time initialization before the service is `RUNNING`
    fn start_up(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// The body of the service; return to terminate cleanly
    fn run(&self) -> Result<(), BoxError>;

    /// One-time teardown after `run` finishes or fails
    fn shut_down(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Called on the stopping thread when `stop` lands on a running
    /// instance, to nudge `run` into returning
    fn trigger_shutdown(&self) {}
}

/// A service backed by one named worker thread
pub struct ThreadService {
    cell: Arc<ServiceCell>,
    worker: Arc<dyn ThreadWorker>,
}

impl ThreadService {
    pub fn new(name: impl Into<String>, worker: impl ThreadWorker) -> Self {
        Self {
            cell: Arc::new(ServiceCell::new(name)),
            worker: Arc::new(worker),
        }
    }

    fn lifecycle(cell: &ServiceCell, worker: &dyn ThreadWorker) {
        if let Err(cause) = guarded(|| worker.start_up()) {
            let _ = cell.notify_failed(cause);
            return;
        }
        let stop_requested = match cell.notify_started() {
            Ok(stop_requested) => stop_requested,
            Err(_) => return,
        };

        let run_failure = if stop_requested {
            None
        } else {
            guarded(|| worker.run()).err()
        };

        // shut_down runs whenever start_up succeeded; a run failure is the
        // cause that sticks even if teardown fails as well.
        let teardown = guarded(|| worker.shut_down());
        match (run_failure, teardown) {
            (Some(cause), _) | (None, Err(cause)) => {
                let _ = cell.notify_failed(cause);
            }
            (None, Ok(())) => {
                let _ = cell.notify_stopped();
            }
        }
    }
}

/// Run a fallible hook, folding panics into the cause
pub(crate) fn guarded(hook: impl FnOnce() -> Result<(), BoxError>) -> Result<(), FailureCause> {
    match catch_unwind(AssertUnwindSafe(hook)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Arc::from(err)),
        Err(payload) => Err(panic_cause(payload)),
    }
}

impl Service for ThreadService {
    fn name(&self) -> &str {
        self.cell.name()
    }

    fn start(&self) -> KinetResult<()> {
        self.cell.transition_to_starting()?;
        let cell = Arc::clone(&self.cell);
        let worker = Arc::clone(&self.worker);
        let spawned = std::thread::Builder::new()
            .name(self.cell.name().to_string())
            .spawn(move || Self::lifecycle(&cell, worker.as_ref()));
        if let Err(err) = spawned {
            let cause: FailureCause = Arc::new(err);
            self.cell.notify_failed(cause.clone())?;
            return Err(KinetError::Failed(cause));
        }
        Ok(())
    }

    fn stop(&self) {
        match self.cell.request_stop() {
            StopDisposition::BeginStop => self.worker.trigger_shutdown(),
            StopDisposition::TerminatedFromNew
            | StopDisposition::Deferred
            | StopDisposition::AlreadyDone => {}
        }
    }

    fn state(&self) -> ServiceState {
        self.cell.state()
    }

    fn failure_cause(&self) -> Option<FailureCause> {
        self.cell.failure_cause()
    }

    fn await_running(&self) -> KinetResult<()> {
        self.cell.await_running()
    }

    fn await_running_timed(&self, timeout: Duration) -> KinetResult<()> {
        self.cell.await_running_timed(timeout)
    }

    fn await_terminated(&self) -> KinetResult<()> {
        self.cell.await_terminated()
    }

    fn await_terminated_timed(&self, timeout: Duration) -> KinetResult<()> {
        self.cell.await_terminated_timed(timeout)
    }

    fn add_listener(&self, listener: Arc<dyn ServiceListener>, executor: Arc<dyn Executor>) {
        self.cell.add_listener(listener, executor);
    }
}
