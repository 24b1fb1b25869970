//! The lifecycle state machine
//!
//! `ServiceCell` holds the state word, the deferred-shutdown flag, the
//! failure cause and the listener queues of one service. Concrete services
//! drive it through the transition methods and run their hooks outside the
//! monitor; the cell guarantees the transition diagram, the ordering of
//! listener events, and the await semantics.

use super::listener::ListenerSet;
use super::{ServiceListener, ServiceState};
use crate::error::{FailureCause, KinetError, KinetResult};
use crate::executor::Executor;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a `stop` request found, telling the caller which hook to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDisposition {
    /// The service was `NEW`; it is now `TERMINATED` and no hook runs
    TerminatedFromNew,
    /// Startup is in flight; the stop is deferred until `notify_started`
    Deferred,
    /// The service was `RUNNING`; it is now `STOPPING` and the caller
    /// should begin its stop sequence
    BeginStop,
    /// Stopping already, or already terminal; nothing to do
    AlreadyDone,
}

#[derive(Clone)]
enum ServiceEvent {
    Starting,
    Running,
    Stopping(ServiceState),
    Terminated(ServiceState),
    Failed(ServiceState, FailureCause),
}

fn deliver(listener: &dyn ServiceListener, event: ServiceEvent) {
    match event {
        ServiceEvent::Starting => listener.starting(),
        ServiceEvent::Running => listener.running(),
        ServiceEvent::Stopping(from) => listener.stopping(from),
        ServiceEvent::Terminated(from) => listener.terminated(from),
        ServiceEvent::Failed(from, cause) => listener.failed(from, &cause),
    }
}

struct CellInner {
    state: ServiceState,
    /// Stop requested while `STARTING`; resolved by `notify_started`
    shutdown_requested: bool,
    /// The service reached `RUNNING` at least once
    ran: bool,
    failure: Option<FailureCause>,
}

/// Shared lifecycle state machine for service implementations
pub struct ServiceCell {
    name: String,
    monitor: Mutex<CellInner>,
    cond: Condvar,
    listeners: ListenerSet<dyn ServiceListener, ServiceEvent>,
}

impl ServiceCell {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            monitor: Mutex::new(CellInner {
                state: ServiceState::New,
                shutdown_requested: false,
                ran: false,
                failure: None,
            }),
            cond: Condvar::new(),
            listeners: ListenerSet::new(deliver),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ServiceState {
        self.monitor.lock().state
    }

    pub fn failure_cause(&self) -> Option<FailureCause> {
        self.monitor.lock().failure.clone()
    }

    /// Attach a listener; it observes only transitions after this call,
    /// and nothing at all once the service is terminal.
    pub fn add_listener(&self, listener: Arc<dyn ServiceListener>, executor: Arc<dyn Executor>) {
        let guard = self.monitor.lock();
        if !guard.state.is_terminal() {
            self.listeners.add(listener, executor);
        }
    }

    /// `NEW -> STARTING`; the caller then begins its start sequence
    pub fn transition_to_starting(&self) -> KinetResult<()> {
        {
            let mut guard = self.monitor.lock();
            if guard.state != ServiceState::New {
                return Err(KinetError::IllegalState(format!(
                    "service {} cannot start from {:?}",
                    self.name, guard.state
                )));
            }
            guard.state = ServiceState::Starting;
            self.listeners.enqueue(ServiceEvent::Starting);
        }
        self.settle();
        Ok(())
    }

    /// Startup finished. Returns `true` when a stop request arrived during
    /// startup: the state is then `STOPPING` (with the one deferred
    /// `stopping` event emitted) and the caller should proceed straight to
    /// its stop sequence instead of running.
    pub fn notify_started(&self) -> KinetResult<bool> {
        let stop_requested;
        {
            let mut guard = self.monitor.lock();
            if guard.state != ServiceState::Starting {
                return Err(KinetError::IllegalState(format!(
                    "service {} got notify_started in {:?}",
                    self.name, guard.state
                )));
            }
            if guard.shutdown_requested {
                guard.state = ServiceState::Stopping;
                self.listeners
                    .enqueue(ServiceEvent::Stopping(ServiceState::Starting));
                stop_requested = true;
            } else {
                guard.state = ServiceState::Running;
                guard.ran = true;
                self.listeners.enqueue(ServiceEvent::Running);
                stop_requested = false;
            }
        }
        self.settle();
        Ok(stop_requested)
    }

    /// Request a stop; idempotent in every state
    pub fn request_stop(&self) -> StopDisposition {
        let disposition;
        {
            let mut guard = self.monitor.lock();
            disposition = match guard.state {
                ServiceState::New => {
                    guard.state = ServiceState::Terminated;
                    self.listeners
                        .enqueue(ServiceEvent::Terminated(ServiceState::New));
                    StopDisposition::TerminatedFromNew
                }
                ServiceState::Starting => {
                    // However many stops land here, exactly one stopping
                    // event comes out of notify_started.
                    guard.shutdown_requested = true;
                    StopDisposition::Deferred
                }
                ServiceState::Running => {
                    guard.state = ServiceState::Stopping;
                    self.listeners
                        .enqueue(ServiceEvent::Stopping(ServiceState::Running));
                    StopDisposition::BeginStop
                }
                ServiceState::Stopping
                | ServiceState::Terminated
                | ServiceState::Failed => StopDisposition::AlreadyDone,
            };
        }
        self.settle();
        disposition
    }

    /// `STOPPING -> TERMINATED`, or `RUNNING -> TERMINATED` for a worker
    /// that finished on its own
    pub fn notify_stopped(&self) -> KinetResult<()> {
        {
            let mut guard = self.monitor.lock();
            match guard.state {
                ServiceState::Stopping | ServiceState::Running => {
                    let from = guard.state;
                    guard.state = ServiceState::Terminated;
                    self.listeners.enqueue(ServiceEvent::Terminated(from));
                }
                other => {
                    return Err(KinetError::IllegalState(format!(
                        "service {} got notify_stopped in {other:?}",
                        self.name
                    )));
                }
            }
        }
        self.settle();
        Ok(())
    }

    /// Record a failure. The first cause wins; a repeat on an already
    /// failed service is a no-op.
    pub fn notify_failed(&self, cause: FailureCause) -> KinetResult<()> {
        {
            let mut guard = self.monitor.lock();
            match guard.state {
                ServiceState::Starting | ServiceState::Running | ServiceState::Stopping => {
                    let from = guard.state;
                    guard.state = ServiceState::Failed;
                    guard.failure = Some(cause.clone());
                    self.listeners.enqueue(ServiceEvent::Failed(from, cause));
                }
                ServiceState::Failed => return Ok(()),
                other => {
                    return Err(KinetError::IllegalState(format!(
                        "service {} got notify_failed in {other:?}",
                        self.name
                    )));
                }
            }
        }
        self.settle();
        Ok(())
    }

    /// Wake waiters and deliver queued events, outside the monitor
    fn settle(&self) {
        self.cond.notify_all();
        self.listeners.dispatch();
    }

    pub fn await_running(&self) -> KinetResult<()> {
        self.await_running_deadline(None)
    }

    pub fn await_running_timed(&self, timeout: Duration) -> KinetResult<()> {
        self.await_running_deadline(Instant::now().checked_add(timeout))
    }

    fn await_running_deadline(&self, deadline: Option<Instant>) -> KinetResult<()> {
        let mut guard = self.monitor.lock();
        loop {
            if guard.ran {
                return Ok(());
            }
            match guard.state {
                ServiceState::Failed => {
                    return Err(self.failure_error(&guard));
                }
                ServiceState::Stopping | ServiceState::Terminated => {
                    return Err(KinetError::IllegalState(format!(
                        "service {} stopped before running",
                        self.name
                    )));
                }
                _ => {}
            }
            if !self.wait_on(&mut guard, deadline) {
                return Err(KinetError::Timeout);
            }
        }
    }

    pub fn await_terminated(&self) -> KinetResult<()> {
        self.await_terminated_deadline(None)
    }

    pub fn await_terminated_timed(&self, timeout: Duration) -> KinetResult<()> {
        self.await_terminated_deadline(Instant::now().checked_add(timeout))
    }

    fn await_terminated_deadline(&self, deadline: Option<Instant>) -> KinetResult<()> {
        let mut guard = self.monitor.lock();
        loop {
            match guard.state {
                ServiceState::Terminated => return Ok(()),
                ServiceState::Failed => return Err(self.failure_error(&guard)),
                _ => {}
            }
            if !self.wait_on(&mut guard, deadline) {
                return Err(KinetError::Timeout);
            }
        }
    }

    fn failure_error(&self, inner: &CellInner) -> KinetError {
        match &inner.failure {
            Some(cause) => KinetError::Failed(cause.clone()),
            None => KinetError::IllegalState(format!("service {} failed", self.name)),
        }
    }

    /// Returns `false` on deadline expiry
    fn wait_on(
        &self,
        guard: &mut parking_lot::MutexGuard<'_, CellInner>,
        deadline: Option<Instant>,
    ) -> bool {
        match deadline {
            Some(deadline) => !self.cond.wait_until(guard, deadline).timed_out(),
            None => {
                self.cond.wait(guard);
                true
            }
        }
    }
}
