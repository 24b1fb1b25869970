//! Service lifecycles and the fleet manager
//!
//! A service is a long-running component with the state machine
//! `NEW -> STARTING -> RUNNING -> STOPPING -> TERMINATED` plus a `FAILED`
//! sink. This module provides:
//! - `ServiceCell`, the shared state machine custom services drive
//! - `ThreadService`, a service whose lifecycle is one worker thread
//! - `ScheduledService`, a service repeating an iteration on a schedule
//! - `ServiceManager`, coordinating a fleet of services

mod cell;
mod listener;
mod manager;
mod scheduled;
mod thread;

pub use cell::{ServiceCell, StopDisposition};
pub use manager::{ManagerListener, ServiceManager};
pub use scheduled::{IterationWorker, Schedule, ScheduledService, Scheduler};
pub use thread::{ThreadService, ThreadWorker};

use crate::error::{FailureCause, KinetResult};
use crate::executor::Executor;
use std::sync::Arc;
use std::time::Duration;

/// Lifecycle states of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServiceState {
    /// Constructed, not yet started
    New,
    /// Startup in progress
    Starting,
    /// Started and operating
    Running,
    /// Shutdown in progress
    Stopping,
    /// Stopped cleanly; terminal
    Terminated,
    /// Stopped by failure; terminal
    Failed,
}

impl ServiceState {
    /// True for the two sink states
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Terminated | ServiceState::Failed)
    }
}

/// Observer of one service's transitions.
///
/// Callbacks arrive in transition order on the executor given at
/// attachment; `stopping` always precedes `terminated` or `failed`, and
/// `running` precedes any stop event when the service ran at all.
pub trait ServiceListener: Send + Sync + 'static {
    fn starting(&self) {}
    fn running(&self) {}
    fn stopping(&self, _from: ServiceState) {}
    fn terminated(&self, _from: ServiceState) {}
    fn failed(&self, _from: ServiceState, _cause: &FailureCause) {}
}

/// The public surface every service exposes
pub trait Service: Send + Sync + 'static {
    /// Stable name, used for thread naming and reporting
    fn name(&self) -> &str;

    /// Begin startup; only valid from `NEW`
    fn start(&self) -> KinetResult<()>;

    /// Request shutdown; idempotent, valid in every state
    fn stop(&self);

    /// Current state
    fn state(&self) -> ServiceState;

    /// The cause recorded when the service failed
    fn failure_cause(&self) -> Option<FailureCause>;

    /// Park until the service has been `RUNNING`; reports failure or a
    /// stop that preempted startup as an error
    fn await_running(&self) -> KinetResult<()>;

    /// Timed variant of `await_running`
    fn await_running_timed(&self, timeout: Duration) -> KinetResult<()>;

    /// Park until the service reaches a terminal state; a failed service
    /// surfaces its cause
    fn await_terminated(&self) -> KinetResult<()>;

    /// Timed variant of `await_terminated`
    fn await_terminated_timed(&self, timeout: Duration) -> KinetResult<()>;

    /// Attach a listener with the executor its callbacks run on
    fn add_listener(&self, listener: Arc<dyn ServiceListener>, executor: Arc<dyn Executor>);
}
