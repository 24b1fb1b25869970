//! Fleet manager
//!
//! Coordinates a set of services: starts and stops them together, tracks
//! every member's state through internal listeners, measures startup
//! durations, and raises each fleet event at most once:
//! - `healthy` the first time every service is `RUNNING` at once, and
//!   never if any service ever failed
//! - `stopped` when every service is terminal
//! - `failure` once per service that enters `FAILED`

use super::listener::ListenerSet;
use super::{Service, ServiceListener, ServiceState};
use crate::error::{FailureCause, KinetError, KinetResult};
use crate::executor::{DirectExecutor, Executor};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observer of fleet-level transitions
pub trait ManagerListener: Send + Sync + 'static {
    fn healthy(&self) {}
    fn stopped(&self) {}
    fn failure(&self, _service: &Arc<dyn Service>) {}
}

#[derive(Clone)]
enum ManagerEvent {
    Healthy,
    Stopped,
    Failure(Arc<dyn Service>),
}

fn deliver(listener: &dyn ManagerListener, event: ManagerEvent) {
    match event {
        ManagerEvent::Healthy => listener.healthy(),
        ManagerEvent::Stopped => listener.stopped(),
        ManagerEvent::Failure(service) => listener.failure(&service),
    }
}

struct ManagerInner {
    states: Vec<ServiceState>,
    started_at: Vec<Option<Instant>>,
    startup_times: Vec<Option<Duration>>,
    any_failed: bool,
    healthy_fired: bool,
    stopped_fired: bool,
}

impl ManagerInner {
    fn all_running(&self) -> bool {
        self.states.iter().all(|state| *state == ServiceState::Running)
    }

    fn all_terminal(&self) -> bool {
        self.states.iter().all(|state| state.is_terminal())
    }

    /// Raise any fleet event this mutation made true; call under the monitor
    fn evaluate(&mut self, listeners: &ListenerSet<dyn ManagerListener, ManagerEvent>) {
        if !self.healthy_fired && !self.any_failed && self.all_running() {
            self.healthy_fired = true;
            listeners.enqueue(ManagerEvent::Healthy);
        }
        if !self.stopped_fired && self.all_terminal() {
            self.stopped_fired = true;
            listeners.enqueue(ManagerEvent::Stopped);
        }
    }
}

struct ManagerShared {
    monitor: Mutex<ManagerInner>,
    cond: Condvar,
    listeners: ListenerSet<dyn ManagerListener, ManagerEvent>,
}

impl ManagerShared {
    fn settle(&self) {
        self.cond.notify_all();
        self.listeners.dispatch();
    }
}

/// Watches one member service and folds its transitions into the fleet view
struct FleetWatcher {
    index: usize,
    service: Arc<dyn Service>,
    shared: Arc<ManagerShared>,
}

impl ServiceListener for FleetWatcher {
    fn starting(&self) {
        {
            let mut inner = self.shared.monitor.lock();
            inner.states[self.index] = ServiceState::Starting;
            inner.started_at[self.index] = Some(Instant::now());
        }
        self.shared.settle();
    }

    fn running(&self) {
        {
            let mut inner = self.shared.monitor.lock();
            inner.states[self.index] = ServiceState::Running;
            if let Some(started) = inner.started_at[self.index] {
                inner.startup_times[self.index] = Some(started.elapsed());
            }
            inner.evaluate(&self.shared.listeners);
        }
        self.shared.settle();
    }

    fn stopping(&self, _from: ServiceState) {
        {
            let mut inner = self.shared.monitor.lock();
            inner.states[self.index] = ServiceState::Stopping;
        }
        self.shared.settle();
    }

    fn terminated(&self, _from: ServiceState) {
        {
            let mut inner = self.shared.monitor.lock();
            inner.states[self.index] = ServiceState::Terminated;
            inner.evaluate(&self.shared.listeners);
        }
        self.shared.settle();
    }

    fn failed(&self, _from: ServiceState, _cause: &FailureCause) {
        {
            let mut inner = self.shared.monitor.lock();
            inner.states[self.index] = ServiceState::Failed;
            inner.any_failed = true;
            self.shared
                .listeners
                .enqueue(ManagerEvent::Failure(Arc::clone(&self.service)));
            inner.evaluate(&self.shared.listeners);
        }
        self.shared.settle();
    }
}

/// Coordinator for a fleet of services
pub struct ServiceManager {
    services: Vec<Arc<dyn Service>>,
    shared: Arc<ManagerShared>,
}

impl ServiceManager {
    /// Build a manager over services still in `NEW`
    pub fn new(services: Vec<Arc<dyn Service>>) -> Self {
        let count = services.len();
        let shared = Arc::new(ManagerShared {
            monitor: Mutex::new(ManagerInner {
                states: vec![ServiceState::New; count],
                started_at: vec![None; count],
                startup_times: vec![None; count],
                any_failed: false,
                healthy_fired: false,
                stopped_fired: false,
            }),
            cond: Condvar::new(),
            listeners: ListenerSet::new(deliver),
        });
        for (index, service) in services.iter().enumerate() {
            service.add_listener(
                Arc::new(FleetWatcher {
                    index,
                    service: Arc::clone(service),
                    shared: Arc::clone(&shared),
                }),
                Arc::new(DirectExecutor),
            );
        }
        Self { services, shared }
    }

    /// Attach a fleet listener
    pub fn add_listener(&self, listener: Arc<dyn ManagerListener>, executor: Arc<dyn Executor>) {
        self.shared.listeners.add(listener, executor);
    }

    /// Start every service; fails fast if any member already left `NEW`
    pub fn start(&self) -> KinetResult<()> {
        for service in &self.services {
            if service.state() != ServiceState::New {
                return Err(KinetError::IllegalState(format!(
                    "service {} is {:?}, not NEW",
                    service.name(),
                    service.state()
                )));
            }
        }
        for service in &self.services {
            service.start()?;
        }
        // An empty fleet is healthy and stopped the moment it starts.
        {
            let mut inner = self.shared.monitor.lock();
            inner.evaluate(&self.shared.listeners);
        }
        self.shared.settle();
        Ok(())
    }

    /// Request shutdown of every service
    pub fn stop(&self) {
        for service in &self.services {
            service.stop();
        }
    }

    /// Park until every service is `RUNNING`; a failure anywhere ends the
    /// wait with an error
    pub fn await_healthy(&self) -> KinetResult<()> {
        self.await_healthy_deadline(None)
    }

    pub fn await_healthy_timed(&self, timeout: Duration) -> KinetResult<()> {
        self.await_healthy_deadline(Instant::now().checked_add(timeout))
    }

    fn await_healthy_deadline(&self, deadline: Option<Instant>) -> KinetResult<()> {
        let mut inner = self.shared.monitor.lock();
        loop {
            if inner.any_failed {
                return Err(KinetError::IllegalState(
                    "a service failed before the fleet became healthy".to_string(),
                ));
            }
            if inner.all_running() {
                return Ok(());
            }
            if inner.all_terminal() {
                return Err(KinetError::IllegalState(
                    "the fleet stopped before becoming healthy".to_string(),
                ));
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut inner, deadline).timed_out() {
                        return Err(KinetError::Timeout);
                    }
                }
                None => self.shared.cond.wait(&mut inner),
            }
        }
    }

    /// Park until every service is terminal
    pub fn await_stopped(&self) -> KinetResult<()> {
        self.await_stopped_deadline(None)
    }

    pub fn await_stopped_timed(&self, timeout: Duration) -> KinetResult<()> {
        self.await_stopped_deadline(Instant::now().checked_add(timeout))
    }

    fn await_stopped_deadline(&self, deadline: Option<Instant>) -> KinetResult<()> {
        let mut inner = self.shared.monitor.lock();
        loop {
            if inner.all_terminal() {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.shared.cond.wait_until(&mut inner, deadline).timed_out() {
                        return Err(KinetError::Timeout);
                    }
                }
                None => self.shared.cond.wait(&mut inner),
            }
        }
    }

    /// True when every service is `RUNNING` right now
    pub fn is_healthy(&self) -> bool {
        self.shared.monitor.lock().all_running()
    }

    /// Snapshot of the fleet grouped by state
    pub fn services_by_state(&self) -> BTreeMap<ServiceState, Vec<Arc<dyn Service>>> {
        let inner = self.shared.monitor.lock();
        let mut by_state: BTreeMap<ServiceState, Vec<Arc<dyn Service>>> = BTreeMap::new();
        for (index, state) in inner.states.iter().enumerate() {
            by_state
                .entry(*state)
                .or_default()
                .push(Arc::clone(&self.services[index]));
        }
        by_state
    }

    /// Time each started service spent in `STARTING`
    pub fn startup_times(&self) -> Vec<(String, Duration)> {
        let inner = self.shared.monitor.lock();
        self.services
            .iter()
            .zip(inner.startup_times.iter())
            .filter_map(|(service, time)| {
                time.map(|time| (service.name().to_string(), time))
            })
            .collect()
    }
}
