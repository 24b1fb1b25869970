//! Scheduled service
//!
//! Repeats `run_one_iteration` on a worker thread according to a
//! `Scheduler`: fixed-rate, fixed-delay, or a custom schedule computed
//! after every iteration. A failing iteration (or a failing custom
//! scheduler) fails the service and stops the loop; no lock is held while
//! user schedule code runs, so a concurrent `stop` can never deadlock
//! against it. Oversized delays saturate into wait-until-stopped instead
//! of overflowing.

use super::cell::{ServiceCell, StopDisposition};
use super::thread::guarded;
use super::{Service, ServiceListener, ServiceState};
use crate::error::{BoxError, FailureCause, KinetError, KinetResult};
use crate::executor::Executor;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// When the next iteration should run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    /// Delay from now until the next iteration
    pub delay: Duration,
}

impl Schedule {
    pub fn after(delay: Duration) -> Self {
        Self { delay }
    }
}

/// Iteration cadence of a scheduled service
pub enum Scheduler {
    /// Fire at `initial`, then every `period` measured target-to-target;
    /// a late iteration runs the next one sooner
    FixedRate { initial: Duration, period: Duration },
    /// Fire at `initial`, then `delay` after each completion
    FixedDelay { initial: Duration, delay: Duration },
    /// Consulted before the first run and after every iteration
    Custom(Box<dyn Fn() -> Result<Schedule, BoxError> + Send + Sync>),
}

impl Scheduler {
    pub fn fixed_rate(initial: Duration, period: Duration) -> Self {
        Scheduler::FixedRate { initial, period }
    }

    pub fn fixed_delay(initial: Duration, delay: Duration) -> Self {
        Scheduler::FixedDelay { initial, delay }
    }

    pub fn custom<F>(next: F) -> Self
    where
        F: Fn() -> Result<Schedule, BoxError> + Send + Sync + 'static,
    {
        Scheduler::Custom(Box::new(next))
    }
}

/// The repeated work of a scheduled service
pub trait IterationWorker: Send + Sync + 'static {
    fn start_up(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// One scheduled iteration
    fn run_one_iteration(&self) -> Result<(), BoxError>;

    fn shut_down(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn raise(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    /// Wait until `deadline` (`None` waits indefinitely). Returns `true`
    /// when the wait ended because a stop was requested.
    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut stopped = self.stopped.lock();
        loop {
            if *stopped {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    self.cond.wait_until(&mut stopped, deadline);
                }
                None => self.cond.wait(&mut stopped),
            }
        }
    }
}

/// Tracks the next due time per scheduler kind
enum Cadence<'s> {
    Rate {
        /// Next target instant; `None` after saturation (wait forever)
        target: Option<Instant>,
        period: Duration,
    },
    Delay {
        deadline: Option<Instant>,
        delay: Duration,
    },
    Custom {
        deadline: Option<Instant>,
        next: &'s (dyn Fn() -> Result<Schedule, BoxError> + Send + Sync),
    },
}

impl<'s> Cadence<'s> {
    fn first(scheduler: &'s Scheduler) -> Result<Self, FailureCause> {
        let now = Instant::now();
        Ok(match scheduler {
            Scheduler::FixedRate { initial, period } => Cadence::Rate {
                target: now.checked_add(*initial),
                period: *period,
            },
            Scheduler::FixedDelay { initial, delay } => Cadence::Delay {
                deadline: now.checked_add(*initial),
                delay: *delay,
            },
            Scheduler::Custom(next) => {
                let schedule = consult(next.as_ref())?;
                Cadence::Custom {
                    deadline: now.checked_add(schedule.delay),
                    next: next.as_ref(),
                }
            }
        })
    }

    fn deadline(&self) -> Option<Instant> {
        match self {
            Cadence::Rate { target, .. } => *target,
            Cadence::Delay { deadline, .. } | Cadence::Custom { deadline, .. } => *deadline,
        }
    }

    /// Advance past a finished iteration
    fn advance(&mut self) -> Result<(), FailureCause> {
        match self {
            Cadence::Rate { target, period } => {
                *target = target.and_then(|t| t.checked_add(*period));
            }
            Cadence::Delay { deadline, delay } => {
                *deadline = Instant::now().checked_add(*delay);
            }
            Cadence::Custom { deadline, next } => {
                let schedule = consult(*next)?;
                *deadline = Instant::now().checked_add(schedule.delay);
            }
        }
        Ok(())
    }
}

/// Run user schedule code with no lock held, folding panics into failures
fn consult(
    next: &(dyn Fn() -> Result<Schedule, BoxError> + Send + Sync),
) -> Result<Schedule, FailureCause> {
    match catch_unwind(AssertUnwindSafe(next)) {
        Ok(Ok(schedule)) => Ok(schedule),
        Ok(Err(err)) => Err(Arc::from(err)),
        Err(payload) => Err(crate::error::panic_cause(payload)),
    }
}

/// A service that repeats an iteration per its scheduler
pub struct ScheduledService {
    cell: Arc<ServiceCell>,
    worker: Arc<dyn IterationWorker>,
    /// Taken exactly once, by the lifecycle of the single start
    scheduler: Mutex<Option<Scheduler>>,
    signal: Arc<StopSignal>,
}

impl ScheduledService {
    pub fn new(
        name: impl Into<String>,
        worker: impl IterationWorker,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            cell: Arc::new(ServiceCell::new(name)),
            worker: Arc::new(worker),
            scheduler: Mutex::new(Some(scheduler)),
            signal: Arc::new(StopSignal::new()),
        }
    }

    fn lifecycle(
        cell: &ServiceCell,
        worker: &dyn IterationWorker,
        scheduler: Scheduler,
        signal: &StopSignal,
    ) {
        if let Err(cause) = guarded(|| worker.start_up()) {
            let _ = cell.notify_failed(cause);
            return;
        }
        let stop_requested = match cell.notify_started() {
            Ok(stop_requested) => stop_requested,
            Err(_) => return,
        };

        if !stop_requested {
            if let Err(cause) = Self::iterate(worker, &scheduler, signal) {
                // An iteration or scheduler failure is terminal on its own;
                // teardown is for clean stops only.
                let _ = cell.notify_failed(cause);
                return;
            }
        }

        match guarded(|| worker.shut_down()) {
            Ok(()) => {
                let _ = cell.notify_stopped();
            }
            Err(cause) => {
                let _ = cell.notify_failed(cause);
            }
        }
    }

    /// Run iterations until a stop is requested; `Err` is an iteration or
    /// scheduler failure.
    fn iterate(
        worker: &dyn IterationWorker,
        scheduler: &Scheduler,
        signal: &StopSignal,
    ) -> Result<(), FailureCause> {
        let mut cadence = Cadence::first(scheduler)?;
        loop {
            if signal.wait_until(cadence.deadline()) {
                return Ok(());
            }
            guarded(|| worker.run_one_iteration())?;
            cadence.advance()?;
        }
    }
}

impl Service for ScheduledService {
    fn name(&self) -> &str {
        self.cell.name()
    }

    fn start(&self) -> KinetResult<()> {
        self.cell.transition_to_starting()?;
        let Some(scheduler) = self.scheduler.lock().take() else {
            return Err(KinetError::IllegalState(format!(
                "service {} already consumed its scheduler",
                self.cell.name()
            )));
        };
        let cell = Arc::clone(&self.cell);
        let worker = Arc::clone(&self.worker);
        let signal = Arc::clone(&self.signal);
        let spawned = std::thread::Builder::new()
            .name(self.cell.name().to_string())
            .spawn(move || Self::lifecycle(&cell, worker.as_ref(), scheduler, &signal));
        if let Err(err) = spawned {
            let cause: FailureCause = Arc::new(err);
            self.cell.notify_failed(cause.clone())?;
            return Err(KinetError::Failed(cause));
        }
        Ok(())
    }

    fn stop(&self) {
        match self.cell.request_stop() {
            StopDisposition::BeginStop | StopDisposition::Deferred => self.signal.raise(),
            StopDisposition::TerminatedFromNew | StopDisposition::AlreadyDone => {}
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

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ticker {
        ticks: Arc<AtomicUsize>,
        observed: channel::Sender<usize>,
        fail_on: Option<usize>,
    }

    impl IterationWorker for Ticker {
        fn run_one_iteration(&self) -> Result<(), BoxError> {
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            self.observed.send(tick).ok();
            if self.fail_on == Some(tick) {
                return Err("iteration failed".into());
            }
            Ok(())
        }
    }

    fn ticker(fail_on: Option<usize>) -> (Ticker, Arc<AtomicUsize>, channel::Receiver<usize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = channel::unbounded();
        (
            Ticker {
                ticks: ticks.clone(),
                observed: tx,
                fail_on,
            },
            ticks,
            rx,
        )
    }

    #[test]
    fn fixed_delay_repeats_until_stopped() {
        let (worker, ticks, rx) = ticker(None);
        let service = ScheduledService::new(
            "tick",
            worker,
            Scheduler::fixed_delay(Duration::ZERO, Duration::from_millis(1)),
        );
        service.start().unwrap();
        service.await_running().unwrap();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        service.stop();
        service.await_terminated().unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn fixed_rate_repeats_until_stopped() {
        let (worker, ticks, rx) = ticker(None);
        let service = ScheduledService::new(
            "rate-tick",
            worker,
            Scheduler::fixed_rate(Duration::ZERO, Duration::from_millis(1)),
        );
        service.start().unwrap();
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        service.stop();
        service.await_terminated().unwrap();
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn failing_iteration_fails_the_service_and_stops_the_loop() {
        let (worker, ticks, rx) = ticker(Some(2));
        let service = ScheduledService::new(
            "failing-tick",
            worker,
            Scheduler::fixed_delay(Duration::ZERO, Duration::from_millis(1)),
        );
        service.start().unwrap();
        assert!(service.await_terminated().is_err());
        assert_eq!(service.state(), ServiceState::Failed);
        // Drain whatever was observed; no tick beyond the failing one.
        drop(rx);
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_custom_scheduler_fails_cleanly_without_deadlocking_stop() {
        struct Once {
            ran: Arc<AtomicUsize>,
        }
        impl IterationWorker for Once {
            fn run_one_iteration(&self) -> Result<(), BoxError> {
                self.ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let ran = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler_calls = calls.clone();
        let service = Arc::new(ScheduledService::new(
            "bad-scheduler",
            Once { ran: ran.clone() },
            Scheduler::custom(move || {
                if scheduler_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Schedule::after(Duration::ZERO))
                } else {
                    Err("no next schedule".into())
                }
            }),
        ));
        service.start().unwrap();
        // Stop concurrently with the scheduler failure; both must settle.
        let stopper = {
            let service = service.clone();
            std::thread::spawn(move || service.stop())
        };
        let result = service.await_terminated_timed(Duration::from_secs(10));
        stopper.join().ok();
        assert!(service.state().is_terminal());
        if service.state() == ServiceState::Failed {
            assert!(result.is_err());
        }
        assert!(ran.load(Ordering::SeqCst) <= 1);
    }

    #[test]
    fn panicking_scheduler_fails_the_service() {
        struct Idle;
        impl IterationWorker for Idle {
            fn run_one_iteration(&self) -> Result<(), BoxError> {
                Ok(())
            }
        }
        let service = ScheduledService::new(
            "panicking-scheduler",
            Idle,
            Scheduler::custom(|| panic!("scheduler panicked")),
        );
        service.start().unwrap();
        assert!(service.await_terminated().is_err());
        assert_eq!(service.state(), ServiceState::Failed);
    }

    #[test]
    fn gigantic_delay_never_iterates_but_stops_promptly() {
        let (worker, ticks, _rx) = ticker(None);
        let service = ScheduledService::new(
            "forever",
            worker,
            Scheduler::fixed_delay(Duration::MAX, Duration::MAX),
        );
        service.start().unwrap();
        service.await_running().unwrap();
        service.stop();
        service
            .await_terminated_timed(Duration::from_secs(10))
            .unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert_eq!(service.state(), ServiceState::Terminated);
    }

    #[test]
    fn stop_during_startup_prevents_iterations() {
        struct SlowStart {
            release: channel::Receiver<()>,
            ticks: Arc<AtomicUsize>,
        }
        impl IterationWorker for SlowStart {
            fn start_up(&self) -> Result<(), BoxError> {
                self.release
                    .recv_timeout(Duration::from_secs(10))
                    .map_err(|e| -> BoxError { Box::new(e) })?;
                Ok(())
            }
            fn run_one_iteration(&self) -> Result<(), BoxError> {
                self.ticks.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        let (release_tx, release_rx) = channel::unbounded();
        let ticks = Arc::new(AtomicUsize::new(0));
        let service = ScheduledService::new(
            "slow-start",
            SlowStart {
                release: release_rx,
                ticks: ticks.clone(),
            },
            Scheduler::fixed_delay(Duration::ZERO, Duration::ZERO),
        );
        service.start().unwrap();
        service.stop();
        release_tx.send(()).ok();
        service.await_terminated().unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 0);
    }
}
