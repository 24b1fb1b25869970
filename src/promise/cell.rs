//! The settable promise cell
//!
//! A `Promise` is a single-assignment container for one future value:
//! settable once, observable by listeners, awaitable by blocking getters,
//! cancellable, and chainable so that one promise's completion mirrors
//! another's. The cell is one atomic state word; the terminal outcome is
//! written strictly before the terminal tag is published, so any thread
//! that observes a terminal tag can read the outcome with no further
//! synchronization.
//!
//! State space:
//! - `PENDING`: waiters and listeners accumulate
//! - `DELEGATED`: completion will mirror another promise
//! - `COMPLETING`: transient claim held by the one transitioning thread
//! - `SUCCESS` / `FAILURE` / `CANCELLED`: immutable terminals
//!
//! Exactly one claim ever reaches a terminal state; the claim CAS
//! serializes every competing setter and canceller. Accepting a delegation
//! is its own transition out of `PENDING`, so a delegated cell can still
//! be cancelled, and only that cancel performs the terminal transition.
//! Delegation chains complete and cancel through explicit work lists,
//! never recursion, so a chain of 100 000 promises costs constant stack.

use super::stack::DrainStack;
use crate::error::{FailureCause, KinetError, KinetResult};
use crate::executor::{Executor, Task};
use crate::interrupt;
use parking_lot::Mutex;
use std::backtrace::Backtrace;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

const PENDING: u8 = 0;
const DELEGATED: u8 = 1;
const COMPLETING: u8 = 2;
const SUCCESS: u8 = 3;
const FAILURE: u8 = 4;
const CANCELLED: u8 = 5;

/// Terminal value of a promise
pub(crate) enum Outcome<T> {
    Success(T),
    Failure(FailureCause),
    Cancelled {
        interrupted: bool,
        cause: Option<FailureCause>,
    },
}

impl<T: Clone> Clone for Outcome<T> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Success(value) => Outcome::Success(value.clone()),
            Outcome::Failure(cause) => Outcome::Failure(cause.clone()),
            Outcome::Cancelled { interrupted, cause } => Outcome::Cancelled {
                interrupted: *interrupted,
                cause: cause.clone(),
            },
        }
    }
}

impl<T> Outcome<T> {
    fn tag(&self) -> u8 {
        match self {
            Outcome::Success(_) => SUCCESS,
            Outcome::Failure(_) => FAILURE,
            Outcome::Cancelled { .. } => CANCELLED,
        }
    }

    fn cancelled(interrupted: bool) -> Self {
        let cause = if cancellation_cause_enabled() {
            Some(Arc::new(CancellationCause::capture()) as FailureCause)
        } else {
            None
        };
        Outcome::Cancelled { interrupted, cause }
    }
}

/// Synthetic cause recorded on cancellation when `KINET_CANCELLATION_CAUSE`
/// is on, pointing at the cancellation site.
pub struct CancellationCause {
    backtrace: Backtrace,
}

impl CancellationCause {
    fn capture() -> Self {
        Self {
            backtrace: Backtrace::force_capture(),
        }
    }

    /// The captured cancellation-site backtrace
    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }
}

impl fmt::Debug for CancellationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CancellationCause({})", self.backtrace)
    }
}

impl fmt::Display for CancellationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise cancelled at: {}", self.backtrace)
    }
}

impl std::error::Error for CancellationCause {}

pub(crate) fn parse_cause_flag(value: Option<&str>) -> bool {
    value.is_some_and(|v| {
        let v = v.trim();
        v == "1" || v.eq_ignore_ascii_case("true")
    })
}

/// Read once per process, then cached
fn cancellation_cause_enabled() -> bool {
    static FLAG: OnceLock<bool> = OnceLock::new();
    *FLAG.get_or_init(|| {
        parse_cause_flag(std::env::var("KINET_CANCELLATION_CAUSE").ok().as_deref())
    })
}

struct WaiterSlot {
    thread: Mutex<Option<Thread>>,
}

impl WaiterSlot {
    fn new(thread: Thread) -> Arc<Self> {
        Arc::new(Self {
            thread: Mutex::new(Some(thread)),
        })
    }

    fn clear(&self) {
        self.thread.lock().take();
    }

    fn wake(&self) {
        if let Some(thread) = self.thread.lock().take() {
            thread.unpark();
        }
    }
}

enum ListenerEntry<T> {
    /// A user callback and the executor to run it on
    Call {
        task: Task,
        executor: Arc<dyn Executor>,
    },
    /// A promise delegated to this one; completed in the cascade loop
    /// rather than through a callback so chains cost no stack.
    Chain(Weak<Inner<T>>),
}

struct Inner<T> {
    state: AtomicU8,
    /// Written exactly once by the claim holder before the terminal tag is
    /// stored with release ordering; read only behind an acquire load of a
    /// terminal tag.
    outcome: UnsafeCell<Option<Outcome<T>>>,
    /// Target while `DELEGATED`; cleared on completion (chain compression)
    /// so completed chains cannot drop recursively.
    delegate: Mutex<Option<Arc<Inner<T>>>>,
    waiters: DrainStack<Arc<WaiterSlot>>,
    listeners: DrainStack<ListenerEntry<T>>,
    /// Invoked exactly once, by the thread that performs a cancellation.
    cancel_hook: Mutex<Option<Box<dyn FnOnce(bool) + Send>>>,
    /// Consulted by `Debug` while the promise is pending.
    pending_info: Mutex<Option<Box<dyn Fn() -> String + Send>>>,
}

// The `UnsafeCell` follows a single-writer publication protocol (claim CAS,
// write, release store); every other field is itself thread-safe.
unsafe impl<T: Send + Sync> Send for Inner<T> {}
unsafe impl<T: Send + Sync> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // Sever an abandoned delegation chain iteratively; each link is
        // emptied before it drops so no chain depth can overflow the stack.
        let mut cursor = self.delegate.get_mut().take();
        while let Some(link) = cursor {
            cursor = link.delegate.lock().take();
        }
    }
}

/// Single-assignment, observable, cancellable promise.
///
/// Handles are cheap clones sharing one cell. The value type needs `Clone`
/// because chained and aggregated promises hand the same outcome to several
/// observers; wrap expensive values in `Arc` to share them.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Promise<T> {
    /// Create a pending promise
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(PENDING),
                outcome: UnsafeCell::new(None),
                delegate: Mutex::new(None),
                waiters: DrainStack::new(),
                listeners: DrainStack::new(),
                cancel_hook: Mutex::new(None),
                pending_info: Mutex::new(None),
            }),
        }
    }

    /// Create a promise already completed with a value
    pub fn successful(value: T) -> Self {
        let promise = Self::new();
        promise.set(value);
        promise
    }

    /// Create a promise already failed with a cause
    pub fn failed(cause: FailureCause) -> Self {
        let promise = Self::new();
        promise.set_failure_cause(cause);
        promise
    }

    /// Complete with a value. Returns `true` only for the one call that
    /// performs the transition.
    pub fn set(&self, value: T) -> bool {
        self.complete(Outcome::Success(value))
    }

    /// Complete exceptionally
    pub fn set_failure(&self, cause: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> bool {
        self.set_failure_cause(Arc::from(cause.into()))
    }

    /// Complete exceptionally with an already-shared cause
    pub fn set_failure_cause(&self, cause: FailureCause) -> bool {
        self.complete(Outcome::Failure(cause))
    }

    fn complete(&self, outcome: Outcome<T>) -> bool {
        match self.inner.try_claim(false) {
            Some(_) => {
                Inner::publish_and_cascade(Arc::clone(&self.inner), outcome);
                true
            }
            None => false,
        }
    }

    /// Mirror another promise's completion.
    ///
    /// If `other` is already terminal this completes immediately with the
    /// same outcome. Otherwise the cell enters the delegated state:
    /// completion of `other` completes this promise (iteratively, however
    /// long the chain), and cancelling this promise cancels `other` with
    /// the same interrupt flag.
    pub fn set_delegate(&self, other: &Promise<T>) -> bool {
        if let Some(outcome) = other.inner.outcome_clone() {
            return self.complete(outcome);
        }

        {
            // The slot is written under its lock in the same critical
            // section as the state CAS, so a concurrent cancel that claims
            // the delegated state always finds the target installed.
            let mut slot = self.inner.delegate.lock();
            if self
                .inner
                .state
                .compare_exchange(PENDING, DELEGATED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return false;
            }
            *slot = Some(Arc::clone(&other.inner));
        }

        let chain = ListenerEntry::Chain(Arc::downgrade(&self.inner));
        if other.inner.listeners.push(chain).is_err() {
            // The target completed between the check and the subscription.
            if let Some(outcome) = other.inner.outcome_clone() {
                if self.inner.claim_chain() {
                    Inner::publish_and_cascade(Arc::clone(&self.inner), outcome);
                }
            }
        }
        true
    }

    /// Cancel the promise, optionally requesting interruption of whatever
    /// is computing it. Propagates through a delegation chain iteratively.
    /// Returns `true` only for the call that performed this promise's
    /// transition.
    pub fn cancel(&self, interrupt: bool) -> bool {
        let Some(previous) = self.inner.try_claim(true) else {
            return false;
        };
        let mut cursor = if previous == DELEGATED {
            self.inner.delegate.lock().clone()
        } else {
            None
        };
        Inner::publish_and_cascade(Arc::clone(&self.inner), Outcome::cancelled(interrupt));
        self.inner.run_cancel_hook(interrupt);

        // Walk the chain without recursion; stop at the first cell some
        // other completion got to first.
        while let Some(target) = cursor {
            match target.try_claim(true) {
                Some(prev) => {
                    cursor = if prev == DELEGATED {
                        target.delegate.lock().clone()
                    } else {
                        None
                    };
                    Inner::publish_and_cascade(Arc::clone(&target), Outcome::cancelled(interrupt));
                    target.run_cancel_hook(interrupt);
                }
                None => break,
            }
        }
        true
    }

    /// Block until completion
    pub fn get(&self) -> KinetResult<T> {
        self.wait(None, true)
    }

    /// Block until completion or until the timeout expires
    pub fn get_timed(&self, timeout: Duration) -> KinetResult<T> {
        self.wait(Some(timeout), true)
    }

    /// Block until completion, deaf to interruption.
    ///
    /// An interrupt arriving mid-wait is left set on the thread's flag for
    /// the caller to observe afterwards.
    pub fn get_uninterruptibly(&self) -> KinetResult<T> {
        self.wait(None, false)
    }

    /// Timed wait that ignores interruption, preserving the flag
    pub fn get_timed_uninterruptibly(&self, timeout: Duration) -> KinetResult<T> {
        self.wait(Some(timeout), false)
    }

    fn wait(&self, timeout: Option<Duration>, interruptibly: bool) -> KinetResult<T> {
        let token = interrupt::current();
        if interruptibly && token.clear() {
            return Err(KinetError::Interrupted);
        }
        if let Some(result) = self.inner.try_read() {
            return result;
        }

        // A timeout too large for the clock saturates into wait-forever.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        let slot = WaiterSlot::new(thread::current());
        if self.inner.waiters.push(Arc::clone(&slot)).is_err() {
            // Already drained: completion is published or imminent.
            return self.inner.read_spin();
        }

        loop {
            if let Some(result) = self.inner.try_read() {
                slot.clear();
                return result;
            }
            if interruptibly && token.is_set() {
                slot.clear();
                token.clear();
                return Err(KinetError::Interrupted);
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        slot.clear();
                        return match self.inner.try_read() {
                            Some(result) => result,
                            None => Err(KinetError::Timeout),
                        };
                    }
                    thread::park_timeout(deadline - now);
                }
                None => thread::park(),
            }
        }
    }

    /// Non-blocking read: `None` while pending
    pub fn peek(&self) -> Option<KinetResult<T>> {
        self.inner.try_read()
    }

    /// Block for the value, mapping any failure through `E`
    pub fn get_checked<E: CheckedError>(&self) -> Result<T, E> {
        match self.get() {
            Ok(value) => Ok(value),
            Err(KinetError::Failed(cause)) => Err(E::from_cause(cause)),
            Err(KinetError::Cancelled) => Err(E::from_cancelled()),
            Err(KinetError::Interrupted) => Err(E::from_interrupted()),
            Err(other) => Err(E::from_cause(Arc::new(other))),
        }
    }

    /// True once the promise left the pending states
    pub fn is_done(&self) -> bool {
        matches!(
            self.inner.state.load(Ordering::Acquire),
            SUCCESS | FAILURE | CANCELLED
        )
    }

    /// True if the promise completed by cancellation
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == CANCELLED
    }

    /// True if the cancellation requested interruption
    pub fn was_interrupted(&self) -> bool {
        matches!(
            self.inner.outcome_ref(),
            Some(Outcome::Cancelled {
                interrupted: true,
                ..
            })
        )
    }

    /// The synthetic cancellation cause, when cause capture is enabled
    pub fn cancellation_cause(&self) -> Option<FailureCause> {
        match self.inner.outcome_ref() {
            Some(Outcome::Cancelled { cause, .. }) => cause.clone(),
            _ => None,
        }
    }

    /// Attach a completion callback.
    ///
    /// Pending: the callback is queued and fires on `executor` after the
    /// terminal value is published, in attachment order. Already complete:
    /// it is submitted before `add_listener` returns. Callback and executor
    /// misbehavior is logged and never disturbs the promise or its other
    /// listeners.
    pub fn add_listener<F>(&self, callback: F, executor: Arc<dyn Executor>)
    where
        F: FnOnce() + Send + 'static,
    {
        let entry = ListenerEntry::Call {
            task: Box::new(callback),
            executor,
        };
        if let Err(entry) = self.inner.listeners.push(entry) {
            if let ListenerEntry::Call { task, executor } = entry {
                // Completion may still be publishing; listeners must observe
                // a terminal state, so wait out the claim window.
                self.inner.spin_until_terminal();
                dispatch_listener(task, executor);
            }
        }
    }

    /// Install the hook run by the cancelling thread, exactly once, with
    /// the interrupt flag. Install before sharing the promise; a hook
    /// installed after cancellation never runs.
    pub fn set_cancel_hook<F>(&self, hook: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        *self.inner.cancel_hook.lock() = Some(Box::new(hook));
    }

    /// Install the pending-reason hook consulted by `Debug`
    pub fn set_pending_info<F>(&self, info: F)
    where
        F: Fn() -> String + Send + 'static,
    {
        *self.inner.pending_info.lock() = Some(Box::new(info));
    }

    pub(crate) fn outcome(&self) -> Option<Outcome<T>> {
        self.inner.outcome_clone()
    }

    /// Complete with a mirrored outcome, preserving cancellation flags
    pub(crate) fn complete_mirrored(&self, outcome: Outcome<T>) -> bool {
        match outcome {
            Outcome::Cancelled { interrupted, .. } => self.cancel(interrupted),
            other => self.complete(other),
        }
    }

    /// A handle that does not keep the cell alive. Combinators store these
    /// inside listener closures and cancel hooks so an abandoned pipeline
    /// of promises never forms a reference cycle.
    pub(crate) fn downgrade(&self) -> WeakPromise<T> {
        WeakPromise {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning promise handle
pub(crate) struct WeakPromise<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for WeakPromise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

impl<T> WeakPromise<T> {
    pub(crate) fn upgrade(&self) -> Option<Promise<T>> {
        self.inner.upgrade().map(|inner| Promise { inner })
    }
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    /// Claim the right to complete. Returns the pre-claim state, or `None`
    /// when the cell is already claimed or terminal.
    fn try_claim(&self, allow_delegated: bool) -> Option<u8> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let claimable = current == PENDING || (allow_delegated && current == DELEGATED);
            if !claimable {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                COMPLETING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(observed) => current = observed,
            }
        }
    }

    /// Claim specifically the delegated-to-completing edge (chain delivery)
    fn claim_chain(&self) -> bool {
        self.state
            .compare_exchange(DELEGATED, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Publish an outcome on a claimed cell, then drain its waiters and
    /// listeners; delegated parents are completed through the same work
    /// list, so arbitrarily long chains unwind without recursion.
    fn publish_and_cascade(start: Arc<Inner<T>>, outcome: Outcome<T>) {
        let mut work = vec![(start, outcome)];
        while let Some((cell, outcome)) = work.pop() {
            let tag = outcome.tag();
            // Safety: this thread holds the claim (state is COMPLETING), so
            // it is the only writer; readers wait for the release store.
            unsafe {
                *cell.outcome.get() = Some(outcome.clone());
            }
            cell.state.store(tag, Ordering::Release);
            // Chain compression: completed cells never point at delegates.
            cell.delegate.lock().take();

            for waiter in cell.waiters.drain() {
                waiter.wake();
            }
            for entry in cell.listeners.drain() {
                match entry {
                    ListenerEntry::Call { task, executor } => dispatch_listener(task, executor),
                    ListenerEntry::Chain(parent) => {
                        if let Some(parent) = parent.upgrade() {
                            if parent.claim_chain() {
                                work.push((parent, outcome.clone()));
                            }
                        }
                    }
                }
            }
        }
    }

    fn run_cancel_hook(&self, interrupt: bool) {
        if let Some(hook) = self.cancel_hook.lock().take() {
            if catch_unwind(AssertUnwindSafe(|| hook(interrupt))).is_err() {
                tracing::error!(target: "kinet::promise", "cancel hook panicked");
            }
        }
    }

    fn try_read(&self) -> Option<KinetResult<T>> {
        match self.state.load(Ordering::Acquire) {
            SUCCESS | FAILURE | CANCELLED => {}
            _ => return None,
        }
        let outcome = self.outcome_ref()?;
        Some(match outcome {
            Outcome::Success(value) => Ok(value.clone()),
            Outcome::Failure(cause) => Err(KinetError::Failed(cause.clone())),
            Outcome::Cancelled { .. } => Err(KinetError::Cancelled),
        })
    }

    /// Wait out a publication in flight; the claim window is a write and a
    /// store, so this spin is bounded.
    fn read_spin(&self) -> KinetResult<T> {
        loop {
            if let Some(result) = self.try_read() {
                return result;
            }
            std::hint::spin_loop();
        }
    }

    fn spin_until_terminal(&self) {
        loop {
            match self.state.load(Ordering::Acquire) {
                SUCCESS | FAILURE | CANCELLED => return,
                _ => std::hint::spin_loop(),
            }
        }
    }

    fn outcome_ref(&self) -> Option<&Outcome<T>> {
        match self.state.load(Ordering::Acquire) {
            SUCCESS | FAILURE | CANCELLED => {}
            _ => return None,
        }
        // Safety: terminal tag observed with acquire ordering, so the
        // outcome write is visible and no further writes ever happen.
        unsafe { (*self.outcome.get()).as_ref() }
    }

    fn outcome_clone(&self) -> Option<Outcome<T>> {
        self.outcome_ref().cloned()
    }
}

/// Run one listener on its executor, capturing misbehavior
fn dispatch_listener(task: Task, executor: Arc<dyn Executor>) {
    let dispatched = catch_unwind(AssertUnwindSafe(move || executor.execute(task)));
    match dispatched {
        Ok(Ok(())) => {}
        Ok(Err(rejection)) => {
            tracing::warn!(
                target: "kinet::promise",
                reason = %rejection.reason,
                "listener executor rejected a completion callback"
            );
        }
        Err(_) => {
            tracing::error!(target: "kinet::promise", "listener panicked during completion");
        }
    }
}

/// Error types `get_checked` can construct from a failed computation.
///
/// The cancelled and interrupted constructors default to wrapping marker
/// causes; implement them when the error type distinguishes those cases.
pub trait CheckedError: std::error::Error + Sized + Send + Sync + 'static {
    /// Build from the failure cause
    fn from_cause(cause: FailureCause) -> Self;

    /// Build for a cancelled computation
    fn from_cancelled() -> Self {
        Self::from_cause(Arc::new(KinetError::Cancelled))
    }

    /// Build for an interrupted wait
    fn from_interrupted() -> Self {
        Self::from_cause(Arc::new(KinetError::Interrupted))
    }
}

impl<T: fmt::Debug + Clone + Send + Sync + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.state.load(Ordering::Acquire) {
            SUCCESS | FAILURE | CANCELLED => match self.inner.outcome_ref() {
                Some(Outcome::Success(value)) => {
                    write!(f, "Promise[status=SUCCESS, result=[{value:?}]]")
                }
                Some(Outcome::Failure(cause)) => {
                    write!(f, "Promise[status=FAILURE, cause=[{cause}]]")
                }
                Some(Outcome::Cancelled { .. }) => write!(f, "Promise[status=CANCELLED]"),
                None => write!(f, "Promise[status=PENDING]"),
            },
            DELEGATED => write!(f, "Promise[status=PENDING, info=[awaiting delegate]]"),
            _ => {
                let info = {
                    let guard = self.inner.pending_info.lock();
                    guard.as_ref().map(|hook| {
                        catch_unwind(AssertUnwindSafe(|| hook()))
                            .unwrap_or_else(|_| "<info computation failed>".to_string())
                    })
                };
                match info {
                    Some(info) => write!(f, "Promise[status=PENDING, info=[{info}]]"),
                    None => write!(f, "Promise[status=PENDING]"),
                }
            }
        }
    }
}
