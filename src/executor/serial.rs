//! FIFO-serializing executor wrapper
//!
//! Wraps any delegate executor and guarantees:
//! - Tasks run in submission order
//! - At most one task runs at a time, whatever the delegate's parallelism
//! - Tasks run on the delegate's threads, never the submitter's
//!
//! A single worker drains the queue; submissions while it runs are elided
//! into the existing worker. A rejected dispatch removes exactly the
//! rejected caller's task and leaves the rest queued for a later retry.

use super::{Executor, Rejected, Task};
use crate::interrupt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// No task running, queue empty.
const IDLE: u8 = 0;
/// Tasks pending, no worker scheduled on the delegate (a rejected dispatch
/// leaves the queue in this state so a later submission retries).
const QUEUED: u8 = 1;
/// A submitting thread is mid-dispatch; redundant dispatches are elided.
const QUEUING: u8 = 2;
/// The worker is draining the queue.
const RUNNING: u8 = 3;

struct Entry {
    seq: u64,
    label: Option<String>,
    task: Task,
}

struct SerialInner {
    delegate: Arc<dyn Executor>,
    /// Queue and state word share the queue mutex for every transition;
    /// the atomic exists so `Debug` can peek without taking the lock.
    queue: Mutex<VecDeque<Entry>>,
    state: AtomicU8,
    next_seq: AtomicU64,
    running_label: Mutex<Option<String>>,
}

/// The FIFO-serializing wrapper
#[derive(Clone)]
pub struct SerialExecutor {
    inner: Arc<SerialInner>,
}

impl SerialExecutor {
    /// Wrap a delegate executor
    pub fn new(delegate: Arc<dyn Executor>) -> Self {
        Self {
            inner: Arc::new(SerialInner {
                delegate,
                queue: Mutex::new(VecDeque::new()),
                state: AtomicU8::new(IDLE),
                next_seq: AtomicU64::new(0),
                running_label: Mutex::new(None),
            }),
        }
    }

    /// Submit a task with a label the wrapper reports while it runs
    pub fn execute_named(
        &self,
        label: impl Into<String>,
        task: Task,
    ) -> Result<(), Rejected> {
        self.enqueue(Some(label.into()), task)
    }

    /// The label of the task currently running, if any
    pub fn running_task(&self) -> Option<String> {
        self.inner.running_label.lock().clone()
    }

    fn enqueue(&self, label: Option<String>, task: Task) -> Result<(), Rejected> {
        let inner = &self.inner;
        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut queue = inner.queue.lock();
            queue.push_back(Entry { seq, label, task });
            match inner.state.load(Ordering::Relaxed) {
                RUNNING | QUEUING => return Ok(()),
                _ => inner.state.store(QUEUING, Ordering::Relaxed),
            }
        }

        // Dispatch outside the queue lock so a direct-running delegate can
        // re-enter `execute` from the task itself.
        let worker_inner = Arc::clone(inner);
        let dispatched = inner
            .delegate
            .execute(Box::new(move || SerialInner::work(&worker_inner)));

        match dispatched {
            Ok(()) => {
                let queue = inner.queue.lock();
                if inner.state.load(Ordering::Relaxed) == QUEUING {
                    inner.state.store(QUEUED, Ordering::Relaxed);
                }
                drop(queue);
                Ok(())
            }
            Err(rejection) => {
                let mut queue = inner.queue.lock();
                let position = queue.iter().position(|entry| entry.seq == seq);
                let own = position.and_then(|index| queue.remove(index));
                if inner.state.load(Ordering::Relaxed) == QUEUING {
                    let next = if queue.is_empty() { IDLE } else { QUEUED };
                    inner.state.store(next, Ordering::Relaxed);
                }
                drop(queue);
                match own {
                    Some(entry) => Err(Rejected::new(entry.task, rejection.reason)),
                    // The worker got in first and already ran it; the
                    // rejection of the redundant dispatch is then moot.
                    None => Ok(()),
                }
            }
        }
    }
}

impl SerialInner {
    fn work(inner: &Arc<SerialInner>) {
        {
            let queue = inner.queue.lock();
            if inner.state.load(Ordering::Relaxed) == RUNNING {
                // A duplicate worker; the live one owns the queue.
                return;
            }
            inner.state.store(RUNNING, Ordering::Relaxed);
            drop(queue);
        }

        let token = interrupt::current();
        let interrupted_on_entry = token.clear();

        loop {
            let entry = {
                let mut queue = inner.queue.lock();
                match queue.pop_front() {
                    Some(entry) => entry,
                    None => {
                        inner.state.store(IDLE, Ordering::Relaxed);
                        break;
                    }
                }
            };

            *inner.running_label.lock() = entry.label;
            // A prior task's interrupt must not leak into this one.
            token.clear();
            let outcome = catch_unwind(AssertUnwindSafe(entry.task));
            *inner.running_label.lock() = None;

            if outcome.is_err() {
                tracing::error!(
                    target: "kinet::executor",
                    seq = entry.seq,
                    "serialized task panicked; handing the queue to a fresh worker"
                );
                Self::resume_after_panic(inner);
                break;
            }
        }

        if interrupted_on_entry {
            token.set();
        } else {
            token.clear();
        }
    }

    /// A panicking task ends this worker; later tasks must still run, so the
    /// remaining queue is handed to a freshly dispatched worker.
    fn resume_after_panic(inner: &Arc<SerialInner>) {
        {
            let queue = inner.queue.lock();
            if queue.is_empty() {
                inner.state.store(IDLE, Ordering::Relaxed);
                return;
            }
            inner.state.store(QUEUED, Ordering::Relaxed);
            drop(queue);
        }
        let worker_inner = Arc::clone(inner);
        let dispatched = inner
            .delegate
            .execute(Box::new(move || SerialInner::work(&worker_inner)));
        if let Err(rejection) = dispatched {
            tracing::error!(
                target: "kinet::executor",
                reason = %rejection.reason,
                "could not reschedule serialized worker; queue stalls until the next submission"
            );
        }
    }
}

impl Executor for SerialExecutor {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        self.enqueue(None, task)
    }
}

impl fmt::Debug for SerialExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::Relaxed) {
            IDLE => "idle",
            QUEUED => "queued",
            QUEUING => "queuing",
            RUNNING => "running",
            _ => "unknown",
        };
        f.debug_struct("SerialExecutor")
            .field("state", &state)
            .field("pending", &self.inner.queue.lock().len())
            .field("running_task", &self.running_task())
            .field("delegate", &self.inner.delegate)
            .finish()
    }
}
