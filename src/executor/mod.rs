//! Executor abstraction and implementations
//!
//! The toolkit composes with whatever thread pool the embedder supplies;
//! everything that runs callbacks or tasks goes through the `Executor`
//! trait. Provided implementations:
//! - `DirectExecutor` runs tasks inline on the submitting thread
//! - `ThreadPool` is a fixed-size pool over a crossbeam channel
//! - `SerialExecutor` wraps any executor and serializes its tasks (FIFO)

mod serial;

pub use serial::SerialExecutor;

use crate::interrupt;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;

/// A unit of work submitted to an executor
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A refused submission, carrying the task back to the caller
pub struct Rejected {
    /// The task that was not accepted
    pub task: Task,
    /// Why the delegate refused it
    pub reason: String,
}

impl Rejected {
    /// Refuse a task with a reason
    pub fn new(task: Task, reason: impl Into<String>) -> Self {
        Self {
            task,
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Rejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task rejected: {}", self.reason)
    }
}

impl std::error::Error for Rejected {}

/// Something that can run tasks.
///
/// `execute` either accepts the task (it will run exactly once, possibly
/// on the calling thread) or hands it back inside `Rejected`.
pub trait Executor: Send + Sync + fmt::Debug + 'static {
    /// Run or enqueue a task
    fn execute(&self, task: Task) -> Result<(), Rejected>;
}

/// Submit a closure without boxing at the call site
pub fn execute<F>(executor: &dyn Executor, f: F) -> Result<(), Rejected>
where
    F: FnOnce() + Send + 'static,
{
    executor.execute(Box::new(f))
}

/// Runs every task inline on the submitting thread, never rejecting.
///
/// Listener dispatch leans on this contract: a listener attached with a
/// direct executor observes completion before `add_listener` returns.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectExecutor;

impl Executor for DirectExecutor {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        task();
        Ok(())
    }
}

/// Fixed-size thread pool.
///
/// Tasks are distributed over a crossbeam channel to named worker threads.
/// A panicking task is logged and isolated; the worker survives. After
/// `shutdown` every submission is rejected.
pub struct ThreadPool {
    name: String,
    size: usize,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
}

impl ThreadPool {
    /// Create a pool with one worker per CPU
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_size(name, num_cpus::get().max(1))
    }

    /// Create a pool with an explicit worker count
    pub fn with_size(name: impl Into<String>, size: usize) -> Self {
        let name = name.into();
        let size = size.max(1);
        let (tx, rx) = unbounded::<Task>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(size);
        for worker_id in 0..size {
            let rx = rx.clone();
            let thread_name = format!("{name}-{worker_id}");
            let builder = std::thread::Builder::new().name(thread_name.clone());
            let spawned = builder.spawn(move || {
                for task in rx.iter() {
                    if catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!(
                            target: "kinet::executor",
                            worker = %thread_name,
                            "task panicked on pool thread"
                        );
                    }
                    // One task's interrupt must not leak into the next.
                    interrupt::clear_interrupted();
                }
            });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    tracing::error!(target: "kinet::executor", %err, "failed to spawn pool worker");
                }
            }
        }

        Self {
            name,
            size,
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shutdown,
        }
    }

    /// Stop accepting tasks, finish queued ones, and join the workers.
    ///
    /// Idempotent; concurrent submitters race with the flag and lose.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // Dropping the sender disconnects the channel once queued tasks drain.
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::error!(target: "kinet::executor", pool = %self.name, "pool worker panicked");
            }
        }
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) -> Result<(), Rejected> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Rejected::new(task, format!("pool {} is shut down", self.name)));
        }
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => match sender.send(task) {
                Ok(()) => Ok(()),
                Err(send_err) => Err(Rejected::new(
                    send_err.into_inner(),
                    format!("pool {} is disconnected", self.name),
                )),
            },
            None => Err(Rejected::new(task, format!("pool {} is shut down", self.name))),
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        // Disconnect so workers exit; joining here could deadlock a worker
        // that owns the last handle, so workers are left to drain.
        self.shutdown.store(true, Ordering::Release);
        self.sender.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn direct_executor_runs_inline() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let result = execute(&DirectExecutor, move || flag.store(true, Ordering::SeqCst));
        assert!(result.is_ok());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn pool_runs_submitted_tasks() {
        let pool = ThreadPool::with_size("test-pool", 2);
        let (tx, rx) = mpsc::channel();
        for i in 0..4 {
            let tx = tx.clone();
            execute(&pool, move || {
                tx.send(i).ok();
            })
            .ok();
        }
        let mut seen: Vec<i32> = (0..4).map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
        pool.shutdown();
    }

    #[test]
    fn pool_rejects_after_shutdown() {
        let pool = ThreadPool::with_size("closing", 1);
        pool.shutdown();
        let result = execute(&pool, || ());
        assert!(result.is_err());
    }

    #[test]
    fn pool_survives_a_panicking_task() {
        let pool = ThreadPool::with_size("sturdy", 1);
        let count = Arc::new(AtomicUsize::new(0));
        execute(&pool, || panic!("scripted")).ok();
        let count_in_task = count.clone();
        let (tx, rx) = mpsc::channel();
        execute(&pool, move || {
            count_in_task.fetch_add(1, Ordering::SeqCst);
            tx.send(()).ok();
        })
        .ok();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        pool.shutdown();
    }
}
