//! Cooperative thread interruption
//!
//! OS threads carry no interrupt status, so the toolkit models one: every
//! thread lazily owns an `InterruptToken`, a shared flag paired with the
//! thread's unpark handle. Interrupting a token wakes the target out of any
//! toolkit parking wait; the target observes the flag, unlinks itself and
//! reports `KinetError::Interrupted`. The serialized executor and the time
//! limiter use tokens to confine one task's interrupt to that task.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, Thread, ThreadId};

/// A handle on one thread's interrupt status.
///
/// Clones share the same flag. Tokens outlive their thread harmlessly;
/// interrupting a finished thread is a no-op.
#[derive(Clone, Debug)]
pub struct InterruptToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug)]
struct TokenInner {
    interrupted: AtomicBool,
    thread: Thread,
}

impl InterruptToken {
    fn new(thread: Thread) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                interrupted: AtomicBool::new(false),
                thread,
            }),
        }
    }

    /// Set the flag and wake the thread out of any park
    pub fn interrupt(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
        self.inner.thread.unpark();
    }

    /// Current flag value, without clearing it
    pub fn is_set(&self) -> bool {
        self.inner.interrupted.load(Ordering::Acquire)
    }

    /// Clear the flag, returning the prior value
    pub fn clear(&self) -> bool {
        self.inner.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Restore the flag without waking the thread.
    ///
    /// Used by uninterruptible waits and by the serialized executor to hand
    /// the entry interrupt state back after draining.
    pub fn set(&self) {
        self.inner.interrupted.store(true, Ordering::Release);
    }
}

fn registry() -> &'static DashMap<ThreadId, InterruptToken> {
    static REGISTRY: OnceLock<DashMap<ThreadId, InterruptToken>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// The calling thread's token, created on first use
pub fn current() -> InterruptToken {
    let current = thread::current();
    registry()
        .entry(current.id())
        .or_insert_with(|| InterruptToken::new(current.clone()))
        .clone()
}

/// True if the calling thread's flag is set; the flag is left in place
pub fn is_interrupted() -> bool {
    current().is_set()
}

/// Clear the calling thread's flag, returning the prior value
pub fn clear_interrupted() -> bool {
    current().clear()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn token_is_shared_within_a_thread() {
        clear_interrupted();
        let token = current();
        assert!(!token.is_set());
        token.interrupt();
        assert!(is_interrupted());
        assert!(clear_interrupted());
        assert!(!is_interrupted());
    }

    #[test]
    fn clear_reports_prior_value() {
        clear_interrupted();
        let token = current();
        assert!(!token.clear());
        token.set();
        assert!(token.clear());
        assert!(!token.is_set());
    }

    #[test]
    fn interrupt_wakes_a_parked_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = thread::spawn(move || {
            let token = current();
            tx.send(token.clone()).ok();
            while !token.is_set() {
                thread::park();
            }
            token.clear();
        });
        let token = rx.recv().ok();
        if let Some(token) = token {
            thread::sleep(Duration::from_millis(20));
            token.interrupt();
        }
        handle.join().ok();
    }

    #[test]
    fn tokens_are_per_thread() {
        let mine = current();
        let theirs = thread::spawn(current).join().ok();
        if let Some(theirs) = theirs {
            theirs.interrupt();
            assert!(!mine.is_set());
        }
    }
}
