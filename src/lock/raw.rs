//! Owner-tracked reentrant lock primitives
//!
//! The cycle-detecting wrappers need locks that know which thread holds
//! them: reentrancy must be distinguishable from contention, and a
//! read-while-holding-write downgrade must succeed. Both primitives here
//! are small monitors over `parking_lot`; fairness is whatever the condvar
//! gives.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::thread::{self, ThreadId};

struct ExclusiveState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Reentrant mutual exclusion without data
pub(crate) struct RawReentrantLock {
    state: Mutex<ExclusiveState>,
    cond: Condvar,
}

impl RawReentrantLock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ExclusiveState {
                owner: None,
                depth: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn held_by_current(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    pub(crate) fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.cond.wait(&mut state),
            }
        }
    }

    /// Non-blocking acquire; `false` when another thread holds the lock
    pub(crate) fn try_lock(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Release one hold; `true` when the calling thread no longer holds
    /// the lock at all
    pub(crate) fn unlock(&self) -> bool {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(thread::current().id()));
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.cond.notify_all();
            true
        } else {
            false
        }
    }
}

struct SharedState {
    writer: Option<ThreadId>,
    write_depth: usize,
    readers: HashMap<ThreadId, usize>,
}

/// Shared/exclusive lock with writer reentrancy and write-to-read
/// downgrade (a writer may take and release the read side freely).
/// Read-to-write upgrade is not supported and blocks like any writer.
pub(crate) struct RawSharedLock {
    state: Mutex<SharedState>,
    cond: Condvar,
}

impl RawSharedLock {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SharedState {
                writer: None,
                write_depth: 0,
                readers: HashMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    /// True when the calling thread holds either side
    pub(crate) fn held_by_current(&self) -> bool {
        let me = thread::current().id();
        let state = self.state.lock();
        state.writer == Some(me) || state.readers.contains_key(&me)
    }

    pub(crate) fn lock_exclusive(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            if state.writer == Some(me) {
                state.write_depth += 1;
                return;
            }
            if state.writer.is_none() && state.readers.is_empty() {
                state.writer = Some(me);
                state.write_depth = 1;
                return;
            }
            self.cond.wait(&mut state);
        }
    }

    pub(crate) fn lock_shared(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            // The writer itself may read (downgrade-style reentrancy), and
            // a thread already reading may stack further reads.
            if state.writer == Some(me)
                || state.writer.is_none()
                || state.readers.contains_key(&me)
            {
                *state.readers.entry(me).or_insert(0) += 1;
                return;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Release one write hold; `true` when the thread no longer holds the
    /// lock on either side
    pub(crate) fn unlock_exclusive(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        debug_assert_eq!(state.writer, Some(me));
        state.write_depth = state.write_depth.saturating_sub(1);
        if state.write_depth == 0 {
            state.writer = None;
            self.cond.notify_all();
            !state.readers.contains_key(&me)
        } else {
            false
        }
    }

    /// Release one read hold; `true` when the thread no longer holds the
    /// lock on either side
    pub(crate) fn unlock_shared(&self) -> bool {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let remove = match state.readers.get_mut(&me) {
            Some(count) => {
                *count -= 1;
                *count == 0
            }
            None => {
                debug_assert!(false, "unlock_shared without a read hold");
                false
            }
        };
        if remove {
            state.readers.remove(&me);
            if state.readers.is_empty() {
                self.cond.notify_all();
            }
        }
        state.writer != Some(me) && !state.readers.contains_key(&me)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn reentrant_lock_stacks_and_releases() {
        let lock = RawReentrantLock::new();
        lock.lock();
        lock.lock();
        assert!(lock.held_by_current());
        assert!(!lock.unlock());
        assert!(lock.unlock());
        assert!(!lock.held_by_current());
    }

    #[test]
    fn try_lock_fails_across_threads() {
        let lock = Arc::new(RawReentrantLock::new());
        lock.lock();
        let contender = lock.clone();
        let held_elsewhere = std::thread::spawn(move || contender.try_lock())
            .join()
            .ok();
        assert_eq!(held_elsewhere, Some(false));
        lock.unlock();
    }

    #[test]
    fn exclusive_lock_excludes_other_threads() {
        let lock = Arc::new(RawSharedLock::new());
        lock.lock_exclusive();
        let contender = lock.clone();
        let handle = std::thread::spawn(move || {
            contender.lock_shared();
            contender.unlock_shared();
        });
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handle.is_finished());
        lock.unlock_exclusive();
        handle.join().ok();
    }

    #[test]
    fn writer_may_downgrade_to_read() {
        let lock = RawSharedLock::new();
        lock.lock_exclusive();
        lock.lock_shared();
        assert!(!lock.unlock_exclusive());
        assert!(lock.unlock_shared());
        assert!(!lock.held_by_current());
    }

    #[test]
    fn readers_share() {
        let lock = Arc::new(RawSharedLock::new());
        lock.lock_shared();
        let second = lock.clone();
        let joined = std::thread::spawn(move || {
            second.lock_shared();
            second.unlock_shared();
            true
        })
        .join()
        .ok();
        assert_eq!(joined, Some(true));
        lock.unlock_shared();
    }
}
