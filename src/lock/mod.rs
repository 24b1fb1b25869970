//! Cycle-detecting lock factory
//!
//! Locks created by a `LockFactory` are reentrant mutexes (and
//! shared/exclusive pairs) that feed every first acquisition into a
//! process-global acquire-order graph. An acquisition that would complete
//! a cycle is refused, logged, or ignored per the policy of the factory
//! that created the lock being acquired. Factories with explicit ordering
//! additionally check a rank discipline between their own locks.
//!
//! A refused acquisition leaves the underlying lock unacquired.

mod graph;
mod raw;

pub use graph::PotentialDeadlock;

use graph::LockNode;
use raw::{RawReentrantLock, RawSharedLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// What a factory does when an acquisition would complete a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Refuse the acquisition
    Throw,
    /// Log and proceed
    Warn,
    /// Observe nothing
    Disabled,
}

/// Lock-ordering violations
#[derive(Error, Debug, Clone)]
pub enum LockOrderError {
    /// The acquisition would complete an acquire-order cycle. Repeat
    /// detections of the same edge pair carry the same shared cause.
    #[error("potential deadlock: {0}")]
    PotentialDeadlock(Arc<PotentialDeadlock>),

    /// Two distinct locks of the same explicit rank on one thread
    #[error("conflicting lock rank: {0}")]
    ConflictingRank(String),
}

/// An explicit rank for ordered lock factories, typically an enum.
///
/// Ordinals order the ranks; locks must be acquired with ordinals
/// ascending, and two held locks of one rank are never legal.
pub trait LockRank: Copy + Send + Sync + 'static {
    fn ordinal(&self) -> usize;
    fn name(&self) -> &'static str;
}

fn next_factory_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(0);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Factory for cycle-detecting locks
pub struct LockFactory {
    policy: Policy,
}

impl LockFactory {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    /// A reentrant lock participating in cycle detection under `name`
    pub fn new_lock(&self, name: impl Into<String>) -> CycleLock {
        CycleLock {
            node: LockNode::new(name, None),
            policy: self.policy,
            raw: RawReentrantLock::new(),
        }
    }

    /// A shared/exclusive pair; both sides are one graph node
    pub fn new_rw_lock(&self, name: impl Into<String>) -> CycleRwLock {
        CycleRwLock {
            node: LockNode::new(name, None),
            policy: self.policy,
            raw: RawSharedLock::new(),
        }
    }

    /// A factory whose locks carry explicit ranks checked on acquisition
    pub fn with_explicit_ordering<R: LockRank>(policy: Policy) -> OrderedLockFactory<R> {
        OrderedLockFactory {
            policy,
            factory_id: next_factory_id(),
            _marker: std::marker::PhantomData,
        }
    }
}

/// Factory for rank-ordered locks; interoperates with unordered locks
/// through the shared graph
pub struct OrderedLockFactory<R: LockRank> {
    policy: Policy,
    factory_id: u64,
    _marker: std::marker::PhantomData<R>,
}

impl<R: LockRank> OrderedLockFactory<R> {
    pub fn new_lock(&self, rank: R) -> CycleLock {
        CycleLock {
            node: LockNode::new(rank.name(), Some((self.factory_id, rank.ordinal()))),
            policy: self.policy,
            raw: RawReentrantLock::new(),
        }
    }

    pub fn new_rw_lock(&self, rank: R) -> CycleRwLock {
        CycleRwLock {
            node: LockNode::new(rank.name(), Some((self.factory_id, rank.ordinal()))),
            policy: self.policy,
            raw: RawSharedLock::new(),
        }
    }
}

/// Reentrant mutex observed by the acquire-order graph
pub struct CycleLock {
    node: Arc<LockNode>,
    policy: Policy,
    raw: RawReentrantLock,
}

impl CycleLock {
    /// The name the lock was created under
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Acquire, observing lock order first. A detection under the `Throw`
    /// policy refuses the acquisition with nothing held.
    pub fn lock(&self) -> Result<CycleLockGuard<'_>, LockOrderError> {
        let first = !self.raw.held_by_current();
        if first && self.policy != Policy::Disabled {
            graph::about_to_acquire(&self.node, self.policy)?;
        }
        self.raw.lock();
        if first && self.policy != Policy::Disabled {
            graph::push_held(&self.node);
        }
        Ok(CycleLockGuard { lock: self })
    }

    /// Non-blocking acquire; `Ok(None)` when another thread holds the lock
    pub fn try_lock(&self) -> Result<Option<CycleLockGuard<'_>>, LockOrderError> {
        let first = !self.raw.held_by_current();
        if first && self.policy != Policy::Disabled {
            graph::about_to_acquire(&self.node, self.policy)?;
        }
        if !self.raw.try_lock() {
            return Ok(None);
        }
        if first && self.policy != Policy::Disabled {
            graph::push_held(&self.node);
        }
        Ok(Some(CycleLockGuard { lock: self }))
    }
}

/// Hold of a `CycleLock`; releasing the last hold of a thread removes the
/// node from its holder stack
pub struct CycleLockGuard<'l> {
    lock: &'l CycleLock,
}

impl Drop for CycleLockGuard<'_> {
    fn drop(&mut self) {
        if self.lock.raw.unlock() {
            graph::pop_held(self.lock.node.id);
        }
    }
}

/// Shared/exclusive lock observed as a single graph node
pub struct CycleRwLock {
    node: Arc<LockNode>,
    policy: Policy,
    raw: RawSharedLock,
}

impl CycleRwLock {
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Acquire the shared side. Taking it while holding the exclusive
    /// side is a downgrade and observed as reentrant.
    pub fn read(&self) -> Result<CycleReadGuard<'_>, LockOrderError> {
        let first = !self.raw.held_by_current();
        if first && self.policy != Policy::Disabled {
            graph::about_to_acquire(&self.node, self.policy)?;
        }
        self.raw.lock_shared();
        if first && self.policy != Policy::Disabled {
            graph::push_held(&self.node);
        }
        Ok(CycleReadGuard { lock: self })
    }

    /// Acquire the exclusive side
    pub fn write(&self) -> Result<CycleWriteGuard<'_>, LockOrderError> {
        let first = !self.raw.held_by_current();
        if first && self.policy != Policy::Disabled {
            graph::about_to_acquire(&self.node, self.policy)?;
        }
        self.raw.lock_exclusive();
        if first && self.policy != Policy::Disabled {
            graph::push_held(&self.node);
        }
        Ok(CycleWriteGuard { lock: self })
    }
}

pub struct CycleReadGuard<'l> {
    lock: &'l CycleRwLock,
}

impl Drop for CycleReadGuard<'_> {
    fn drop(&mut self) {
        if self.lock.raw.unlock_shared() {
            graph::pop_held(self.lock.node.id);
        }
    }
}

pub struct CycleWriteGuard<'l> {
    lock: &'l CycleRwLock,
}

impl Drop for CycleWriteGuard<'_> {
    fn drop(&mut self) {
        if self.lock.raw.unlock_exclusive() {
            graph::pop_held(self.lock.node.id);
        }
    }
}
