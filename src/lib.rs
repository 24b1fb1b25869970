//! Concurrency toolkit for long-lived services and multi-threaded code
//!
//! This crate provides a family of tightly-coupled primitives:
//! - Settable, observable, cancellable promises with combinators
//! - A lifecycle state machine for long-running services plus a fleet manager
//! - A FIFO-serializing wrapper over any executor
//! - A cycle-detecting lock factory that refuses deadlock-prone acquisitions
//! - A token-bucket rate limiter with warm-up and a bounded-time call limiter
//!
//! The toolkit is thread-based: blocking waits park the calling OS thread,
//! tasks run on whatever executor the embedder supplies, and every component
//! is safe under truly concurrent access from arbitrary numbers of threads.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod clock;
pub mod error;
pub mod executor;
pub mod interrupt;
pub mod limiter;
pub mod lock;
pub mod promise;
pub mod service;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BoxError, FailureCause, KinetError, KinetResult, PanicCause};
pub use executor::{DirectExecutor, Executor, Rejected, SerialExecutor, Task, ThreadPool};
pub use interrupt::InterruptToken;
pub use limiter::{RateLimiter, TimeLimiter};
pub use lock::{CycleLock, CycleRwLock, LockFactory, LockOrderError, Policy};
pub use promise::Promise;
pub use service::{
    Service, ServiceListener, ServiceManager, ServiceState, ThreadService,
};
