//! Abstract time for limiters and schedulers
//!
//! Everything in the toolkit that reads or spends wall-clock time goes
//! through the `Clock` trait so tests can substitute a manual clock and
//! drive the exact schedules the limiter contracts promise.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic time source plus the sleep primitive the rate limiter uses.
///
/// Readings are microseconds from an arbitrary epoch. Consumers must only
/// ever compare readings by difference, so a counter close to wraparound
/// stays harmless.
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Current reading in microseconds
    fn micros(&self) -> u64;

    /// Block the calling thread for the given duration, uninterruptibly
    fn sleep(&self, duration: Duration);
}

/// Signed difference between two clock readings, wraparound-safe
pub(crate) fn micros_diff(a: u64, b: u64) -> i64 {
    a.wrapping_sub(b) as i64
}

/// The process monotonic clock
#[derive(Debug, Default)]
pub struct SystemClock {
    _priv: (),
}

impl SystemClock {
    /// Create a system clock
    pub fn new() -> Self {
        Self { _priv: () }
    }

    fn anchor() -> Instant {
        static ANCHOR: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        *ANCHOR.get_or_init(Instant::now)
    }
}

impl Clock for SystemClock {
    fn micros(&self) -> u64 {
        Self::anchor().elapsed().as_micros() as u64
    }

    fn sleep(&self, duration: Duration) {
        // std sleep does not observe the cooperative interrupt flag, which
        // is exactly the uninterruptible wait the limiter contract needs.
        std::thread::sleep(duration);
    }
}

/// Hand-driven clock for tests.
///
/// `sleep` advances the reading instead of blocking, and every sleep is
/// recorded so tests can assert the exact waits a caller paid.
#[derive(Debug)]
pub struct ManualClock {
    now_micros: AtomicU64,
    slept_micros: AtomicU64,
}

impl ManualClock {
    /// Create a manual clock starting at zero
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a manual clock with an explicit starting reading
    pub fn starting_at(micros: u64) -> Self {
        Self {
            now_micros: AtomicU64::new(micros),
            slept_micros: AtomicU64::new(0),
        }
    }

    /// Advance the reading
    pub fn advance(&self, duration: Duration) {
        self.now_micros
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    /// Total time spent in `sleep` since construction
    pub fn total_slept(&self) -> Duration {
        Duration::from_micros(self.slept_micros.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn micros(&self) -> u64 {
        self.now_micros.load(Ordering::SeqCst)
    }

    fn sleep(&self, duration: Duration) {
        let micros = duration.as_micros() as u64;
        self.now_micros.fetch_add(micros, Ordering::SeqCst);
        self.slept_micros.fetch_add(micros, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        clock.sleep(Duration::from_micros(250));
        assert_eq!(clock.micros(), 250);
        assert_eq!(clock.total_slept(), Duration::from_micros(250));
    }

    #[test]
    fn manual_clock_advance_does_not_count_as_sleep() {
        let clock = ManualClock::starting_at(10);
        clock.advance(Duration::from_micros(40));
        assert_eq!(clock.micros(), 50);
        assert_eq!(clock.total_slept(), Duration::ZERO);
    }

    #[test]
    fn diff_survives_wraparound() {
        let before = u64::MAX - 10;
        let after = before.wrapping_add(30);
        assert_eq!(micros_diff(after, before), 30);
        assert_eq!(micros_diff(before, after), -30);
    }

    #[test]
    fn system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.micros();
        let b = clock.micros();
        assert!(b >= a);
    }
}
