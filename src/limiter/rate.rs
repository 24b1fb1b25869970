//! Token-bucket rate limiter
//!
//! The bucket stores `next_free_ticket_micros`, the earliest instant the
//! next permit becomes free. Reserving permits advances that instant; the
//! caller pays only the debt that existed before its own reservation, so
//! an oversized request runs immediately and the *next* caller absorbs
//! the cost. Sleeping happens outside the state mutex, uninterruptibly,
//! through the clock.
//!
//! The warm-up variant models a cold bucket: stored permits cost more the
//! fuller the store, linearly from the stable interval at empty up to
//! three times it at full, with `max_permits` sized so draining a full
//! store costs exactly the warm-up period. Idling for the warm-up period
//! refills the store completely.

use crate::clock::{micros_diff, Clock, SystemClock};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const MICROS_PER_SECOND: f64 = 1_000_000.0;
/// Per-permit cost of a completely cold bucket, in stable intervals
const COLD_FACTOR: f64 = 3.0;

enum BucketKind {
    Bursty { max_burst_seconds: f64 },
    Warming { warmup_micros: f64, slope: f64 },
}

struct BucketState {
    kind: BucketKind,
    permits_per_second: f64,
    stable_interval_micros: f64,
    max_permits: f64,
    stored_permits: f64,
    next_free_ticket_micros: u64,
}

impl BucketState {
    /// Micros of idleness that grow one stored permit
    fn cool_down_interval(&self) -> f64 {
        match &self.kind {
            BucketKind::Bursty { .. } => self.stable_interval_micros,
            BucketKind::Warming { warmup_micros, .. } => warmup_micros / self.max_permits,
        }
    }

    /// Fold elapsed idle time into stored permits
    fn resync(&mut self, now_micros: u64) {
        let idle = micros_diff(now_micros, self.next_free_ticket_micros);
        if idle > 0 {
            let cool_down = self.cool_down_interval();
            if cool_down > 0.0 {
                let grown = idle as f64 / cool_down;
                self.stored_permits = (self.stored_permits + grown).min(self.max_permits);
            } else {
                self.stored_permits = self.max_permits;
            }
            self.next_free_ticket_micros = now_micros;
        }
    }

    /// Cost of one permit at store level `level`, in micros
    fn cost_at(&self, level: f64) -> f64 {
        match &self.kind {
            BucketKind::Bursty { .. } => 0.0,
            BucketKind::Warming { slope, .. } => {
                self.stable_interval_micros + slope * level
            }
        }
    }

    /// Micros charged for spending `take` permits off a store holding
    /// `stored` (trapezoid under the linear cost curve)
    fn stored_permits_to_wait(&self, stored: f64, take: f64) -> f64 {
        match &self.kind {
            BucketKind::Bursty { .. } => 0.0,
            BucketKind::Warming { .. } => {
                take * (self.cost_at(stored) + self.cost_at(stored - take)) / 2.0
            }
        }
    }

    /// Reserve `permits`, returning the pre-reservation free instant:
    /// the wait *this* caller pays. The advance lands on the next caller.
    fn reserve(&mut self, permits: f64, now_micros: u64) -> u64 {
        self.resync(now_micros);
        let free_at = self.next_free_ticket_micros;
        let from_store = permits.min(self.stored_permits);
        let fresh = permits - from_store;
        let wait = self.stored_permits_to_wait(self.stored_permits, from_store)
            + fresh * self.stable_interval_micros;
        if wait.is_finite() {
            self.next_free_ticket_micros =
                self.next_free_ticket_micros.wrapping_add(wait.round() as u64);
        }
        self.stored_permits -= from_store;
        free_at
    }

    fn apply_rate(&mut self, permits_per_second: f64, now_micros: u64) {
        self.resync(now_micros);
        self.permits_per_second = permits_per_second;
        let stable_interval = MICROS_PER_SECOND / permits_per_second;
        self.stable_interval_micros = stable_interval;
        let old_max = self.max_permits;
        match &mut self.kind {
            BucketKind::Bursty { max_burst_seconds } => {
                self.max_permits = *max_burst_seconds * permits_per_second;
                self.stored_permits = if old_max == f64::INFINITY {
                    self.max_permits
                } else if old_max == 0.0 {
                    0.0
                } else {
                    self.stored_permits * self.max_permits / old_max
                };
            }
            BucketKind::Warming {
                warmup_micros,
                slope,
            } => {
                self.max_permits = 0.5 * *warmup_micros / stable_interval;
                let cold_interval = COLD_FACTOR * stable_interval;
                *slope = (cold_interval - stable_interval) / self.max_permits;
                self.stored_permits = if old_max == 0.0 || old_max == f64::INFINITY {
                    // Construction and infinite-rate transitions start cold.
                    self.max_permits
                } else {
                    self.stored_permits * self.max_permits / old_max
                };
            }
        }
    }
}

/// Token-bucket rate gate
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// A limiter allowing `permits_per_second`, able to burst one second
    /// of unused capacity
    pub fn new(permits_per_second: f64) -> Self {
        Self::new_with_clock(permits_per_second, Arc::new(SystemClock::new()))
    }

    /// `new` with an explicit clock
    pub fn new_with_clock(permits_per_second: f64, clock: Arc<dyn Clock>) -> Self {
        Self::build(
            BucketKind::Bursty {
                max_burst_seconds: 1.0,
            },
            permits_per_second,
            clock,
        )
    }

    /// A limiter that warms up: after idleness it hands out permits more
    /// slowly, ramping to the stable rate over `warmup`
    pub fn with_warmup(permits_per_second: f64, warmup: Duration) -> Self {
        Self::warmup_with_clock(permits_per_second, warmup, Arc::new(SystemClock::new()))
    }

    /// `with_warmup` with an explicit clock
    pub fn warmup_with_clock(
        permits_per_second: f64,
        warmup: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::build(
            BucketKind::Warming {
                warmup_micros: warmup.as_micros() as f64,
                slope: 0.0,
            },
            permits_per_second,
            clock,
        )
    }

    fn build(kind: BucketKind, permits_per_second: f64, clock: Arc<dyn Clock>) -> Self {
        assert!(
            permits_per_second > 0.0,
            "rate must be positive, got {permits_per_second}"
        );
        let now = clock.micros();
        let mut state = BucketState {
            kind,
            permits_per_second,
            stable_interval_micros: 0.0,
            max_permits: 0.0,
            stored_permits: 0.0,
            next_free_ticket_micros: now,
        };
        state.apply_rate(permits_per_second, now);
        Self {
            clock,
            state: Mutex::new(state),
        }
    }

    /// Acquire `permits`, sleeping as long as the bucket demands.
    /// Returns the seconds actually slept.
    pub fn acquire(&self, permits: u32) -> f64 {
        let wait_micros = self.reserve_wait(permits);
        if wait_micros > 0 {
            self.clock.sleep(Duration::from_micros(wait_micros));
        }
        wait_micros as f64 / MICROS_PER_SECOND
    }

    /// Acquire only if the required wait fits in `timeout`; a refusal
    /// leaves the bucket untouched
    pub fn try_acquire(&self, permits: u32, timeout: Duration) -> bool {
        let wait_micros = {
            let mut state = self.state.lock();
            let now = self.clock.micros();
            state.resync(now);
            let debt = micros_diff(state.next_free_ticket_micros, now).max(0) as u128;
            if debt > timeout.as_micros() {
                return false;
            }
            let free_at = state.reserve(f64::from(permits.max(1)), now);
            micros_diff(free_at, now).max(0) as u64
        };
        if wait_micros > 0 {
            self.clock.sleep(Duration::from_micros(wait_micros));
        }
        true
    }

    fn reserve_wait(&self, permits: u32) -> u64 {
        let mut state = self.state.lock();
        let now = self.clock.micros();
        let free_at = state.reserve(f64::from(permits.max(1)), now);
        micros_diff(free_at, now).max(0) as u64
    }

    /// Change the rate. Debt already on the books is settled at the rate
    /// it was incurred at; only subsequent reservations use the new rate.
    pub fn set_rate(&self, permits_per_second: f64) {
        assert!(
            permits_per_second > 0.0,
            "rate must be positive, got {permits_per_second}"
        );
        let mut state = self.state.lock();
        let now = self.clock.micros();
        state.apply_rate(permits_per_second, now);
    }

    /// The configured rate in permits per second
    pub fn rate(&self) -> f64 {
        self.state.lock().permits_per_second
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let kind = match state.kind {
            BucketKind::Bursty { .. } => "bursty",
            BucketKind::Warming { .. } => "warming",
        };
        f.debug_struct("RateLimiter")
            .field("kind", &kind)
            .field("permits_per_second", &state.permits_per_second)
            .field("stored_permits", &state.stored_permits)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;

    fn seconds(micros: u64) -> f64 {
        micros as f64 / MICROS_PER_SECOND
    }

    /// Acquire once and report the slept seconds per the manual clock
    fn timed_acquire(limiter: &RateLimiter, clock: &ManualClock, permits: u32) -> f64 {
        let before = clock.total_slept();
        limiter.acquire(permits);
        seconds((clock.total_slept() - before).as_micros() as u64)
    }

    #[test]
    fn first_acquire_is_free_and_later_ones_pace() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new_with_clock(5.0, clock.clone());
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.0);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.2);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.2);
    }

    #[test]
    fn oversized_request_runs_now_and_the_next_caller_pays() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new_with_clock(1.0, clock.clone());
        assert_eq!(timed_acquire(&limiter, &clock, 5), 0.0);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 5.0);
    }

    #[test]
    fn idle_time_grants_burst_capacity_up_to_one_second() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new_with_clock(2.0, clock.clone());
        limiter.acquire(1);
        // Idle far longer than the burst window.
        clock.advance(Duration::from_secs(10));
        // Two stored permits (one second at rate 2) come out free.
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.0);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.0);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.0);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.5);
    }

    #[test]
    fn warmup_drains_cold_permits_on_the_documented_schedule() {
        let clock = Arc::new(ManualClock::new());
        // stable = 0.5s, warmup = 4s: max_permits = 4, costs ramp
        // 1.5s, 1.25s, 1s, 0.75s, 0.5s per successive stored permit.
        let limiter =
            RateLimiter::warmup_with_clock(2.0, Duration::from_secs(4), clock.clone());
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.0);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 1.375);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 1.125);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.875);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.625);
        // Store empty: stable pacing from here.
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.5);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.5);
    }

    #[test]
    fn a_full_warmup_of_idleness_makes_the_bucket_fully_cold_again() {
        let clock = Arc::new(ManualClock::new());
        let limiter =
            RateLimiter::warmup_with_clock(2.0, Duration::from_secs(4), clock.clone());
        // Drain the cold store completely.
        for _ in 0..5 {
            limiter.acquire(1);
        }
        // Half a second of debt is still on the books; idle through it
        // plus exactly one warmup period.
        clock.advance(Duration::from_millis(4500));
        // Cold again: the first paid wait is the coldest cost.
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.0);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 1.375);
    }

    #[test]
    fn set_rate_settles_existing_debt_at_the_old_rate() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new_with_clock(1.0, clock.clone());
        limiter.acquire(1);
        limiter.acquire(1);
        // One second of old-rate debt is on the books; the new rate only
        // applies to reservations made after the change.
        limiter.set_rate(10.0);
        assert_eq!(limiter.rate(), 10.0);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 1.0);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.1);
    }

    #[test]
    fn infinite_rate_never_waits_and_never_advances_the_clock() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new_with_clock(f64::INFINITY, clock.clone());
        for _ in 0..3 {
            assert_eq!(timed_acquire(&limiter, &clock, 1_000_000), 0.0);
        }
        // Dropping back to a finite rate starts fresh, without a debt
        // mountain left by the infinite phase.
        limiter.set_rate(2.0);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.0);
    }

    #[test]
    fn clock_near_wraparound_still_paces_normally() {
        let clock = Arc::new(ManualClock::starting_at(u64::MAX - 100_000));
        let limiter = RateLimiter::new_with_clock(5.0, clock.clone());
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.0);
        // These sleeps walk the counter across the wrap point.
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.2);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.2);
        assert_eq!(timed_acquire(&limiter, &clock, 1), 0.2);
    }

    #[test]
    fn try_acquire_refuses_without_advancing() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::new_with_clock(1.0, clock.clone());
        assert!(limiter.try_acquire(1, Duration::ZERO));
        // A second permit needs a 1s wait; zero budget refuses it.
        assert!(!limiter.try_acquire(1, Duration::ZERO));
        assert!(!limiter.try_acquire(1, Duration::from_millis(500)));
        // The refusals must not have advanced the bucket.
        assert!(limiter.try_acquire(1, Duration::from_secs(1)));
        assert_eq!(clock.total_slept(), Duration::from_secs(1));
    }

    proptest! {
        #[test]
        fn waits_are_finite_and_stores_stay_bounded(
            rates in proptest::collection::vec(0.5f64..100.0, 1..4),
            permits in proptest::collection::vec(1u32..20, 1..30),
            idles in proptest::collection::vec(0u64..5_000_000, 1..30),
        ) {
            let clock = Arc::new(ManualClock::new());
            let limiter = RateLimiter::new_with_clock(rates[0], clock.clone());
            for (index, permit) in permits.iter().enumerate() {
                if let Some(rate) = rates.get(index % rates.len()) {
                    limiter.set_rate(*rate);
                }
                clock.advance(Duration::from_micros(idles[index % idles.len()]));
                let waited = limiter.acquire(*permit);
                prop_assert!(waited.is_finite());
                prop_assert!(waited >= 0.0);
                let state = limiter.state.lock();
                prop_assert!(state.stored_permits >= 0.0);
                prop_assert!(state.stored_permits <= state.max_permits + 1e-9);
            }
        }
    }
}
