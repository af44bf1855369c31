//! Per-worker circuit breaker (spec section 4.6).
//!
//! Tracks failures in a sliding trip window; once `failure_threshold` is
//! reached inside that window the breaker opens and claims stop until
//! `recovery_timeout` has elapsed, at which point a single probe claim is
//! let through (`HalfOpen`). `recovery_threshold` consecutive probe
//! successes close the breaker again; any probe failure reopens it.
//!
//! Naming follows `CircuitBreaker`/`CircuitState`/`CircuitConfig` as used
//! elsewhere in this codebase's plugin engine, generalized here to use an
//! injected [`Clock`] so trip/recovery timing is deterministically
//! testable with [`crate::clock::FakeClock`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::clock::Clock;
use crate::config::BreakerConfig;

/// Observable state of a breaker, also used directly as the `breaker_state`
/// gauge value (0=Closed, 1=HalfOpen, 2=Open; spec section 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    pub fn as_gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    window_start: Instant,
    opened_at: Instant,
    half_open_successes: u32,
}

/// A single worker's breaker. Cheap to clone; the interior state is shared
/// via `Arc`.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Inner>>,
    /// Gates `HalfOpen` to a single in-flight probe: only the caller that
    /// wins the `false -> true` compare-exchange may attempt a claim.
    probe_in_flight: Arc<AtomicBool>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                window_start: now,
                opened_at: now,
                half_open_successes: 0,
            })),
            probe_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a claim attempt is currently permitted. Transitions
    /// `Open -> HalfOpen` on the caller's behalf once `recovery_timeout`
    /// has elapsed, and gates `HalfOpen` to exactly one concurrent probe.
    pub fn allow(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if now.duration_since(inner.opened_at) >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    drop(inner);
                    self.probe_in_flight
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self
                .probe_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
        }
    }

    /// Releases a HalfOpen probe slot that `allow()` granted but that never
    /// reached a recorded outcome — a claim attempt that found no job, or
    /// failed before a handler ran. Without this, an idle recovery tick
    /// would consume the single probe forever and the breaker would never
    /// admit another one. A no-op outside `HalfOpen`, since `probe_in_flight`
    /// is only ever set true by this worker's own prior `allow()` call.
    pub fn release_unclaimed_probe(&self) {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state == CircuitState::HalfOpen {
            self.probe_in_flight.store(false, Ordering::SeqCst);
        }
    }

    /// Records a successful claim/job outcome.
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.window_start = now;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                self.probe_in_flight.store(false, Ordering::SeqCst);
                if inner.half_open_successes >= self.config.recovery_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.window_start = now;
                }
            }
            CircuitState::Open => {
                // A success arriving after the breaker already reopened
                // (a stale probe race); nothing to do.
            }
        }
    }

    /// Records a failed claim/job outcome.
    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => {
                if now.duration_since(inner.window_start) > self.config.trip_window {
                    inner.failure_count = 0;
                    inner.window_start = now;
                }
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = now;
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = now;
                inner.failure_count = 0;
                self.probe_in_flight.store(false, Ordering::SeqCst);
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use std::time::Duration;

    fn breaker_with_clock() -> (CircuitBreaker, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock::new());
        let config = BreakerConfig {
            failure_threshold: 3,
            recovery_threshold: 2,
            trip_window: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(10),
        };
        let breaker = CircuitBreaker::new(config, clock.clone() as Arc<dyn Clock>);
        (breaker, clock)
    }

    #[test]
    fn opens_after_threshold_failures() {
        let (breaker, _clock) = breaker_with_clock();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn transitions_to_half_open_after_recovery_timeout_and_allows_single_probe() {
        let (breaker, clock) = breaker_with_clock();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(11));
        assert!(breaker.allow());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // A second concurrent caller must not get a probe slot.
        assert!(!breaker.allow());
    }

    #[test]
    fn releasing_an_unclaimed_probe_lets_a_later_tick_retry() {
        let (breaker, clock) = breaker_with_clock();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_secs(11));

        // Recovery tick grabs the probe but finds no job (idle queue).
        assert!(breaker.allow());
        breaker.release_unclaimed_probe();

        // Without the release above this would wrongly return false forever.
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn closes_after_recovery_threshold_successes_in_half_open() {
        let (breaker, clock) = breaker_with_clock();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_secs(11));
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn probe_failure_in_half_open_reopens_immediately() {
        let (breaker, clock) = breaker_with_clock();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_secs(11));
        assert!(breaker.allow());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn failure_window_resets_stale_counts() {
        let (breaker, clock) = breaker_with_clock();
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(Duration::from_secs(31));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
