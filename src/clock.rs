//! Time abstraction used by the circuit breaker and retry backoff.
//!
//! Production code calls `Instant::now()` through [`SystemClock`]; tests that
//! need to exercise trip/recovery transitions deterministically (see spec
//! scenario S4) use [`FakeClock`], which only advances when told to.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Source of monotonic time, abstracted so breaker/backoff logic is testable
/// without real sleeps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// Real wall-clock time via `Instant::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when [`FakeClock::advance`] is called.
///
/// Useful for deterministically driving the circuit breaker through its
/// `TripWindow`/`RecoveryTimeout` transitions in tests.
#[derive(Debug, Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<Instant>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.lock().expect("fake clock mutex poisoned");
        *guard += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self.inner.lock().expect("fake clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(1));
        let b = clock.now();
        assert!(b > a);
    }

    #[test]
    fn fake_clock_only_moves_on_advance() {
        let clock = FakeClock::new();
        let a = clock.now();
        let b = clock.now();
        assert_eq!(a, b);

        clock.advance(Duration::from_secs(5));
        let c = clock.now();
        assert!(c >= a + Duration::from_secs(5));
    }
}
