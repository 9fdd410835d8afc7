//! Monotonic clock abstraction
//!
//! Mix loops read time through [`Clock`] so tests can drive them with a
//! [`ManualClock`] instead of sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic nanosecond clock
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;

    /// Wall time until `deadline_ns`, zero if it already passed
    fn duration_until(&self, deadline_ns: i64) -> Duration {
        let delta = deadline_ns.saturating_sub(self.now());
        Duration::from_nanos(u64::try_from(delta).unwrap_or(0))
    }
}

/// Clock backed by [`Instant`], counting from construction
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        i64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ns: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ns),
        }
    }

    pub fn set(&self, now_ns: i64) {
        self.now.store(now_ns, Ordering::Release);
    }

    pub fn advance(&self, delta: Duration) {
        let delta = i64::try_from(delta.as_nanos()).unwrap_or(i64::MAX);
        self.now.fetch_add(delta, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> i64 {
        self.now.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance(Duration::from_micros(1));
        assert_eq!(clock.now(), 2_000);
        assert_eq!(clock.duration_until(5_000), Duration::from_nanos(3_000));
        assert_eq!(clock.duration_until(0), Duration::ZERO);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
