//! Time sources for stateful policies
//!
//! The circuit breaker and the rate limiter never read wall-clock time directly.
//! They ask a [`Clock`] for monotonic seconds, which lets tests drive them with a
//! [`ManualClock`] instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic time, in seconds relative to an arbitrary anchor
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Get monotonic time in seconds
    fn monotonic_time(&self) -> f64;
}

/// Clock backed by [`Instant`], anchored at construction (immune to NTP skew)
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    start_time: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// Clock that only moves when told to
///
/// # Example
///
/// ```rust
/// use resilience_machines::{Clock, ManualClock};
/// use std::time::Duration;
///
/// let clock = ManualClock::new();
/// assert_eq!(clock.monotonic_time(), 0.0);
///
/// clock.advance(Duration::from_millis(1500));
/// assert_eq!(clock.monotonic_time(), 1.5);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(by))
            });
    }

    /// Jump to an absolute offset from the anchor
    pub fn set(&self, at: Duration) {
        let at = u64::try_from(at.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.store(at, Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn monotonic_time(&self) -> f64 {
        self.nanos.load(Ordering::Acquire) as f64 / 1_000_000_000.0
    }
}
