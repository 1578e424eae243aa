//! Consecutive-failure bookkeeping for the Closed state
//!
//! The state machine's guards only see the circuit context, so the running count of
//! qualifying failures lives here, shared through an `Arc` between the breaker and
//! the machine. All writers hold the breaker lock; the atomics only make the tally
//! `Sync`.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Running count of consecutive qualifying failures
#[derive(Debug, Default)]
pub struct FailureTally {
    consecutive_failures: AtomicUsize,
}

impl FailureTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one more qualifying failure, returning the new total
    pub fn record_failure(&self) -> usize {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// A success breaks the streak
    pub fn record_success(&self) {
        self.clear();
    }

    pub fn consecutive_failures(&self) -> usize {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn clear(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }
}
