//! Counters exposed alongside a circuit breaker for observability.

use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters tracking a circuit breaker's lifetime activity.
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
    state_changes: AtomicU64,
}

impl CircuitBreakerMetrics {
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_state_change(&self) {
        self.state_changes.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn state_changes(&self) -> u64 {
        self.state_changes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let metrics = CircuitBreakerMetrics::default();
        metrics.record_success();
        metrics.record_success();
        metrics.record_failure();
        metrics.record_rejection();
        metrics.record_state_change();

        assert_eq!(metrics.successes(), 2);
        assert_eq!(metrics.failures(), 1);
        assert_eq!(metrics.rejections(), 1);
        assert_eq!(metrics.state_changes(), 1);
    }
}
