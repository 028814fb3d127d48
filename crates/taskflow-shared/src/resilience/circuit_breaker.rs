//! Circuit breaker guarding outbound calls (webhook delivery) against a
//! persistently failing target.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use super::metrics::CircuitBreakerMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Behavior a circuit breaker must implement. Kept object-safe so callers
/// that don't need a concrete type can hold `&dyn CircuitBreakerBehavior`.
pub trait CircuitBreakerBehavior: Send + Sync + Debug {
    /// Whether a call should be attempted right now.
    fn allow_request(&self) -> bool;
    /// Record a successful call.
    fn record_success(&self);
    /// Record a failed call.
    fn record_failure(&self);
    /// Current state, for diagnostics.
    fn state(&self) -> CircuitState;
}

#[cfg(test)]
fn _assert_object_safe(_: &dyn CircuitBreakerBehavior) {}

/// A breaker that opens after `failure_threshold` consecutive failures,
/// stays open for `open_duration`, then allows a single probe request
/// through in the half-open state before fully closing or reopening.
#[derive(Debug)]
pub struct AtomicCircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    opened_at_millis: AtomicU64,
    failure_threshold: u32,
    open_duration: Duration,
    epoch: Instant,
    metrics: CircuitBreakerMetrics,
}

impl AtomicCircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed.to_u8()),
            consecutive_failures: AtomicU32::new(0),
            opened_at_millis: AtomicU64::new(0),
            failure_threshold,
            open_duration,
            epoch: Instant::now(),
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &CircuitBreakerMetrics {
        &self.metrics
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn transition(&self, from: CircuitState, to: CircuitState) -> bool {
        self.state
            .compare_exchange(
                from.to_u8(),
                to.to_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }
}

impl CircuitBreakerBehavior for AtomicCircuitBreaker {
    fn allow_request(&self) -> bool {
        match CircuitState::from_u8(self.state.load(Ordering::SeqCst)) {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::SeqCst);
                let elapsed = self.now_millis().saturating_sub(opened_at);
                if elapsed >= self.open_duration.as_millis() as u64
                    && self.transition(CircuitState::Open, CircuitState::HalfOpen)
                {
                    self.metrics.record_state_change();
                    return true;
                }
                self.metrics.record_rejection();
                false
            }
        }
    }

    fn record_success(&self) {
        self.metrics.record_success();
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.transition(CircuitState::HalfOpen, CircuitState::Closed) {
            self.metrics.record_state_change();
        }
    }

    fn record_failure(&self) {
        self.metrics.record_failure();
        match CircuitState::from_u8(self.state.load(Ordering::SeqCst)) {
            CircuitState::HalfOpen => {
                self.opened_at_millis.store(self.now_millis(), Ordering::SeqCst);
                if self.transition(CircuitState::HalfOpen, CircuitState::Open) {
                    self.metrics.record_state_change();
                }
            }
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.failure_threshold {
                    self.opened_at_millis.store(self.now_millis(), Ordering::SeqCst);
                    if self.transition(CircuitState::Closed, CircuitState::Open) {
                        self.metrics.record_state_change();
                    }
                }
            }
            CircuitState::Open => {}
        }
    }

    fn state(&self) -> CircuitState {
        CircuitState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_object_safe() {
        let breaker = AtomicCircuitBreaker::new(3, Duration::from_millis(50));
        _assert_object_safe(&breaker);
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = AtomicCircuitBreaker::new(2, Duration::from_secs(60));
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn half_open_probe_closes_on_success() {
        let breaker = AtomicCircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_reopens_on_failure() {
        let breaker = AtomicCircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
