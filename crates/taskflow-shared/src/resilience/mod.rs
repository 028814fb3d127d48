//! Resilience primitives guarding outbound calls the engine makes on behalf
//! of webhook steps.

pub mod circuit_breaker;
pub mod metrics;

pub use circuit_breaker::{AtomicCircuitBreaker, CircuitBreakerBehavior, CircuitState};
pub use metrics::CircuitBreakerMetrics;
