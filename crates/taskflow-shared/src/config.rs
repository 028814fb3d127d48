//! # Engine Configuration
//!
//! Structured configuration for the execution engine. Loaded from a TOML
//! file plus environment overrides via the `config` crate, the way the
//! orchestration layer this engine descends from loads its settings.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Authentication mode for the callback ingress and HTTP surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// No authentication beyond the per-run callback secret.
    #[default]
    CallbackSecretOnly,
    /// Bearer token required on all administrative endpoints in addition to
    /// the callback secret on callback endpoints.
    BearerToken,
}

/// Exponential backoff policy applied to webhook step retries and to the
/// store gateway's bounded local retry on `StoreUnavailable`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackoffConfig {
    #[serde(default = "BackoffConfig::default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "BackoffConfig::default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "BackoffConfig::default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "BackoffConfig::default_max_attempts")]
    pub max_attempts: u32,
}

impl BackoffConfig {
    fn default_initial_ms() -> u64 {
        250
    }
    fn default_multiplier() -> f64 {
        2.0
    }
    fn default_max_ms() -> u64 {
        30_000
    }
    fn default_max_attempts() -> u32 {
        5
    }

    /// Delay before the given zero-indexed attempt, capped at `max_ms`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let scaled = self.initial_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_ms as f64);
        Duration::from_millis(capped.round() as u64)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: Self::default_initial_ms(),
            multiplier: Self::default_multiplier(),
            max_ms: Self::default_max_ms(),
            max_attempts: Self::default_max_attempts(),
        }
    }
}

/// Circuit breaker guarding outbound webhook delivery.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "CircuitBreakerConfig::default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(with = "duration_millis", default = "CircuitBreakerConfig::default_open_duration")]
    pub open_duration: Duration,
}

impl CircuitBreakerConfig {
    fn default_failure_threshold() -> u32 {
        5
    }
    fn default_open_duration() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Self::default_failure_threshold(),
            open_duration: Self::default_open_duration(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Connection string for the backing document store.
    #[serde(default = "EngineConfig::default_store_url")]
    pub store_url: String,

    /// Size of the bounded worker pool that runs dispatcher work items
    /// (step activation, boundary evaluation, timer firing).
    #[serde(default = "EngineConfig::default_worker_pool_size")]
    pub worker_pool_size: usize,

    /// Timer wheel tick granularity.
    #[serde(with = "duration_millis", default = "EngineConfig::default_timer_granularity")]
    pub timer_granularity: Duration,

    /// Default retry/backoff policy for webhook steps and store retries.
    #[serde(default)]
    pub default_retry_policy: BackoffConfig,

    /// Interval between SSE heartbeat frames.
    #[serde(with = "duration_millis", default = "EngineConfig::default_sse_heartbeat")]
    pub sse_heartbeat_interval: Duration,

    /// Authentication mode for administrative endpoints.
    #[serde(default)]
    pub auth_mode: AuthMode,

    /// Circuit breaker guarding outbound webhook delivery.
    #[serde(default)]
    pub webhook_circuit_breaker: CircuitBreakerConfig,
}

impl EngineConfig {
    fn default_store_url() -> String {
        "memory://local".to_string()
    }
    fn default_worker_pool_size() -> usize {
        16
    }
    fn default_timer_granularity() -> Duration {
        Duration::from_secs(1)
    }
    fn default_sse_heartbeat() -> Duration {
        Duration::from_secs(30)
    }

    /// Load configuration from a base file plus `TASKFLOW_` environment
    /// overrides, falling back to defaults if no file is present.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&EngineConfig::default())?,
        );
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TASKFLOW")
                .separator("__")
                .try_parsing(true),
        );
        builder.build()?.try_deserialize()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_url: Self::default_store_url(),
            worker_pool_size: Self::default_worker_pool_size(),
            timer_granularity: Self::default_timer_granularity(),
            default_retry_policy: BackoffConfig::default(),
            sse_heartbeat_interval: Self::default_sse_heartbeat(),
            auth_mode: AuthMode::default(),
            webhook_circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(de)?;
        Ok(Duration::from_millis(millis))
    }
}
