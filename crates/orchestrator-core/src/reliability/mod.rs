//! Reliability helpers shared by the workflow executor: retry policy,
//! circuit breaker, and step-timeout wrapping.

pub mod circuit_breaker;
pub mod retry;
pub mod timeout;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::RetryPolicy;
pub use timeout::{with_timeout, TimeoutOutcome, DEFAULT_POLICY_STEP_TIMEOUT, DEFAULT_STEP_TIMEOUT};

/// Serde support for `Option<Duration>` as milliseconds, used by
/// `StepDefinition::timeout`.
pub mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
