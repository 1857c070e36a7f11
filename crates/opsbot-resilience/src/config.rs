//! Combined configuration for the resilience layer.

use std::env::VarError;

use opsbot_core::ConfigError;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::idempotency::IdempotencyConfig;
use crate::retry::{RetryPolicy, RetryWorkerConfig};

/// All resilience settings, loaded together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub idempotency: IdempotencyConfig,
    pub retry_policy: RetryPolicy,
    pub retry_worker: RetryWorkerConfig,
}

impl ResilienceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        Ok(Self {
            circuit_breaker: CircuitBreakerConfig::from_reader(&reader)?,
            idempotency: IdempotencyConfig::from_reader(&reader)?,
            retry_policy: RetryPolicy::from_reader(&reader)?,
            retry_worker: RetryWorkerConfig::from_reader(&reader)?,
        })
    }
}
