//! Circuit breaker pattern for provider calls.
//!
//! One breaker exists per provider name. Breakers are looked up or created
//! through a [`CircuitBreakerRegistry`]; callers never construct one directly.
//! Only `TRANSIENT_ERROR` outcomes count against a breaker. Every other status
//! is an answer from a live directory.

use std::collections::{BTreeMap, HashMap};
use std::env::VarError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use opsbot_core::config::{parse_bool_or, parse_or};
use opsbot_core::{codes, ConfigError, OperationResult};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - calls pass through.
    #[default]
    Closed,
    /// Tripped - calls are rejected without reaching the provider.
    Open,
    /// Probing recovery with a limited number of trial calls.
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CLOSED" => Some(Self::Closed),
            "OPEN" => Some(Self::Open),
            "HALF_OPEN" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// When false every breaker is a pass-through.
    pub enabled: bool,
    /// Consecutive transient failures before opening the circuit.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open after the last failure.
    pub open_timeout_secs: u64,
    /// Trial calls admitted while half-open; this many consecutive successes close the circuit.
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            open_timeout_secs: 60,
            half_open_max_calls: 3,
        }
    }
}

impl CircuitBreakerConfig {
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_open_timeout(mut self, secs: u64) -> Self {
        self.open_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let defaults = Self::default();
        Ok(Self {
            enabled: parse_bool_or(&reader, "CIRCUIT_BREAKER_ENABLED", defaults.enabled)?,
            failure_threshold: parse_or(
                &reader,
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                defaults.failure_threshold,
            )?,
            open_timeout_secs: parse_or(
                &reader,
                "CIRCUIT_BREAKER_OPEN_TIMEOUT_SECONDS",
                defaults.open_timeout_secs,
            )?,
            half_open_max_calls: parse_or(
                &reader,
                "CIRCUIT_BREAKER_HALF_OPEN_MAX_CALLS",
                defaults.half_open_max_calls,
            )?,
        })
    }

    fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    fn threshold(&self) -> u32 {
        self.failure_threshold.max(1)
    }

    fn trial_calls(&self) -> u32 {
        self.half_open_max_calls.max(1)
    }
}

/// A call refused by an open (or saturated half-open) breaker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker for '{name}' is {state}; retry in {retry_after_secs}s")]
pub struct CircuitRejection {
    pub name: String,
    pub state: CircuitState,
    pub retry_after_secs: u64,
}

impl CircuitRejection {
    /// Express the rejection as a transient provider outcome.
    pub fn into_result<T>(self) -> OperationResult<T> {
        let retry_after = self.retry_after_secs;
        OperationResult::transient_error(self.to_string())
            .with_error_code(codes::CIRCUIT_OPEN)
            .with_retry_after(retry_after)
    }
}

/// Read-only snapshot of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub enabled: bool,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub message: String,
}

#[derive(Debug, Default)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_admitted: u32,
    half_open_since: Option<Instant>,
    last_failure_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
}

impl BreakerState {
    fn open_remaining(&self, timeout: Duration, now: Instant) -> Duration {
        match self.last_failure_at {
            Some(at) => timeout.saturating_sub(now.saturating_duration_since(at)),
            None => Duration::ZERO,
        }
    }

    fn note_failure(&mut self, now: Instant) {
        self.last_failure_at = Some(now);
        self.last_failure_time = Some(Utc::now());
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

/// Circuit breaker guarding a single provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub(crate) fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerState::default()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the open to half-open transition if due.
    pub async fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner, Instant::now());
        inner.state
    }

    fn refresh(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state == CircuitState::Open
            && inner
                .open_remaining(self.config.open_timeout(), now)
                .is_zero()
        {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.half_open_admitted = 0;
            inner.half_open_since = Some(now);
            info!(
                target: "circuit_breaker",
                breaker = %self.name,
                "Circuit breaker transitioning to half-open"
            );
        }
    }

    /// Ask permission to place one call.
    ///
    /// Rejections are not failures and leave the counters untouched.
    pub async fn try_acquire(&self) -> Result<(), CircuitRejection> {
        if !self.config.enabled {
            return Ok(());
        }

        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner, now);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let remaining = inner.open_remaining(self.config.open_timeout(), now);
                Err(CircuitRejection {
                    name: self.name.clone(),
                    state: CircuitState::Open,
                    retry_after_secs: ceil_secs(remaining),
                })
            }
            CircuitState::HalfOpen => {
                if inner.half_open_admitted < self.config.trial_calls() {
                    inner.half_open_admitted += 1;
                    return Ok(());
                }

                // Trial calls that never reported back (cancelled futures) would
                // otherwise pin the breaker half-open forever.
                let window_elapsed = inner
                    .half_open_since
                    .map_or(true, |since| now.saturating_duration_since(since) >= self.config.open_timeout());
                if window_elapsed {
                    debug!(
                        target: "circuit_breaker",
                        breaker = %self.name,
                        "Restarting stale half-open trial window"
                    );
                    inner.half_open_admitted = 1;
                    inner.success_count = 0;
                    inner.half_open_since = Some(now);
                    return Ok(());
                }

                Err(CircuitRejection {
                    name: self.name.clone(),
                    state: CircuitState::HalfOpen,
                    retry_after_secs: 1,
                })
            }
        }
    }

    /// Record a call that reached a live directory.
    pub async fn record_success(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.trial_calls() {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.half_open_admitted = 0;
                    inner.half_open_since = None;
                    info!(
                        target: "circuit_breaker",
                        breaker = %self.name,
                        "Circuit breaker closed after successful trial calls"
                    );
                }
            }
            CircuitState::Open => {
                // Late result from a call admitted before the circuit opened.
                debug!(
                    target: "circuit_breaker",
                    breaker = %self.name,
                    "Ignoring success recorded while circuit is open"
                );
            }
        }
    }

    /// Record a transient failure.
    pub async fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }

        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.note_failure(now);

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.threshold() {
                    inner.state = CircuitState::Open;
                    warn!(
                        target: "circuit_breaker",
                        breaker = %self.name,
                        failure_count = inner.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.failure_count += 1;
                inner.success_count = 0;
                inner.half_open_admitted = 0;
                inner.half_open_since = None;
                warn!(
                    target: "circuit_breaker",
                    breaker = %self.name,
                    "Circuit breaker reopened after failed trial call"
                );
            }
            CircuitState::Open => {
                inner.failure_count += 1;
            }
        }
    }

    /// Run `operation` under breaker protection.
    ///
    /// The lock is released while the operation runs.
    pub async fn call<T, F, Fut>(&self, operation: F) -> OperationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OperationResult<T>>,
    {
        if let Err(rejection) = self.try_acquire().await {
            debug!(
                target: "circuit_breaker",
                breaker = %self.name,
                retry_after_secs = rejection.retry_after_secs,
                "Call rejected by circuit breaker"
            );
            return rejection.into_result();
        }

        let result = operation().await;
        if result.is_transient() {
            self.record_failure().await;
        } else {
            self.record_success().await;
        }
        result
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        self.refresh(&mut inner, now);

        let message = if !self.config.enabled {
            "Circuit breaker disabled".to_string()
        } else {
            match inner.state {
                CircuitState::Closed => "Circuit closed".to_string(),
                CircuitState::Open => format!(
                    "Circuit open; trial calls allowed in {}s",
                    ceil_secs(inner.open_remaining(self.config.open_timeout(), now))
                ),
                CircuitState::HalfOpen => format!(
                    "Circuit half-open; {}/{} trial calls admitted",
                    inner.half_open_admitted,
                    self.config.trial_calls()
                ),
            }
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            enabled: self.config.enabled,
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_time: inner.last_failure_time,
            message,
        }
    }

    /// Force the breaker back to closed with cleared counters.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        *inner = BreakerState::default();
        info!(target: "circuit_breaker", breaker = %self.name, "Circuit breaker reset");
    }
}

/// Process-wide registry of breakers keyed by provider name.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, Arc<CircuitBreaker>>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the breaker for `name`, creating it on first use.
    pub async fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read().await;
            if let Some(cb) = breakers.get(name) {
                return Arc::clone(cb);
            }
        }

        let mut breakers = self.breakers.write().await;

        // Double-check after acquiring write lock
        if let Some(cb) = breakers.get(name) {
            return Arc::clone(cb);
        }

        let cb = Arc::new(CircuitBreaker::new(name, self.config.clone()));
        breakers.insert(name.to_string(), Arc::clone(&cb));
        debug!(target: "circuit_breaker", breaker = %name, "Created circuit breaker");
        cb
    }

    pub async fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(name).cloned()
    }

    /// Run `operation` through the breaker for `name`.
    pub async fn call<T, F, Fut>(&self, name: &str, operation: F) -> OperationResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OperationResult<T>>,
    {
        self.get_or_create(name).await.call(operation).await
    }

    async fn snapshot(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.read().await.values().cloned().collect()
    }

    /// Stats for every known breaker, keyed by provider name.
    pub async fn get_all_circuit_breaker_stats(&self) -> BTreeMap<String, CircuitBreakerStats> {
        let mut all = BTreeMap::new();
        for cb in self.snapshot().await {
            all.insert(cb.name().to_string(), cb.stats().await);
        }
        all
    }

    /// Names of breakers currently rejecting calls, sorted.
    pub async fn get_open_circuit_breakers(&self) -> Vec<String> {
        let mut open = Vec::new();
        for cb in self.snapshot().await {
            if cb.config().enabled && cb.state().await == CircuitState::Open {
                open.push(cb.name().to_string());
            }
        }
        open.sort();
        open
    }

    /// Reset one breaker. Returns false if it does not exist.
    pub async fn reset(&self, name: &str) -> bool {
        match self.get(name).await {
            Some(cb) => {
                cb.reset().await;
                true
            }
            None => false,
        }
    }

    pub async fn reset_all(&self) {
        for cb in self.snapshot().await {
            cb.reset().await;
        }
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.breakers.write().await.remove(name).is_some()
    }

    /// Drop every breaker (test isolation).
    pub async fn clear(&self) {
        self.breakers.write().await.clear();
    }
}
