//! Idempotency cache for mutating orchestration entry points.
//!
//! Keys are a SHA256 hash of `namespace`, `operation` and the sorted request
//! components, so the same logical request always maps to the same key
//! regardless of argument order. Stores hold two kinds of entries:
//!
//! - a short-lived *reservation* taken before the request executes, which
//!   turns concurrent duplicates away while the first is still running
//! - the completed response, served to every duplicate until the TTL expires

use std::env::VarError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use opsbot_core::config::parse_or;
use opsbot_core::ConfigError;

use crate::error::StoreResult;

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryIdempotencyStore;

/// Derive a deterministic idempotency key.
///
/// Components are sorted before hashing and encoded as a JSON array so that
/// `["a:b"]` and `["a", "b"]` cannot collide. Returns 64 hex characters.
pub fn idempotency_key<I, S>(namespace: &str, operation: &str, components: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parts: Vec<String> = components
        .into_iter()
        .map(|c| c.as_ref().to_string())
        .collect();
    parts.sort();

    // Serializing a Vec<String> cannot fail.
    let encoded = serde_json::to_string(&parts).unwrap_or_default();
    let composite = format!("{namespace}:{operation}:{encoded}");

    let mut hasher = Sha256::new();
    hasher.update(composite.as_bytes());
    hex::encode(hasher.finalize())
}

/// Idempotency configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyConfig {
    /// How long a completed response is served to duplicates.
    pub ttl_secs: u64,
    /// How long a reservation blocks duplicates before it is presumed abandoned.
    pub in_flight_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            in_flight_secs: 300,
        }
    }
}

impl IdempotencyConfig {
    #[must_use]
    pub fn with_ttl(mut self, secs: u64) -> Self {
        self.ttl_secs = secs;
        self
    }

    #[must_use]
    pub fn with_in_flight(mut self, secs: u64) -> Self {
        self.in_flight_secs = secs;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        let defaults = Self::default();
        Ok(Self {
            ttl_secs: parse_or(&reader, "IDEMPOTENCY_TTL_SECONDS", defaults.ttl_secs)?,
            in_flight_secs: parse_or(
                &reader,
                "IDEMPOTENCY_IN_FLIGHT_SECONDS",
                defaults.in_flight_secs,
            )?,
        })
    }
}

/// Outcome of trying to reserve a key in a store.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// The caller owns the key and must `set` or `release` it.
    Acquired,
    /// Another caller holds an unexpired reservation.
    InFlight,
    /// The request already completed; here is its response.
    Completed(serde_json::Value),
}

/// Live entry counts reported by a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub entries: u64,
    pub in_flight: u64,
}

/// Shared key/value store with TTL expiry.
///
/// Implementations must be linearizable per key: of two concurrent
/// `try_reserve` calls for the same key exactly one sees `Acquired`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Completed, unexpired response for `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;

    /// Store a completed response, replacing any reservation.
    async fn set(&self, key: &str, response: serde_json::Value, ttl: Duration) -> StoreResult<()>;

    /// Atomically reserve `key` for `lease` unless it is live.
    async fn try_reserve(&self, key: &str, lease: Duration) -> StoreResult<Reservation>;

    /// Drop a reservation. Completed entries are left alone.
    async fn release(&self, key: &str) -> StoreResult<()>;

    async fn clear(&self) -> StoreResult<()>;

    async fn counts(&self) -> StoreResult<EntryCounts>;
}

/// Result of [`IdempotencyCache::begin`].
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    /// First sighting; the caller holds the reservation.
    Execute,
    /// A duplicate of a request that is still running.
    InFlight,
    /// A duplicate of a completed request.
    Cached(T),
}

/// Operational snapshot of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyStats {
    pub entries: u64,
    pub in_flight: u64,
    pub hits: u64,
    pub misses: u64,
    pub ttl_seconds: u64,
}

/// Typed front end over an [`IdempotencyStore`] with hit/miss accounting.
pub struct IdempotencyCache {
    store: Arc<dyn IdempotencyStore>,
    config: IdempotencyConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl IdempotencyCache {
    pub fn new(store: Arc<dyn IdempotencyStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Cache backed by a process-local store.
    #[must_use]
    pub fn in_memory(config: IdempotencyConfig) -> Self {
        Self::new(Arc::new(InMemoryIdempotencyStore::new()), config)
    }

    #[must_use]
    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    fn record_hit(&self, key: &str) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        debug!(target: "idempotency", key = %key, "Idempotency cache hit");
    }

    /// Cached response for `key`, if any.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Option<T>> {
        match self.store.get(key).await? {
            Some(value) => {
                self.record_hit(key);
                Ok(Some(serde_json::from_value(value)?))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    /// Store `response` under `key` for the configured TTL.
    pub async fn set<T: Serialize>(&self, key: &str, response: &T) -> StoreResult<()> {
        self.set_with_ttl(key, response, self.ttl()).await
    }

    pub async fn set_with_ttl<T: Serialize>(
        &self,
        key: &str,
        response: &T,
        ttl: Duration,
    ) -> StoreResult<()> {
        let value = serde_json::to_value(response)?;
        self.store.set(key, value, ttl).await
    }

    /// Reserve `key` or report why the request must not execute.
    pub async fn begin<T: DeserializeOwned>(&self, key: &str) -> StoreResult<Lookup<T>> {
        let lease = Duration::from_secs(self.config.in_flight_secs);
        match self.store.try_reserve(key, lease).await? {
            Reservation::Acquired => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(Lookup::Execute)
            }
            Reservation::InFlight => {
                debug!(target: "idempotency", key = %key, "Duplicate request still in flight");
                Ok(Lookup::InFlight)
            }
            Reservation::Completed(value) => {
                self.record_hit(key);
                Ok(Lookup::Cached(serde_json::from_value(value)?))
            }
        }
    }

    /// Give up a reservation so the request can be attempted again.
    pub async fn abandon(&self, key: &str) -> StoreResult<()> {
        self.store.release(key).await
    }

    pub async fn clear(&self) -> StoreResult<()> {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.store.clear().await
    }

    pub async fn get_stats(&self) -> StoreResult<IdempotencyStats> {
        let counts = self.store.counts().await?;
        Ok(IdempotencyStats {
            entries: counts.entries,
            in_flight: counts.in_flight,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            ttl_seconds: self.config.ttl_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_key_is_deterministic_and_order_independent() {
        let a = idempotency_key("groups", "add_member", ["eng-team", "alice@example.com"]);
        let b = idempotency_key("groups", "add_member", ["alice@example.com", "eng-team"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_key_separates_namespace_operation_and_components() {
        let base = idempotency_key("groups", "add_member", ["eng-team", "alice@example.com"]);
        assert_ne!(
            base,
            idempotency_key("groups", "remove_member", ["eng-team", "alice@example.com"])
        );
        assert_ne!(
            base,
            idempotency_key("users", "add_member", ["eng-team", "alice@example.com"])
        );
        assert_ne!(
            idempotency_key("groups", "add_member", ["a:b"]),
            idempotency_key("groups", "add_member", ["a", "b"])
        );
    }

    #[test]
    fn test_config_from_reader() {
        let vars: HashMap<&str, &str> = HashMap::from([("IDEMPOTENCY_TTL_SECONDS", "60")]);
        let config = IdempotencyConfig::from_reader(|k: &str| {
            vars.get(k)
                .map(|v| v.to_string())
                .ok_or(VarError::NotPresent)
        })
        .unwrap();
        assert_eq!(config.ttl_secs, 60);
        assert_eq!(config.in_flight_secs, 300);
    }

    #[tokio::test]
    async fn test_begin_then_set_serves_duplicates() {
        let cache = IdempotencyCache::in_memory(IdempotencyConfig::default());
        let key = idempotency_key("groups", "add_member", ["eng-team"]);

        assert_eq!(cache.begin::<u32>(&key).await.unwrap(), Lookup::Execute);
        assert_eq!(cache.begin::<u32>(&key).await.unwrap(), Lookup::InFlight);

        cache.set(&key, &42u32).await.unwrap();
        assert_eq!(cache.begin::<u32>(&key).await.unwrap(), Lookup::Cached(42));
        assert_eq!(cache.get::<u32>(&key).await.unwrap(), Some(42));

        let stats = cache.get_stats().await.unwrap();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn test_abandon_allows_retry() {
        let cache = IdempotencyCache::in_memory(IdempotencyConfig::default());
        assert_eq!(cache.begin::<u32>("k").await.unwrap(), Lookup::Execute);
        cache.abandon("k").await.unwrap();
        assert_eq!(cache.begin::<u32>("k").await.unwrap(), Lookup::Execute);
    }

    #[tokio::test]
    async fn test_clear_resets_entries_and_counters() {
        let cache = IdempotencyCache::in_memory(IdempotencyConfig::default());
        cache.set("k", &json!({"success": true})).await.unwrap();
        let _ = cache.get::<serde_json::Value>("k").await.unwrap();
        let _ = cache.get::<serde_json::Value>("missing").await.unwrap();

        cache.clear().await.unwrap();
        assert_eq!(cache.get_stats().await.unwrap(), IdempotencyStats {
            ttl_seconds: 3600,
            ..IdempotencyStats::default()
        });
    }

    #[tokio::test]
    async fn test_mismatched_cached_shape_is_an_error() {
        let cache = IdempotencyCache::in_memory(IdempotencyConfig::default());
        cache.set("k", &json!({"not": "a number"})).await.unwrap();
        assert!(cache.begin::<u32>("k").await.is_err());
    }
}
