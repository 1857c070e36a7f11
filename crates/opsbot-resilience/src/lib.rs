//! opsbot Resilience
//!
//! Failure isolation and deduplication primitives shared by the group
//! membership orchestrator.
//!
//! - [`circuit_breaker`] - Per-provider breakers behind a name-keyed registry
//! - [`idempotency`] - Deterministic request keys and a TTL response cache
//! - [`retry`] - Durable retry queue, exponential backoff and the batch worker
//!
//! In-memory backends are always available. PostgreSQL backends live behind
//! the `postgres` feature.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitRejection, CircuitState,
};
pub use config::ResilienceConfig;
pub use error::{StoreError, StoreResult};
pub use idempotency::{
    idempotency_key, IdempotencyCache, IdempotencyConfig, IdempotencyStats, IdempotencyStore,
    InMemoryIdempotencyStore, Lookup, Reservation,
};
pub use retry::{
    InMemoryRetryStore, RetryPolicy, RetryProcessor, RetryRecord, RetryResult, RetryStats,
    RetryStore, RetryWorker, RetryWorkerConfig, WorkerReport,
};

#[cfg(feature = "postgres")]
pub use idempotency::postgres::PgIdempotencyStore;
#[cfg(feature = "postgres")]
pub use retry::postgres::PgRetryStore;
