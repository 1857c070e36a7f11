//! Error types for resilience stores.

use thiserror::Error;

/// Failures raised by idempotency and retry store backends.
///
/// These are infrastructure failures, not provider outcomes. Callers on the
/// request path log them and degrade rather than failing the request.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The referenced record does not exist (or is no longer pending).
    #[error("record not found: {0}")]
    NotFound(String),

    /// The caller's claim on a retry record was superseded by another
    /// claimant or the record was already transitioned.
    #[error("lease lost on record {0}")]
    LeaseLost(String),

    /// A payload or cached response could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Database error from the PostgreSQL backend.
    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Check if the failure is likely to clear up on its own.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::NotFound(_) | StoreError::LeaseLost(_) | StoreError::Serialization(_) => {
                false
            }
            #[cfg(feature = "postgres")]
            StoreError::Database(_) => true,
        }
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_permanent() {
        let err = StoreError::NotFound("abc".into());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "record not found: abc");
    }

    #[test]
    fn test_lease_lost_is_permanent() {
        let err = StoreError::LeaseLost("abc".into());
        assert!(!err.is_transient());
        assert_eq!(err.to_string(), "lease lost on record abc");
    }
}
