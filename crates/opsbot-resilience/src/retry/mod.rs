//! Durable retry subsystem.
//!
//! Failed propagation steps become [`RetryRecord`]s in a [`RetryStore`]. A
//! [`RetryWorker`] periodically claims due records under a lease, routes each
//! to the [`RetryProcessor`] registered for its `operation_type`, and applies
//! the resulting transition: delete on success, reschedule with exponential
//! backoff, or dead-letter.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use opsbot_core::{LeaseToken, RetryRecordId};

pub mod memory;
pub mod policy;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;
pub mod worker;

pub use memory::InMemoryRetryStore;
pub use policy::RetryPolicy;
pub use store::RetryStore;
pub use worker::{RetryProcessor, RetryWorker, RetryWorkerConfig, WorkerReport};

/// A queued retry of one failed operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub id: RetryRecordId,
    pub operation_type: String,
    pub payload: serde_json::Value,
    /// Attempts made so far. Incremented when a worker claims the record.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// `None` means due at the next poll.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Set on records returned by `claim_batch`; transitions must present it.
    #[serde(skip)]
    pub lease: Option<LeaseToken>,
}

impl RetryRecord {
    /// A fresh record with no attempts, due immediately.
    pub fn new(operation_type: impl Into<String>, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: RetryRecordId::new(),
            operation_type: operation_type.into(),
            payload,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            lease: None,
        }
    }

    #[must_use]
    pub fn with_last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    #[must_use]
    pub fn with_next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Correlation id carried in the payload, if any.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.payload.get("correlation_id").and_then(|v| v.as_str())
    }
}

/// Lifecycle of a stored record. Succeeded records are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    DeadLetter,
}

impl RetryStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::DeadLetter => "dead_letter",
        }
    }
}

/// What a processor concluded about one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryResult {
    Success,
    /// Transient failure; try again later.
    Retry(String),
    /// Will never succeed; dead-letter now.
    PermanentFailure(String),
}

impl RetryResult {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Retry(_) => "RETRY",
            Self::PermanentFailure(_) => "PERMANENT_FAILURE",
        }
    }
}

impl fmt::Display for RetryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("SUCCESS"),
            Self::Retry(error) | Self::PermanentFailure(error) => {
                write!(f, "{}: {error}", self.as_str())
            }
        }
    }
}

/// Queue depth snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStats {
    /// Pending records not currently leased.
    pub pending: u64,
    /// Pending records under an active lease.
    pub claimed: u64,
    pub dead_letter: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record_starts_due_with_no_attempts() {
        let record = RetryRecord::new(
            "groups.member.propagation",
            json!({"correlation_id": "abc"}),
        );
        assert_eq!(record.attempts, 0);
        assert!(record.is_due(Utc::now()));
        assert_eq!(record.correlation_id(), Some("abc"));
    }

    #[test]
    fn test_scheduled_record_not_due_early() {
        let later = Utc::now() + chrono::TimeDelta::seconds(60);
        let record = RetryRecord::new("x", json!({})).with_next_retry_at(later);
        assert!(!record.is_due(Utc::now()));
        assert!(record.is_due(later));
    }

    #[test]
    fn test_retry_result_display() {
        assert_eq!(RetryResult::Success.to_string(), "SUCCESS");
        assert_eq!(
            RetryResult::Retry("timeout".into()).to_string(),
            "RETRY: timeout"
        );
    }

    #[test]
    fn test_record_persisted_shape() {
        let record = RetryRecord::new("x", json!({"provider": "aws"}));
        let value = serde_json::to_value(&record).unwrap();
        for field in [
            "id",
            "operation_type",
            "payload",
            "attempts",
            "last_error",
            "created_at",
            "updated_at",
            "next_retry_at",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
        assert!(value["id"].is_string());
        assert!(value["last_error"].is_null());
        assert!(value.get("lease").is_none());
    }
}
