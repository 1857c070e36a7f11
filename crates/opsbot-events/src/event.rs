//! Event payload handed to audit and notification consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use opsbot_core::CorrelationId;

use crate::error::EventError;

/// Well-known event type names.
pub mod event_types {
    pub const GROUP_MEMBER_ADDED: &str = "group.member.added";
    pub const GROUP_MEMBER_REMOVED: &str = "group.member.removed";
    /// Handlers registered under this type receive every event.
    pub const WILDCARD: &str = "*";
}

/// One orchestration outcome.
///
/// Serializes with an RFC 3339 `timestamp` and the correlation id in its
/// string form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: Utc::now(),
            correlation_id,
            user_email: None,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_user_email(mut self, email: impl Into<String>) -> Self {
        self.user_email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Serialize to a JSON object.
    pub fn to_value(&self) -> Result<Value, EventError> {
        serde_json::to_value(self).map_err(|e| EventError::InvalidPayload {
            reason: e.to_string(),
        })
    }

    /// Parse from a JSON object produced by [`Event::to_value`].
    pub fn from_value(value: Value) -> Result<Self, EventError> {
        serde_json::from_value(value).map_err(|e| EventError::InvalidPayload {
            reason: e.to_string(),
        })
    }
}
