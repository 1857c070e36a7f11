//! Orchestration response returned to the chat/API layer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use opsbot_core::{CorrelationId, OperationResult};
use opsbot_events::Event;

use crate::provider::{MembershipAction, NormalizedMember};

/// Outcome of one add/remove orchestration.
///
/// `success` reflects the primary write only. Secondary outcomes are keyed
/// by provider name in `propagation`; `partial_failures` is set when any of
/// them did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationResponse {
    pub success: bool,
    pub action: MembershipAction,
    pub group_id: String,
    pub member_email: String,
    pub correlation_id: CorrelationId,
    pub primary_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary: Option<OperationResult<NormalizedMember>>,
    #[serde(default)]
    pub propagation: BTreeMap<String, OperationResult<NormalizedMember>>,
    pub partial_failures: bool,
    /// Secondaries with a retry record queued by this call.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queued_for_retry: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrchestrationResponse {
    pub(crate) fn new(
        action: MembershipAction,
        group_id: impl Into<String>,
        member_email: impl Into<String>,
        correlation_id: CorrelationId,
        primary_provider: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            action,
            group_id: group_id.into(),
            member_email: member_email.into(),
            correlation_id,
            primary_provider: primary_provider.into(),
            primary: None,
            propagation: BTreeMap::new(),
            partial_failures: false,
            queued_for_retry: Vec::new(),
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub(crate) fn fail(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    /// Providers whose propagation did not succeed.
    #[must_use]
    pub fn failed_providers(&self) -> Vec<&str> {
        self.propagation
            .iter()
            .filter(|(_, result)| !result.is_success())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Event announcing this outcome. The full response travels in metadata.
    pub fn to_event(&self, user_email: Option<&str>) -> Event {
        let mut event = Event::new(self.action.event_type(), self.correlation_id)
            .with_timestamp(self.timestamp);
        if let Some(email) = user_email {
            event = event.with_user_email(email);
        }
        if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(self) {
            event.metadata = fields;
        }
        event
    }
}
