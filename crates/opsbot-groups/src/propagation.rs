//! Retry processing for failed secondary propagation.
//!
//! The orchestrator queues a [`PropagationPayload`] whenever a secondary
//! fails transiently; [`MembershipPropagationProcessor`] replays it through
//! the same per-provider breaker.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use opsbot_core::CorrelationId;
use opsbot_resilience::{CircuitBreakerRegistry, RetryProcessor, RetryRecord, RetryResult};

use crate::provider::{GroupProvider, MembershipAction};

/// `operation_type` of queued propagation retries.
pub const PROPAGATION_OPERATION: &str = "groups.member.propagation";

/// Persisted payload of a propagation retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationPayload {
    /// Canonical group id. Mapped to the provider's id at replay time.
    pub group_id: String,
    pub provider: String,
    pub member_email: String,
    pub action: MembershipAction,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
}

impl PropagationPayload {
    pub fn into_record(self) -> Result<RetryRecord, serde_json::Error> {
        Ok(RetryRecord::new(PROPAGATION_OPERATION, serde_json::to_value(self)?))
    }

    pub fn from_record(record: &RetryRecord) -> Result<Self, serde_json::Error> {
        serde_json::from_value(record.payload.clone())
    }
}

/// Replays queued propagation against secondary providers.
pub struct MembershipPropagationProcessor {
    providers: HashMap<String, Arc<dyn GroupProvider>>,
    breakers: CircuitBreakerRegistry,
}

impl MembershipPropagationProcessor {
    pub fn new(providers: &[Arc<dyn GroupProvider>], breakers: CircuitBreakerRegistry) -> Self {
        Self {
            providers: providers
                .iter()
                .map(|p| (p.name().to_string(), Arc::clone(p)))
                .collect(),
            breakers,
        }
    }
}

#[async_trait]
impl RetryProcessor for MembershipPropagationProcessor {
    fn operation_type(&self) -> &str {
        PROPAGATION_OPERATION
    }

    async fn process_record(&self, record: &RetryRecord) -> RetryResult {
        let payload = match PropagationPayload::from_record(record) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    target: "groups",
                    record_id = %record.id,
                    error = %e,
                    "Unreadable propagation payload"
                );
                return RetryResult::PermanentFailure(format!("invalid payload: {e}"));
            }
        };

        let Some(provider) = self.providers.get(&payload.provider) else {
            return RetryResult::PermanentFailure(format!(
                "unknown provider '{}'",
                payload.provider
            ));
        };

        if !provider.capabilities().supports_member_management {
            return RetryResult::PermanentFailure(format!(
                "provider '{}' does not support member management",
                payload.provider
            ));
        }

        let group_key = provider.group_name_mapping().to_provider(&payload.group_id);
        let result = self
            .breakers
            .call(provider.name(), || {
                payload.action.apply(
                    provider.as_ref(),
                    &group_key,
                    &payload.member_email,
                    payload.justification.as_deref(),
                )
            })
            .await;

        debug!(
            target: "groups",
            record_id = %record.id,
            correlation_id = %payload.correlation_id,
            provider = %payload.provider,
            attempt = record.attempts,
            status = %result.status,
            "Replayed membership propagation"
        );

        if result.is_success() {
            RetryResult::Success
        } else if result.is_transient() {
            RetryResult::Retry(result.message)
        } else {
            RetryResult::PermanentFailure(format!("{}: {}", result.status, result.message))
        }
    }
}
