//! Audit trail handler.
//!
//! Every dispatched event is handed to an [`AuditSink`]. Long-term storage is
//! the sink's concern; the default sink writes one structured log line per
//! event under the `audit` target.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::dispatcher::{EventDispatcher, EventHandler};
use crate::error::EventError;
use crate::event::{event_types, Event};

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: &Event) -> Result<(), EventError>;
}

/// Sink that emits audit records through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: &Event) -> Result<(), EventError> {
        let metadata = serde_json::to_string(&event.metadata).map_err(|e| {
            EventError::SinkFailed {
                cause: e.to_string(),
            }
        })?;
        info!(
            target: "audit",
            event_type = %event.event_type,
            correlation_id = %event.correlation_id,
            user_email = event.user_email.as_deref().unwrap_or(""),
            timestamp = %event.timestamp.to_rfc3339(),
            metadata = %metadata,
            "Audit event"
        );
        Ok(())
    }
}

/// Handler forwarding every event to an [`AuditSink`].
pub struct AuditHandler {
    sink: Arc<dyn AuditSink>,
}

impl AuditHandler {
    pub const NAME: &'static str = "audit";

    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    /// Register an audit handler under the wildcard type.
    pub async fn install(dispatcher: &EventDispatcher, sink: Arc<dyn AuditSink>) {
        dispatcher
            .register(event_types::WILDCARD, Arc::new(Self::new(sink)))
            .await;
    }
}

#[async_trait]
impl EventHandler for AuditHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn handle(&self, event: &Event) -> Result<Value, EventError> {
        self.sink.record(event).await?;
        Ok(json!({
            "audited": true,
            "event_type": event.event_type,
            "correlation_id": event.correlation_id.to_string(),
        }))
    }
}
