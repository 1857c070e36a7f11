//! Error types for the opsbot-events crate.

use thiserror::Error;

use opsbot_core::ConfigError;

/// Errors that can occur while building or dispatching events.
#[derive(Debug, Error)]
pub enum EventError {
    /// A serialized event could not be interpreted.
    #[error("Invalid event payload: {reason}")]
    InvalidPayload { reason: String },

    /// A handler returned an error.
    #[error("Handler {handler} failed: {cause}")]
    HandlerFailed { handler: String, cause: String },

    /// A handler panicked.
    #[error("Handler {handler} panicked: {cause}")]
    HandlerPanicked { handler: String, cause: String },

    /// `start_event_executor` was called while workers are running.
    #[error("Event executor is already running")]
    AlreadyRunning,

    /// The audit sink rejected an event.
    #[error("Audit sink failed: {cause}")]
    SinkFailed { cause: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EventError {
    pub fn handler_failed(handler: impl Into<String>, cause: impl ToString) -> Self {
        Self::HandlerFailed {
            handler: handler.into(),
            cause: cause.to_string(),
        }
    }

    /// Check if retrying the same operation could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::SinkFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = EventError::handler_failed("audit", "disk full");
        assert_eq!(err.to_string(), "Handler audit failed: disk full");
        assert!(!err.is_transient());
    }
}
