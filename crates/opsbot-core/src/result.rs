//! Uniform outcome contract.
//!
//! Every provider adapter call and every orchestration step produces an
//! [`OperationResult`]. Expected runtime outcomes (timeouts, missing groups,
//! denied permissions) are statuses, not errors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Well-known values for [`OperationResult::error_code`].
pub mod codes {
    /// The provider's circuit breaker rejected the call without reaching it.
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    /// The adapter does not support the operation (group/user lifecycle).
    pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
    /// The external call timed out.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// The external directory throttled the call.
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    /// An identical request is still executing elsewhere.
    pub const DUPLICATE_IN_PROGRESS: &str = "DUPLICATE_IN_PROGRESS";
    /// The request named a provider that is not registered.
    pub const UNKNOWN_PROVIDER: &str = "UNKNOWN_PROVIDER";
    /// A stored payload could not be interpreted.
    pub const INVALID_PAYLOAD: &str = "INVALID_PAYLOAD";
    /// The requestor may not perform the action on the group.
    pub const PERMISSION_DENIED: &str = "PERMISSION_DENIED";
}

/// Outcome classification shared by all adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    /// The call completed.
    Success,
    /// Network, timeout or rate-limit failure. Retryable.
    TransientError,
    /// Validation, conflict or unsupported operation. Not retryable.
    PermanentError,
    /// The bot's credentials were rejected by the directory.
    Unauthorized,
    /// The group or member does not exist in the directory.
    NotFound,
}

impl OperationStatus {
    /// Get the wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Success => "SUCCESS",
            OperationStatus::TransientError => "TRANSIENT_ERROR",
            OperationStatus::PermanentError => "PERMANENT_ERROR",
            OperationStatus::Unauthorized => "UNAUTHORIZED",
            OperationStatus::NotFound => "NOT_FOUND",
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, OperationStatus::Success)
    }

    /// Check if a failed call with this status is worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, OperationStatus::TransientError)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = ParseOperationStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SUCCESS" => Ok(OperationStatus::Success),
            "TRANSIENT_ERROR" => Ok(OperationStatus::TransientError),
            "PERMANENT_ERROR" => Ok(OperationStatus::PermanentError),
            "UNAUTHORIZED" => Ok(OperationStatus::Unauthorized),
            "NOT_FOUND" => Ok(OperationStatus::NotFound),
            _ => Err(ParseOperationStatusError(s.to_string())),
        }
    }
}

/// Error parsing an operation status from string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid operation status '{0}'")]
pub struct ParseOperationStatusError(String);

/// Immutable outcome of one adapter call or orchestration step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct OperationResult<T> {
    pub status: OperationStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Seconds the caller should wait before trying again, if the directory said so.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl<T> OperationResult<T> {
    fn with_status(status: OperationStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            data: None,
            error_code: None,
            retry_after: None,
        }
    }

    /// A successful result carrying `data`.
    pub fn success(data: T) -> Self {
        Self::success_with_message(data, "ok")
    }

    pub fn success_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            data: Some(data),
            ..Self::with_status(OperationStatus::Success, message)
        }
    }

    pub fn transient_error(message: impl Into<String>) -> Self {
        Self::with_status(OperationStatus::TransientError, message)
    }

    pub fn permanent_error(message: impl Into<String>) -> Self {
        Self::with_status(OperationStatus::PermanentError, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::with_status(OperationStatus::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::with_status(OperationStatus::NotFound, message)
    }

    /// Result for an operation the adapter deliberately does not support.
    pub fn not_implemented(operation: &str) -> Self {
        Self::permanent_error(format!("{operation} is not supported by this provider"))
            .with_error_code(codes::NOT_IMPLEMENTED)
    }

    /// Result for a call that exceeded its deadline.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::transient_error(message).with_error_code(codes::TIMEOUT)
    }

    #[must_use]
    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.status.is_transient()
    }

    /// Transform the carried data, keeping status and metadata.
    pub fn map<U, F>(self, f: F) -> OperationResult<U>
    where
        F: FnOnce(T) -> U,
    {
        OperationResult {
            status: self.status,
            message: self.message,
            data: self.data.map(f),
            error_code: self.error_code,
            retry_after: self.retry_after,
        }
    }

    /// Re-type a failed result. Any carried data is dropped.
    pub fn cast<U>(self) -> OperationResult<U> {
        OperationResult {
            status: self.status,
            message: self.message,
            data: None,
            error_code: self.error_code,
            retry_after: self.retry_after,
        }
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }
}
