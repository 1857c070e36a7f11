//! opsbot Core Library
//!
//! Shared types for the opsbot group membership engine.
//!
//! # Modules
//!
//! - [`result`] - The uniform outcome contract (`OperationResult`, `OperationStatus`)
//! - [`ids`] - Strongly typed identifiers (`CorrelationId`, `RetryRecordId`, `LeaseToken`)
//! - [`config`] - Environment reader helpers shared by every subsystem config
//!
//! # Example
//!
//! ```
//! use opsbot_core::{CorrelationId, OperationResult, OperationStatus};
//!
//! let correlation_id = CorrelationId::new();
//! let result: OperationResult<u32> = OperationResult::transient_error("directory timed out");
//!
//! assert_eq!(result.status, OperationStatus::TransientError);
//! assert!(!correlation_id.to_string().is_empty());
//! ```

pub mod config;
pub mod ids;
pub mod result;

pub use config::{env_reader, ConfigError};
pub use ids::{CorrelationId, LeaseToken, RetryRecordId};
pub use result::{codes, OperationResult, OperationStatus, ParseOperationStatusError};
