//! Error types for the opsbot-groups crate.
//!
//! Provider and orchestration outcomes travel as `OperationResult`; these
//! errors are reserved for wiring mistakes found at startup.

use thiserror::Error;

use opsbot_core::ConfigError;

/// Errors building providers from the registry.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// A provider with this name is already registered.
    #[error("provider '{0}' is already registered")]
    DuplicateProvider(String),

    /// No provider with this name is registered.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// A factory could not construct its provider.
    #[error("failed to build provider '{name}': {reason}")]
    Factory { name: String, reason: String },
}

impl ProviderError {
    pub fn factory(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Factory {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors constructing a [`GroupOrchestrator`](crate::GroupOrchestrator).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no primary provider configured")]
    NoPrimary,

    #[error("exactly one primary provider is allowed, found: {}", .0.join(", "))]
    MultiplePrimaries(Vec<String>),

    /// Two providers share a name.
    #[error("provider '{0}' is configured more than once")]
    DuplicateProvider(String),

    /// The primary is listed in `GROUPS_DISABLED_PROVIDERS`.
    #[error("primary provider '{0}' cannot be disabled")]
    PrimaryDisabled(String),

    /// The primary declares it cannot add or remove members.
    #[error("primary provider '{0}' does not support member management")]
    PrimaryReadOnly(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
