//! Group orchestration configuration.

use std::env::VarError;

use opsbot_core::config::{parse_bool_or, parse_list};
use opsbot_core::ConfigError;
use opsbot_events::EventDispatcherConfig;
use opsbot_resilience::ResilienceConfig;

/// Everything the group orchestrator and its collaborators read at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupsConfig {
    pub resilience: ResilienceConfig,
    pub events: EventDispatcherConfig,
    /// Secondary providers excluded from propagation.
    pub disabled_providers: Vec<String>,
    /// Ask the primary whether the requestor may change the group.
    pub enforce_permissions: bool,
}

impl GroupsConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key))
    }

    /// Load configuration from a custom variable reader.
    pub fn from_reader<F>(reader: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, VarError>,
    {
        Ok(Self {
            resilience: ResilienceConfig::from_reader(&reader)?,
            events: EventDispatcherConfig::from_reader(&reader)?,
            disabled_providers: parse_list(&reader, "GROUPS_DISABLED_PROVIDERS"),
            enforce_permissions: parse_bool_or(&reader, "GROUPS_ENFORCE_PERMISSIONS", false)?,
        })
    }

    #[must_use]
    pub fn with_disabled_provider(mut self, name: impl Into<String>) -> Self {
        self.disabled_providers.push(name.into());
        self
    }

    #[must_use]
    pub fn with_enforce_permissions(mut self, enforce: bool) -> Self {
        self.enforce_permissions = enforce;
        self
    }

    #[must_use]
    pub fn is_disabled(&self, provider: &str) -> bool {
        self.disabled_providers.iter().any(|p| p == provider)
    }
}
