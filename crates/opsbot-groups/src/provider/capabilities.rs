//! Static per-provider flags.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Directory family a provider talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Workspace directory (Google Workspace groups)
    Google,
    /// Cloud IAM directory (AWS Identity Center groups)
    Aws,
}

impl ProviderKind {
    #[must_use]
    pub fn all() -> &'static [ProviderKind] {
        &[ProviderKind::Google, ProviderKind::Aws]
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Google => "google",
            ProviderKind::Aws => "aws",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ParseProviderKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "google" => Ok(ProviderKind::Google),
            "aws" => Ok(ProviderKind::Aws),
            _ => Err(ParseProviderKindError(s.to_string())),
        }
    }
}

/// Error parsing a provider kind from string.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid provider kind '{0}', expected one of: google, aws")]
pub struct ParseProviderKindError(String);

/// What a provider can do. Fixed when the provider is constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub supports_member_management: bool,
    /// Source of truth for canonical group ids.
    pub is_primary: bool,
    pub provides_role_info: bool,
    pub supports_batch_operations: bool,
    pub max_batch_size: usize,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supports_member_management: true,
            is_primary: false,
            provides_role_info: false,
            supports_batch_operations: false,
            max_batch_size: 1,
        }
    }
}

impl ProviderCapabilities {
    /// Capabilities of a secondary provider.
    #[must_use]
    pub fn secondary() -> Self {
        Self::default()
    }

    /// Capabilities of the primary provider.
    #[must_use]
    pub fn primary() -> Self {
        Self {
            is_primary: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_role_info(mut self, provides: bool) -> Self {
        self.provides_role_info = provides;
        self
    }

    /// Enable batch operations of at most `max_batch_size` items.
    #[must_use]
    pub fn with_batch(mut self, max_batch_size: usize) -> Self {
        self.supports_batch_operations = max_batch_size > 1;
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.supports_member_management = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        for kind in ProviderKind::all() {
            assert_eq!(kind.as_str().parse::<ProviderKind>().unwrap(), *kind);
        }
        assert_eq!("AWS".parse::<ProviderKind>().unwrap(), ProviderKind::Aws);
        let err = "okta".parse::<ProviderKind>().unwrap_err();
        assert!(err.to_string().contains("okta"));
    }

    #[test]
    fn test_capability_builders() {
        let caps = ProviderCapabilities::primary()
            .with_role_info(true)
            .with_batch(50);
        assert!(caps.is_primary);
        assert!(caps.provides_role_info);
        assert!(caps.supports_batch_operations);
        assert_eq!(caps.max_batch_size, 50);

        let caps = ProviderCapabilities::secondary().with_batch(0).read_only();
        assert!(!caps.is_primary);
        assert!(!caps.supports_batch_operations);
        assert_eq!(caps.max_batch_size, 1);
        assert!(!caps.supports_member_management);
    }
}
