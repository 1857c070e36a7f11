//! Canonical to provider-local group name mapping.
//!
//! The primary provider's group id is canonical. Secondaries name the same
//! group by a deterministic transform: optional prefix/suffix, an optional
//! stripped email domain, optional lowercasing.

use serde::{Deserialize, Serialize};

use super::capabilities::ProviderKind;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupNameMapping {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
    /// Drop everything from the first `@` (`eng-team@corp.com` -> `eng-team`).
    #[serde(default)]
    pub strip_domain: bool,
    #[serde(default)]
    pub lowercase: bool,
}

impl GroupNameMapping {
    /// Identity mapping.
    #[must_use]
    pub fn identity() -> Self {
        Self::default()
    }

    /// Default mapping for a directory family.
    #[must_use]
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Google => Self::identity(),
            ProviderKind::Aws => Self::identity().with_strip_domain(true),
        }
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    #[must_use]
    pub fn with_strip_domain(mut self, strip: bool) -> Self {
        self.strip_domain = strip;
        self
    }

    #[must_use]
    pub fn with_lowercase(mut self, lowercase: bool) -> Self {
        self.lowercase = lowercase;
        self
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        *self == Self::identity()
    }

    /// Provider-local id for a canonical group id.
    #[must_use]
    pub fn to_provider(&self, canonical: &str) -> String {
        let base = if self.strip_domain {
            canonical.split('@').next().unwrap_or(canonical)
        } else {
            canonical
        };
        let mapped = format!("{}{}{}", self.prefix, base, self.suffix);
        if self.lowercase {
            mapped.to_lowercase()
        } else {
            mapped
        }
    }

    /// Canonical id for a provider-local id.
    ///
    /// Only the prefix and suffix are reversible; a stripped domain or the
    /// original casing cannot be recovered.
    #[must_use]
    pub fn to_canonical(&self, local: &str) -> String {
        let without_prefix = local.strip_prefix(self.prefix.as_str()).unwrap_or(local);
        without_prefix
            .strip_suffix(self.suffix.as_str())
            .unwrap_or(without_prefix)
            .to_string()
    }
}
