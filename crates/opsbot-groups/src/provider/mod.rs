//! Provider interface
//!
//! One adapter per external directory. Every call returns an
//! [`OperationResult`]; adapters own their own timeouts and report them as
//! transient errors. Group and user lifecycle is managed out of band, so the
//! create/delete operations default to `NOT_IMPLEMENTED`.

pub mod capabilities;
pub mod mapping;
pub mod normalize;
pub mod registry;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use opsbot_core::OperationResult;
use opsbot_events::event_types;

pub use capabilities::{ParseProviderKindError, ProviderCapabilities, ProviderKind};
pub use mapping::GroupNameMapping;
pub use registry::{ProviderFactory, ProviderRegistry};

/// Canonical member, independent of the source directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMember {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_member_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl NormalizedMember {
    /// Member with only an email. The email is trimmed and lowercased.
    pub fn new(email: impl AsRef<str>) -> Self {
        Self {
            email: email.as_ref().trim().to_lowercase(),
            id: None,
            role: None,
            provider_member_id: None,
            first_name: None,
            family_name: None,
            raw: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Canonical group. `id` is provider-local unless `provider` is the primary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedGroup {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub provider: String,
    #[serde(default)]
    pub members: Vec<NormalizedMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl NormalizedGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: None,
            provider: provider.into(),
            members: Vec::new(),
            raw: None,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Membership mutation carried through responses, retries and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    AddMember,
    RemoveMember,
}

impl MembershipAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipAction::AddMember => "add_member",
            MembershipAction::RemoveMember => "remove_member",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "add_member" => Some(MembershipAction::AddMember),
            "remove_member" => Some(MembershipAction::RemoveMember),
            _ => None,
        }
    }

    /// Event type announcing this action.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            MembershipAction::AddMember => event_types::GROUP_MEMBER_ADDED,
            MembershipAction::RemoveMember => event_types::GROUP_MEMBER_REMOVED,
        }
    }

    /// Invoke the matching provider operation.
    pub async fn apply(
        self,
        provider: &dyn GroupProvider,
        group_key: &str,
        member: &str,
        justification: Option<&str>,
    ) -> OperationResult<NormalizedMember> {
        match self {
            MembershipAction::AddMember => {
                provider.add_member(group_key, member, justification).await
            }
            MembershipAction::RemoveMember => {
                provider.remove_member(group_key, member, justification).await
            }
        }
    }
}

impl fmt::Display for MembershipAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Options for [`GroupProvider::get_group_members`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberQuery {
    /// Include members inherited through nested groups.
    pub include_derived: bool,
    /// Only members holding one of these roles. Empty means all.
    pub roles: Vec<String>,
    pub max_results: Option<usize>,
}

impl MemberQuery {
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    #[must_use]
    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    #[must_use]
    pub fn include_derived(mut self) -> Self {
        self.include_derived = true;
        self
    }
}

/// Contract every directory adapter implements.
#[async_trait]
pub trait GroupProvider: Send + Sync {
    /// Registry name, also the circuit breaker and propagation key.
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> &ProviderCapabilities;

    /// How canonical group ids map onto this directory's ids.
    fn group_name_mapping(&self) -> GroupNameMapping {
        GroupNameMapping::for_kind(self.kind())
    }

    fn is_primary(&self) -> bool {
        self.capabilities().is_primary
    }

    async fn list_groups_for_user(&self, user_key: &str) -> OperationResult<Vec<NormalizedGroup>>;

    async fn add_member(
        &self,
        group_key: &str,
        member: &str,
        justification: Option<&str>,
    ) -> OperationResult<NormalizedMember>;

    async fn remove_member(
        &self,
        group_key: &str,
        member: &str,
        justification: Option<&str>,
    ) -> OperationResult<NormalizedMember>;

    async fn get_group_members(
        &self,
        group_key: &str,
        query: &MemberQuery,
    ) -> OperationResult<Vec<NormalizedMember>>;

    /// Whether `user_key` may perform `action` on `group_key`.
    async fn validate_permissions(
        &self,
        user_key: &str,
        group_key: &str,
        action: MembershipAction,
    ) -> OperationResult<bool>;

    async fn healthcheck(&self) -> OperationResult<bool>;

    async fn create_group(
        &self,
        _name: &str,
        _description: Option<&str>,
    ) -> OperationResult<NormalizedGroup> {
        OperationResult::not_implemented("create_group")
    }

    async fn delete_group(&self, _group_key: &str) -> OperationResult<()> {
        OperationResult::not_implemented("delete_group")
    }

    async fn create_user(&self, _email: &str) -> OperationResult<NormalizedMember> {
        OperationResult::not_implemented("create_user")
    }

    async fn delete_user(&self, _user_key: &str) -> OperationResult<()> {
        OperationResult::not_implemented("delete_user")
    }
}
