//! Shared fixtures for opsbot-groups integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use opsbot_core::OperationResult;
use opsbot_groups::{
    GroupProvider, MemberQuery, MembershipAction, NormalizedGroup, NormalizedMember,
    ProviderCapabilities, ProviderKind,
};

/// How a mock provider answers mutating calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Succeed,
    Timeout,
    Permanent,
    NotFound,
}

impl Behaviour {
    fn answer(self, provider: &str, member: &str) -> OperationResult<NormalizedMember> {
        match self {
            Behaviour::Succeed => OperationResult::success(NormalizedMember::new(member)),
            Behaviour::Timeout => OperationResult::timeout(format!("{provider} timed out")),
            Behaviour::Permanent => {
                OperationResult::permanent_error(format!("{provider} rejected the request"))
            }
            Behaviour::NotFound => OperationResult::not_found(format!("{provider}: no such group")),
        }
    }
}

/// One recorded mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub action: MembershipAction,
    pub group_key: String,
    pub member: String,
}

/// Scriptable directory adapter.
pub struct MockProvider {
    name: String,
    kind: ProviderKind,
    capabilities: ProviderCapabilities,
    behaviour: Mutex<Behaviour>,
    list_behaviour: Mutex<Behaviour>,
    permitted: bool,
    groups: Vec<NormalizedGroup>,
    gate: Option<Arc<Notify>>,
    calls: Mutex<Vec<Call>>,
    mutations: AtomicUsize,
    permission_checks: AtomicUsize,
    member_queries: AtomicUsize,
}

impl MockProvider {
    fn build(name: &str, kind: ProviderKind, capabilities: ProviderCapabilities) -> Self {
        Self {
            name: name.to_string(),
            kind,
            capabilities,
            behaviour: Mutex::new(Behaviour::Succeed),
            list_behaviour: Mutex::new(Behaviour::Succeed),
            permitted: true,
            groups: Vec::new(),
            gate: None,
            calls: Mutex::new(Vec::new()),
            mutations: AtomicUsize::new(0),
            permission_checks: AtomicUsize::new(0),
            member_queries: AtomicUsize::new(0),
        }
    }

    pub fn primary(name: &str) -> Self {
        Self::build(name, ProviderKind::Google, ProviderCapabilities::primary())
    }

    pub fn secondary(name: &str, kind: ProviderKind) -> Self {
        Self::build(name, kind, ProviderCapabilities::secondary())
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_behaviour(self, behaviour: Behaviour) -> Self {
        self.set_behaviour(behaviour);
        self
    }

    pub fn with_list_behaviour(self, behaviour: Behaviour) -> Self {
        *self.list_behaviour.lock().unwrap() = behaviour;
        self
    }

    pub fn with_permission(mut self, permitted: bool) -> Self {
        self.permitted = permitted;
        self
    }

    pub fn with_groups(mut self, ids: &[&str]) -> Self {
        self.groups = ids
            .iter()
            .map(|id| NormalizedGroup::new(*id, *id, self.name.clone()))
            .collect();
        self
    }

    /// Mutating calls wait for `gate` before answering.
    pub fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn permission_checks(&self) -> usize {
        self.permission_checks.load(Ordering::SeqCst)
    }

    pub fn member_queries(&self) -> usize {
        self.member_queries.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn mutate(
        &self,
        action: MembershipAction,
        group_key: &str,
        member: &str,
    ) -> OperationResult<NormalizedMember> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            action,
            group_key: group_key.to_string(),
            member: member.to_string(),
        });
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let behaviour = *self.behaviour.lock().unwrap();
        behaviour.answer(&self.name, member)
    }
}

#[async_trait]
impl GroupProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    async fn list_groups_for_user(&self, _user_key: &str) -> OperationResult<Vec<NormalizedGroup>> {
        let behaviour = *self.list_behaviour.lock().unwrap();
        match behaviour {
            Behaviour::Succeed => OperationResult::success(self.groups.clone()),
            other => other.answer(&self.name, "").cast(),
        }
    }

    async fn add_member(
        &self,
        group_key: &str,
        member: &str,
        _justification: Option<&str>,
    ) -> OperationResult<NormalizedMember> {
        self.mutate(MembershipAction::AddMember, group_key, member).await
    }

    async fn remove_member(
        &self,
        group_key: &str,
        member: &str,
        _justification: Option<&str>,
    ) -> OperationResult<NormalizedMember> {
        self.mutate(MembershipAction::RemoveMember, group_key, member).await
    }

    async fn get_group_members(
        &self,
        _group_key: &str,
        _query: &MemberQuery,
    ) -> OperationResult<Vec<NormalizedMember>> {
        self.member_queries.fetch_add(1, Ordering::SeqCst);
        OperationResult::success(Vec::new())
    }

    async fn validate_permissions(
        &self,
        _user_key: &str,
        _group_key: &str,
        _action: MembershipAction,
    ) -> OperationResult<bool> {
        self.permission_checks.fetch_add(1, Ordering::SeqCst);
        OperationResult::success(self.permitted)
    }

    async fn healthcheck(&self) -> OperationResult<bool> {
        let behaviour = *self.behaviour.lock().unwrap();
        match behaviour {
            Behaviour::Succeed => OperationResult::success(true),
            other => other.answer(&self.name, "").cast(),
        }
    }
}

/// Install a test subscriber when diagnosing a failure.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}
