//! Group membership orchestrator
//!
//! Coordinates one primary write with propagation to every enabled
//! secondary provider:
//!
//! 1. Deduplicate through the idempotency cache (a completed duplicate
//!    returns the first response, an in-flight duplicate is refused).
//! 2. Optionally ask the primary whether the requestor may make the change.
//! 3. Write to the primary through its circuit breaker. Any failure aborts.
//! 4. Propagate to secondaries that manage members, through their own
//!    breakers. Transient failures (including open breakers) are queued for
//!    retry.
//! 5. Cache successful responses and emit a `group.member.*` event.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tracing::{debug, error, info, instrument, warn};

use opsbot_core::{codes, CorrelationId, OperationResult};
use opsbot_events::EventDispatcher;
use opsbot_resilience::{
    idempotency_key, CircuitBreakerRegistry, IdempotencyCache, InMemoryRetryStore, Lookup,
    RetryStore,
};

use crate::config::GroupsConfig;
use crate::error::OrchestratorError;
use crate::propagation::{MembershipPropagationProcessor, PropagationPayload};
use crate::provider::{
    GroupProvider, MemberQuery, MembershipAction, NormalizedGroup, NormalizedMember,
    ProviderRegistry,
};
use crate::response::OrchestrationResponse;

/// Idempotency namespace for membership mutations.
pub const IDEMPOTENCY_NAMESPACE: &str = "groups";

/// Error reported to a duplicate of a request that is still executing.
pub const DUPLICATE_IN_PROGRESS: &str = "duplicate request in progress";

/// A membership change as received from the chat/API layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipRequest {
    /// Canonical (primary) group id.
    pub group_id: String,
    pub member_email: String,
    /// Restrict propagation to this secondary. Naming the primary means all.
    pub provider_hint: Option<String>,
    pub justification: Option<String>,
    pub requestor_email: Option<String>,
}

impl MembershipRequest {
    pub fn new(group_id: impl Into<String>, member_email: impl AsRef<str>) -> Self {
        let group_id: String = group_id.into();
        Self {
            group_id: group_id.trim().to_string(),
            member_email: normalize_email(member_email.as_ref()),
            provider_hint: None,
            justification: None,
            requestor_email: None,
        }
    }

    #[must_use]
    pub fn with_provider_hint(mut self, provider: impl Into<String>) -> Self {
        self.provider_hint = Some(provider.into());
        self
    }

    #[must_use]
    pub fn with_justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    #[must_use]
    pub fn with_requestor(mut self, requestor: impl AsRef<str>) -> Self {
        self.requestor_email = Some(normalize_email(requestor.as_ref()));
        self
    }

    /// Deterministic idempotency key for `action` on this request.
    #[must_use]
    pub fn idempotency_key(&self, action: MembershipAction) -> String {
        let mut components = vec![
            format!("group:{}", self.group_id),
            format!("member:{}", normalize_email(&self.member_email)),
        ];
        if let Some(requestor) = &self.requestor_email {
            components.push(format!("requestor:{}", normalize_email(requestor)));
        }
        if let Some(hint) = &self.provider_hint {
            components.push(format!("provider:{hint}"));
        }
        idempotency_key(IDEMPOTENCY_NAMESPACE, action.as_str(), components)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Multi-provider membership orchestrator.
#[derive(Clone)]
pub struct GroupOrchestrator {
    primary: Arc<dyn GroupProvider>,
    secondaries: Vec<Arc<dyn GroupProvider>>,
    breakers: CircuitBreakerRegistry,
    idempotency: Arc<IdempotencyCache>,
    retry_store: Arc<dyn RetryStore>,
    dispatcher: EventDispatcher,
    config: GroupsConfig,
}

impl GroupOrchestrator {
    /// Build an orchestrator over `providers` with process-local stores.
    ///
    /// Fails unless exactly one provider is primary, it manages members, and
    /// names are unique.
    pub fn new(
        providers: Vec<Arc<dyn GroupProvider>>,
        config: GroupsConfig,
    ) -> Result<Self, OrchestratorError> {
        let mut seen = HashSet::new();
        for provider in &providers {
            if !seen.insert(provider.name().to_string()) {
                return Err(OrchestratorError::DuplicateProvider(
                    provider.name().to_string(),
                ));
            }
        }

        let (mut primaries, secondaries): (Vec<_>, Vec<_>) =
            providers.into_iter().partition(|p| p.is_primary());
        let primary = match primaries.len() {
            0 => return Err(OrchestratorError::NoPrimary),
            1 => primaries.remove(0),
            _ => {
                return Err(OrchestratorError::MultiplePrimaries(
                    primaries.iter().map(|p| p.name().to_string()).collect(),
                ))
            }
        };
        if config.is_disabled(primary.name()) {
            return Err(OrchestratorError::PrimaryDisabled(primary.name().to_string()));
        }
        if !primary.capabilities().supports_member_management {
            return Err(OrchestratorError::PrimaryReadOnly(primary.name().to_string()));
        }

        info!(
            target: "groups",
            primary = %primary.name(),
            secondaries = ?secondaries.iter().map(|p| p.name()).collect::<Vec<_>>(),
            disabled = ?config.disabled_providers,
            read_only = ?secondaries
                .iter()
                .filter(|p| !p.capabilities().supports_member_management)
                .map(|p| p.name())
                .collect::<Vec<_>>(),
            "Group orchestrator configured"
        );

        Ok(Self {
            primary,
            secondaries,
            breakers: CircuitBreakerRegistry::new(config.resilience.circuit_breaker.clone()),
            idempotency: Arc::new(IdempotencyCache::in_memory(
                config.resilience.idempotency.clone(),
            )),
            retry_store: Arc::new(InMemoryRetryStore::new()),
            dispatcher: EventDispatcher::new(config.events.clone()),
            config,
        })
    }

    /// Build every provider in `registry` and orchestrate over them.
    pub fn from_registry(
        registry: &ProviderRegistry,
        config: GroupsConfig,
    ) -> Result<Self, OrchestratorError> {
        Self::new(registry.instantiate()?, config)
    }

    #[must_use]
    pub fn with_breakers(mut self, breakers: CircuitBreakerRegistry) -> Self {
        self.breakers = breakers;
        self
    }

    #[must_use]
    pub fn with_idempotency(mut self, cache: Arc<IdempotencyCache>) -> Self {
        self.idempotency = cache;
        self
    }

    #[must_use]
    pub fn with_retry_store(mut self, store: Arc<dyn RetryStore>) -> Self {
        self.retry_store = store;
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: EventDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    #[must_use]
    pub fn primary(&self) -> &Arc<dyn GroupProvider> {
        &self.primary
    }

    #[must_use]
    pub fn secondaries(&self) -> &[Arc<dyn GroupProvider>] {
        &self.secondaries
    }

    #[must_use]
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    #[must_use]
    pub fn idempotency(&self) -> &Arc<IdempotencyCache> {
        &self.idempotency
    }

    #[must_use]
    pub fn retry_store(&self) -> &Arc<dyn RetryStore> {
        &self.retry_store
    }

    #[must_use]
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    #[must_use]
    pub fn config(&self) -> &GroupsConfig {
        &self.config
    }

    /// Retry processor replaying propagation through this orchestrator's
    /// providers and breakers.
    #[must_use]
    pub fn propagation_processor(&self) -> MembershipPropagationProcessor {
        let mut providers = vec![Arc::clone(&self.primary)];
        providers.extend(self.secondaries.iter().cloned());
        MembershipPropagationProcessor::new(&providers, self.breakers.clone())
    }

    fn enabled_secondaries(&self) -> impl Iterator<Item = &Arc<dyn GroupProvider>> {
        self.secondaries
            .iter()
            .filter(|p| !self.config.is_disabled(p.name()))
    }

    /// Enabled secondaries that accept membership writes.
    fn propagation_targets(&self) -> impl Iterator<Item = &Arc<dyn GroupProvider>> {
        self.enabled_secondaries()
            .filter(|p| p.capabilities().supports_member_management)
    }

    pub async fn add_member_to_group(
        &self,
        group_id: &str,
        member_email: &str,
        justification: Option<&str>,
    ) -> OrchestrationResponse {
        let mut request = MembershipRequest::new(group_id, member_email);
        request.justification = justification.map(str::to_string);
        self.execute(MembershipAction::AddMember, request).await
    }

    pub async fn remove_member_from_group(
        &self,
        group_id: &str,
        member_email: &str,
        justification: Option<&str>,
    ) -> OrchestrationResponse {
        let mut request = MembershipRequest::new(group_id, member_email);
        request.justification = justification.map(str::to_string);
        self.execute(MembershipAction::RemoveMember, request).await
    }

    /// Run `action` for `request`. Never fails; problems are reported in the
    /// response.
    pub async fn execute(
        &self,
        action: MembershipAction,
        request: MembershipRequest,
    ) -> OrchestrationResponse {
        let correlation_id = CorrelationId::new();
        self.orchestrate(action, request, correlation_id).await
    }

    #[instrument(
        skip_all,
        fields(
            correlation_id = %correlation_id,
            action = %action,
            group_id = %request.group_id,
        )
    )]
    async fn orchestrate(
        &self,
        action: MembershipAction,
        mut request: MembershipRequest,
        correlation_id: CorrelationId,
    ) -> OrchestrationResponse {
        request.member_email = normalize_email(&request.member_email);
        let response = OrchestrationResponse::new(
            action,
            request.group_id.clone(),
            request.member_email.clone(),
            correlation_id,
            self.primary.name(),
        );

        if request.group_id.is_empty() || request.member_email.is_empty() {
            let response = response.fail("group_id and member_email are required");
            self.emit(&response, &request).await;
            return response;
        }

        let targets = match self.resolve_targets(request.provider_hint.as_deref()) {
            Ok(targets) => targets,
            Err(reason) => {
                let response = response.fail(reason);
                self.emit(&response, &request).await;
                return response;
            }
        };

        let key = request.idempotency_key(action);
        let reserved = match self.idempotency.begin::<OrchestrationResponse>(&key).await {
            Ok(Lookup::Cached(cached)) => {
                debug!(
                    target: "groups",
                    original_correlation_id = %cached.correlation_id,
                    "Returning cached orchestration response"
                );
                return cached;
            }
            Ok(Lookup::InFlight) => {
                info!(target: "groups", "Duplicate request still in flight");
                return response.fail(DUPLICATE_IN_PROGRESS);
            }
            Ok(Lookup::Execute) => true,
            Err(e) => {
                warn!(
                    target: "groups",
                    error = %e,
                    "Idempotency store unavailable, executing uncached"
                );
                false
            }
        };

        let response = self.run(action, &request, targets, response).await;

        if reserved {
            let stored = if response.success {
                self.idempotency.set(&key, &response).await
            } else {
                self.idempotency.abandon(&key).await
            };
            if let Err(e) = stored {
                warn!(
                    target: "groups",
                    error = %e,
                    success = response.success,
                    "Failed to settle idempotency entry"
                );
            }
        }

        self.emit(&response, &request).await;
        response
    }

    /// Secondaries to propagate to, given an optional provider hint.
    fn resolve_targets(&self, hint: Option<&str>) -> Result<Vec<Arc<dyn GroupProvider>>, String> {
        match hint {
            None => Ok(self.propagation_targets().cloned().collect()),
            Some(name) if name == self.primary.name() => {
                Ok(self.propagation_targets().cloned().collect())
            }
            Some(name) => {
                let provider = self
                    .secondaries
                    .iter()
                    .find(|p| p.name() == name)
                    .ok_or_else(|| format!("unknown provider '{name}'"))?;
                if self.config.is_disabled(name) {
                    return Err(format!("provider '{name}' is disabled"));
                }
                if !provider.capabilities().supports_member_management {
                    return Err(format!("provider '{name}' does not support member management"));
                }
                Ok(vec![Arc::clone(provider)])
            }
        }
    }

    async fn run(
        &self,
        action: MembershipAction,
        request: &MembershipRequest,
        targets: Vec<Arc<dyn GroupProvider>>,
        mut response: OrchestrationResponse,
    ) -> OrchestrationResponse {
        let primary_name = self.primary.name();
        let primary_group = self
            .primary
            .group_name_mapping()
            .to_provider(&request.group_id);

        if let Some(denied) = self.check_permissions(action, request, &primary_group).await {
            let reason = format!(
                "permission check on primary provider '{primary_name}' failed: {}",
                denied.message
            );
            response.primary = Some(denied);
            return response.fail(reason);
        }

        let primary_result = self
            .breakers
            .call(primary_name, || {
                action.apply(
                    self.primary.as_ref(),
                    &primary_group,
                    &request.member_email,
                    request.justification.as_deref(),
                )
            })
            .await;

        if !primary_result.is_success() {
            warn!(
                target: "groups",
                provider = %primary_name,
                status = %primary_result.status,
                error = %primary_result.message,
                "Primary provider failed, aborting orchestration"
            );
            let reason = format!(
                "primary provider '{primary_name}' failed: {}",
                primary_result.message
            );
            response.primary = Some(primary_result);
            return response.fail(reason);
        }
        response.primary = Some(primary_result);
        response.success = true;

        let outcomes = join_all(
            targets
                .iter()
                .map(|provider| self.propagate(action, request, provider.as_ref())),
        )
        .await;

        for (provider, result) in targets.iter().zip(outcomes) {
            let name = provider.name().to_string();
            let result = if result.is_transient() {
                match self.enqueue_retry(action, request, &name, response.correlation_id).await {
                    Ok(()) => {
                        response.queued_for_retry.push(name.clone());
                        result
                    }
                    Err(reason) => OperationResult {
                        message: format!("{} (retry enqueue failed: {reason})", result.message),
                        ..result
                    },
                }
            } else {
                result
            };
            if !result.is_success() {
                response.partial_failures = true;
            }
            response.propagation.insert(name, result);
        }

        if response.partial_failures {
            warn!(
                target: "groups",
                failed = ?response.failed_providers(),
                queued = ?response.queued_for_retry,
                "Orchestration completed with partial failures"
            );
        } else {
            info!(
                target: "groups",
                secondaries = response.propagation.len(),
                "Orchestration completed"
            );
        }
        response
    }

    /// `Some(result)` when the requestor is not allowed to proceed.
    async fn check_permissions(
        &self,
        action: MembershipAction,
        request: &MembershipRequest,
        primary_group: &str,
    ) -> Option<OperationResult<NormalizedMember>> {
        if !self.config.enforce_permissions {
            return None;
        }
        let requestor = request.requestor_email.as_deref()?;

        let result = self
            .breakers
            .call(self.primary.name(), || {
                self.primary
                    .validate_permissions(requestor, primary_group, action)
            })
            .await;

        if !result.is_success() {
            return Some(result.cast());
        }
        if result.data == Some(true) {
            return None;
        }
        Some(
            OperationResult::unauthorized(format!(
                "{requestor} may not {action} on {primary_group}"
            ))
            .with_error_code(codes::PERMISSION_DENIED),
        )
    }

    async fn propagate(
        &self,
        action: MembershipAction,
        request: &MembershipRequest,
        provider: &dyn GroupProvider,
    ) -> OperationResult<NormalizedMember> {
        let local_group = provider.group_name_mapping().to_provider(&request.group_id);
        let result = self
            .breakers
            .call(provider.name(), || {
                action.apply(
                    provider,
                    &local_group,
                    &request.member_email,
                    request.justification.as_deref(),
                )
            })
            .await;

        if result.is_success() {
            debug!(target: "groups", provider = %provider.name(), group = %local_group, "Propagated");
        } else {
            warn!(
                target: "groups",
                provider = %provider.name(),
                group = %local_group,
                status = %result.status,
                error_code = result.error_code.as_deref().unwrap_or(""),
                error = %result.message,
                "Propagation to secondary provider failed"
            );
        }
        result
    }

    async fn enqueue_retry(
        &self,
        action: MembershipAction,
        request: &MembershipRequest,
        provider: &str,
        correlation_id: CorrelationId,
    ) -> Result<(), String> {
        let record = PropagationPayload {
            group_id: request.group_id.clone(),
            provider: provider.to_string(),
            member_email: request.member_email.clone(),
            action,
            correlation_id,
            justification: request.justification.clone(),
        }
        .into_record()
        .map_err(|e| e.to_string())?;

        match self.retry_store.enqueue(record).await {
            Ok(record_id) => {
                info!(
                    target: "groups",
                    provider = %provider,
                    record_id = %record_id,
                    "Queued propagation retry"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    target: "groups",
                    provider = %provider,
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to queue propagation retry"
                );
                Err(e.to_string())
            }
        }
    }

    async fn emit(&self, response: &OrchestrationResponse, request: &MembershipRequest) {
        let event = response.to_event(
            request
                .requestor_email
                .as_deref()
                .or(Some(request.member_email.as_str())),
        );
        // Not running, saturated or shut down mid-call: deliver inline instead.
        if !self.dispatcher.dispatch_background(event.clone()).await {
            self.dispatcher.dispatch_event(&event).await;
        }
    }

    /// Groups `user_key` belongs to, keyed by canonical id.
    ///
    /// Queries the primary only, or with `merge` every enabled provider.
    /// Secondary failures are logged and skipped; a primary failure is
    /// returned as is.
    #[instrument(skip(self))]
    pub async fn list_groups_for_user(
        &self,
        user_key: &str,
        merge: bool,
    ) -> OperationResult<Vec<NormalizedGroup>> {
        let mut providers = vec![Arc::clone(&self.primary)];
        if merge {
            providers.extend(self.enabled_secondaries().cloned());
        }

        let results = join_all(providers.iter().map(|provider| {
            self.breakers
                .call(provider.name(), || provider.list_groups_for_user(user_key))
        }))
        .await;

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        for (provider, result) in providers.iter().zip(results) {
            if !result.is_success() {
                if provider.is_primary() {
                    return result;
                }
                warn!(
                    target: "groups",
                    provider = %provider.name(),
                    status = %result.status,
                    error = %result.message,
                    "Skipping provider while listing groups"
                );
                continue;
            }

            let mapping = provider.group_name_mapping();
            for mut group in result.into_data().unwrap_or_default() {
                group.id = mapping.to_canonical(&group.id);
                if seen.insert(group.id.clone()) {
                    merged.push(group);
                }
            }
        }

        OperationResult::success(merged)
    }

    /// Members of canonical group `group_id` as the primary sees them.
    ///
    /// Role filters are refused when the primary does not report roles.
    #[instrument(skip(self, query))]
    pub async fn get_group_members(
        &self,
        group_id: &str,
        query: &MemberQuery,
    ) -> OperationResult<Vec<NormalizedMember>> {
        if !query.roles.is_empty() && !self.primary.capabilities().provides_role_info {
            return OperationResult::permanent_error(format!(
                "provider '{}' does not report member roles",
                self.primary.name()
            ))
            .with_error_code(codes::NOT_IMPLEMENTED);
        }

        let group_key = self.primary.group_name_mapping().to_provider(group_id);
        self.breakers
            .call(self.primary.name(), || {
                self.primary.get_group_members(&group_key, query)
            })
            .await
    }

    /// Health of every provider, keyed by name. Bypasses the breakers.
    pub async fn provider_health(&self) -> BTreeMap<String, OperationResult<bool>> {
        let mut providers = vec![Arc::clone(&self.primary)];
        providers.extend(self.secondaries.iter().cloned());

        let results = join_all(providers.iter().map(|p| p.healthcheck())).await;
        providers
            .iter()
            .map(|p| p.name().to_string())
            .zip(results)
            .collect()
    }
}
