//! Provider registry.
//!
//! Factories are registered by name at startup and instantiated in
//! registration order.

use std::sync::Arc;

use tracing::{debug, info};

use super::GroupProvider;
use crate::error::ProviderError;

/// Builds one provider instance.
pub type ProviderFactory =
    Box<dyn Fn() -> Result<Arc<dyn GroupProvider>, ProviderError> + Send + Sync>;

/// Ordered, name-keyed set of provider factories.
#[derive(Default)]
pub struct ProviderRegistry {
    factories: Vec<(String, ProviderFactory)>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `factory` under `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> Result<(), ProviderError>
    where
        F: Fn() -> Result<Arc<dyn GroupProvider>, ProviderError> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.contains(&name) {
            return Err(ProviderError::DuplicateProvider(name));
        }
        debug!(target: "groups", provider = %name, "Registered provider factory");
        self.factories.push((name, Box::new(factory)));
        Ok(())
    }

    /// Register an already constructed provider under its own name.
    pub fn register_instance(&mut self, provider: Arc<dyn GroupProvider>) -> Result<(), ProviderError> {
        let name = provider.name().to_string();
        self.register(name, move || Ok(Arc::clone(&provider)))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.iter().any(|(n, _)| n == name)
    }

    /// Registered names in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.factories.iter().map(|(n, _)| n.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build the provider registered as `name`.
    pub fn create(&self, name: &str) -> Result<Arc<dyn GroupProvider>, ProviderError> {
        let (_, factory) = self
            .factories
            .iter()
            .find(|(n, _)| n == name)
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))?;
        build(name, factory)
    }

    /// Build every registered provider in registration order.
    pub fn instantiate(&self) -> Result<Vec<Arc<dyn GroupProvider>>, ProviderError> {
        let providers = self
            .factories
            .iter()
            .map(|(name, factory)| build(name, factory))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            target: "groups",
            providers = ?self.names(),
            "Instantiated group providers"
        );
        Ok(providers)
    }
}

fn build(name: &str, factory: &ProviderFactory) -> Result<Arc<dyn GroupProvider>, ProviderError> {
    let provider = factory()?;
    if provider.name() != name {
        return Err(ProviderError::factory(
            name,
            format!("factory produced provider named '{}'", provider.name()),
        ));
    }
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{
        MemberQuery, MembershipAction, NormalizedGroup, NormalizedMember, ProviderCapabilities,
        ProviderKind,
    };
    use async_trait::async_trait;
    use opsbot_core::OperationResult;

    struct Named {
        name: String,
        capabilities: ProviderCapabilities,
    }

    fn named(name: &str) -> Arc<dyn GroupProvider> {
        Arc::new(Named {
            name: name.to_string(),
            capabilities: ProviderCapabilities::secondary(),
        })
    }

    #[async_trait]
    impl GroupProvider for Named {
        fn name(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Google
        }

        fn capabilities(&self) -> &ProviderCapabilities {
            &self.capabilities
        }

        async fn list_groups_for_user(&self, _: &str) -> OperationResult<Vec<NormalizedGroup>> {
            OperationResult::success(Vec::new())
        }

        async fn add_member(
            &self,
            _: &str,
            member: &str,
            _: Option<&str>,
        ) -> OperationResult<NormalizedMember> {
            OperationResult::success(NormalizedMember::new(member))
        }

        async fn remove_member(
            &self,
            _: &str,
            member: &str,
            _: Option<&str>,
        ) -> OperationResult<NormalizedMember> {
            OperationResult::success(NormalizedMember::new(member))
        }

        async fn get_group_members(
            &self,
            _: &str,
            _: &MemberQuery,
        ) -> OperationResult<Vec<NormalizedMember>> {
            OperationResult::success(Vec::new())
        }

        async fn validate_permissions(
            &self,
            _: &str,
            _: &str,
            _: MembershipAction,
        ) -> OperationResult<bool> {
            OperationResult::success(true)
        }

        async fn healthcheck(&self) -> OperationResult<bool> {
            OperationResult::success(true)
        }
    }

    #[test]
    fn test_register_preserves_order() {
        let mut registry = ProviderRegistry::new();
        registry.register("google", || Ok(named("google"))).unwrap();
        registry.register("aws", || Ok(named("aws"))).unwrap();

        assert_eq!(registry.names(), vec!["google", "aws"]);
        let providers = registry.instantiate().unwrap();
        let names: Vec<_> = providers.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["google", "aws"]);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = ProviderRegistry::new();
        registry.register_instance(named("aws")).unwrap();
        let err = registry.register("aws", || Ok(named("aws"))).unwrap_err();
        assert!(matches!(err, ProviderError::DuplicateProvider(name) if name == "aws"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_factory_errors_propagate() {
        let mut registry = ProviderRegistry::new();
        registry
            .register("aws", || Err(ProviderError::factory("aws", "missing region")))
            .unwrap();
        assert!(matches!(
            registry.instantiate(),
            Err(ProviderError::Factory { .. })
        ));
    }

    #[test]
    fn test_name_mismatch_and_unknown() {
        let mut registry = ProviderRegistry::new();
        registry.register("aws", || Ok(named("google"))).unwrap();
        assert!(matches!(
            registry.create("aws"),
            Err(ProviderError::Factory { .. })
        ));
        assert!(matches!(
            registry.create("okta"),
            Err(ProviderError::UnknownProvider(_))
        ));
    }
}
