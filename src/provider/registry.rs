//! Registry of providers, one per resource kind.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::PlanError;
use crate::graph::ResourceKind;

use super::traits::ResourceProvider;

/// Maps each resource kind to its provider.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ResourceKind, Arc<dyn ResourceProvider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under the kind it reports, replacing any
    /// previous one.
    pub fn register(&mut self, provider: Arc<dyn ResourceProvider>) {
        self.providers.insert(provider.kind(), provider);
    }

    /// Builder-style [`Self::register`].
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn ResourceProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Looks up the provider for a kind.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::MissingProvider`] if none is registered.
    pub fn get(&self, kind: ResourceKind) -> Result<Arc<dyn ResourceProvider>, PlanError> {
        self.providers
            .get(&kind)
            .cloned()
            .ok_or_else(|| PlanError::MissingProvider { kind: kind.to_string() })
    }

    /// Registered kinds, in kind order.
    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.providers.keys().copied()
    }

    /// Returns true if a provider is registered for the kind.
    #[must_use]
    pub fn supports(&self, kind: ResourceKind) -> bool {
        self.providers.contains_key(&kind)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("kinds", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::traits::MockResourceProvider;

    #[test]
    fn test_register_and_lookup() {
        let mut mock = MockResourceProvider::new();
        mock.expect_kind().return_const(ResourceKind::Subnet);

        let registry = ProviderRegistry::new().with(Arc::new(mock));
        assert!(registry.supports(ResourceKind::Subnet));
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec![ResourceKind::Subnet]);
        assert!(registry.get(ResourceKind::Subnet).is_ok());
        assert!(matches!(
            registry.get(ResourceKind::Network),
            Err(PlanError::MissingProvider { .. })
        ));
    }
}
