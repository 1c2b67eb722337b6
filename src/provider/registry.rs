//! Registry mapping resource types to providers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::{ConfigError, Result};

use super::local::LocalProvider;
use super::schema::ResourceSchema;
use super::{Provider, ProviderContext};

/// Name of the built-in filesystem provider.
const LOCAL_PROVIDER: &str = "local";

/// Registry of providers keyed by the resource types they handle.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    schemas: BTreeMap<String, ResourceSchema>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a registry of built-in providers from their contexts.
    ///
    /// The `local` provider is always registered, with default settings when
    /// no context names it.
    ///
    /// # Errors
    ///
    /// Returns an error if a context names an unknown provider.
    pub fn from_contexts(contexts: impl IntoIterator<Item = ProviderContext>) -> Result<Self> {
        let mut local = None;
        for context in contexts {
            match context.name.as_str() {
                LOCAL_PROVIDER => local = Some(LocalProvider::from_context(&context)),
                other => {
                    return Err(ConfigError::invalid(
                        format!("Unknown provider '{other}'"),
                        format!("providers.{other}"),
                    )
                    .into());
                }
            }
        }

        let local = local.unwrap_or_else(|| LocalProvider::from_context(&ProviderContext::new(LOCAL_PROVIDER)));
        let mut registry = Self::new();
        registry.register(Arc::new(local))?;
        Ok(registry)
    }

    /// Registers a provider for every type in its schemas.
    ///
    /// # Errors
    ///
    /// Returns an error if a type is already handled by another provider.
    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<()> {
        for schema in provider.schemas() {
            if self.schemas.contains_key(&schema.resource_type) {
                return Err(ConfigError::invalid(
                    format!("Resource type '{}' registered twice", schema.resource_type),
                    "providers",
                )
                .into());
            }
            debug!("Registered resource type {}", schema.resource_type);
            self.providers
                .insert(schema.resource_type.clone(), Arc::clone(&provider));
            self.schemas.insert(schema.resource_type.clone(), schema);
        }
        Ok(())
    }

    /// Returns the provider handling a resource type.
    #[must_use]
    pub fn provider_for(&self, resource_type: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(resource_type).cloned()
    }

    /// Returns the schema of a resource type.
    #[must_use]
    pub fn schema(&self, resource_type: &str) -> Option<&ResourceSchema> {
        self.schemas.get(resource_type)
    }

    /// Returns every registered resource type, sorted.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("types", &self.schemas.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FILE_TYPE, MockProvider, RANDOM_ID_TYPE};

    fn mock_with(types: &[&'static str]) -> MockProvider {
        let types: Vec<&'static str> = types.to_vec();
        let mut mock = MockProvider::new();
        mock.expect_schemas()
            .returning(move || types.iter().map(|t| ResourceSchema::new(*t)).collect());
        mock
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(mock_with(&["test:net", "test:subnet"])))
            .expect("register");

        assert!(registry.provider_for("test:net").is_some());
        assert!(registry.schema("test:subnet").is_some());
        assert!(registry.provider_for("test:other").is_none());
        assert_eq!(registry.types().collect::<Vec<_>>(), vec!["test:net", "test:subnet"]);
    }

    #[test]
    fn test_duplicate_type_rejected() {
        let mut registry = ProviderRegistry::new();
        registry
            .register(Arc::new(mock_with(&["test:net"])))
            .expect("register");
        assert!(registry.register(Arc::new(mock_with(&["test:net"]))).is_err());
    }

    #[test]
    fn test_builtin_local_always_present() {
        let registry = ProviderRegistry::from_contexts(Vec::new()).expect("registry");
        assert!(registry.schema(FILE_TYPE).is_some());
        assert!(registry.schema(RANDOM_ID_TYPE).is_some());
    }

    #[test]
    fn test_unknown_provider_context() {
        let result = ProviderRegistry::from_contexts(vec![ProviderContext::new("aws")]);
        assert!(result.is_err());
    }
}
