//! Provider adapter boundary.
//!
//! A provider translates abstract create/read/update/delete calls into calls
//! against an external system. The engine never looks behind this trait: it
//! only knows each resource type's [`ResourceSchema`] and the outcome of each
//! call.

mod local;
mod registry;
mod retry;
mod schema;

pub use local::{FILE_TYPE, LocalProvider, RANDOM_ID_TYPE};
pub use registry::ProviderRegistry;
pub use retry::{RetryPolicy, call_with_retry};
pub use schema::{ChangePolicy, ResourceSchema};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::ProviderError;
use crate::graph::AttributeMap;

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Outcome of a successful create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedResource {
    /// Identifier assigned by the external system.
    pub provider_id: String,
    /// Output attributes of the new resource.
    pub outputs: AttributeMap,
}

/// Explicit provider configuration, threaded into provider construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderContext {
    /// Provider name, e.g. `local`.
    pub name: String,
    /// Provider settings from the stack file.
    pub settings: BTreeMap<String, Value>,
}

impl ProviderContext {
    /// Creates a context with no settings.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: BTreeMap::new(),
        }
    }

    /// Returns a string setting.
    #[must_use]
    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(Value::as_str)
    }
}

/// Capability interface implemented per set of resource types.
///
/// Every call may fail with a transient error (retried by the engine) or a
/// permanent one (surfaced to the user).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Returns the schemas of every resource type this provider handles.
    fn schemas(&self) -> Vec<ResourceSchema>;

    /// Creates a resource.
    async fn create(
        &self,
        resource_type: &str,
        inputs: &AttributeMap,
    ) -> ProviderResult<CreatedResource>;

    /// Reads live outputs. Returns `None` if the resource no longer exists.
    async fn read(&self, resource_type: &str, provider_id: &str)
    -> ProviderResult<Option<AttributeMap>>;

    /// Updates a resource in place and returns its new outputs.
    async fn update(
        &self,
        resource_type: &str,
        provider_id: &str,
        inputs: &AttributeMap,
    ) -> ProviderResult<AttributeMap>;

    /// Deletes a resource.
    async fn delete(&self, resource_type: &str, provider_id: &str) -> ProviderResult<()>;
}
