//! Resource type schemas and attribute change policies.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a change to an input attribute is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangePolicy {
    /// The provider can apply the change to the live resource.
    UpdateInPlace,
    /// The resource must be destroyed and recreated.
    ReplaceRequired,
}

/// Static description of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Resource type, e.g. `local:file`.
    pub resource_type: String,
    /// Per-attribute change policy.
    pub attributes: BTreeMap<String, ChangePolicy>,
    /// Policy for attributes not listed in `attributes`.
    ///
    /// When `None`, declaring an unlisted attribute is a validation error.
    pub default_policy: Option<ChangePolicy>,
    /// Whether a replacement must be created before the old instance is deleted.
    pub create_before_delete: bool,
}

impl ResourceSchema {
    /// Creates a schema with no attributes.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            attributes: BTreeMap::new(),
            default_policy: None,
            create_before_delete: false,
        }
    }

    /// Declares an attribute that can be updated in place.
    #[must_use]
    pub fn update_in_place(mut self, attribute: impl Into<String>) -> Self {
        self.attributes
            .insert(attribute.into(), ChangePolicy::UpdateInPlace);
        self
    }

    /// Declares an attribute whose change forces replacement.
    #[must_use]
    pub fn replace_required(mut self, attribute: impl Into<String>) -> Self {
        self.attributes
            .insert(attribute.into(), ChangePolicy::ReplaceRequired);
        self
    }

    /// Sets the policy for unlisted attributes.
    #[must_use]
    pub const fn with_default_policy(mut self, policy: ChangePolicy) -> Self {
        self.default_policy = Some(policy);
        self
    }

    /// Requires create-before-delete ordering on replacement.
    #[must_use]
    pub const fn create_before_delete(mut self) -> Self {
        self.create_before_delete = true;
        self
    }

    /// Returns the change policy for an attribute, if one is defined.
    #[must_use]
    pub fn policy_for(&self, attribute: &str) -> Option<ChangePolicy> {
        self.attributes
            .get(attribute)
            .copied()
            .or(self.default_policy)
    }
}
