//! Resource identity and declarations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::ResourceConfig;
use crate::error::ValidationError;

use super::value::InputValue;

/// Separator between type and name in a rendered identity.
const KEY_SEPARATOR: &str = "::";

/// Identity of a resource: its type plus its logical name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Resource type, e.g. `local:file`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name, unique within a stack.
    pub name: String,
}

impl ResourceId {
    /// Creates a new identity.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
        }
    }

    /// Returns the key under which this resource is stored in state.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}{KEY_SEPARATOR}{}", self.resource_type, self.name)
    }

    /// Parses a key produced by [`ResourceId::key`].
    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        let (resource_type, name) = key.rsplit_once(KEY_SEPARATOR)?;
        if resource_type.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(resource_type, name))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.resource_type, self.name)
    }
}

/// A validated resource declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDeclaration {
    /// Resource identity.
    pub id: ResourceId,
    /// Declared inputs.
    pub inputs: BTreeMap<String, InputValue>,
    /// Explicit dependencies by logical name, in addition to references.
    pub depends_on: Vec<String>,
}

impl ResourceDeclaration {
    /// Creates a declaration with no inputs.
    #[must_use]
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(resource_type, name),
            inputs: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// Adds an input attribute.
    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, value: InputValue) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Parses a declaration from its configuration form.
    ///
    /// # Errors
    ///
    /// Returns an error if an input contains a malformed reference.
    pub fn from_config(config: &ResourceConfig) -> Result<Self, ValidationError> {
        let mut inputs = BTreeMap::new();
        for (attr, raw) in &config.inputs {
            let value = InputValue::parse(raw).map_err(|message| {
                ValidationError::malformed(format!("{}.inputs.{attr}", config.name), message)
            })?;
            inputs.insert(attr.clone(), value);
        }

        Ok(Self {
            id: ResourceId::new(&config.resource_type, &config.name),
            inputs,
            depends_on: config.depends_on.clone(),
        })
    }

    /// Returns the logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.id.name
    }

    /// Returns the names of every resource this declaration depends on.
    #[must_use]
    pub fn dependency_names(&self) -> BTreeSet<&str> {
        self.inputs
            .values()
            .flat_map(InputValue::references)
            .map(|r| r.resource.as_str())
            .chain(self.depends_on.iter().map(String::as_str))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OutputRef;

    #[test]
    fn test_key_roundtrip() {
        let id = ResourceId::new("aws:ec2:Subnet", "mskSubnet1");
        assert_eq!(id.key(), "aws:ec2:Subnet::mskSubnet1");
        assert_eq!(ResourceId::from_key(&id.key()), Some(id));
        assert_eq!(ResourceId::from_key("no-separator"), None);
    }

    #[test]
    fn test_dependency_names_merge_references_and_explicit() {
        let decl = ResourceDeclaration::new("test:subnet", "sub")
            .with_input("vpc_id", InputValue::Reference(OutputRef::new("net", "id")))
            .with_input(
                "sg",
                InputValue::List(vec![InputValue::Reference(OutputRef::new("sg", "id"))]),
            )
            .with_dependency("net");

        let deps: Vec<&str> = decl.dependency_names().into_iter().collect();
        assert_eq!(deps, vec!["net", "sg"]);
    }
}
