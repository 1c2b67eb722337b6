//! Diff engine for comparing declared inputs against recorded state.
//!
//! Classification of a declared resource:
//! - no recorded entry: `Create`
//! - recorded input hash equals the resolved input hash: `NoOp`
//! - changed attributes all update-in-place: `Update`
//! - any changed attribute replace-required: `Replace`
//!
//! A recorded resource with no declaration is a `Delete`.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::debug;

use crate::config::InputHasher;
use crate::error::ValidationError;
use crate::graph::{OutputRef, Resolved, ResolvedInputs, ResourceGraph, ResourceId};
use crate::provider::{ChangePolicy, ResourceSchema};
use crate::state::{ResourceState, StateSnapshot};

/// Engine for computing per-resource diffs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine {
    /// Input hasher.
    hasher: InputHasher,
}

/// Kind of operation a resource needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Resource needs to be created.
    Create,
    /// Resource can be changed in place.
    Update,
    /// Resource must be destroyed and recreated.
    Replace,
    /// Resource needs to be deleted.
    Delete,
    /// Resource is unchanged.
    NoOp,
}

/// A single attribute-level change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Recorded value.
    pub old_value: Option<Value>,
    /// Declared value; `None` when removed or not known yet.
    pub new_value: Option<Value>,
    /// Policy that applies to the change.
    pub policy: Option<ChangePolicy>,
    /// False when the new value depends on an output not produced yet.
    pub known: bool,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDiff {
    /// Resource identity.
    pub id: ResourceId,
    /// Classification.
    pub kind: OperationKind,
    /// Attribute-level changes.
    pub changes: Vec<AttributeChange>,
    /// Recorded input hash.
    pub old_hash: Option<String>,
    /// Resolved input hash; `None` while some input is unknown.
    pub new_hash: Option<String>,
    /// Whether a replacement creates the new instance first.
    pub create_before_delete: bool,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: InputHasher::new(),
        }
    }

    /// Returns the hash of fully known inputs.
    #[must_use]
    pub fn hash(&self, inputs: &ResolvedInputs) -> Option<String> {
        inputs
            .is_fully_known()
            .then(|| self.hasher.hash_inputs(&inputs.known))
    }

    /// Resolves the inputs of graph node `node` against recorded outputs.
    ///
    /// References to resources named in `pending` resolve as unknown.
    ///
    /// # Errors
    ///
    /// Returns `UnknownOutput` when a referenced output is not recorded.
    pub fn resolve(
        graph: &ResourceGraph,
        node: usize,
        snapshot: &StateSnapshot,
        pending: &HashSet<String>,
    ) -> Result<ResolvedInputs, ValidationError> {
        let Some(node) = graph.node(node) else {
            return Ok(ResolvedInputs::default());
        };

        let lookup = |r: &OutputRef| -> Option<Resolved> {
            if pending.contains(&r.resource) {
                return Some(Resolved::Unknown);
            }
            let id = graph.id_of(&r.resource)?;
            snapshot
                .get(id)?
                .outputs
                .get(&r.output)
                .cloned()
                .map(Resolved::Known)
        };

        ResolvedInputs::resolve(&node.declaration.inputs, &lookup).map_err(|r| {
            ValidationError::UnknownOutput {
                reference: r.to_string(),
            }
        })
    }

    /// Computes the diff for a declared resource.
    #[must_use]
    pub fn diff_resource(
        &self,
        id: &ResourceId,
        inputs: &ResolvedInputs,
        prior: Option<&ResourceState>,
        schema: &ResourceSchema,
    ) -> ResourceDiff {
        let new_hash = self.hash(inputs);

        let Some(prior) = prior else {
            debug!("{id} needs to be created");
            let mut changes: Vec<AttributeChange> = inputs
                .known
                .iter()
                .map(|(attr, value)| AttributeChange {
                    attribute: attr.clone(),
                    old_value: None,
                    new_value: Some(value.clone()),
                    policy: schema.policy_for(attr),
                    known: true,
                })
                .collect();
            changes.extend(inputs.unknown.iter().map(|attr| AttributeChange {
                attribute: attr.clone(),
                old_value: None,
                new_value: None,
                policy: schema.policy_for(attr),
                known: false,
            }));
            changes.sort_by(|a, b| a.attribute.cmp(&b.attribute));

            return ResourceDiff {
                id: id.clone(),
                kind: OperationKind::Create,
                changes,
                old_hash: None,
                new_hash,
                create_before_delete: schema.create_before_delete,
            };
        };

        if new_hash
            .as_deref()
            .is_some_and(|h| InputHasher::hashes_match(h, &prior.input_hash))
        {
            debug!("{id} is up to date");
            return self.unchanged(id, prior, new_hash, schema);
        }

        let changes = Self::changed_attributes(inputs, prior, schema);
        if changes.is_empty() {
            debug!("{id} hash differs but no attribute changed");
            return self.unchanged(id, prior, new_hash, schema);
        }

        // An attribute without a policy can only be one that was removed from
        // the declaration; treat its removal as replace-required.
        let kind = if changes
            .iter()
            .any(|c| c.policy.unwrap_or(ChangePolicy::ReplaceRequired) == ChangePolicy::ReplaceRequired)
        {
            OperationKind::Replace
        } else {
            OperationKind::Update
        };

        debug!("{id} needs {kind} ({} attributes changed)", changes.len());
        ResourceDiff {
            id: id.clone(),
            kind,
            changes,
            old_hash: Some(prior.input_hash.clone()),
            new_hash,
            create_before_delete: schema.create_before_delete,
        }
    }

    /// Computes the diff for a recorded resource that is no longer declared.
    #[must_use]
    pub fn diff_removed(&self, prior: &ResourceState) -> ResourceDiff {
        debug!("{} needs to be deleted", prior.id);
        ResourceDiff {
            id: prior.id.clone(),
            kind: OperationKind::Delete,
            changes: prior
                .inputs
                .iter()
                .map(|(attr, value)| AttributeChange {
                    attribute: attr.clone(),
                    old_value: Some(value.clone()),
                    new_value: None,
                    policy: None,
                    known: true,
                })
                .collect(),
            old_hash: Some(prior.input_hash.clone()),
            new_hash: None,
            create_before_delete: false,
        }
    }

    fn unchanged(
        &self,
        id: &ResourceId,
        prior: &ResourceState,
        new_hash: Option<String>,
        schema: &ResourceSchema,
    ) -> ResourceDiff {
        ResourceDiff {
            id: id.clone(),
            kind: OperationKind::NoOp,
            changes: Vec::new(),
            old_hash: Some(prior.input_hash.clone()),
            new_hash: new_hash.or_else(|| Some(self.hasher.hash_inputs(&prior.inputs))),
            create_before_delete: schema.create_before_delete,
        }
    }

    fn changed_attributes(
        inputs: &ResolvedInputs,
        prior: &ResourceState,
        schema: &ResourceSchema,
    ) -> Vec<AttributeChange> {
        let attributes: BTreeSet<&String> = prior
            .inputs
            .keys()
            .chain(inputs.known.keys())
            .chain(inputs.unknown.iter())
            .collect();

        attributes
            .into_iter()
            .filter_map(|attr| {
                let old_value = prior.inputs.get(attr);
                let known = !inputs.unknown.contains(attr);
                let new_value = inputs.known.get(attr);
                if known && old_value == new_value {
                    return None;
                }
                Some(AttributeChange {
                    attribute: attr.clone(),
                    old_value: old_value.cloned(),
                    new_value: new_value.cloned(),
                    policy: schema.policy_for(attr),
                    known,
                })
            })
            .collect()
    }
}

impl OperationKind {
    /// Returns true if the operation calls a provider.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Returns the plan symbol for this kind.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
            Self::NoOp => " ",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |v: &Option<Value>| v.as_ref().map_or_else(|| String::from("null"), Value::to_string);
        let new = if self.known {
            render(&self.new_value)
        } else {
            String::from("(known after apply)")
        };
        write!(f, "{}: {} -> {new}", self.attribute, render(&self.old_value))?;
        if self.policy == Some(ChangePolicy::ReplaceRequired) {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

impl fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.id, self.kind)?;
        if !self.changes.is_empty() && self.kind != OperationKind::Create {
            write!(f, " (")?;
            for (i, change) in self.changes.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", change.attribute)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttributeMap;
    use serde_json::json;

    fn schema() -> ResourceSchema {
        ResourceSchema::new("test:net")
            .replace_required("cidr")
            .update_in_place("tags")
    }

    fn known(pairs: &[(&str, Value)]) -> ResolvedInputs {
        ResolvedInputs {
            known: pairs
                .iter()
                .map(|(k, v)| ((*k).to_string(), v.clone()))
                .collect(),
            unknown: BTreeSet::new(),
        }
    }

    fn recorded(engine: &DiffEngine, inputs: &ResolvedInputs) -> ResourceState {
        ResourceState::new(
            ResourceId::new("test:net", "net"),
            "net-1",
            engine.hash(inputs).expect("known inputs"),
        )
        .with_inputs(inputs.known.clone())
    }

    #[test]
    fn test_create_when_not_recorded() {
        let engine = DiffEngine::new();
        let id = ResourceId::new("test:net", "net");
        let diff = engine.diff_resource(&id, &known(&[("cidr", json!("10.0.0.0/16"))]), None, &schema());

        assert_eq!(diff.kind, OperationKind::Create);
        assert_eq!(diff.changes.len(), 1);
        assert!(diff.new_hash.is_some());
    }

    #[test]
    fn test_noop_when_hash_matches() {
        let engine = DiffEngine::new();
        let inputs = known(&[("cidr", json!("10.0.0.0/16"))]);
        let prior = recorded(&engine, &inputs);

        let diff = engine.diff_resource(&prior.id, &inputs, Some(&prior), &schema());
        assert_eq!(diff.kind, OperationKind::NoOp);
        assert!(diff.changes.is_empty());
    }

    #[test]
    fn test_update_in_place() {
        let engine = DiffEngine::new();
        let prior = recorded(
            &engine,
            &known(&[("cidr", json!("10.0.0.0/16")), ("tags", json!({"a": "1"}))]),
        );
        let inputs = known(&[("cidr", json!("10.0.0.0/16")), ("tags", json!({"a": "2"}))]);

        let diff = engine.diff_resource(&prior.id, &inputs, Some(&prior), &schema());
        assert_eq!(diff.kind, OperationKind::Update);
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(diff.changes[0].attribute, "tags");
    }

    #[test]
    fn test_replace_required() {
        let engine = DiffEngine::new();
        let prior = recorded(&engine, &known(&[("cidr", json!("10.0.0.0/16"))]));
        let inputs = known(&[("cidr", json!("10.1.0.0/16"))]);

        let diff = engine.diff_resource(&prior.id, &inputs, Some(&prior), &schema());
        assert_eq!(diff.kind, OperationKind::Replace);
        assert!(diff.to_string().contains("cidr"));
    }

    #[test]
    fn test_unknown_input_counts_as_changed() {
        let engine = DiffEngine::new();
        let prior = recorded(
            &engine,
            &known(&[("cidr", json!("10.0.0.0/16")), ("tags", json!({}))]),
        );
        let mut inputs = known(&[("cidr", json!("10.0.0.0/16"))]);
        inputs.unknown.insert(String::from("tags"));

        let diff = engine.diff_resource(&prior.id, &inputs, Some(&prior), &schema());
        assert_eq!(diff.kind, OperationKind::Update);
        assert!(diff.new_hash.is_none());
        assert!(!diff.changes[0].known);
    }

    #[test]
    fn test_removed_attribute_without_policy_forces_replace() {
        let engine = DiffEngine::new();
        let mut recorded_inputs = AttributeMap::new();
        recorded_inputs.insert(String::from("legacy"), json!(true));
        let prior = ResourceState::new(ResourceId::new("test:net", "net"), "net-1", "old")
            .with_inputs(recorded_inputs);

        let diff = engine.diff_resource(&prior.id, &known(&[]), Some(&prior), &schema());
        assert_eq!(diff.kind, OperationKind::Replace);
    }

    #[test]
    fn test_removed_resource_is_delete() {
        let engine = DiffEngine::new();
        let prior = recorded(&engine, &known(&[("cidr", json!("10.0.0.0/16"))]));
        let diff = engine.diff_removed(&prior);
        assert_eq!(diff.kind, OperationKind::Delete);
        assert_eq!(diff.old_hash.as_deref(), Some(prior.input_hash.as_str()));
    }
}
