//! Plan types and construction.
//!
//! A plan is the ordered list of operations needed to move recorded state
//! to the declared one. Declared resources appear in topological order.
//! Then come the deletes that retire old instances of delete-first
//! replacements, the deletes of resources no longer declared in reverse
//! dependency order, and finally deletes of replaced instances left over
//! from earlier runs.
//!
//! An old instance is deleted only after every old instance that depended
//! on it is gone, and every declared operation on a resource waits for the
//! deletion of old instances that depended on it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::cmp::Reverse;
use std::fmt;
use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::graph::{ResourceGraph, ResourceId};
use crate::provider::ProviderRegistry;
use crate::state::{ResourceState, StateSnapshot};

use super::diff::{DiffEngine, OperationKind, ResourceDiff};

/// A complete plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the stack this plan is based on.
    pub stack_hash: String,
    /// Planned operations in dispatch order.
    pub operations: Vec<PlannedOperation>,
}

/// A single planned operation.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedOperation {
    /// Resource identity.
    pub id: ResourceId,
    /// Operation kind predicted from recorded state.
    pub kind: OperationKind,
    /// Predicted diff.
    pub diff: ResourceDiff,
    /// Graph node index for declared resources.
    #[serde(skip)]
    pub node: Option<usize>,
    /// Recorded state before the run.
    #[serde(skip)]
    pub prior: Option<ResourceState>,
    /// Whether this deletes a replaced instance left by an earlier run.
    pub pending_delete: bool,
    /// Whether this deletes the old instance of a delete-first replacement
    /// ahead of the operation that re-creates it.
    pub retires_prior: bool,
    /// Operation indices that must finish first.
    pub dependencies: Vec<usize>,
}

impl Plan {
    /// Builds a plan for converging `snapshot` towards `graph`.
    ///
    /// References to resources that will be created or replaced in this run
    /// are previewed as unknown; other references use recorded outputs.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a resource type has no provider or a
    /// referenced output is not recorded.
    pub fn build(
        graph: &ResourceGraph,
        snapshot: &StateSnapshot,
        registry: &ProviderRegistry,
        stack_hash: impl Into<String>,
    ) -> Result<Self> {
        let engine = DiffEngine::new();
        let mut operations: Vec<PlannedOperation> = Vec::with_capacity(graph.len());
        let mut op_of_node: Vec<Option<usize>> = vec![None; graph.len()];
        let mut pending: HashSet<String> = HashSet::new();

        for &idx in graph.topological_order() {
            let node = &graph.nodes()[idx];
            let declaration = &node.declaration;
            let schema = registry
                .schema(&declaration.id.resource_type)
                .ok_or_else(|| ValidationError::UnknownResourceType {
                    resource: declaration.name().to_string(),
                    resource_type: declaration.id.resource_type.clone(),
                })?;

            let inputs = DiffEngine::resolve(graph, idx, snapshot, &pending)?;
            let prior = snapshot.get(&declaration.id);
            let diff = engine.diff_resource(&declaration.id, &inputs, prior, schema);

            if matches!(diff.kind, OperationKind::Create | OperationKind::Replace) {
                pending.insert(declaration.name().to_string());
            }

            op_of_node[idx] = Some(operations.len());
            operations.push(PlannedOperation {
                id: declaration.id.clone(),
                kind: diff.kind,
                diff,
                node: Some(idx),
                prior: prior.cloned(),
                pending_delete: false,
                retires_prior: false,
                dependencies: node
                    .dependencies
                    .iter()
                    .filter_map(|&d| op_of_node[d])
                    .collect(),
            });
        }

        let declared: HashSet<String> = graph
            .nodes()
            .iter()
            .map(|n| n.declaration.id.key())
            .collect();
        let removed: Vec<&ResourceState> = snapshot
            .resources
            .iter()
            .filter(|(key, _)| !declared.contains(*key))
            .map(|(_, state)| state)
            .collect();

        Self::push_retirements(&engine, &mut operations);
        Self::push_deletes(&engine, &mut operations, &removed);
        Self::push_pending_deletes(&engine, &mut operations, snapshot);
        order_old_instance_deletes(&mut operations);

        debug!("Built plan with {} operations", operations.len());
        Ok(Self {
            created_at: Utc::now(),
            stack_hash: stack_hash.into(),
            operations,
        })
    }

    /// Builds a plan that deletes every recorded resource.
    #[must_use]
    pub fn destroy(snapshot: &StateSnapshot, stack_hash: impl Into<String>) -> Self {
        let engine = DiffEngine::new();
        let mut operations = Vec::with_capacity(snapshot.resources.len());
        let recorded: Vec<&ResourceState> = snapshot.resources.values().collect();

        Self::push_deletes(&engine, &mut operations, &recorded);
        Self::push_pending_deletes(&engine, &mut operations, snapshot);

        Self {
            created_at: Utc::now(),
            stack_hash: stack_hash.into(),
            operations,
        }
    }

    /// Splits each delete-first replacement in two: a delete of the old
    /// instance, and the declared operation that creates the new one after it.
    fn push_retirements(engine: &DiffEngine, operations: &mut Vec<PlannedOperation>) {
        for idx in 0..operations.len() {
            if !operations[idx].deletes_first() {
                continue;
            }
            let Some(prior) = operations[idx].prior.clone() else {
                continue;
            };
            let retire = operations.len();
            operations[idx].dependencies.push(retire);
            operations.push(PlannedOperation {
                id: prior.id.clone(),
                kind: OperationKind::Delete,
                diff: engine.diff_removed(&prior),
                node: None,
                prior: Some(prior),
                pending_delete: false,
                retires_prior: true,
                dependencies: Vec::new(),
            });
        }
    }

    /// Appends deletes so that a resource is deleted only after everything
    /// that depended on it has been changed or deleted.
    fn push_deletes(
        engine: &DiffEngine,
        operations: &mut Vec<PlannedOperation>,
        removed: &[&ResourceState],
    ) {
        for idx in reverse_dependency_order(removed) {
            let state = removed[idx];
            let key = state.id.key();
            let dependencies = operations
                .iter()
                .enumerate()
                .filter(|(_, op)| {
                    op.prior
                        .as_ref()
                        .is_some_and(|p| p.dependencies.contains(&key))
                })
                .map(|(i, _)| i)
                .collect();

            operations.push(PlannedOperation {
                id: state.id.clone(),
                kind: OperationKind::Delete,
                diff: engine.diff_removed(state),
                node: None,
                prior: Some(state.clone()),
                pending_delete: false,
                retires_prior: false,
                dependencies,
            });
        }
    }

    fn push_pending_deletes(
        engine: &DiffEngine,
        operations: &mut Vec<PlannedOperation>,
        snapshot: &StateSnapshot,
    ) {
        for state in &snapshot.pending_deletes {
            operations.push(PlannedOperation {
                id: state.id.clone(),
                kind: OperationKind::Delete,
                diff: engine.diff_removed(state),
                node: None,
                prior: Some(state.clone()),
                pending_delete: true,
                retires_prior: false,
                dependencies: Vec::new(),
            });
        }
    }

    /// Returns the number of resources planned for the given kind. The
    /// delete half of a delete-first replacement counts with the replacement.
    #[must_use]
    pub fn count(&self, kind: OperationKind) -> usize {
        self.operations
            .iter()
            .filter(|op| op.kind == kind && !op.retires_prior)
            .count()
    }

    /// Returns true if any operation changes a resource.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.operations.iter().any(|op| op.kind.is_change())
    }

    /// Returns true if the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.has_changes()
    }

    /// Returns the operations that change a resource.
    pub fn changes(&self) -> impl Iterator<Item = &PlannedOperation> {
        self.operations.iter().filter(|op| op.kind.is_change())
    }

    /// Returns a one-line summary of the plan.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.count(OperationKind::Create),
            self.count(OperationKind::Update),
            self.count(OperationKind::Replace),
            self.count(OperationKind::Delete),
            self.count(OperationKind::NoOp),
        )
    }
}

impl PlannedOperation {
    /// Returns true for a declared replacement whose old instance has to go
    /// before the new one is created.
    #[must_use]
    pub fn deletes_first(&self) -> bool {
        self.kind == OperationKind::Replace
            && !self.diff.create_before_delete
            && self.node.is_some()
            && self.prior.is_some()
    }

    /// Returns true if this operation deletes an old instance that other
    /// old instances may have depended on.
    fn deletes_old_instance(&self) -> bool {
        self.kind == OperationKind::Delete && self.node.is_none() && !self.pending_delete
    }

    /// Returns a human-readable description of the operation.
    #[must_use]
    pub fn description(&self) -> String {
        match self.kind {
            OperationKind::Create => format!("Create {}", self.id),
            OperationKind::Update => format!("Update {} in place", self.id),
            OperationKind::Replace if self.diff.create_before_delete => {
                format!("Replace {} (create before delete)", self.id)
            }
            OperationKind::Replace => format!("Replace {}", self.id),
            OperationKind::Delete if self.pending_delete => {
                format!("Delete replaced instance of {}", self.id)
            }
            OperationKind::Delete if self.retires_prior => {
                format!("Delete old instance of {} before re-creating it", self.id)
            }
            OperationKind::Delete => format!("Delete {}", self.id),
            OperationKind::NoOp => format!("No changes for {}", self.id),
        }
    }
}

/// Makes each old instance outlive the old instances that used it: every
/// operation on resource `K`, including the deletion of `K`'s old instance,
/// waits for deletes of old instances recorded as depending on `K`. An edge
/// that would close a cycle is left out.
fn order_old_instance_deletes(operations: &mut [PlannedOperation]) {
    let mut edges = Vec::new();
    for (deleting, op) in operations.iter().enumerate() {
        if !op.deletes_old_instance() {
            continue;
        }
        let Some(prior) = &op.prior else {
            continue;
        };
        for (waiter, other) in operations.iter().enumerate() {
            if waiter != deleting
                && !other.pending_delete
                && prior.dependencies.contains(&other.id.key())
            {
                edges.push((waiter, deleting));
            }
        }
    }

    for (waiter, deleting) in edges {
        if operations[waiter].dependencies.contains(&deleting) {
            continue;
        }
        if depends_on(operations, deleting, waiter) {
            debug!(
                "Not ordering {} after {}: it would close a cycle",
                operations[waiter].description(),
                operations[deleting].description()
            );
            continue;
        }
        operations[waiter].dependencies.push(deleting);
    }
}

/// Returns true if `from` transitively depends on `target`.
fn depends_on(operations: &[PlannedOperation], from: usize, target: usize) -> bool {
    let mut seen = vec![false; operations.len()];
    let mut stack = vec![from];
    while let Some(idx) = stack.pop() {
        if idx == target {
            return true;
        }
        if std::mem::replace(&mut seen[idx], true) {
            continue;
        }
        stack.extend(operations[idx].dependencies.iter().copied());
    }
    false
}

/// Orders recorded resources so that dependents come before the resources
/// they depend on. Ties break on key order; leftovers from a corrupt cycle
/// are appended in key order.
fn reverse_dependency_order(resources: &[&ResourceState]) -> Vec<usize> {
    let index: HashMap<String, usize> = resources
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.key(), i))
        .collect();

    let mut remaining_dependents = vec![0usize; resources.len()];
    for state in resources {
        for dep in &state.dependencies {
            if let Some(&d) = index.get(dep) {
                remaining_dependents[d] += 1;
            }
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = remaining_dependents
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(resources.len());
    let mut placed = vec![false; resources.len()];

    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        placed[i] = true;
        for dep in &resources[i].dependencies {
            if let Some(&d) = index.get(dep) {
                remaining_dependents[d] -= 1;
                if remaining_dependents[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }
    }

    order.extend((0..resources.len()).filter(|&i| !placed[i]));
    order
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes. Recorded state matches the declarations.");
        }

        writeln!(f, "Plan: {}", self.summary())?;
        writeln!(f)?;
        for op in self.changes() {
            writeln!(f, "{op}")?;
        }
        Ok(())
    }
}

impl fmt::Display for PlannedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  {:>3} {}", self.kind.symbol(), self.description())?;
        let changes: BTreeMap<&str, String> = self
            .diff
            .changes
            .iter()
            .filter(|_| matches!(self.kind, OperationKind::Update | OperationKind::Replace))
            .map(|c| (c.attribute.as_str(), c.to_string()))
            .collect();
        for change in changes.values() {
            write!(f, "\n        {change}")?;
        }
        Ok(())
    }
}
