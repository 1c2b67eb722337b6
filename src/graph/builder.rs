//! Resource graph construction.
//!
//! Builds one node per declaration and one edge per reference, rejects
//! unknown references and cycles, and computes a topological order in which
//! ties are broken by declaration order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

use crate::error::ValidationError;

use super::declaration::{ResourceDeclaration, ResourceId};

/// A node in the resource graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// The declaration this node was built from.
    pub declaration: ResourceDeclaration,
    /// Indices of nodes this node depends on, in declaration order.
    pub dependencies: Vec<usize>,
    /// Indices of nodes that depend on this node, in declaration order.
    pub dependents: Vec<usize>,
}

/// A validated, acyclic resource graph.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<GraphNode>,
    by_name: HashMap<String, usize>,
    order: Vec<usize>,
}

/// Builder for [`ResourceGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    declarations: Vec<ResourceDeclaration>,
}

/// DFS visitation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Finished,
}

impl GraphBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            declarations: Vec::new(),
        }
    }

    /// Adds a declaration.
    #[must_use]
    pub fn declare(mut self, declaration: ResourceDeclaration) -> Self {
        self.declarations.push(declaration);
        self
    }

    /// Adds many declarations, preserving their order.
    #[must_use]
    pub fn declare_all(mut self, declarations: impl IntoIterator<Item = ResourceDeclaration>) -> Self {
        self.declarations.extend(declarations);
        self
    }

    /// Builds and validates the graph.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName`, `UnknownReference`, or `Cycle`.
    pub fn build(self) -> Result<ResourceGraph, ValidationError> {
        let mut by_name = HashMap::with_capacity(self.declarations.len());
        for (idx, decl) in self.declarations.iter().enumerate() {
            if by_name.insert(decl.name().to_string(), idx).is_some() {
                return Err(ValidationError::DuplicateName {
                    name: decl.name().to_string(),
                });
            }
        }

        let mut nodes: Vec<GraphNode> = self
            .declarations
            .into_iter()
            .map(|declaration| GraphNode {
                declaration,
                dependencies: Vec::new(),
                dependents: Vec::new(),
            })
            .collect();

        for idx in 0..nodes.len() {
            let mut deps = Vec::new();
            for target in nodes[idx].declaration.dependency_names() {
                let Some(&dep) = by_name.get(target) else {
                    return Err(ValidationError::UnknownReference {
                        resource: nodes[idx].declaration.name().to_string(),
                        target: target.to_string(),
                    });
                };
                deps.push(dep);
            }
            deps.sort_unstable();
            nodes[idx].dependencies = deps;
        }

        for idx in 0..nodes.len() {
            for dep in nodes[idx].dependencies.clone() {
                nodes[dep].dependents.push(idx);
            }
        }

        detect_cycle(&nodes)?;
        let order = topological_order(&nodes);

        debug!("Built resource graph with {} nodes", nodes.len());
        Ok(ResourceGraph {
            nodes,
            by_name,
            order,
        })
    }
}

/// Depth-first search with an explicit recursion stack.
fn detect_cycle(nodes: &[GraphNode]) -> Result<(), ValidationError> {
    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut path: Vec<usize> = Vec::new();

    for start in 0..nodes.len() {
        if marks[start] == Mark::Unvisited {
            visit(start, nodes, &mut marks, &mut path)?;
        }
    }
    Ok(())
}

fn visit(
    idx: usize,
    nodes: &[GraphNode],
    marks: &mut [Mark],
    path: &mut Vec<usize>,
) -> Result<(), ValidationError> {
    marks[idx] = Mark::OnStack;
    path.push(idx);

    for &dep in &nodes[idx].dependencies {
        match marks[dep] {
            Mark::OnStack => {
                let start = path.iter().position(|&p| p == dep).unwrap_or(0);
                let mut names: Vec<&str> = path[start..]
                    .iter()
                    .map(|&p| nodes[p].declaration.name())
                    .collect();
                names.push(nodes[dep].declaration.name());
                return Err(ValidationError::Cycle {
                    path: names.join(" -> "),
                });
            }
            Mark::Unvisited => visit(dep, nodes, marks, path)?,
            Mark::Finished => {}
        }
    }

    path.pop();
    marks[idx] = Mark::Finished;
    Ok(())
}

/// Kahn's algorithm; the ready set is a min-heap on declaration index.
fn topological_order(nodes: &[GraphNode]) -> Vec<usize> {
    let mut in_degree: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(idx)) = ready.pop() {
        order.push(idx);
        for &dependent in &nodes[idx].dependents {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.push(Reverse(dependent));
            }
        }
    }
    order
}

impl ResourceGraph {
    /// Returns the number of nodes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns a node by index.
    #[must_use]
    pub fn node(&self, idx: usize) -> Option<&GraphNode> {
        self.nodes.get(idx)
    }

    /// Returns all nodes in declaration order.
    #[must_use]
    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Returns the index of a node by logical name.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Returns the identity of a resource by logical name.
    #[must_use]
    pub fn id_of(&self, name: &str) -> Option<&ResourceId> {
        self.index_of(name).map(|idx| &self.nodes[idx].declaration.id)
    }

    /// Returns node indices in topological order.
    #[must_use]
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Returns declarations in topological order.
    pub fn ordered(&self) -> impl Iterator<Item = &ResourceDeclaration> {
        self.order.iter().map(|&idx| &self.nodes[idx].declaration)
    }

    /// Returns the state keys of a node's dependencies.
    #[must_use]
    pub fn dependency_keys(&self, idx: usize) -> Vec<String> {
        self.nodes
            .get(idx)
            .map(|n| {
                n.dependencies
                    .iter()
                    .map(|&d| self.nodes[d].declaration.id.key())
                    .collect()
            })
            .unwrap_or_default()
    }
}
