//! Resource declarations and the dependency graph.
//!
//! This module handles:
//! - Declared input values and `${name.output}` references
//! - Resource identity
//! - Graph construction, cycle detection, and topological ordering

mod builder;
mod declaration;
mod value;

pub use builder::{GraphBuilder, GraphNode, ResourceGraph};
pub use declaration::{ResourceDeclaration, ResourceId};
pub use value::{AttributeMap, InputValue, OutputRef, Resolved, ResolvedInputs, TemplatePart};
