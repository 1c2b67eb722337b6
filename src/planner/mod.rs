//! Planning and execution.
//!
//! This module compares declarations with recorded state, orders the
//! resulting operations, and executes them against providers.

mod diff;
mod executor;
mod plan;

pub use diff::{AttributeChange, DiffEngine, OperationKind, ResourceDiff};
pub use executor::{
    CancellationToken, ExecutionResult, ExecutorOptions, LifecycleState, NodeStatus,
    OperationResult, PlanExecutor, ProgressEvent,
};
pub use plan::{Plan, PlannedOperation};
