// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Convergence
//!
//! A dependency-aware, declarative resource reconciliation engine.
//!
//! ## Overview
//!
//! A stack file declares resources, their inputs, and references to other
//! resources' outputs. Convergence:
//!
//! - Builds a dependency graph from references and explicit `depends_on`
//! - Compares declarations with the recorded state of the last run
//! - Plans the minimal create, update, replace, and delete operations
//! - Executes them against providers with bounded parallelism, retries, and
//!   failure isolation
//! - Checkpoints state after every successful operation
//!
//! ## Architecture
//!
//! 1. **Declarations**: parsed from `converge.stack.yaml`
//! 2. **Recorded state**: the outputs and input hashes of the previous run
//! 3. **Providers**: adapters that create, read, update, and delete objects
//!
//! ## Modules
//!
//! - [`config`]: Stack file parsing, validation, and input hashing
//! - [`graph`]: Reference parsing and dependency graph construction
//! - [`state`]: State storage backends (local file, in-memory) and locking
//! - [`provider`]: Provider trait, schemas, retries, and the local provider
//! - [`planner`]: Diffing, planning, and parallel execution
//! - [`reconciler`]: Plan/apply/destroy/refresh orchestration
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: demo
//!   environment: dev
//!
//! resources:
//!   - name: app_id
//!     type: local:random_id
//!     inputs:
//!       byte_length: 8
//!
//!   - name: app_config
//!     type: local:file
//!     inputs:
//!       path: app.conf
//!       content: "id = ${app_id.hex}"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigParser, ConfigValidator, InputHasher, StackConfig};
pub use error::{ConvergeError, Result};
pub use graph::{GraphBuilder, ResourceGraph, ResourceId};
pub use planner::{DiffEngine, Plan, PlanExecutor};
pub use provider::{Provider, ProviderRegistry};
pub use reconciler::{DriftReport, ReconciliationResult, Reconciler};
pub use state::{LocalStateStore, MemoryStateStore, StateSnapshot, StateStore};
