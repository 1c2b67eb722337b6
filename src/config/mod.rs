//! Configuration module.
//!
//! This module handles all stack-file functionality:
//! - Parsing and deserializing `converge.stack.yaml`
//! - Validation of declarations before any provider call
//! - Hashing resolved inputs for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::InputHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    CheckpointMode, EngineConfig, ResourceConfig, StackConfig, StackInfo, StateBackend,
    StateConfig,
};
pub use validator::{ConfigValidator, ValidationResult};
