//! Stack file types.
//!
//! These structs map to `converge.stack.yaml`. A stack file declares the
//! stack identity, where state lives, how the engine runs, the provider
//! contexts, the resources themselves, and the stack outputs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::provider::{ProviderContext, RetryPolicy};

/// The root configuration structure for a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Stack identity.
    pub stack: StackInfo,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Provider settings keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, BTreeMap<String, Value>>,
    /// Resource declarations, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Stack outputs: name to `${resource.output}` expression.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Stack identity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackInfo {
    /// Stack name.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State directory for the local backend.
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// Process-local state, discarded on exit.
    Memory,
}

/// When the scheduler writes the snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    /// After every completed operation.
    #[default]
    Incremental,
    /// Once, when the run ends.
    End,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum number of in-flight provider operations.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Timeout for a single provider call.
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,
    /// Timeout for a whole run.
    #[serde(default)]
    pub run_timeout_secs: Option<u64>,
    /// Retries of a transient provider failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,
    /// Upper bound on a retry delay.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
    /// Snapshot write policy.
    #[serde(default)]
    pub checkpoint: CheckpointMode,
}

/// A resource declaration as written in the stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Logical name, unique within the stack.
    pub name: String,
    /// Resource type, e.g. `local:file`.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Input attributes; strings may contain `${name.output}` references.
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    /// Explicit dependencies by logical name.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

const fn default_concurrency() -> usize {
    4
}

const fn default_operation_timeout() -> u64 {
    300
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_backoff_base() -> u64 {
    500
}

const fn default_backoff_max() -> u64 {
    30_000
}

fn default_environment() -> String {
    String::from("dev")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            operation_timeout_secs: default_operation_timeout(),
            run_timeout_secs: None,
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            checkpoint: CheckpointMode::default(),
        }
    }
}

impl EngineConfig {
    /// Returns the retry policy for provider calls.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
        }
    }

    /// Returns the run timeout, if any.
    #[must_use]
    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

impl StackConfig {
    /// Creates an empty stack.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            stack: StackInfo {
                name: name.into(),
                environment: default_environment(),
            },
            state: StateConfig::default(),
            engine: EngineConfig::default(),
            providers: BTreeMap::new(),
            resources: Vec::new(),
            outputs: BTreeMap::new(),
        }
    }

    /// Returns the provider contexts declared in the stack.
    #[must_use]
    pub fn provider_contexts(&self) -> Vec<ProviderContext> {
        self.providers
            .iter()
            .map(|(name, settings)| ProviderContext {
                name: name.clone(),
                settings: settings.clone(),
            })
            .collect()
    }

    /// Returns a resource declaration by name.
    #[must_use]
    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }
}
