//! Recorded state types.
//!
//! A snapshot records, for every resource that reached `Done`, the identifier
//! the provider assigned, the outputs it returned, and a hash of the inputs
//! it was created or updated with. Entries are keyed by logical identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::StateError;
use crate::graph::{AttributeMap, ResourceId};

/// Current version of the snapshot format.
pub const STATE_VERSION: &str = "1";

/// Maximum number of history entries kept in a snapshot.
const MAX_HISTORY: usize = 100;

/// The complete recorded state of a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Snapshot format version.
    pub version: String,
    /// Stack name.
    pub stack: String,
    /// Environment name.
    pub environment: String,
    /// Incremented on every checkpoint.
    #[serde(default)]
    pub serial: u64,
    /// Recorded resources keyed by `type::name`.
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
    /// Resolved stack outputs from the last run.
    #[serde(default)]
    pub outputs: AttributeMap,
    /// Replaced instances whose delete has not succeeded yet.
    #[serde(default)]
    pub pending_deletes: Vec<ResourceState>,
    /// When the snapshot was last written.
    pub last_updated: DateTime<Utc>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Recorded state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    /// Logical identity.
    pub id: ResourceId,
    /// Identifier assigned by the provider.
    pub provider_id: String,
    /// Outputs returned by the last successful create, update, or refresh.
    #[serde(default)]
    pub outputs: AttributeMap,
    /// Hash of the resolved inputs last applied.
    pub input_hash: String,
    /// Resolved inputs last applied.
    #[serde(default)]
    pub inputs: AttributeMap,
    /// Keys of the resources this one depended on when last applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// When the resource was created.
    pub created_at: DateTime<Utc>,
    /// When the resource was last changed.
    pub updated_at: DateTime<Utc>,
}

/// Per-kind operation counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    /// Resources created.
    pub created: usize,
    /// Resources updated in place.
    pub updated: usize,
    /// Resources replaced.
    pub replaced: usize,
    /// Resources deleted.
    pub deleted: usize,
    /// Resources left unchanged.
    pub unchanged: usize,
    /// Operations that failed.
    pub failed: usize,
    /// Operations never started because a dependency failed.
    pub skipped: usize,
    /// Operations never started because the run was cancelled.
    pub cancelled: usize,
}

/// One entry of run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Kind of run.
    pub operation: RunOperation,
    /// Operation counts.
    pub counts: RunCounts,
    /// Whether every operation succeeded.
    pub success: bool,
    /// First error, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Kinds of runs recorded in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Converge towards the declarations.
    Apply,
    /// Delete everything recorded.
    Destroy,
    /// Replace recorded outputs with live ones.
    Refresh,
}

impl StateSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new(stack: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            environment: environment.to_string(),
            serial: 0,
            resources: BTreeMap::new(),
            outputs: AttributeMap::new(),
            pending_deletes: Vec::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Checks that the snapshot was written in a supported format.
    ///
    /// # Errors
    ///
    /// Returns `VersionMismatch` for any other version.
    pub fn check_version(&self) -> Result<(), StateError> {
        if self.version == STATE_VERSION {
            Ok(())
        } else {
            Err(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: self.version.clone(),
            })
        }
    }

    /// Returns the recorded state of a resource.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.resources.get(&id.key())
    }

    /// Records a resource, replacing any previous entry.
    pub fn upsert(&mut self, resource: ResourceState) {
        self.resources.insert(resource.id.key(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource.
    pub fn remove(&mut self, id: &ResourceId) -> Option<ResourceState> {
        let removed = self.resources.remove(&id.key());
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Queues a replaced instance whose delete must be retried.
    pub fn push_pending_delete(&mut self, resource: ResourceState) {
        self.pending_deletes.push(resource);
        self.last_updated = Utc::now();
    }

    /// Removes a queued instance by provider id.
    pub fn clear_pending_delete(&mut self, id: &ResourceId, provider_id: &str) {
        self.pending_deletes
            .retain(|r| !(r.id == *id && r.provider_id == provider_id));
        self.last_updated = Utc::now();
    }

    /// Increments the serial before a write.
    pub fn bump_serial(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, dropping the oldest beyond the cap.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }

    /// Returns true if nothing is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.pending_deletes.is_empty()
    }
}

impl ResourceState {
    /// Creates a freshly created resource record.
    #[must_use]
    pub fn new(id: ResourceId, provider_id: impl Into<String>, input_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            provider_id: provider_id.into(),
            outputs: AttributeMap::new(),
            input_hash: input_hash.into(),
            inputs: AttributeMap::new(),
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the recorded outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: AttributeMap) -> Self {
        self.outputs = outputs;
        self
    }

    /// Sets the recorded inputs.
    #[must_use]
    pub fn with_inputs(mut self, inputs: AttributeMap) -> Self {
        self.inputs = inputs;
        self
    }

    /// Sets the recorded dependency keys.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }
}

impl RunCounts {
    /// Returns the number of resources that changed.
    #[must_use]
    pub const fn changed(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    /// Returns true if nothing failed, was skipped, or was cancelled.
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && self.cancelled == 0
    }
}

impl RunHistoryEntry {
    /// Creates a history entry for a finished run.
    #[must_use]
    pub fn new(operation: RunOperation, counts: RunCounts, error: Option<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            counts,
            success: counts.is_clean() && error.is_none(),
            error,
        }
    }
}

impl fmt::Display for RunOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Refresh => "refresh",
        };
        write!(f, "{op}")
    }
}

impl fmt::Display for RunCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} created, {} updated, {} replaced, {} deleted, {} unchanged, {} failed, {} skipped",
            self.created,
            self.updated,
            self.replaced,
            self.deleted,
            self.unchanged,
            self.failed,
            self.skipped
        )?;
        if self.cancelled > 0 {
            write!(f, ", {} cancelled", self.cancelled)?;
        }
        Ok(())
    }
}
