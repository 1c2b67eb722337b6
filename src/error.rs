//! Error types for the convergence engine.
//!
//! The hierarchy mirrors the phases of a run: configuration loading,
//! declaration validation, state persistence, provider calls, and the
//! reconciliation run itself. Only validation and state errors are fatal for
//! a run; provider failures are recorded per resource.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the convergence engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Declaration validation errors.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors surfaced outside of a scheduled operation.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Reconciliation run errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Environment variable is missing or malformed.
    #[error("Missing or invalid environment variable: {name}")]
    MissingEnvVar {
        /// Name of the variable.
        name: String,
    },

    /// A configuration value is out of range or inconsistent.
    #[error("Invalid configuration: {message}")]
    Invalid {
        /// Description of the problem.
        message: String,
        /// Field that is invalid.
        field: Option<String>,
    },
}

/// Declaration validation errors.
///
/// These are raised before any provider call is made.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// The reference graph contains a cycle.
    #[error("Dependency cycle detected: {path}")]
    Cycle {
        /// The cycle rendered as `a -> b -> a`.
        path: String,
    },

    /// A reference points to a resource that is not declared.
    #[error("Resource '{resource}' references unknown resource '{target}'")]
    UnknownReference {
        /// Name of the referencing resource.
        resource: String,
        /// Name that could not be found.
        target: String,
    },

    /// A reference points to an output the upstream resource does not have.
    #[error("Reference '{reference}' does not match any recorded output")]
    UnknownOutput {
        /// The reference, rendered as `${name.output}`.
        reference: String,
    },

    /// Two declarations share a logical name.
    #[error("Duplicate resource name: {name}")]
    DuplicateName {
        /// The duplicated name.
        name: String,
    },

    /// No registered provider handles the resource type.
    #[error("Resource '{resource}' has unknown type '{resource_type}'")]
    UnknownResourceType {
        /// Name of the resource.
        resource: String,
        /// The unhandled type.
        resource_type: String,
    },

    /// An input attribute has no declared change policy.
    #[error("Attribute '{attribute}' of '{resource}' ({resource_type}) has no change policy")]
    MissingChangePolicy {
        /// Name of the resource.
        resource: String,
        /// Resource type.
        resource_type: String,
        /// The attribute without a policy.
        attribute: String,
    },

    /// A declaration is structurally invalid.
    #[error("Malformed declaration at {field}: {message}")]
    Malformed {
        /// Field path of the problem.
        field: String,
        /// Description of the problem.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State could not be read or written.
    #[error("State IO failure: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },
}

/// Errors returned by provider adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// A retryable failure (throttling, network blip).
    #[error("Transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// A failure that retrying will not fix.
    #[error("Permanent provider failure: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },

    /// The external object does not exist.
    #[error("Resource not found: {provider_id}")]
    NotFound {
        /// Provider-assigned identifier.
        provider_id: String,
    },

    /// A provider call exceeded its per-operation timeout.
    #[error("Provider call '{operation}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Description of the call.
        operation: String,
        /// Timeout that elapsed.
        timeout_ms: u64,
    },
}

/// Reconciliation run errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The run was refused before any operation started.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// The run was cancelled; in-flight operations were allowed to finish.
    #[error("Reconciliation cancelled after {completed} completed operations")]
    Cancelled {
        /// Operations that reached a terminal state before cancellation.
        completed: usize,
    },

    /// The whole-run timeout elapsed.
    #[error("Reconciliation exceeded its run timeout of {timeout_secs}s")]
    RunTimedOut {
        /// The run timeout.
        timeout_secs: u64,
    },

    /// Some operations failed or were skipped; the rest were recorded.
    #[error("Run finished with {failed} failed and {skipped} skipped operations")]
    PartialFailure {
        /// Operations that failed.
        failed: usize,
        /// Operations skipped because a dependency failed.
        skipped: usize,
    },

    /// Maximum retry attempts exceeded.
    #[error("Maximum retry attempts ({attempts}) exceeded for {resource}: {last_error}")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// Resource that failed.
        resource: String,
        /// The error returned by the final attempt.
        last_error: String,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }
}

impl ConfigError {
    /// Creates an invalid-value error for a specific field.
    #[must_use]
    pub fn invalid(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl ValidationError {
    /// Creates a malformed-declaration error.
    #[must_use]
    pub fn malformed(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates an IO error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_retryability() {
        assert!(ProviderError::transient("throttled").is_retryable());
        assert!(
            ProviderError::Timeout {
                operation: String::from("create"),
                timeout_ms: 10,
            }
            .is_retryable()
        );
        assert!(!ProviderError::permanent("bad input").is_retryable());
        assert!(
            !ProviderError::NotFound {
                provider_id: String::from("x"),
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_top_level_retryable_delegates() {
        let err: ConvergeError = ProviderError::transient("slow down").into();
        assert!(err.is_retryable());

        let err: ConvergeError = ValidationError::DuplicateName {
            name: String::from("net"),
        }
        .into();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_cycle_message() {
        let err = ValidationError::Cycle {
            path: String::from("a -> b -> a"),
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> b -> a");
    }
}
