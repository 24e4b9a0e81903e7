//! Error types for the Terrace convergence engine.
//!
//! This module provides the error hierarchy for every stage of a convergence
//! cycle: configuration, graph validation, state management, the provider
//! interface, planning and pipeline orchestration.

use std::path::PathBuf;
use thiserror::Error;

use crate::graph::ResourceId;

/// The main error type for the Terrace convergence engine.
#[derive(Debug, Error)]
pub enum TerraceError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The resource graph is invalid.
    #[error("Invalid graph: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Pipeline errors.
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

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

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// Why a resource graph was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two resources share the same identity.
    #[error("duplicate resource identity {id}")]
    DuplicateIdentity {
        /// The duplicated identity.
        id: ResourceId,
    },

    /// A resource references an identity that is not in the graph.
    #[error("{from} references missing resource {to}")]
    DanglingReference {
        /// Resource holding the reference.
        from: ResourceId,
        /// The missing target.
        to: ResourceId,
    },

    /// The dependency edges contain a cycle.
    #[error("dependency cycle: {}", format_path(.path))]
    Cycle {
        /// Resources on the cycle, first element repeated at the end.
        path: Vec<ResourceId>,
    },

    /// A resource does not satisfy its type schema.
    #[error("{id} violates schema: {message}")]
    SchemaViolation {
        /// Offending resource.
        id: ResourceId,
        /// What is wrong.
        message: String,
    },

    /// A resource identity string could not be parsed.
    #[error("invalid resource identity '{raw}': expected 'type.name'")]
    MalformedIdentity {
        /// The raw string.
        raw: String,
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

    /// The stored serial advanced past the serial the writer started from.
    #[error("State conflict: expected serial {expected}, store is at {found}")]
    Conflict {
        /// Serial the writer loaded.
        expected: u64,
        /// Serial currently in the store.
        found: u64,
    },

    /// The stored snapshot belongs to a different state lineage.
    #[error("State lineage mismatch: expected {expected}, found {found}")]
    LineageMismatch {
        /// Lineage the caller expected.
        expected: String,
        /// Lineage found in the store.
        found: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockHeld {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The lock could not be acquired before the wait timeout elapsed.
    #[error("Timed out after {waited_secs}s waiting for state lock held by {holder}")]
    LockTimeout {
        /// Holder at the time the wait gave up.
        holder: String,
        /// Seconds spent waiting.
        waited_secs: u64,
    },

    /// The presented lock token no longer matches the current holder.
    #[error("Stale lock token {lock_id}: the lock is no longer held by this token")]
    StaleToken {
        /// The stale lock id.
        lock_id: String,
    },

    /// State lock operation failed at the storage layer.
    #[error("State lock operation failed: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Unsupported state format version.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Supported state version.
        expected: u32,
        /// Found state version.
        found: u32,
    },
}

/// Errors reported by a provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// A temporary failure; the call may succeed if repeated.
    #[error("transient provider failure: {message}")]
    Transient {
        /// Description of the failure.
        message: String,
    },

    /// The provider asked us to slow down.
    #[error("provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Network error talking to the provider.
    #[error("network error communicating with provider: {message}")]
    Network {
        /// Description of the network error.
        message: String,
    },

    /// A failure that will not go away by retrying.
    #[error("permanent provider failure: {message}")]
    Permanent {
        /// Description of the failure.
        message: String,
    },

    /// The provider has no object with this id.
    #[error("provider object not found: {provider_id}")]
    NotFound {
        /// Provider-side identifier.
        provider_id: String,
    },

    /// A pending operation never completed.
    #[error("timed out after {waited_secs}s waiting for {provider_id} to complete")]
    Timeout {
        /// Provider-side identifier.
        provider_id: String,
        /// Seconds spent polling.
        waited_secs: u64,
    },

    /// The operation was cancelled before completion.
    #[error("operation on {provider_id} cancelled")]
    Cancelled {
        /// Provider-side identifier, empty when not yet known.
        provider_id: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Ordering constraints between steps form a cycle.
    #[error("plan ordering cycle between steps: {}", .steps.join(" -> "))]
    PlanCycle {
        /// Steps on the cycle, rendered as `operation type.name`.
        steps: Vec<String>,
    },

    /// A reference could not be resolved when preparing a step.
    #[error("cannot resolve {reference} for {resource}")]
    UnresolvedReference {
        /// The resource being prepared.
        resource: ResourceId,
        /// The reference, rendered as `type.name.attribute`.
        reference: String,
    },
}

/// Pipeline errors.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run was cancelled.
    #[error("pipeline run {run_id} cancelled")]
    Cancelled {
        /// Identifier of the cancelled run.
        run_id: String,
    },

    /// The desired graph for a revision could not be obtained.
    #[error("desired graph {reference} unavailable: {message}")]
    SourceUnavailable {
        /// Reference carried by the trigger.
        reference: String,
        /// Why it could not be loaded.
        message: String,
    },

    /// A run was moved to a stage it cannot reach from its current one.
    #[error("pipeline run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// Identifier of the run.
        run_id: String,
        /// Current stage.
        from: String,
        /// Requested stage.
        to: String,
    },

    /// A report sink failed to accept a report.
    #[error("report sink '{sink}' failed: {message}")]
    ReportFailed {
        /// Name of the sink.
        sink: String,
        /// Description of the failure.
        message: String,
    },
}

/// Result type alias for Terrace operations.
pub type Result<T> = std::result::Result<T, TerraceError>;

fn format_path(path: &[ResourceId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl TerraceError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(err) => err.is_retryable(),
            Self::State(StateError::LockHeld { .. } | StateError::LockTimeout { .. }) => true,
            _ => false,
        }
    }

    /// Returns true if the error came from a cancellation signal.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Pipeline(PipelineError::Cancelled { .. })
                | Self::Provider(ProviderError::Cancelled { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(err) => err.retry_delay_secs(),
            Self::State(StateError::LockHeld { .. } | StateError::LockTimeout { .. }) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
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

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Returns true if repeating the call may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::RateLimited { .. } | Self::Network { .. }
        )
    }

    /// Returns the provider-suggested delay, if any.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
