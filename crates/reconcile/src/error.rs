//! Error types for planning and applying configuration.
//!
//! Errors are categorized so callers can tell fatal structural problems
//! (a corrupted state file, a held lock) from conditions that only affect a
//! single resource. Each variant carries enough context to act on.

use std::path::PathBuf;
use thiserror::Error;

/// Categories of reconciliation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed persisted state or plan
    Validation,
    /// Another plan/apply holds the lock
    LockConflict,
    /// State file is unreadable or has an unsupported version
    StateCorruption,
    /// Resources reference each other in a loop
    DependencyCycle,
    /// A reference does not resolve to a declared resource
    MissingDependency,
    /// A single resource failed to apply
    ExecutionFailure,
    /// Filesystem or other unexpected errors
    Other,
}

impl ErrorCategory {
    /// Whether this category aborts the whole operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Validation | Self::LockConflict | Self::StateCorruption | Self::Other
        )
    }

    /// Get a user-friendly description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Validation => "Invalid state or plan",
            Self::LockConflict => "Operation already in progress",
            Self::StateCorruption => "Corrupted state file",
            Self::DependencyCycle => "Dependency cycle",
            Self::MissingDependency => "Unresolved reference",
            Self::ExecutionFailure => "Apply failed",
            Self::Other => "Unexpected error",
        }
    }

    /// Get actionable advice for resolving this error category.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::Validation => "Regenerate the plan or fix the file it was loaded from",
            Self::LockConflict => {
                "Wait for the other operation to finish, or run `converge unlock` if it crashed"
            }
            Self::StateCorruption => {
                "Restore .state/state.json from backup or remove it and re-import resources"
            }
            Self::DependencyCycle => "Break the reference loop between the listed resources",
            Self::MissingDependency => "Declare the referenced resource or remove the reference",
            Self::ExecutionFailure => "Check the resource error and re-run apply",
            Self::Other => "Check the error details for more information",
        }
    }
}

/// Errors that can occur while planning or applying.
#[derive(Debug, Error)]
pub enum Error {
    /// Persisted content did not have the expected shape
    #[error("validation failed: {message}")]
    Validation {
        /// What was wrong
        message: String,
    },

    /// State file could not be parsed
    #[error("corrupted state file {path}: {message}")]
    StateCorruption {
        /// Path of the state file
        path: PathBuf,
        /// Parser error
        message: String,
    },

    /// State or plan file written by an incompatible version
    #[error("unsupported {what} version {found} (expected {expected})")]
    UnsupportedVersion {
        /// "state" or "plan"
        what: &'static str,
        /// Version found in the file
        found: String,
        /// Version this build understands
        expected: &'static str,
    },

    /// File exceeds the size ceiling for persisted documents
    #[error("{path} is {size} bytes, larger than the {limit} byte limit")]
    PayloadTooLarge {
        /// Offending file
        path: PathBuf,
        /// Actual size
        size: u64,
        /// Allowed size
        limit: u64,
    },

    /// Another process holds the lock
    #[error("another {operation} is in progress (pid {pid}, started {created_at})")]
    LockConflict {
        /// PID of the lock holder
        pid: u32,
        /// Operation the holder is running
        operation: String,
        /// When the lock was taken (RFC 3339)
        created_at: String,
    },

    /// A resource references something that is not declared
    #[error("{resource} references unknown {kind} '{dependency}'")]
    MissingDependency {
        /// Referencing resource
        resource: String,
        /// Kind of the missing resource
        kind: String,
        /// Missing name
        dependency: String,
    },

    /// Plan content does not match its signature
    #[error("plan signature mismatch: expected {expected}, computed {actual}")]
    PlanSignatureMismatch {
        /// Signature stored in the plan file
        expected: String,
        /// Signature recomputed from the content
        actual: String,
    },

    /// Plan was generated from a different configuration
    #[error("plan was generated for config {planned}, current config is {current}")]
    PlanConfigMismatch {
        /// Config hash recorded in the plan
        planned: String,
        /// Config hash of the configuration on disk
        current: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Get the error category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Validation { .. }
            | Error::PlanSignatureMismatch { .. }
            | Error::PlanConfigMismatch { .. }
            | Error::PayloadTooLarge { .. } => ErrorCategory::Validation,
            Error::StateCorruption { .. } | Error::UnsupportedVersion { .. } => {
                ErrorCategory::StateCorruption
            }
            Error::LockConflict { .. } => ErrorCategory::LockConflict,
            Error::MissingDependency { .. } => ErrorCategory::MissingDependency,
            _ => ErrorCategory::Other,
        }
    }

    /// Whether this error aborts the operation.
    pub fn is_fatal(&self) -> bool {
        self.category().is_fatal()
    }

    /// Whether retrying the same call later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockConflict { .. })
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, Error>;
