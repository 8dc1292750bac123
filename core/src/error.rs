//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
///
/// The enum is `Clone` so that one-shot initialization (the process-wide
/// cgroup hierarchy) can record its outcome for later callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// No job with this identifier in the caller's registry
    #[error("job {0} not found")]
    NotFound(String),

    /// The operation is not valid for the job's current state
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// The host environment (cgroup filesystem, spawn syscall) rejected an
    /// operation
    #[error("environment error: {0}")]
    Environment(String),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short stable code for transports to map onto their own status space
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "NOT_FOUND",
            CoreError::Precondition(_) => "FAILED_PRECONDITION",
            CoreError::Environment(_) => "ENVIRONMENT",
            CoreError::Internal(_) => "INTERNAL",
        }
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;
