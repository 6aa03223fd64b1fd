//! Error types for the core model.

use thiserror::Error;

use crate::paths::PathId;

/// Result type alias for group and spec validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Errors raised when a group update violates a model invariant.
///
/// These surface to the caller unchanged; a failed update never mutates
/// the root group.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("validation failure: {0}")]
    Failure(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("dependency cycle through {0}")]
    Cycle(PathId),

    #[error("invalid path `{0}`: {1}")]
    InvalidPath(String, String),
}
