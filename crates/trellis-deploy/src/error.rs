//! Error types for the deployment executor.

use thiserror::Error;

use trellis_store::StoreError;

/// Result type alias for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    /// Another deployment holds locks on affected run specs. Carries the
    /// holders' deployment ids; callers may retry with `force`.
    #[error("affected run specs are locked by deployments {0:?}")]
    AppLocked(Vec<String>),

    /// The plan was pre-empted by a forced deployment or an explicit
    /// cancellation.
    #[error("deployment cancelled")]
    DeploymentCancelled,

    /// A step failed; instance state is preserved as observed.
    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
