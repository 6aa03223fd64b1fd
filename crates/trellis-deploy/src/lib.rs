//! Scheduler core and deployment executor.
//!
//! The deployment manager serializes overlapping deployments through
//! per-run-spec locks and drives plan steps to completion against the
//! instance tracker, the launch queue, and the kill service. The scheduler
//! core gates everything behind leader election and owns reconciliation
//! and the scale loop.

pub mod collab;
pub mod error;
pub mod locks;
pub mod manager;
pub mod reconcile;
pub mod scale;
pub mod scheduler;
pub mod steps;

pub use collab::{
    AlwaysReady, HealthCheckReconciler, LaunchQueue, NoopHealthChecks, ReadinessCheck,
    ReconciliationClient, TaskStatus,
};
pub use error::{DeployError, DeployResult};
pub use manager::{DeploymentManagerHandle, DeploymentStarted};
pub use scheduler::SchedulerHandle;
pub use steps::StepDeps;
