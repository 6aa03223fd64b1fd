//! Core domain model for the Trellis control plane.
//!
//! This crate holds the declarative side of the orchestrator: hierarchical
//! run-spec identifiers, immutable app/pod specifications, the group tree
//! that versions them as one unit, and the dependency graph the deployment
//! planner layers its steps over.

pub mod config;
pub mod depgraph;
pub mod error;
pub mod group;
pub mod paths;
pub mod runspec;

pub use config::CoreConfig;
pub use error::{ValidationError, ValidationResult};
pub use group::{Group, GroupOp, RootGroup};
pub use paths::PathId;
pub use runspec::{
    AppSpec, ContainerSpec, HealthCheckSpec, PodSpec, ReadinessCheckSpec, Resources, RunSpec,
    UnreachableStrategy, UpgradeStrategy, VersionInfo,
};

/// Current Unix epoch in milliseconds. Version timestamps across the
/// control plane use this resolution.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
