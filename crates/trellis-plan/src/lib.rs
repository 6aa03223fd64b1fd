//! Deployment planning: orders the work that moves one root group to
//! another.
//!
//! The planner is pure and stateless; it may be called from anywhere. The
//! executor owns running the resulting plan.

pub mod plan;
pub mod planner;

pub use plan::{DeploymentAction, DeploymentPlan, DeploymentStep};
pub use planner::plan;
