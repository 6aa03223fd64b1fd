//! Instance and task state for the Trellis control plane.
//!
//! The instance tracker is the authoritative in-memory view of every
//! instance. All mutations funnel through it, so per-instance updates are
//! totally ordered; everything else reads snapshots.

pub mod condition;
pub mod id;
pub mod instance;
pub mod reducer;
pub mod tracker;

pub use condition::{Condition, Goal, GoalChangeReason};
pub use id::{IdPrefix, InstanceId, MatchError, TaskId};
pub use instance::{
    AgentInfo, Instance, InstanceState, Reservation, ReservationState, Task,
};
pub use tracker::{InstanceEvent, InstancePersistence, InstanceTracker, NoopPersistence};
