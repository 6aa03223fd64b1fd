//! Persistence garbage collection.
//!
//! A finite-state actor scans the app, pod, root, and deployment
//! repositories for unreferenced versions and compacts them away without
//! ever racing a concurrent writer: stores issued during a scan are
//! recorded and subtracted from the deletion sets, and stores that would
//! touch an entity being compacted are parked until compaction finishes.

pub mod actor;
pub mod scan;
pub mod store;

pub use actor::{GcConfig, GcHandle, GcPhase};
pub use scan::{DeletionSets, UpdatedEntities};
pub use store::GcStore;
