//! Persistence for the Trellis control plane.
//!
//! Versioned repositories over redb: run specs, root groups, deployment
//! plans, and instances. All values are JSON-serialized into `&[u8]`
//! columns; an in-memory backend backs tests.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use store::{
    AppRepository, DeploymentRepository, InstanceRepository, PodRepository, RootRepository,
    StateStore,
};
