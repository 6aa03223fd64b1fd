//! The kill service: drives non-terminal tasks to a killed state through
//! the offer layer, throttled and retrying, reconciling with the instance
//! event stream.

pub mod service;

pub use service::{KillConfig, KillServiceHandle, TaskKiller};
