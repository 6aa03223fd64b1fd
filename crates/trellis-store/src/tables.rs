//! redb table definitions for the Trellis state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain
//! types). Version keys zero-pad the millisecond timestamp to 20 digits so
//! lexicographic key order equals version order.

use redb::TableDefinition;

/// Current app specs keyed by run-spec path.
pub const APPS: TableDefinition<&str, &[u8]> = TableDefinition::new("apps");

/// App spec versions keyed by `{path}@{version:020}`.
pub const APP_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("app_versions");

/// Current pod specs keyed by run-spec path.
pub const PODS: TableDefinition<&str, &[u8]> = TableDefinition::new("pods");

/// Pod spec versions keyed by `{path}@{version:020}`.
pub const POD_VERSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("pod_versions");

/// Root groups keyed by `{version:020}`; the greatest key is current.
pub const ROOTS: TableDefinition<&str, &[u8]> = TableDefinition::new("roots");

/// In-flight deployment plans keyed by plan id.
pub const DEPLOYMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("deployments");

/// Tracked instances keyed by canonical instance-id string.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Compose a `{path}@{version:020}` version key.
pub fn version_key(id: &str, version: u64) -> String {
    format!("{id}@{version:020}")
}

/// Compose a `{version:020}` root key.
pub fn root_key(version: u64) -> String {
    format!("{version:020}")
}
