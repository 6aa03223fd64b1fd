//! StateStore — redb-backed persistence for the Trellis control plane.
//!
//! One database holds every repository; repositories are thin handles
//! sharing the `Arc<Database>`. `store_root` is the only multi-table
//! transaction: a root-group version commits together with the run-spec
//! versions it references.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use trellis_core::{AppSpec, PathId, PodSpec, RootGroup};
use trellis_instance::{Instance, InstanceId, InstancePersistence};
use trellis_plan::DeploymentPlan;

use crate::error::{StoreError, StoreResult};
use crate::tables::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPS).map_err(map_err!(Table))?;
        txn.open_table(APP_VERSIONS).map_err(map_err!(Table))?;
        txn.open_table(PODS).map_err(map_err!(Table))?;
        txn.open_table(POD_VERSIONS).map_err(map_err!(Table))?;
        txn.open_table(ROOTS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(INSTANCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn apps(&self) -> AppRepository {
        AppRepository {
            db: self.db.clone(),
        }
    }

    pub fn pods(&self) -> PodRepository {
        PodRepository {
            db: self.db.clone(),
        }
    }

    pub fn roots(&self) -> RootRepository {
        RootRepository {
            db: self.db.clone(),
        }
    }

    pub fn deployments(&self) -> DeploymentRepository {
        DeploymentRepository {
            db: self.db.clone(),
        }
    }

    pub fn instances(&self) -> InstanceRepository {
        InstanceRepository {
            db: self.db.clone(),
        }
    }
}

// ── Shared raw operations ──────────────────────────────────────────

fn put_raw(
    db: &Database,
    table: TableDefinition<&str, &[u8]>,
    key: &str,
    value: &[u8],
) -> StoreResult<()> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    {
        let mut t = txn.open_table(table).map_err(map_err!(Table))?;
        t.insert(key, value).map_err(map_err!(Write))?;
    }
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

fn get_raw(
    db: &Database,
    table: TableDefinition<&str, &[u8]>,
    key: &str,
) -> StoreResult<Option<Vec<u8>>> {
    let txn = db.begin_read().map_err(map_err!(Transaction))?;
    let t = txn.open_table(table).map_err(map_err!(Table))?;
    Ok(t.get(key)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value().to_vec()))
}

fn remove_raw(
    db: &Database,
    table: TableDefinition<&str, &[u8]>,
    key: &str,
) -> StoreResult<bool> {
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    let existed;
    {
        let mut t = txn.open_table(table).map_err(map_err!(Table))?;
        existed = t.remove(key).map_err(map_err!(Write))?.is_some();
    }
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(existed)
}

fn all_keys(db: &Database, table: TableDefinition<&str, &[u8]>) -> StoreResult<Vec<String>> {
    let txn = db.begin_read().map_err(map_err!(Transaction))?;
    let t = txn.open_table(table).map_err(map_err!(Table))?;
    let mut keys = Vec::new();
    for entry in t.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        keys.push(key.value().to_string());
    }
    Ok(keys)
}

fn range_keys(
    db: &Database,
    table: TableDefinition<&str, &[u8]>,
    start: &str,
    end: &str,
) -> StoreResult<Vec<String>> {
    let txn = db.begin_read().map_err(map_err!(Transaction))?;
    let t = txn.open_table(table).map_err(map_err!(Table))?;
    let mut keys = Vec::new();
    for entry in t.range(start..end).map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        keys.push(key.value().to_string());
    }
    Ok(keys)
}

fn all_decoded<T: DeserializeOwned>(
    db: &Database,
    table: TableDefinition<&str, &[u8]>,
) -> StoreResult<Vec<T>> {
    let txn = db.begin_read().map_err(map_err!(Transaction))?;
    let t = txn.open_table(table).map_err(map_err!(Table))?;
    let mut out = Vec::new();
    for entry in t.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        out.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
    }
    Ok(out)
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Delete every version row for `id`. Runs inside the caller's intent of
/// removing the whole spec.
fn remove_versions(
    db: &Database,
    table: TableDefinition<&str, &[u8]>,
    id: &str,
) -> StoreResult<()> {
    let doomed = range_keys(db, table, &format!("{id}@"), &format!("{id}A"))?;
    let txn = db.begin_write().map_err(map_err!(Transaction))?;
    {
        let mut t = txn.open_table(table).map_err(map_err!(Table))?;
        for key in &doomed {
            t.remove(key.as_str()).map_err(map_err!(Write))?;
        }
    }
    txn.commit().map_err(map_err!(Transaction))?;
    Ok(())
}

fn versions_of(
    db: &Database,
    table: TableDefinition<&str, &[u8]>,
    id: &str,
) -> StoreResult<Vec<u64>> {
    let keys = range_keys(db, table, &format!("{id}@"), &format!("{id}A"))?;
    Ok(keys
        .iter()
        .filter_map(|k| k.rsplit_once('@'))
        .filter_map(|(_, v)| v.parse().ok())
        .collect())
}

// ── Run-spec repositories ──────────────────────────────────────────

/// Versioned store for app specs.
#[derive(Clone)]
pub struct AppRepository {
    db: Arc<Database>,
}

impl AppRepository {
    /// Store the current version of an app.
    pub fn store(&self, app: &AppSpec) -> StoreResult<()> {
        put_raw(&self.db, APPS, &app.id.to_string(), &encode(app)?)
    }

    /// Store one historical version of an app.
    pub fn store_version(&self, app: &AppSpec) -> StoreResult<()> {
        let key = version_key(&app.id.to_string(), app.version_info.version());
        put_raw(&self.db, APP_VERSIONS, &key, &encode(app)?)
    }

    pub fn get(&self, id: &PathId) -> StoreResult<Option<AppSpec>> {
        get_raw(&self.db, APPS, &id.to_string())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn get_version(&self, id: &PathId, version: u64) -> StoreResult<Option<AppSpec>> {
        get_raw(&self.db, APP_VERSIONS, &version_key(&id.to_string(), version))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn ids(&self) -> StoreResult<Vec<PathId>> {
        Ok(all_keys(&self.db, APPS)?
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect())
    }

    /// Version timestamps stored for `id`, oldest first.
    pub fn versions(&self, id: &PathId) -> StoreResult<Vec<u64>> {
        versions_of(&self.db, APP_VERSIONS, &id.to_string())
    }

    /// Remove the current spec and every stored version.
    pub fn delete(&self, id: &PathId) -> StoreResult<bool> {
        let existed = remove_raw(&self.db, APPS, &id.to_string())?;
        remove_versions(&self.db, APP_VERSIONS, &id.to_string())?;
        Ok(existed)
    }

    pub fn delete_version(&self, id: &PathId, version: u64) -> StoreResult<bool> {
        remove_raw(&self.db, APP_VERSIONS, &version_key(&id.to_string(), version))
    }
}

/// Versioned store for pod specs.
#[derive(Clone)]
pub struct PodRepository {
    db: Arc<Database>,
}

impl PodRepository {
    pub fn store(&self, pod: &PodSpec) -> StoreResult<()> {
        put_raw(&self.db, PODS, &pod.id.to_string(), &encode(pod)?)
    }

    pub fn store_version(&self, pod: &PodSpec) -> StoreResult<()> {
        let key = version_key(&pod.id.to_string(), pod.version_info.version());
        put_raw(&self.db, POD_VERSIONS, &key, &encode(pod)?)
    }

    pub fn get(&self, id: &PathId) -> StoreResult<Option<PodSpec>> {
        get_raw(&self.db, PODS, &id.to_string())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn get_version(&self, id: &PathId, version: u64) -> StoreResult<Option<PodSpec>> {
        get_raw(&self.db, POD_VERSIONS, &version_key(&id.to_string(), version))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn ids(&self) -> StoreResult<Vec<PathId>> {
        Ok(all_keys(&self.db, PODS)?
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect())
    }

    pub fn versions(&self, id: &PathId) -> StoreResult<Vec<u64>> {
        versions_of(&self.db, POD_VERSIONS, &id.to_string())
    }

    pub fn delete(&self, id: &PathId) -> StoreResult<bool> {
        let existed = remove_raw(&self.db, PODS, &id.to_string())?;
        remove_versions(&self.db, POD_VERSIONS, &id.to_string())?;
        Ok(existed)
    }

    pub fn delete_version(&self, id: &PathId, version: u64) -> StoreResult<bool> {
        remove_raw(&self.db, POD_VERSIONS, &version_key(&id.to_string(), version))
    }
}

// ── Root repository ────────────────────────────────────────────────

/// Versioned store for root groups. The greatest version key is current.
#[derive(Clone)]
pub struct RootRepository {
    db: Arc<Database>,
}

impl RootRepository {
    /// Store a new root version together with the run-spec versions it
    /// references, atomically.
    pub fn store_root(
        &self,
        root: &RootGroup,
        updated_apps: &[AppSpec],
        deleted_app_ids: &[PathId],
        updated_pods: &[PodSpec],
        deleted_pod_ids: &[PathId],
    ) -> StoreResult<()> {
        let root_bytes = encode(root)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut roots = txn.open_table(ROOTS).map_err(map_err!(Table))?;
            roots
                .insert(root_key(root.version).as_str(), root_bytes.as_slice())
                .map_err(map_err!(Write))?;

            let mut apps = txn.open_table(APPS).map_err(map_err!(Table))?;
            let mut app_versions = txn.open_table(APP_VERSIONS).map_err(map_err!(Table))?;
            for app in updated_apps {
                let bytes = encode(app)?;
                apps.insert(app.id.to_string().as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                app_versions
                    .insert(
                        version_key(&app.id.to_string(), app.version_info.version()).as_str(),
                        bytes.as_slice(),
                    )
                    .map_err(map_err!(Write))?;
            }
            for id in deleted_app_ids {
                apps.remove(id.to_string().as_str()).map_err(map_err!(Write))?;
            }

            let mut pods = txn.open_table(PODS).map_err(map_err!(Table))?;
            let mut pod_versions = txn.open_table(POD_VERSIONS).map_err(map_err!(Table))?;
            for pod in updated_pods {
                let bytes = encode(pod)?;
                pods.insert(pod.id.to_string().as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                pod_versions
                    .insert(
                        version_key(&pod.id.to_string(), pod.version_info.version()).as_str(),
                        bytes.as_slice(),
                    )
                    .map_err(map_err!(Write))?;
            }
            for id in deleted_pod_ids {
                pods.remove(id.to_string().as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(version = root.version, "root group stored");
        Ok(())
    }

    /// The current root group, if any has ever been stored.
    pub fn root(&self) -> StoreResult<Option<RootGroup>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(ROOTS).map_err(map_err!(Table))?;
        let last = t.last().map_err(map_err!(Read))?;
        match last {
            Some((_, value)) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// All stored root versions, oldest first.
    pub fn root_versions(&self) -> StoreResult<Vec<u64>> {
        Ok(all_keys(&self.db, ROOTS)?
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect())
    }

    pub fn root_version(&self, version: u64) -> StoreResult<Option<RootGroup>> {
        get_raw(&self.db, ROOTS, &root_key(version))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn delete_root_version(&self, version: u64) -> StoreResult<bool> {
        remove_raw(&self.db, ROOTS, &root_key(version))
    }
}

// ── Deployment repository ──────────────────────────────────────────

/// Store for in-flight deployment plans.
#[derive(Clone)]
pub struct DeploymentRepository {
    db: Arc<Database>,
}

impl DeploymentRepository {
    pub fn store(&self, plan: &DeploymentPlan) -> StoreResult<()> {
        put_raw(&self.db, DEPLOYMENTS, &plan.id, &encode(plan)?)
    }

    pub fn delete(&self, plan_id: &str) -> StoreResult<bool> {
        remove_raw(&self.db, DEPLOYMENTS, plan_id)
    }

    pub fn all(&self) -> StoreResult<Vec<DeploymentPlan>> {
        all_decoded(&self.db, DEPLOYMENTS)
    }
}

// ── Instance repository ────────────────────────────────────────────

/// Store for tracked instances; the instance tracker writes through here.
#[derive(Clone)]
pub struct InstanceRepository {
    db: Arc<Database>,
}

impl InstanceRepository {
    pub fn store(&self, instance: &Instance) -> StoreResult<()> {
        put_raw(
            &self.db,
            INSTANCES,
            &instance.id.to_string(),
            &encode(instance)?,
        )
    }

    pub fn get(&self, id: &InstanceId) -> StoreResult<Option<Instance>> {
        get_raw(&self.db, INSTANCES, &id.to_string())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn ids(&self) -> StoreResult<Vec<InstanceId>> {
        Ok(all_keys(&self.db, INSTANCES)?
            .iter()
            .filter_map(|k| k.parse().ok())
            .collect())
    }

    pub fn all(&self) -> StoreResult<Vec<Instance>> {
        all_decoded(&self.db, INSTANCES)
    }

    pub fn delete(&self, id: &InstanceId) -> StoreResult<bool> {
        remove_raw(&self.db, INSTANCES, &id.to_string())
    }
}

impl InstancePersistence for InstanceRepository {
    fn persist(&self, instance: &Instance) -> anyhow::Result<()> {
        self.store(instance)?;
        Ok(())
    }

    fn expunge(&self, id: &InstanceId) -> anyhow::Result<()> {
        self.delete(id)?;
        Ok(())
    }
}
