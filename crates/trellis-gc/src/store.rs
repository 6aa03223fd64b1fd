//! Repository surface the garbage collector works against.
//!
//! A seam trait rather than the concrete store, so tests can inject
//! failing or gated repositories; production uses the blanket
//! implementation for [`StateStore`].

use trellis_core::{AppSpec, PathId, PodSpec, RootGroup};
use trellis_plan::DeploymentPlan;
use trellis_store::{StateStore, StoreResult};

pub trait GcStore: Send + Sync + 'static {
    fn app_ids(&self) -> StoreResult<Vec<PathId>>;
    fn app_versions(&self, id: &PathId) -> StoreResult<Vec<u64>>;
    fn store_app(&self, app: &AppSpec) -> StoreResult<()>;
    fn delete_app(&self, id: &PathId) -> StoreResult<bool>;
    fn delete_app_version(&self, id: &PathId, version: u64) -> StoreResult<bool>;

    fn pod_ids(&self) -> StoreResult<Vec<PathId>>;
    fn pod_versions(&self, id: &PathId) -> StoreResult<Vec<u64>>;
    fn store_pod(&self, pod: &PodSpec) -> StoreResult<()>;
    fn delete_pod(&self, id: &PathId) -> StoreResult<bool>;
    fn delete_pod_version(&self, id: &PathId, version: u64) -> StoreResult<bool>;

    fn current_root(&self) -> StoreResult<Option<RootGroup>>;
    fn root_versions(&self) -> StoreResult<Vec<u64>>;
    fn root_version(&self, version: u64) -> StoreResult<Option<RootGroup>>;
    fn delete_root_version(&self, version: u64) -> StoreResult<bool>;
    fn store_root(
        &self,
        root: &RootGroup,
        updated_apps: &[AppSpec],
        deleted_app_ids: &[PathId],
        updated_pods: &[PodSpec],
        deleted_pod_ids: &[PathId],
    ) -> StoreResult<()>;

    fn deployment_plans(&self) -> StoreResult<Vec<DeploymentPlan>>;
}

impl GcStore for StateStore {
    fn app_ids(&self) -> StoreResult<Vec<PathId>> {
        self.apps().ids()
    }

    fn app_versions(&self, id: &PathId) -> StoreResult<Vec<u64>> {
        self.apps().versions(id)
    }

    fn store_app(&self, app: &AppSpec) -> StoreResult<()> {
        self.apps().store(app)?;
        self.apps().store_version(app)
    }

    fn delete_app(&self, id: &PathId) -> StoreResult<bool> {
        self.apps().delete(id)
    }

    fn delete_app_version(&self, id: &PathId, version: u64) -> StoreResult<bool> {
        self.apps().delete_version(id, version)
    }

    fn pod_ids(&self) -> StoreResult<Vec<PathId>> {
        self.pods().ids()
    }

    fn pod_versions(&self, id: &PathId) -> StoreResult<Vec<u64>> {
        self.pods().versions(id)
    }

    fn store_pod(&self, pod: &PodSpec) -> StoreResult<()> {
        self.pods().store(pod)?;
        self.pods().store_version(pod)
    }

    fn delete_pod(&self, id: &PathId) -> StoreResult<bool> {
        self.pods().delete(id)
    }

    fn delete_pod_version(&self, id: &PathId, version: u64) -> StoreResult<bool> {
        self.pods().delete_version(id, version)
    }

    fn current_root(&self) -> StoreResult<Option<RootGroup>> {
        self.roots().root()
    }

    fn root_versions(&self) -> StoreResult<Vec<u64>> {
        self.roots().root_versions()
    }

    fn root_version(&self, version: u64) -> StoreResult<Option<RootGroup>> {
        self.roots().root_version(version)
    }

    fn delete_root_version(&self, version: u64) -> StoreResult<bool> {
        self.roots().delete_root_version(version)
    }

    fn store_root(
        &self,
        root: &RootGroup,
        updated_apps: &[AppSpec],
        deleted_app_ids: &[PathId],
        updated_pods: &[PodSpec],
        deleted_pod_ids: &[PathId],
    ) -> StoreResult<()> {
        self.roots()
            .store_root(root, updated_apps, deleted_app_ids, updated_pods, deleted_pod_ids)
    }

    fn deployment_plans(&self) -> StoreResult<Vec<DeploymentPlan>> {
        self.deployments().all()
    }
}
