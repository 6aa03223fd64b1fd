//! Scan and compaction passes.
//!
//! The scan walks roots, in-flight plans, and both spec repositories to
//! compute deletion sets; any repository error aborts the scan into empty
//! sets — GC must never take something down with it. Compaction deletes
//! with logged-and-swallowed errors and always reports done.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use trellis_core::{PathId, RootGroup};

use crate::store::GcStore;

/// What a completed scan proposes to delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionSets {
    pub apps: BTreeSet<PathId>,
    pub app_versions: BTreeSet<(PathId, u64)>,
    pub pods: BTreeSet<PathId>,
    pub pod_versions: BTreeSet<(PathId, u64)>,
    pub roots: BTreeSet<u64>,
}

impl DeletionSets {
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
            && self.app_versions.is_empty()
            && self.pods.is_empty()
            && self.pod_versions.is_empty()
            && self.roots.is_empty()
    }

    /// Drop everything the user stored while the scan ran. A stored spec
    /// shields the whole entity: the scan's view of its references is
    /// stale, so none of its versions may be compacted.
    pub fn subtract(&mut self, updated: &UpdatedEntities) {
        self.apps.retain(|id| !updated.apps.contains(id));
        self.app_versions.retain(|(id, _)| !updated.apps.contains(id));
        self.pods.retain(|id| !updated.pods.contains(id));
        self.pod_versions.retain(|(id, _)| !updated.pods.contains(id));
        self.roots.retain(|v| !updated.root_versions.contains(v));
    }

    /// Would the given store command touch an entity being compacted?
    pub fn blocks_app(&self, id: &PathId) -> bool {
        self.apps.contains(id) || self.app_versions.iter().any(|(a, _)| a == id)
    }

    pub fn blocks_pod(&self, id: &PathId) -> bool {
        self.pods.contains(id) || self.pod_versions.iter().any(|(p, _)| p == id)
    }
}

/// Entities stored while a scan was in progress.
#[derive(Debug, Clone, Default)]
pub struct UpdatedEntities {
    pub apps: BTreeSet<PathId>,
    pub pods: BTreeSet<PathId>,
    pub root_versions: BTreeSet<u64>,
}

/// Compute the deletion sets. Errors are swallowed into "delete nothing".
pub fn scan<S: GcStore>(store: &S, max_versions: usize, max_root_versions: usize) -> DeletionSets {
    match try_scan(store, max_versions, max_root_versions) {
        Ok(sets) => sets,
        Err(e) => {
            warn!(error = %e, "gc scan failed, skipping this cycle");
            DeletionSets::default()
        }
    }
}

fn try_scan<S: GcStore>(
    store: &S,
    max_versions: usize,
    max_root_versions: usize,
) -> trellis_store::StoreResult<DeletionSets> {
    let mut sets = DeletionSets::default();

    // Roots: keep the newest `max_root_versions`, everything older is a
    // candidate. The current root is the newest and always survives.
    let root_versions = store.root_versions()?;
    let cutoff = root_versions.len().saturating_sub(max_root_versions.max(1));
    let (doomed_roots, retained_roots) = root_versions.split_at(cutoff);
    sets.roots = doomed_roots.iter().copied().collect();

    // References: the current root, every retained root version, and both
    // sides of every in-flight deployment.
    let mut referenced: BTreeMap<PathId, BTreeSet<u64>> = BTreeMap::new();
    if let Some(root) = store.current_root()? {
        collect_refs(&root, &mut referenced);
    }
    for version in retained_roots {
        if let Some(root) = store.root_version(*version)? {
            collect_refs(&root, &mut referenced);
        }
    }
    for plan in store.deployment_plans()? {
        collect_refs(&plan.original, &mut referenced);
        collect_refs(&plan.target, &mut referenced);
    }

    // Apps.
    for id in store.app_ids()? {
        match referenced.get(&id) {
            None => {
                sets.apps.insert(id);
            }
            Some(keep) => {
                let versions = store.app_versions(&id)?;
                let cutoff = versions.len().saturating_sub(max_versions);
                for version in &versions[..cutoff] {
                    if !keep.contains(version) {
                        sets.app_versions.insert((id.clone(), *version));
                    }
                }
            }
        }
    }

    // Pods.
    for id in store.pod_ids()? {
        match referenced.get(&id) {
            None => {
                sets.pods.insert(id);
            }
            Some(keep) => {
                let versions = store.pod_versions(&id)?;
                let cutoff = versions.len().saturating_sub(max_versions);
                for version in &versions[..cutoff] {
                    if !keep.contains(version) {
                        sets.pod_versions.insert((id.clone(), *version));
                    }
                }
            }
        }
    }

    debug!(
        apps = sets.apps.len(),
        app_versions = sets.app_versions.len(),
        pods = sets.pods.len(),
        pod_versions = sets.pod_versions.len(),
        roots = sets.roots.len(),
        "gc scan complete"
    );
    Ok(sets)
}

fn collect_refs(root: &RootGroup, referenced: &mut BTreeMap<PathId, BTreeSet<u64>>) {
    for spec in root.transitive_run_specs() {
        referenced
            .entry(spec.id().clone())
            .or_default()
            .insert(spec.version());
    }
}

/// Delete everything in the sets. Per-entry errors are logged and
/// swallowed; compaction always runs to the end.
pub fn compact<S: GcStore>(store: &S, sets: &DeletionSets) {
    for id in &sets.apps {
        if let Err(e) = store.delete_app(id) {
            warn!(app = %id, error = %e, "failed to delete app");
        }
    }
    for (id, version) in &sets.app_versions {
        if let Err(e) = store.delete_app_version(id, *version) {
            warn!(app = %id, version, error = %e, "failed to delete app version");
        }
    }
    for id in &sets.pods {
        if let Err(e) = store.delete_pod(id) {
            warn!(pod = %id, error = %e, "failed to delete pod");
        }
    }
    for (id, version) in &sets.pod_versions {
        if let Err(e) = store.delete_pod_version(id, *version) {
            warn!(pod = %id, version, error = %e, "failed to delete pod version");
        }
    }
    for version in &sets.roots {
        if let Err(e) = store.delete_root_version(*version) {
            warn!(version, error = %e, "failed to delete root version");
        }
    }
    debug!("gc compaction complete");
}
