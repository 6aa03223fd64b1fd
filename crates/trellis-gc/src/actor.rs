//! The garbage-collector actor.
//!
//! States: `Resting` (only when a scan interval is configured),
//! `ReadyForGc`, `Scanning`, `Compacting`. Store traffic is routed through
//! the actor so a scan can record concurrent writes and a compaction can
//! park writes that would race a pending deletion.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use trellis_core::{AppSpec, CoreConfig, PathId, PodSpec, RootGroup};

use crate::scan::{compact, scan, DeletionSets, UpdatedEntities};
use crate::store::GcStore;
use trellis_store::{StoreError, StoreResult};

#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Automatic scan cadence; `None` means on-demand only.
    pub scan_interval: Option<Duration>,
    /// Versions retained per run spec.
    pub max_versions: usize,
    /// Root versions retained.
    pub max_root_versions: usize,
}

impl GcConfig {
    pub fn from_core(config: &CoreConfig) -> Self {
        Self {
            scan_interval: config.gc_scan_interval(),
            max_versions: config.max_versions as usize,
            max_root_versions: config.max_root_versions as usize,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self::from_core(&CoreConfig::default())
    }
}

/// Externally observable phase, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    Resting,
    ReadyForGc,
    Scanning,
    Compacting,
}

enum Msg {
    RunGc,
    StoreApp {
        app: Box<AppSpec>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    StorePod {
        pod: Box<PodSpec>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    StoreRoot {
        request: Box<StoreRootRequest>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Phase {
        reply: oneshot::Sender<GcPhase>,
    },
    ScanDone(DeletionSets),
    CompactDone,
}

struct StoreRootRequest {
    root: RootGroup,
    updated_apps: Vec<AppSpec>,
    deleted_app_ids: Vec<PathId>,
    updated_pods: Vec<PodSpec>,
    deleted_pod_ids: Vec<PathId>,
}

enum BlockedStore {
    App {
        app: Box<AppSpec>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Pod {
        pod: Box<PodSpec>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
    Root {
        request: Box<StoreRootRequest>,
        reply: oneshot::Sender<StoreResult<()>>,
    },
}

enum State {
    Resting,
    ReadyForGc,
    Scanning {
        updated: UpdatedEntities,
        gc_requested: bool,
    },
    Compacting {
        deleting: DeletionSets,
        blocked: Vec<BlockedStore>,
        gc_requested: bool,
    },
}

impl State {
    fn phase(&self) -> GcPhase {
        match self {
            Self::Resting => GcPhase::Resting,
            Self::ReadyForGc => GcPhase::ReadyForGc,
            Self::Scanning { .. } => GcPhase::Scanning,
            Self::Compacting { .. } => GcPhase::Compacting,
        }
    }
}

/// Handle to the GC actor. Root-group and run-spec writes go through here
/// so the collector can interleave them safely with scans.
#[derive(Clone)]
pub struct GcHandle {
    tx: mpsc::Sender<Msg>,
}

impl GcHandle {
    pub fn spawn<S: GcStore>(store: Arc<S>, config: GcConfig) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(store, config, tx.clone(), rx));
        Self { tx }
    }

    /// Request a collection cycle. Coalesces with any cycle in progress.
    pub async fn run_gc(&self) {
        let _ = self.tx.send(Msg::RunGc).await;
    }

    pub async fn store_app(&self, app: AppSpec) -> StoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::StoreApp {
                app: Box::new(app),
                reply,
            })
            .await
            .map_err(|_| StoreError::Write("gc actor stopped".to_string()))?;
        rx.await
            .map_err(|_| StoreError::Write("gc actor stopped".to_string()))?
    }

    pub async fn store_pod(&self, pod: PodSpec) -> StoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::StorePod {
                pod: Box::new(pod),
                reply,
            })
            .await
            .map_err(|_| StoreError::Write("gc actor stopped".to_string()))?;
        rx.await
            .map_err(|_| StoreError::Write("gc actor stopped".to_string()))?
    }

    pub async fn store_root(
        &self,
        root: RootGroup,
        updated_apps: Vec<AppSpec>,
        deleted_app_ids: Vec<PathId>,
        updated_pods: Vec<PodSpec>,
        deleted_pod_ids: Vec<PathId>,
    ) -> StoreResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::StoreRoot {
                request: Box::new(StoreRootRequest {
                    root,
                    updated_apps,
                    deleted_app_ids,
                    updated_pods,
                    deleted_pod_ids,
                }),
                reply,
            })
            .await
            .map_err(|_| StoreError::Write("gc actor stopped".to_string()))?;
        rx.await
            .map_err(|_| StoreError::Write("gc actor stopped".to_string()))?
    }

    pub async fn phase(&self) -> GcPhase {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Msg::Phase { reply }).await.is_err() {
            return GcPhase::ReadyForGc;
        }
        rx.await.unwrap_or(GcPhase::ReadyForGc)
    }
}

async fn run<S: GcStore>(
    store: Arc<S>,
    config: GcConfig,
    tx: mpsc::Sender<Msg>,
    mut rx: mpsc::Receiver<Msg>,
) {
    let mut state = match config.scan_interval {
        Some(_) => State::Resting,
        None => State::ReadyForGc,
    };
    let mut timer = config.scan_interval.map(|interval| {
        let mut t = tokio::time::interval(interval);
        t.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would trigger a scan at boot.
        t.reset();
        t
    });

    loop {
        let msg = match &mut timer {
            Some(timer) => tokio::select! {
                msg = rx.recv() => msg,
                _ = timer.tick() => {
                    if matches!(state, State::Resting) {
                        state = State::ReadyForGc;
                        Some(Msg::RunGc)
                    } else {
                        continue;
                    }
                }
            },
            None => rx.recv().await,
        };
        let Some(msg) = msg else { break };
        state = handle(&store, &config, &tx, state, msg);
    }
    debug!("gc actor stopped");
}

fn handle<S: GcStore>(
    store: &Arc<S>,
    config: &GcConfig,
    tx: &mpsc::Sender<Msg>,
    state: State,
    msg: Msg,
) -> State {
    match msg {
        Msg::RunGc => match state {
            State::Resting | State::ReadyForGc => start_scan(store, config, tx),
            State::Scanning { updated, .. } => State::Scanning {
                updated,
                gc_requested: true,
            },
            State::Compacting {
                deleting, blocked, ..
            } => State::Compacting {
                deleting,
                blocked,
                gc_requested: true,
            },
        },

        Msg::Phase { reply } => {
            let _ = reply.send(state.phase());
            state
        }

        Msg::StoreApp { app, reply } => match state {
            State::Scanning {
                mut updated,
                gc_requested,
            } => {
                updated.apps.insert(app.id.clone());
                let _ = reply.send(store.store_app(&app));
                State::Scanning {
                    updated,
                    gc_requested,
                }
            }
            State::Compacting {
                deleting,
                mut blocked,
                gc_requested,
            } => {
                if deleting.blocks_app(&app.id) {
                    blocked.push(BlockedStore::App { app, reply });
                } else {
                    let _ = reply.send(store.store_app(&app));
                }
                State::Compacting {
                    deleting,
                    blocked,
                    gc_requested,
                }
            }
            other => {
                let _ = reply.send(store.store_app(&app));
                other
            }
        },

        Msg::StorePod { pod, reply } => match state {
            State::Scanning {
                mut updated,
                gc_requested,
            } => {
                updated.pods.insert(pod.id.clone());
                let _ = reply.send(store.store_pod(&pod));
                State::Scanning {
                    updated,
                    gc_requested,
                }
            }
            State::Compacting {
                deleting,
                mut blocked,
                gc_requested,
            } => {
                if deleting.blocks_pod(&pod.id) {
                    blocked.push(BlockedStore::Pod { pod, reply });
                } else {
                    let _ = reply.send(store.store_pod(&pod));
                }
                State::Compacting {
                    deleting,
                    blocked,
                    gc_requested,
                }
            }
            other => {
                let _ = reply.send(store.store_pod(&pod));
                other
            }
        },

        Msg::StoreRoot { request, reply } => match state {
            State::Scanning {
                mut updated,
                gc_requested,
            } => {
                updated.root_versions.insert(request.root.version);
                for app in &request.updated_apps {
                    updated.apps.insert(app.id.clone());
                }
                for pod in &request.updated_pods {
                    updated.pods.insert(pod.id.clone());
                }
                let _ = reply.send(do_store_root(store, &request));
                State::Scanning {
                    updated,
                    gc_requested,
                }
            }
            State::Compacting {
                deleting,
                mut blocked,
                gc_requested,
            } => {
                let conflicts = deleting.roots.contains(&request.root.version)
                    || request
                        .updated_apps
                        .iter()
                        .any(|a| deleting.blocks_app(&a.id))
                    || request
                        .updated_pods
                        .iter()
                        .any(|p| deleting.blocks_pod(&p.id));
                if conflicts {
                    blocked.push(BlockedStore::Root { request, reply });
                } else {
                    let _ = reply.send(do_store_root(store, &request));
                }
                State::Compacting {
                    deleting,
                    blocked,
                    gc_requested,
                }
            }
            other => {
                let _ = reply.send(do_store_root(store, &request));
                other
            }
        },

        Msg::ScanDone(mut sets) => match state {
            State::Scanning {
                updated,
                gc_requested,
            } => {
                sets.subtract(&updated);
                if sets.is_empty() {
                    debug!("gc scan found nothing to compact");
                    if gc_requested {
                        start_scan(store, config, tx)
                    } else {
                        State::ReadyForGc
                    }
                } else {
                    info!(
                        apps = sets.apps.len(),
                        app_versions = sets.app_versions.len(),
                        pods = sets.pods.len(),
                        pod_versions = sets.pod_versions.len(),
                        roots = sets.roots.len(),
                        "gc compacting"
                    );
                    let store = store.clone();
                    let tx = tx.clone();
                    let deleting = sets.clone();
                    tokio::spawn(async move {
                        compact(store.as_ref(), &deleting);
                        let _ = tx.send(Msg::CompactDone).await;
                    });
                    State::Compacting {
                        deleting: sets,
                        blocked: Vec::new(),
                        gc_requested,
                    }
                }
            }
            // A stale ScanDone after a state change carries no authority.
            other => other,
        },

        Msg::CompactDone => match state {
            State::Compacting {
                blocked,
                gc_requested,
                ..
            } => {
                for parked in blocked {
                    match parked {
                        BlockedStore::App { app, reply } => {
                            let _ = reply.send(store.store_app(&app));
                        }
                        BlockedStore::Pod { pod, reply } => {
                            let _ = reply.send(store.store_pod(&pod));
                        }
                        BlockedStore::Root { request, reply } => {
                            let _ = reply.send(do_store_root(store, &request));
                        }
                    }
                }
                if gc_requested {
                    start_scan(store, config, tx)
                } else if config.scan_interval.is_some() {
                    State::Resting
                } else {
                    State::ReadyForGc
                }
            }
            other => other,
        },
    }
}

fn start_scan<S: GcStore>(
    store: &Arc<S>,
    config: &GcConfig,
    tx: &mpsc::Sender<Msg>,
) -> State {
    debug!("gc scan starting");
    let store = store.clone();
    let tx = tx.clone();
    let max_versions = config.max_versions;
    let max_root_versions = config.max_root_versions;
    tokio::spawn(async move {
        let sets = scan(store.as_ref(), max_versions, max_root_versions);
        if tx.send(Msg::ScanDone(sets)).await.is_err() {
            warn!("gc actor gone before scan completed");
        }
    });
    State::Scanning {
        updated: UpdatedEntities::default(),
        gc_requested: false,
    }
}

fn do_store_root<S: GcStore>(store: &Arc<S>, request: &StoreRootRequest) -> StoreResult<()> {
    store.store_root(
        &request.root,
        &request.updated_apps,
        &request.deleted_app_ids,
        &request.updated_pods,
        &request.deleted_pod_ids,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use trellis_core::RunSpec;
    use trellis_plan::DeploymentPlan;
    use trellis_store::StateStore;

    fn id(s: &str) -> PathId {
        s.parse().unwrap()
    }

    fn app(path: &str, version: u64) -> AppSpec {
        AppSpec::new(id(path), version)
    }

    fn on_demand() -> GcConfig {
        GcConfig {
            scan_interval: None,
            max_versions: 1,
            max_root_versions: 1,
        }
    }

    async fn wait_for_phase(handle: &GcHandle, phase: GcPhase) {
        for _ in 0..200 {
            if handle.phase().await == phase {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("gc never reached {phase:?}");
    }

    /// Seed a store with a referenced app and an orphaned one.
    fn seeded_store() -> (Arc<StateStore>, PathId, PathId) {
        let store = StateStore::open_in_memory().unwrap();
        let kept = id("/kept");
        let orphan = id("/orphan");

        let root = RootGroup::new("*", 100)
            .put_app(app("/kept", 100), 100)
            .unwrap();
        let stored = match root.run_spec(&kept).unwrap() {
            RunSpec::App(a) => a.clone(),
            _ => unreachable!(),
        };
        store
            .roots()
            .store_root(&root, &[stored], &[], &[], &[])
            .unwrap();

        let orphan_spec = app("/orphan", 50);
        store.apps().store(&orphan_spec).unwrap();
        store.apps().store_version(&orphan_spec).unwrap();
        (Arc::new(store), kept, orphan)
    }

    #[tokio::test]
    async fn collects_unreferenced_apps_and_returns_to_ready() {
        let (store, kept, orphan) = seeded_store();
        let handle = GcHandle::spawn(store.clone(), on_demand());
        assert_eq!(handle.phase().await, GcPhase::ReadyForGc);

        handle.run_gc().await;
        wait_for_phase(&handle, GcPhase::ReadyForGc).await;

        assert!(store.apps().get(&orphan).unwrap().is_none());
        assert!(store.apps().versions(&orphan).unwrap().is_empty());
        assert!(store.apps().get(&kept).unwrap().is_some());
    }

    #[tokio::test]
    async fn retains_versions_referenced_by_in_flight_plans() {
        let (store, _, orphan) = seeded_store();
        // An in-flight plan whose original still references the orphan.
        let original = RootGroup::new("*", 50)
            .put_app(app("/orphan", 50), 50)
            .unwrap();
        let target = RootGroup::new("*", 60);
        let plan = trellis_plan::plan(&original, &target, &Default::default(), 60);
        store.deployments().store(&plan).unwrap();

        let handle = GcHandle::spawn(store.clone(), on_demand());
        handle.run_gc().await;
        wait_for_phase(&handle, GcPhase::ReadyForGc).await;

        assert!(store.apps().get(&orphan).unwrap().is_some());
    }

    #[tokio::test]
    async fn prunes_old_root_versions() {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        for version in [100u64, 200, 300] {
            store
                .roots()
                .store_root(&RootGroup::new("*", version), &[], &[], &[], &[])
                .unwrap();
        }
        let config = GcConfig {
            scan_interval: None,
            max_versions: 1,
            max_root_versions: 2,
        };
        let handle = GcHandle::spawn(store.clone(), config);
        handle.run_gc().await;
        wait_for_phase(&handle, GcPhase::ReadyForGc).await;

        assert_eq!(store.roots().root_versions().unwrap(), vec![200, 300]);
    }

    // ── Error resilience (scan failure) ────────────────────────────

    #[derive(Default)]
    struct FailingAppsStore {
        pods_touched: AtomicBool,
        deletes: AtomicUsize,
    }

    impl GcStore for FailingAppsStore {
        fn app_ids(&self) -> StoreResult<Vec<PathId>> {
            Err(StoreError::Read("injected failure".to_string()))
        }
        fn app_versions(&self, _id: &PathId) -> StoreResult<Vec<u64>> {
            Ok(Vec::new())
        }
        fn store_app(&self, _app: &AppSpec) -> StoreResult<()> {
            Ok(())
        }
        fn delete_app(&self, _id: &PathId) -> StoreResult<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn delete_app_version(&self, _id: &PathId, _version: u64) -> StoreResult<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn pod_ids(&self) -> StoreResult<Vec<PathId>> {
            self.pods_touched.store(true, Ordering::SeqCst);
            Ok(Vec::new())
        }
        fn pod_versions(&self, _id: &PathId) -> StoreResult<Vec<u64>> {
            Ok(Vec::new())
        }
        fn store_pod(&self, _pod: &PodSpec) -> StoreResult<()> {
            Ok(())
        }
        fn delete_pod(&self, _id: &PathId) -> StoreResult<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn delete_pod_version(&self, _id: &PathId, _version: u64) -> StoreResult<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn current_root(&self) -> StoreResult<Option<RootGroup>> {
            Ok(None)
        }
        fn root_versions(&self) -> StoreResult<Vec<u64>> {
            Ok(Vec::new())
        }
        fn root_version(&self, _version: u64) -> StoreResult<Option<RootGroup>> {
            Ok(None)
        }
        fn delete_root_version(&self, _version: u64) -> StoreResult<bool> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
        fn store_root(
            &self,
            _root: &RootGroup,
            _updated_apps: &[AppSpec],
            _deleted_app_ids: &[PathId],
            _updated_pods: &[PodSpec],
            _deleted_pod_ids: &[PathId],
        ) -> StoreResult<()> {
            Ok(())
        }
        fn deployment_plans(&self) -> StoreResult<Vec<DeploymentPlan>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn scan_error_is_swallowed_and_nothing_else_is_touched() {
        let store = Arc::new(FailingAppsStore::default());
        let handle = GcHandle::spawn(store.clone(), on_demand());

        handle.run_gc().await;
        wait_for_phase(&handle, GcPhase::ReadyForGc).await;

        assert!(!store.pods_touched.load(Ordering::SeqCst));
        assert_eq!(store.deletes.load(Ordering::SeqCst), 0);
    }

    // ── Write interleaving ─────────────────────────────────────────

    /// Delegates to a real store but gates chosen calls so tests can hold
    /// a scan or a compaction open.
    struct GatedStore {
        inner: StateStore,
        scan_gate: Arc<tokio::sync::Notify>,
        gate_scan: AtomicBool,
        compact_gate: Arc<tokio::sync::Notify>,
        gate_compact: AtomicBool,
        waiting: Arc<tokio::sync::Notify>,
    }

    impl GatedStore {
        fn new(inner: StateStore) -> Self {
            Self {
                inner,
                scan_gate: Arc::new(tokio::sync::Notify::new()),
                gate_scan: AtomicBool::new(false),
                compact_gate: Arc::new(tokio::sync::Notify::new()),
                gate_compact: AtomicBool::new(false),
                waiting: Arc::new(tokio::sync::Notify::new()),
            }
        }

        fn block_on(&self, notify: &Arc<tokio::sync::Notify>) {
            // The scan/compact run on blocking-agnostic spawned tasks; a
            // std blocking wait would deadlock the runtime, so park on a
            // one-shot notification via a throwaway runtime handle.
            let notify = notify.clone();
            let waiting = self.waiting.clone();
            tokio::task::block_in_place(move || {
                let rt = tokio::runtime::Handle::current();
                rt.block_on(async move {
                    waiting.notify_one();
                    notify.notified().await;
                });
            });
        }
    }

    impl GcStore for GatedStore {
        fn app_ids(&self) -> StoreResult<Vec<PathId>> {
            if self.gate_scan.load(Ordering::SeqCst) {
                self.block_on(&self.scan_gate);
            }
            self.inner.apps().ids()
        }
        fn app_versions(&self, id: &PathId) -> StoreResult<Vec<u64>> {
            self.inner.apps().versions(id)
        }
        fn store_app(&self, app: &AppSpec) -> StoreResult<()> {
            self.inner.apps().store(app)?;
            self.inner.apps().store_version(app)
        }
        fn delete_app(&self, id: &PathId) -> StoreResult<bool> {
            if self.gate_compact.load(Ordering::SeqCst) {
                self.block_on(&self.compact_gate);
            }
            self.inner.apps().delete(id)
        }
        fn delete_app_version(&self, id: &PathId, version: u64) -> StoreResult<bool> {
            self.inner.apps().delete_version(id, version)
        }
        fn pod_ids(&self) -> StoreResult<Vec<PathId>> {
            self.inner.pods().ids()
        }
        fn pod_versions(&self, id: &PathId) -> StoreResult<Vec<u64>> {
            self.inner.pods().versions(id)
        }
        fn store_pod(&self, pod: &PodSpec) -> StoreResult<()> {
            self.inner.pods().store(pod)?;
            self.inner.pods().store_version(pod)
        }
        fn delete_pod(&self, id: &PathId) -> StoreResult<bool> {
            self.inner.pods().delete(id)
        }
        fn delete_pod_version(&self, id: &PathId, version: u64) -> StoreResult<bool> {
            self.inner.pods().delete_version(id, version)
        }
        fn current_root(&self) -> StoreResult<Option<RootGroup>> {
            self.inner.roots().root()
        }
        fn root_versions(&self) -> StoreResult<Vec<u64>> {
            self.inner.roots().root_versions()
        }
        fn root_version(&self, version: u64) -> StoreResult<Option<RootGroup>> {
            self.inner.roots().root_version(version)
        }
        fn delete_root_version(&self, version: u64) -> StoreResult<bool> {
            self.inner.roots().delete_root_version(version)
        }
        fn store_root(
            &self,
            root: &RootGroup,
            updated_apps: &[AppSpec],
            deleted_app_ids: &[PathId],
            updated_pods: &[PodSpec],
            deleted_pod_ids: &[PathId],
        ) -> StoreResult<()> {
            self.inner.roots().store_root(
                root,
                updated_apps,
                deleted_app_ids,
                updated_pods,
                deleted_pod_ids,
            )
        }
        fn deployment_plans(&self) -> StoreResult<Vec<DeploymentPlan>> {
            self.inner.deployments().all()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn store_during_scan_shields_the_entity() {
        let inner = StateStore::open_in_memory().unwrap();
        // /orphan is unreferenced, so the scan will propose deleting it.
        let orphan_spec = app("/orphan", 50);
        inner.apps().store(&orphan_spec).unwrap();
        inner.apps().store_version(&orphan_spec).unwrap();

        let store = Arc::new(GatedStore::new(inner));
        store.gate_scan.store(true, Ordering::SeqCst);
        let handle = GcHandle::spawn(store.clone(), on_demand());

        handle.run_gc().await;
        // Wait until the scan is parked on the gate.
        store.waiting.notified().await;

        // The user stores the orphan mid-scan; this must succeed now and
        // shield the entity from the pending deletion.
        handle.store_app(app("/orphan", 60)).await.unwrap();

        store.gate_scan.store(false, Ordering::SeqCst);
        store.scan_gate.notify_one();
        wait_for_phase(&handle, GcPhase::ReadyForGc).await;

        assert!(store.inner.apps().get(&id("/orphan")).unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn store_during_compaction_is_parked_until_compact_done() {
        let inner = StateStore::open_in_memory().unwrap();
        let orphan_spec = app("/orphan", 50);
        inner.apps().store(&orphan_spec).unwrap();
        inner.apps().store_version(&orphan_spec).unwrap();

        let store = Arc::new(GatedStore::new(inner));
        store.gate_compact.store(true, Ordering::SeqCst);
        let handle = GcHandle::spawn(store.clone(), on_demand());

        handle.run_gc().await;
        // Compaction is now parked on the gate with /orphan in the
        // deletion set.
        store.waiting.notified().await;
        assert_eq!(handle.phase().await, GcPhase::Compacting);

        let parked = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.store_app(app("/orphan", 70)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!parked.is_finished(), "conflicting store must park");

        store.gate_compact.store(false, Ordering::SeqCst);
        store.compact_gate.notify_one();
        parked.await.unwrap().unwrap();
        wait_for_phase(&handle, GcPhase::ReadyForGc).await;

        // The write survived the compaction.
        assert!(store.inner.apps().get(&id("/orphan")).unwrap().is_some());
    }

    #[tokio::test]
    async fn run_gc_during_scan_coalesces_into_a_follow_up_cycle() {
        let (store, _, orphan) = seeded_store();
        let handle = GcHandle::spawn(store.clone(), on_demand());

        handle.run_gc().await;
        handle.run_gc().await; // coalesces; no second concurrent scan
        wait_for_phase(&handle, GcPhase::ReadyForGc).await;

        assert!(store.apps().get(&orphan).unwrap().is_none());
    }
}
