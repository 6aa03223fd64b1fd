//! End-to-end control-plane flow: group update → plan → deploy → instance
//! tracking → stop → garbage collection, with a fake offer layer standing
//! in for Mesos.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use trellis_core::{now_ms, AppSpec, PathId, RootGroup, RunSpec};
use trellis_deploy::{
    AlwaysReady, DeploymentManagerHandle, LaunchQueue, NoopHealthChecks, ReconciliationClient,
    SchedulerHandle, StepDeps, TaskStatus,
};
use trellis_gc::{GcConfig, GcHandle, GcPhase};
use trellis_instance::{AgentInfo, Condition, InstanceTracker, TaskId};
use trellis_kill::{KillConfig, KillServiceHandle, TaskKiller};
use trellis_store::StateStore;

/// Fake offer layer: provisions every scheduled instance it sees and
/// confirms kills with a `Killed` status update.
struct FakeOfferLayer {
    tracker: InstanceTracker,
}

impl FakeOfferLayer {
    fn spawn(tracker: InstanceTracker) -> tokio::task::JoinHandle<()> {
        let layer = FakeOfferLayer { tracker };
        tokio::spawn(async move {
            loop {
                layer.drive().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    async fn drive(&self) {
        for instance in self.tracker.list().await {
            if instance.state.condition == Condition::Scheduled
                && self
                    .tracker
                    .provision(&instance.id, AgentInfo::on_host("agent-1"), now_ms())
                    .await
                    .is_ok()
            {
                let task_id = TaskId::for_instance(instance.id.clone());
                self.tracker
                    .update_task(&task_id, Condition::Running, None, now_ms())
                    .await;
            }
        }
    }
}

struct ConfirmingKiller {
    tracker: InstanceTracker,
}

impl TaskKiller for ConfirmingKiller {
    fn kill_task(&self, task_id: &TaskId) {
        let tracker = self.tracker.clone();
        let task_id = task_id.clone();
        tokio::spawn(async move {
            tracker
                .update_task(&task_id, Condition::Killed, None, now_ms())
                .await;
        });
    }
}

#[derive(Default)]
struct RecordingQueue {
    adds: Mutex<Vec<(PathId, u32)>>,
    purges: Mutex<Vec<PathId>>,
}

impl LaunchQueue for RecordingQueue {
    fn add(&self, spec: &RunSpec, count: u32) {
        self.adds.lock().unwrap().push((spec.id().clone(), count));
    }
    fn purge(&self, run_spec_id: &PathId) {
        self.purges.lock().unwrap().push(run_spec_id.clone());
    }
}

#[derive(Default)]
struct SilentClient;

impl ReconciliationClient for SilentClient {
    fn reconcile_tasks(&self, _statuses: Vec<TaskStatus>) {}
}

struct ControlPlane {
    store: StateStore,
    tracker: InstanceTracker,
    manager: DeploymentManagerHandle,
    scheduler: SchedulerHandle,
    gc: GcHandle,
    queue: Arc<RecordingQueue>,
    offer_layer: tokio::task::JoinHandle<()>,
}

impl ControlPlane {
    fn start() -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let tracker = InstanceTracker::new(Arc::new(store.instances()));
        let queue = Arc::new(RecordingQueue::default());
        let kill = KillServiceHandle::spawn(
            tracker.clone(),
            Arc::new(ConfirmingKiller {
                tracker: tracker.clone(),
            }),
            KillConfig::default(),
        );
        let steps = StepDeps {
            tracker: tracker.clone(),
            launch_queue: queue.clone(),
            kill,
            readiness: Arc::new(AlwaysReady),
        };
        let gc = GcHandle::spawn(
            Arc::new(store.clone()),
            GcConfig {
                scan_interval: None,
                max_versions: 1,
                max_root_versions: 1,
            },
        );
        let manager = DeploymentManagerHandle::spawn(steps, store.clone(), gc.clone());
        let scheduler = SchedulerHandle::spawn(
            tracker.clone(),
            store.clone(),
            manager.clone(),
            queue.clone(),
            Arc::new(SilentClient),
            Arc::new(NoopHealthChecks),
        );
        let offer_layer = FakeOfferLayer::spawn(tracker.clone());
        Self {
            store,
            tracker,
            manager,
            scheduler,
            gc,
            queue,
            offer_layer,
        }
    }

    /// Apply a root-group change the way the API path would: persist the
    /// target root through the GC facade, then deploy the plan.
    async fn apply(&self, original: &RootGroup, target: &RootGroup) {
        let (apps, pods) = spec_payload(target);
        self.gc
            .store_root(target.clone(), apps, Vec::new(), pods, Vec::new())
            .await
            .unwrap();
        let plan = trellis_plan::plan(original, target, &HashMap::new(), target.version);
        let started = self.manager.deploy(plan, false).await.unwrap();
        started.wait().await.unwrap();
    }
}

fn spec_payload(root: &RootGroup) -> (Vec<AppSpec>, Vec<trellis_core::PodSpec>) {
    let mut apps = Vec::new();
    let mut pods = Vec::new();
    for spec in root.transitive_run_specs() {
        match spec {
            RunSpec::App(app) => apps.push(app.clone()),
            RunSpec::Pod(pod) => pods.push(pod.clone()),
        }
    }
    (apps, pods)
}

fn app(path: &str, instances: u32, cmd: &str) -> AppSpec {
    let mut spec = AppSpec::new(path.parse().unwrap(), 0);
    spec.instances = instances;
    spec.cmd = Some(cmd.to_string());
    spec
}

#[tokio::test]
async fn deploy_scale_restart_stop_and_collect() {
    let plane = ControlPlane::start();
    let id: PathId = "/test/app".parse().unwrap();

    // Leadership with an empty store is uneventful but must succeed.
    plane.scheduler.elected_as_leader_and_ready().await.unwrap();

    // 1. Fresh app with two instances.
    let empty = RootGroup::new("*", 0);
    let v1 = empty.put_app(app("/test/app", 2, "run v1"), 1_000).unwrap();
    plane.apply(&empty, &v1).await;
    assert_eq!(plane.tracker.active_count(&id).await, 2);
    assert!(plane
        .queue
        .adds
        .lock()
        .unwrap()
        .iter()
        .any(|(spec, _)| spec == &id));

    // 2. Scale to four.
    let v2 = v1.put_app(app("/test/app", 4, "run v1"), 2_000).unwrap();
    plane.apply(&v1, &v2).await;
    assert_eq!(plane.tracker.active_count(&id).await, 4);

    // 3. Config change restarts onto the new version.
    let v3 = v2.put_app(app("/test/app", 4, "run v2"), 3_000).unwrap();
    plane.apply(&v2, &v3).await;
    let instances = plane.tracker.instances_for(&id).await;
    let running: Vec<_> = instances.iter().filter(|i| i.is_active()).collect();
    assert_eq!(running.len(), 4);
    let expected_version = v3.run_spec(&id).unwrap().version();
    assert!(running.iter().all(|i| i.run_spec.version() == expected_version));

    // 4. Delete the app: its instances are stopped and expunged, the
    //    launch queue is purged.
    let v4 = v3.delete_app(id.clone(), 4_000).unwrap();
    plane.apply(&v3, &v4).await;
    assert!(plane.tracker.instances_for(&id).await.is_empty());
    assert_eq!(plane.queue.purges.lock().unwrap()[..], [id.clone()]);

    // 5. GC now collects the unreferenced app and stale roots.
    plane.gc.run_gc().await;
    for _ in 0..200 {
        if plane.gc.phase().await == GcPhase::ReadyForGc
            && plane.store.apps().get(&id).unwrap().is_none()
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(plane.store.apps().get(&id).unwrap().is_none());
    assert_eq!(plane.store.roots().root_versions().unwrap(), vec![4_000]);

    plane.offer_layer.abort();
}

#[tokio::test]
async fn instances_survive_in_the_repository_while_running() {
    let plane = ControlPlane::start();
    let id: PathId = "/durable/app".parse().unwrap();

    let empty = RootGroup::new("*", 0);
    let v1 = empty.put_app(app("/durable/app", 1, "run"), 1_000).unwrap();
    plane.apply(&empty, &v1).await;

    // The tracker write-through keeps the instance repository current.
    let persisted = plane.store.instances().all().unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].run_spec.id(), &id);
    assert_eq!(persisted[0].state.condition, Condition::Running);

    plane.offer_layer.abort();
}
