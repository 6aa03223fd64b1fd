//! The deployment manager: serializes deployment starts, owns the lock
//! table, and supervises one runner task per in-flight plan.
//!
//! Force-deploying preempts every conflicting plan: the holder's promise
//! fails with `DeploymentCancelled`, its root-group changes are reverted
//! on top of the currently persisted root, and only then does the new
//! plan acquire the locks.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use trellis_core::{now_ms, PathId, RunSpec};
use trellis_gc::GcHandle;
use trellis_plan::DeploymentPlan;
use trellis_store::{DeploymentRepository, RootRepository, StateStore};

use crate::error::{DeployError, DeployResult};
use crate::locks::LockTable;
use crate::steps::{run_plan, StepDeps};

/// A successfully started deployment: `done` settles when the plan
/// completes, fails, or is cancelled.
pub struct DeploymentStarted {
    pub id: String,
    pub done: oneshot::Receiver<DeployResult<()>>,
}

impl DeploymentStarted {
    /// Wait for the plan to finish.
    pub async fn wait(self) -> DeployResult<()> {
        self.done
            .await
            .unwrap_or_else(|_| Err(DeployError::DeploymentCancelled))
    }
}

enum Msg {
    Deploy {
        plan: Box<DeploymentPlan>,
        force: bool,
        reply: oneshot::Sender<DeployResult<DeploymentStarted>>,
    },
    Resume {
        plan: Box<DeploymentPlan>,
    },
    Cancel {
        id: String,
        reply: oneshot::Sender<bool>,
    },
    Finished {
        id: String,
        result: DeployResult<()>,
    },
    Running {
        reply: oneshot::Sender<Vec<String>>,
    },
}

/// Handle to the deployment manager actor.
#[derive(Clone)]
pub struct DeploymentManagerHandle {
    tx: mpsc::Sender<Msg>,
}

impl DeploymentManagerHandle {
    pub fn spawn(steps: StepDeps, store: StateStore, gc: GcHandle) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let actor = ManagerActor {
            steps,
            deployments: store.deployments(),
            roots: store.roots(),
            gc,
            locks: LockTable::default(),
            active: HashMap::new(),
            tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Start a deployment. Fails with `AppLocked` when affected run specs
    /// are held by other plans, unless `force` preempts them.
    pub async fn deploy(
        &self,
        plan: DeploymentPlan,
        force: bool,
    ) -> DeployResult<DeploymentStarted> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::Deploy {
                plan: Box::new(plan),
                force,
                reply,
            })
            .await
            .map_err(|_| DeployError::DeploymentFailed("deployment manager stopped".into()))?;
        rx.await
            .map_err(|_| DeployError::DeploymentFailed("deployment manager stopped".into()))?
    }

    /// Resume a plan loaded from the deployment repository after an
    /// election. No promise is handed out; completion shows up in logs
    /// and in the repository.
    pub async fn resume(&self, plan: DeploymentPlan) {
        let _ = self
            .tx
            .send(Msg::Resume {
                plan: Box::new(plan),
            })
            .await;
    }

    /// Cancel an in-flight plan: revokes its locks, reverts the root, and
    /// fails its promise with `DeploymentCancelled`. Returns whether the
    /// plan was running.
    pub async fn cancel(&self, deployment_id: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(Msg::Cancel {
                id: deployment_id.to_string(),
                reply,
            })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Ids of plans currently in flight.
    pub async fn running(&self) -> Vec<String> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Msg::Running { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct ActiveDeployment {
    plan: DeploymentPlan,
    cancel: watch::Sender<bool>,
    promise: Option<oneshot::Sender<DeployResult<()>>>,
}

struct ManagerActor {
    steps: StepDeps,
    deployments: DeploymentRepository,
    roots: RootRepository,
    gc: GcHandle,
    locks: LockTable,
    active: HashMap<String, ActiveDeployment>,
    tx: mpsc::Sender<Msg>,
}

impl ManagerActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Deploy { plan, force, reply } => {
                    let outcome = self.handle_deploy(*plan, force).await;
                    let _ = reply.send(outcome);
                }
                Msg::Resume { plan } => self.handle_resume(*plan),
                Msg::Cancel { id, reply } => {
                    let was_active = self.cancel_deployment(&id).await;
                    let _ = reply.send(was_active);
                }
                Msg::Finished { id, result } => self.handle_finished(&id, result),
                Msg::Running { reply } => {
                    let mut ids: Vec<String> = self.active.keys().cloned().collect();
                    ids.sort();
                    let _ = reply.send(ids);
                }
            }
        }
        debug!("deployment manager stopped");
    }

    async fn handle_deploy(
        &mut self,
        plan: DeploymentPlan,
        force: bool,
    ) -> DeployResult<DeploymentStarted> {
        let affected = plan.affected_run_spec_ids();
        let conflicts = self.locks.conflicts(&affected);
        if !conflicts.is_empty() {
            if !force {
                debug!(plan = %plan.id, holders = ?conflicts, "deployment conflicts with running plans");
                return Err(DeployError::AppLocked(conflicts));
            }
            for holder in conflicts {
                info!(plan = %plan.id, preempting = %holder, "forced deployment preempts holder");
                self.cancel_deployment(&holder).await;
            }
        }
        if let Err(holders) = self.locks.acquire(&affected, &plan.id) {
            // Should not happen after preemption; surface it as a lock
            // failure rather than corrupting the table.
            return Err(DeployError::AppLocked(holders));
        }
        if let Err(e) = self.deployments.store(&plan) {
            self.locks.release(&plan.id);
            return Err(e.into());
        }
        Ok(self.start_runner(plan))
    }

    fn handle_resume(&mut self, plan: DeploymentPlan) {
        let affected = plan.affected_run_spec_ids();
        if let Err(holders) = self.locks.acquire(&affected, &plan.id) {
            error!(plan = %plan.id, ?holders, "cannot resume plan, locks are taken");
            return;
        }
        info!(plan = %plan.id, steps = plan.steps.len(), "resuming stored deployment");
        // Nobody holds the promise for a resumed plan; completion shows up
        // in the repository and the logs.
        self.start_runner(plan);
    }

    fn start_runner(&mut self, plan: DeploymentPlan) -> DeploymentStarted {
        let id = plan.id.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        self.active.insert(
            id.clone(),
            ActiveDeployment {
                plan: plan.clone(),
                cancel: cancel_tx,
                promise: Some(done_tx),
            },
        );

        let steps = self.steps.clone();
        let tx = self.tx.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            let result = run_plan(&plan, &steps, cancel_rx).await;
            let _ = tx
                .send(Msg::Finished {
                    id: task_id,
                    result,
                })
                .await;
        });
        info!(plan = %id, "deployment started");
        DeploymentStarted { id, done: done_rx }
    }

    /// Tear down an in-flight plan and revert its target-root changes on
    /// top of whatever root is persisted now.
    async fn cancel_deployment(&mut self, id: &str) -> bool {
        let Some(mut active) = self.active.remove(id) else {
            return false;
        };
        let _ = active.cancel.send(true);
        if let Some(promise) = active.promise.take() {
            let _ = promise.send(Err(DeployError::DeploymentCancelled));
        }
        self.locks.release(id);
        if let Err(e) = self.deployments.delete(id) {
            warn!(plan = %id, error = %e, "failed to delete cancelled plan");
        }

        match self.roots.root() {
            Ok(Some(current)) => {
                let mut reverted = active.plan.revert(&current);
                reverted.version = now_ms();
                let (apps, deleted_apps, pods, deleted_pods) =
                    revert_payload(&active.plan, &reverted);
                if let Err(e) = self
                    .gc
                    .store_root(reverted, apps, deleted_apps, pods, deleted_pods)
                    .await
                {
                    warn!(plan = %id, error = %e, "failed to persist reverted root");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(plan = %id, error = %e, "failed to load root for revert"),
        }
        info!(plan = %id, "deployment cancelled");
        true
    }

    fn handle_finished(&mut self, id: &str, result: DeployResult<()>) {
        // A cancelled plan was already torn down; its runner's last word
        // is dropped on the floor.
        let Some(mut active) = self.active.remove(id) else {
            return;
        };
        self.locks.release(id);
        if let Err(e) = self.deployments.delete(id) {
            warn!(plan = %id, error = %e, "failed to delete finished plan");
        }
        match &result {
            Ok(()) => info!(plan = %id, "deployment finished"),
            Err(e) => warn!(plan = %id, error = %e, "deployment failed"),
        }
        if let Some(promise) = active.promise.take() {
            let _ = promise.send(result);
        }
    }
}

/// Split the reverted state of a plan's affected ids into the update
/// payload `store_root` expects.
fn revert_payload(
    plan: &DeploymentPlan,
    reverted: &trellis_core::RootGroup,
) -> (
    Vec<trellis_core::AppSpec>,
    Vec<PathId>,
    Vec<trellis_core::PodSpec>,
    Vec<PathId>,
) {
    let mut apps = Vec::new();
    let mut deleted_apps = Vec::new();
    let mut pods = Vec::new();
    let mut deleted_pods = Vec::new();
    for id in plan.affected_run_spec_ids() {
        match reverted.run_spec(&id) {
            Some(RunSpec::App(app)) => apps.push(app.clone()),
            Some(RunSpec::Pod(pod)) => pods.push(pod.clone()),
            None => {
                let was_pod = plan
                    .target
                    .run_spec(&id)
                    .or_else(|| plan.original.run_spec(&id))
                    .map(RunSpec::is_pod)
                    .unwrap_or(false);
                if was_pod {
                    deleted_pods.push(id);
                } else {
                    deleted_apps.push(id);
                }
            }
        }
    }
    (apps, deleted_apps, pods, deleted_pods)
}
