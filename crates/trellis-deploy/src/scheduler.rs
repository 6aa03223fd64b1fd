//! The scheduler core: leadership gate, reconciliation coalescing, and
//! the scale loop.
//!
//! Idle until elected. On `ElectedAsLeaderAndReady` it reconciles health
//! checks against the persisted root, resumes stored deployment plans,
//! and is then ready to serve reconciliation and scale requests. At most
//! one reconciliation runs at a time; requests arriving during one settle
//! when the in-flight pass completes.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use trellis_core::RootGroup;
use trellis_instance::{Goal, InstanceEvent, InstanceTracker};
use trellis_store::{DeploymentRepository, RootRepository, StateStore};

use crate::collab::{HealthCheckReconciler, LaunchQueue, ReconciliationClient};
use crate::error::{DeployError, DeployResult};
use crate::manager::DeploymentManagerHandle;
use crate::reconcile::reconcile_tasks;
use crate::scale::scale_run_specs;

enum Msg {
    Elected {
        reply: oneshot::Sender<DeployResult<()>>,
    },
    ReconcileTasks {
        reply: oneshot::Sender<()>,
    },
    ReconcileFinished,
    ScaleRunSpecs,
}

/// Handle to the scheduler core actor.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Msg>,
}

impl SchedulerHandle {
    pub fn spawn(
        tracker: InstanceTracker,
        store: StateStore,
        manager: DeploymentManagerHandle,
        launch_queue: Arc<dyn LaunchQueue>,
        reconciliation: Arc<dyn ReconciliationClient>,
        health: Arc<dyn HealthCheckReconciler>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let actor = SchedulerActor {
            tracker,
            roots: store.roots(),
            deployments: store.deployments(),
            manager,
            launch_queue,
            reconciliation,
            health,
            reconcile_in_flight: false,
            reconcile_waiters: Vec::new(),
            tx: tx.clone(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    /// Leadership gained and the persistence layer is warm. A repository
    /// failure here is unrecoverable; the caller should exit the process.
    pub async fn elected_as_leader_and_ready(&self) -> DeployResult<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::Elected { reply })
            .await
            .map_err(|_| DeployError::DeploymentFailed("scheduler stopped".into()))?;
        rx.await
            .map_err(|_| DeployError::DeploymentFailed("scheduler stopped".into()))?
    }

    /// Run (or join) a reconciliation pass; resolves when a pass that
    /// covers this request finishes.
    pub async fn reconcile_tasks(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Msg::ReconcileTasks { reply }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Top up every run spec below its target instance count.
    pub async fn scale_run_specs(&self) {
        let _ = self.tx.send(Msg::ScaleRunSpecs).await;
    }
}

struct SchedulerActor {
    tracker: InstanceTracker,
    roots: RootRepository,
    deployments: DeploymentRepository,
    manager: DeploymentManagerHandle,
    launch_queue: Arc<dyn LaunchQueue>,
    reconciliation: Arc<dyn ReconciliationClient>,
    health: Arc<dyn HealthCheckReconciler>,
    reconcile_in_flight: bool,
    reconcile_waiters: Vec<oneshot::Sender<()>>,
    tx: mpsc::Sender<Msg>,
}

impl SchedulerActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                Msg::Elected { reply } => {
                    let _ = reply.send(self.handle_elected().await);
                }
                Msg::ReconcileTasks { reply } => self.handle_reconcile(reply),
                Msg::ReconcileFinished => {
                    self.reconcile_in_flight = false;
                    for waiter in self.reconcile_waiters.drain(..) {
                        let _ = waiter.send(());
                    }
                }
                Msg::ScaleRunSpecs => self.handle_scale().await,
            }
        }
        debug!("scheduler stopped");
    }

    async fn handle_elected(&mut self) -> DeployResult<()> {
        let root = self.current_root()?;
        self.health.reconcile(&root);

        let plans = self.deployments.all()?;
        let count = plans.len();
        for plan in plans {
            self.manager.resume(plan).await;
        }

        // Follow the instance stream: a terminal instance that still wants
        // to run means capacity went missing, so the scale loop runs again.
        let mut events = self.tracker.subscribe();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(InstanceEvent::Changed { instance })
                        if instance.state.condition.is_considered_terminal()
                            && instance.state.goal == Goal::Running =>
                    {
                        if tx.send(Msg::ScaleRunSpecs).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        });

        info!(resumed = count, "leadership gained, scheduler ready");
        Ok(())
    }

    fn handle_reconcile(&mut self, reply: oneshot::Sender<()>) {
        self.reconcile_waiters.push(reply);
        if self.reconcile_in_flight {
            // Coalesce: the in-flight pass covers this request too.
            return;
        }
        self.reconcile_in_flight = true;
        let root = match self.current_root() {
            Ok(root) => root,
            Err(e) => {
                warn!(error = %e, "cannot load root for reconciliation");
                let _ = self.tx.try_send(Msg::ReconcileFinished);
                return;
            }
        };
        let tracker = self.tracker.clone();
        let client = self.reconciliation.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            reconcile_tasks(&tracker, &root, &client).await;
            let _ = tx.send(Msg::ReconcileFinished).await;
        });
    }

    async fn handle_scale(&mut self) {
        match self.current_root() {
            Ok(root) => scale_run_specs(&root, &self.tracker, &self.launch_queue).await,
            Err(e) => warn!(error = %e, "cannot load root for scale loop"),
        }
    }

    fn current_root(&self) -> DeployResult<RootGroup> {
        Ok(self
            .roots
            .root()?
            .unwrap_or_else(|| RootGroup::new("*", 0)))
    }
}
