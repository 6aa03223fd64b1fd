//! The instance tracker: single writer of instance state.
//!
//! Every mutation goes through one write path, so updates for a given
//! instance are totally ordered. Readers get cheap snapshots. Each applied
//! update is written through to persistence and published on a broadcast
//! channel for the kill service, the deployment executor, and anything
//! else that follows instance lifecycles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use trellis_core::{now_ms, PathId, RunSpec, UnreachableStrategy};

use crate::condition::{Condition, Goal, GoalChangeReason};
use crate::id::{InstanceId, TaskId};
use crate::instance::{AgentInfo, Instance, Reservation, ReservationState, Task};
use crate::reducer;

/// Result alias for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unknown instance {0}")]
    UnknownInstance(InstanceId),

    #[error("illegal transition for {id}: {reason}")]
    IllegalTransition { id: InstanceId, reason: String },
}

/// Write-through persistence for tracked instances. Implemented by the
/// instance repository; tests use [`NoopPersistence`].
pub trait InstancePersistence: Send + Sync {
    fn persist(&self, instance: &Instance) -> anyhow::Result<()>;
    fn expunge(&self, id: &InstanceId) -> anyhow::Result<()>;
}

/// Persistence sink that drops everything.
pub struct NoopPersistence;

impl InstancePersistence for NoopPersistence {
    fn persist(&self, _instance: &Instance) -> anyhow::Result<()> {
        Ok(())
    }

    fn expunge(&self, _id: &InstanceId) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Published after every applied instance update.
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// The instance changed; carries the post-update snapshot. Expunged
    /// instances publish their final state here before disappearing.
    Changed { instance: Instance },
    /// A status update arrived for an instance the tracker does not know,
    /// reporting it terminal.
    UnknownTerminated { id: InstanceId },
}

/// The authoritative in-memory instance map.
#[derive(Clone)]
pub struct InstanceTracker {
    instances: Arc<RwLock<HashMap<InstanceId, Instance>>>,
    events: broadcast::Sender<InstanceEvent>,
    persistence: Arc<dyn InstancePersistence>,
}

impl InstanceTracker {
    pub fn new(persistence: Arc<dyn InstancePersistence>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            instances: Arc::new(RwLock::new(HashMap::new())),
            events,
            persistence,
        }
    }

    /// A tracker without persistence, for tests.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(NoopPersistence))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub async fn get(&self, id: &InstanceId) -> Option<Instance> {
        self.instances.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Instance> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn instances_for(&self, run_spec_id: &PathId) -> Vec<Instance> {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| i.run_spec_id() == run_spec_id)
            .cloned()
            .collect()
    }

    /// Instances counting toward the spec's capacity: active condition
    /// and goal `Running`.
    pub async fn active_count(&self, run_spec_id: &PathId) -> usize {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| {
                i.run_spec_id() == run_spec_id
                    && i.state.goal == Goal::Running
                    && i.is_active()
            })
            .count()
    }

    // ── Mutations ──────────────────────────────────────────────────

    /// Create a fresh `Scheduled` instance for a replica of `spec`.
    pub async fn schedule(&self, spec: RunSpec) -> Instance {
        let instance = Instance::scheduled(spec, now_ms());
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.clone(), instance.clone());
        drop(instances);
        self.committed(&instance);
        debug!(instance = %instance.id, "instance scheduled");
        instance
    }

    /// Restore an instance loaded from persistence without re-persisting.
    pub async fn resume(&self, instance: Instance) {
        self.instances
            .write()
            .await
            .insert(instance.id.clone(), instance);
    }

    /// Bind an agent and create the task set: `Scheduled → Provisioned`.
    pub async fn provision(
        &self,
        id: &InstanceId,
        agent: AgentInfo,
        now: u64,
    ) -> TrackerResult<Instance> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownInstance(id.clone()))?;
        if instance.state.goal != Goal::Running || !instance.is_scheduled() {
            return Err(TrackerError::IllegalTransition {
                id: id.clone(),
                reason: format!(
                    "provision requires a scheduled instance with goal running, \
                     found {:?}/{:?}",
                    instance.state.condition, instance.state.goal
                ),
            });
        }
        instance.agent_info = Some(agent);
        instance.tasks = instance
            .run_spec
            .container_names()
            .into_iter()
            .map(|container| {
                let task_id = match container {
                    Some(name) => TaskId::for_container(id.clone(), name),
                    None => TaskId::for_instance(id.clone()),
                };
                (task_id.clone(), Task::provisioned(task_id))
            })
            .collect();
        instance.state.condition = Condition::Provisioned;
        instance.state.since = now;
        let snapshot = instance.clone();
        drop(instances);
        self.committed(&snapshot);
        debug!(instance = %id, "instance provisioned");
        Ok(snapshot)
    }

    /// Apply a task status update. Updates for unknown instances publish
    /// `UnknownTerminated` when the reported condition is terminal.
    pub async fn update_task(
        &self,
        task_id: &TaskId,
        condition: Condition,
        healthy: Option<bool>,
        now: u64,
    ) {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(&task_id.instance) else {
            drop(instances);
            if condition.is_terminal() {
                let _ = self.events.send(InstanceEvent::UnknownTerminated {
                    id: task_id.instance.clone(),
                });
            } else {
                warn!(task = %task_id, ?condition, "status update for unknown instance");
            }
            return;
        };
        let Some(task) = instance.tasks.get_mut(task_id) else {
            warn!(task = %task_id, "status update for unknown task");
            return;
        };

        let was = task.condition;
        task.condition = condition;
        task.healthy = healthy;
        if condition == Condition::Running && task.started_at.is_none() {
            task.started_at = Some(now);
        }
        if condition == Condition::Unreachable {
            if was != Condition::Unreachable {
                task.unreachable_since = Some(now);
            }
        } else {
            task.unreachable_since = None;
        }

        let strategy = instance.run_spec.unreachable().clone();
        instance.state = reducer::next_state(
            &instance.state,
            &instance.tasks,
            &strategy,
            instance.state.goal,
            now,
        );
        let snapshot = instance.clone();
        let expunge = snapshot.should_expunge();
        if expunge {
            instances.remove(&task_id.instance);
        }
        drop(instances);

        if expunge {
            self.expunged(&snapshot);
        } else {
            self.committed(&snapshot);
            self.arm_inactive_timer(&snapshot, now);
        }
    }

    /// Change the instance goal. Scheduled instances decommissioned before
    /// ever launching are expunged on the spot.
    pub async fn set_goal(
        &self,
        id: &InstanceId,
        goal: Goal,
        reason: GoalChangeReason,
        now: u64,
    ) -> TrackerResult<Instance> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownInstance(id.clone()))?;
        instance.state.goal = goal;
        instance.state.since = now;
        if goal == Goal::Decommissioned {
            instance.reservation = None;
        }
        let snapshot = instance.clone();
        let expunge = snapshot.should_expunge();
        if expunge {
            instances.remove(id);
        }
        drop(instances);

        debug!(instance = %id, ?goal, ?reason, "goal changed");
        if expunge {
            self.expunged(&snapshot);
        } else {
            self.committed(&snapshot);
        }
        Ok(snapshot)
    }

    /// Advance a reservation whose state deadline passed: waiting states
    /// decay to `Garbage`, and garbage past its deadline is released with
    /// the instance expunged if already decommissioned.
    pub async fn reservation_timeout(&self, id: &InstanceId, now: u64) -> TrackerResult<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownInstance(id.clone()))?;
        let Some(state) = instance.reservation.as_ref().map(|r| r.state.clone()) else {
            return Ok(());
        };
        let due = |deadline: Option<u64>| deadline.is_some_and(|d| now >= d);
        match state {
            ReservationState::New { deadline }
            | ReservationState::Suspended { deadline }
            | ReservationState::Unknown { deadline }
                if due(deadline) =>
            {
                if let Some(reservation) = instance.reservation.as_mut() {
                    reservation.state = ReservationState::Garbage {
                        deadline: Some(now),
                    };
                }
            }
            ReservationState::Garbage { deadline } if due(deadline) => {
                instance.reservation = None;
            }
            _ => return Ok(()),
        }
        let snapshot = instance.clone();
        drop(instances);
        self.committed(&snapshot);
        Ok(())
    }

    /// Attach a reservation to an instance (resident services).
    pub async fn reserve(&self, id: &InstanceId, reservation: Reservation) -> TrackerResult<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| TrackerError::UnknownInstance(id.clone()))?;
        instance.reservation = Some(reservation);
        let snapshot = instance.clone();
        drop(instances);
        self.committed(&snapshot);
        Ok(())
    }

    /// Re-evaluate an instance against the unreachable strategy. Invoked
    /// by the inactive timer; harmless if the instance recovered.
    pub async fn recheck_unreachable(&self, id: &InstanceId, now: u64) {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(id) else {
            return;
        };
        let strategy = instance.run_spec.unreachable().clone();
        let next = reducer::next_state(
            &instance.state,
            &instance.tasks,
            &strategy,
            instance.state.goal,
            now,
        );
        if next == instance.state {
            return;
        }
        instance.state = next;
        let snapshot = instance.clone();
        drop(instances);
        debug!(instance = %id, condition = ?snapshot.state.condition, "unreachable re-check");
        self.committed(&snapshot);
    }

    /// Remove an instance outright.
    pub async fn expunge(&self, id: &InstanceId) {
        let removed = self.instances.write().await.remove(id);
        if let Some(instance) = removed {
            self.expunged(&instance);
        }
    }

    // ── Internal ───────────────────────────────────────────────────

    fn committed(&self, instance: &Instance) {
        if let Err(e) = self.persistence.persist(instance) {
            warn!(instance = %instance.id, error = %e, "failed to persist instance");
        }
        let _ = self.events.send(InstanceEvent::Changed {
            instance: instance.clone(),
        });
    }

    fn expunged(&self, instance: &Instance) {
        if let Err(e) = self.persistence.expunge(&instance.id) {
            warn!(instance = %instance.id, error = %e, "failed to expunge instance");
        }
        debug!(instance = %instance.id, "instance expunged");
        let _ = self.events.send(InstanceEvent::Changed {
            instance: instance.clone(),
        });
    }

    /// When a task just went unreachable under an enabled strategy,
    /// schedule the promotion re-check for the moment the deadline hits.
    fn arm_inactive_timer(&self, instance: &Instance, now: u64) {
        let UnreachableStrategy::Enabled {
            inactive_after_secs,
            ..
        } = instance.run_spec.unreachable()
        else {
            return;
        };
        if instance.state.condition != Condition::Unreachable {
            return;
        }
        let Some(oldest) = instance
            .tasks
            .values()
            .filter_map(|t| t.unreachable_since)
            .min()
        else {
            return;
        };
        let deadline = oldest + inactive_after_secs.saturating_mul(1000);
        let delay = Duration::from_millis(deadline.saturating_sub(now));
        let tracker = self.clone();
        let id = instance.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracker.recheck_unreachable(&id, now_ms()).await;
        });
    }
}
