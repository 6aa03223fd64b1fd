//! The runtime counterpart of a run spec: instances, tasks, agents, and
//! reservations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use trellis_core::{PathId, RunSpec};

use crate::condition::{Condition, Goal};
use crate::id::{InstanceId, TaskId};

/// One task the offer layer launched and tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub condition: Condition,
    /// Millis when the task first reported `Running`.
    pub started_at: Option<u64>,
    /// Millis when the task entered `Unreachable`; cleared on recovery.
    pub unreachable_since: Option<u64>,
    /// Last health-check verdict, if the task reports health at all.
    pub healthy: Option<bool>,
}

impl Task {
    pub fn provisioned(id: TaskId) -> Self {
        Self {
            id,
            condition: Condition::Provisioned,
            started_at: None,
            unreachable_since: None,
            healthy: None,
        }
    }
}

/// Where an instance landed, bound when the offer layer commits a launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub host: String,
    pub agent_id: Option<String>,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub attributes: Vec<(String, String)>,
}

impl AgentInfo {
    pub fn on_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            agent_id: None,
            region: None,
            zone: None,
            attributes: Vec::new(),
        }
    }
}

/// Lifecycle of a persistent-volume reservation. Non-`Launched` states
/// carry a deadline (millis) after which the reservation advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReservationState {
    New { deadline: Option<u64> },
    Launched,
    Suspended { deadline: Option<u64> },
    Garbage { deadline: Option<u64> },
    Unknown { deadline: Option<u64> },
}

/// A persistent resource claim bound to an instance id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub volume_ids: Vec<String>,
    pub state: ReservationState,
    /// Equals `InstanceId::simplified` or a legacy task-derived form; kept
    /// stable across updates.
    pub id: String,
}

/// Aggregated per-instance state computed by the condition reducer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub condition: Condition,
    /// Millis when `(condition, healthy)` last changed.
    pub since: u64,
    /// Earliest task start, if any task started.
    pub active_since: Option<u64>,
    pub healthy: Option<bool>,
    pub goal: Goal,
}

/// One replica of a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub agent_info: Option<AgentInfo>,
    pub state: InstanceState,
    pub tasks: BTreeMap<TaskId, Task>,
    /// The spec snapshot the instance was launched with, version pinned.
    pub run_spec: RunSpec,
    pub reservation: Option<Reservation>,
    /// The role resources were reserved against. May differ from the
    /// spec's role for resident instances during a role migration.
    pub role: String,
}

impl Instance {
    /// A freshly scheduled instance: no agent, no tasks, waiting for the
    /// offer layer.
    pub fn scheduled(run_spec: RunSpec, now_ms: u64) -> Self {
        let id = InstanceId::fresh(run_spec.id().clone());
        let role = run_spec.role().unwrap_or("*").to_string();
        Self {
            id,
            agent_info: None,
            state: InstanceState {
                condition: Condition::Scheduled,
                since: now_ms,
                active_since: None,
                healthy: None,
                goal: Goal::Running,
            },
            tasks: BTreeMap::new(),
            run_spec,
            reservation: None,
            role,
        }
    }

    pub fn run_spec_id(&self) -> &PathId {
        self.run_spec.id()
    }

    /// Waiting for a launch: goal is `Running` and the instance is either
    /// freshly scheduled or its last incarnation ended terminally.
    pub fn is_scheduled(&self) -> bool {
        self.state.goal == Goal::Running
            && (self.state.condition == Condition::Scheduled
                || self.state.condition.is_considered_terminal())
    }

    pub fn is_active(&self) -> bool {
        self.state.condition.is_active()
    }

    /// Running, with no health check reporting trouble.
    pub fn is_running_healthy(&self) -> bool {
        self.state.condition == Condition::Running && self.state.healthy != Some(false)
    }

    /// Decommissioned instances leave the tracker once every task is done.
    pub fn should_expunge(&self) -> bool {
        self.state.goal == Goal::Decommissioned
            && (self.tasks.is_empty() || self.state.condition.is_considered_terminal())
    }

    /// Tasks the kill service would have to drive to a terminal state.
    pub fn non_terminal_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values().filter(|t| !t.condition.is_terminal())
    }
}
