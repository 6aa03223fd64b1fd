//! Deployment plans, steps, and actions.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use trellis_core::{PathId, RootGroup, RunSpec};
use trellis_instance::InstanceId;

/// One unit of deployment work on a single run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentAction {
    /// Backward-compat placeholder: registers a new run spec at zero
    /// instances and always succeeds immediately.
    Start { spec: RunSpec },
    /// Kill every instance and drop the run spec from the launch queue.
    Stop { spec: RunSpec },
    /// Drive the live-instance count to `to`, killing `sentenced` first.
    Scale {
        spec: RunSpec,
        to: u32,
        sentenced: Vec<InstanceId>,
    },
    /// Replace all instances with the new spec version under the spec's
    /// upgrade strategy.
    Restart { spec: RunSpec },
}

impl DeploymentAction {
    pub fn spec(&self) -> &RunSpec {
        match self {
            Self::Start { spec }
            | Self::Stop { spec }
            | Self::Scale { spec, .. }
            | Self::Restart { spec } => spec,
        }
    }

    pub fn run_spec_id(&self) -> &PathId {
        self.spec().id()
    }

    /// Wire name used in the plan's JSON representation.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "StartApplication",
            Self::Stop { .. } => "StopApplication",
            Self::Scale { .. } => "ScaleApplication",
            Self::Restart { .. } => "RestartApplication",
        }
    }
}

/// An unordered set of actions safe to run in parallel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub actions: Vec<DeploymentAction>,
}

impl DeploymentStep {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// An ordered sequence of steps transforming `original` into `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: String,
    pub original: RootGroup,
    pub target: RootGroup,
    pub steps: Vec<DeploymentStep>,
    pub version: u64,
}

impl DeploymentPlan {
    pub fn new(
        original: RootGroup,
        target: RootGroup,
        steps: Vec<DeploymentStep>,
        version: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            original,
            target,
            steps,
            version,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run specs this plan may touch: present in exactly one of the two
    /// roots, or present in both with changed spec bytes. Deployment locks
    /// are taken over this set.
    pub fn affected_run_spec_ids(&self) -> BTreeSet<PathId> {
        let original_ids = self.original.transitive_ids();
        let target_ids = self.target.transitive_ids();
        let mut affected: BTreeSet<PathId> = original_ids
            .symmetric_difference(&target_ids)
            .cloned()
            .collect();
        for id in original_ids.intersection(&target_ids) {
            if self.original.run_spec(id) != self.target.run_spec(id) {
                affected.insert(id.clone());
            }
        }
        affected
    }

    /// The root-group change that undoes `target − original` on top of an
    /// arbitrary `current` root: run specs this plan introduced are
    /// removed, run specs it changed or removed are restored to their
    /// original version, and anything added after the plan started is left
    /// alone. Used when a deployment is cancelled mid-flight.
    pub fn revert(&self, current: &RootGroup) -> RootGroup {
        let mut reverted = current.clone();
        // Only the affected set is locked by this plan; everything else in
        // `current` may have moved on and must not be clobbered.
        for id in self.affected_run_spec_ids() {
            match self.original.run_spec(&id) {
                Some(spec) => {
                    reverted = reverted
                        .without_run_spec(&id)
                        .with_run_spec(spec.clone())
                        .unwrap_or(reverted);
                }
                None => reverted = reverted.without_run_spec(&id),
            }
        }
        reverted
    }

    /// The external JSON representation: per step, an `actions` array of
    /// `{action, app|pod}` entries. Step boundaries are preserved.
    pub fn to_json(&self) -> serde_json::Value {
        let steps: Vec<serde_json::Value> = self
            .steps
            .iter()
            .map(|step| {
                let actions: Vec<serde_json::Value> = step
                    .actions
                    .iter()
                    .map(|action| {
                        let key = if action.spec().is_pod() { "pod" } else { "app" };
                        json!({
                            "action": action.kind(),
                            key: action.run_spec_id().to_string(),
                        })
                    })
                    .collect();
                json!({ "actions": actions })
            })
            .collect();
        json!({
            "id": self.id,
            "version": self.version,
            "steps": steps,
        })
    }
}
