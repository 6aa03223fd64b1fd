//! Task reconciliation with the offer layer.
//!
//! Orphaned instances (no run spec in the current root) are decommissioned
//! locally; everything else is reported to the offer layer as a status
//! list, followed by the empty list as the finished sentinel. Coalescing
//! of concurrent requests lives in the scheduler actor.

use std::sync::Arc;

use tracing::{debug, info};

use trellis_core::{now_ms, RootGroup};
use trellis_instance::{Condition, Goal, GoalChangeReason, InstanceTracker};

use crate::collab::{ReconciliationClient, TaskStatus};

/// One reconciliation pass.
pub async fn reconcile_tasks(
    tracker: &InstanceTracker,
    root: &RootGroup,
    client: &Arc<dyn ReconciliationClient>,
) {
    let known = root.transitive_ids();

    // Instances whose run spec vanished are orphans: decommission them so
    // the kill service and the tracker clean up.
    let mut orphaned = 0;
    for instance in tracker.list().await {
        if !known.contains(instance.run_spec_id()) {
            let _ = tracker
                .set_goal(
                    &instance.id,
                    Goal::Decommissioned,
                    GoalChangeReason::Orphaned,
                    now_ms(),
                )
                .await;
            orphaned += 1;
        }
    }
    if orphaned > 0 {
        info!(orphaned, "reconciliation decommissioned orphaned instances");
    }

    // Report every task that has launched and not yet terminated.
    // Terminal tasks have nothing to reconcile; provisioned tasks were
    // never acknowledged by the offer layer.
    let statuses: Vec<TaskStatus> = tracker
        .list()
        .await
        .iter()
        .flat_map(|instance| instance.tasks.values())
        .filter(|task| {
            !task.condition.is_terminal() && task.condition != Condition::Provisioned
        })
        .map(|task| TaskStatus {
            task_id: task.id.clone(),
            condition: task.condition,
        })
        .collect();

    debug!(tasks = statuses.len(), "submitting reconciliation list");
    client.reconcile_tasks(statuses);
    // The empty list tells the offer layer the pass is complete.
    client.reconcile_tasks(Vec::new());
}
