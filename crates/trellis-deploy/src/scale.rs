//! The scale loop: tops up under-provisioned run specs.

use std::sync::Arc;

use tracing::info;

use trellis_core::RootGroup;
use trellis_instance::{Goal, InstanceTracker};

use crate::collab::LaunchQueue;

/// Walk the root group and enqueue launches for every run spec whose
/// tracked instance count (scheduled or live, goal `Running`) is below its
/// declared target.
pub async fn scale_run_specs(
    root: &RootGroup,
    tracker: &InstanceTracker,
    launch_queue: &Arc<dyn LaunchQueue>,
) {
    for spec in root.transitive_run_specs() {
        let tracked = tracker
            .instances_for(spec.id())
            .await
            .into_iter()
            .filter(|i| {
                i.state.goal == Goal::Running && !i.state.condition.is_considered_terminal()
            })
            .count() as u32;
        if tracked < spec.instances() {
            let delta = spec.instances() - tracked;
            info!(run_spec = %spec.id(), tracked, target = spec.instances(), delta, "scaling up");
            for _ in 0..delta {
                tracker.schedule((*spec).clone()).await;
            }
            launch_queue.add(spec, delta);
        }
    }
}
