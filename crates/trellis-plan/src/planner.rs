//! The layered deployment planner.
//!
//! Given an original and a target root group, produce the ordered step
//! sequence that drives the cluster from one to the other:
//!
//! 1. stops for run specs that disappeared,
//! 2. placeholder starts for run specs that appeared,
//! 3. one parallel step per dependency layer of the affected specs,
//!    leaves first.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use trellis_core::depgraph::DependencyGraph;
use trellis_core::{PathId, RootGroup};
use trellis_instance::InstanceId;

use crate::plan::{DeploymentAction, DeploymentPlan, DeploymentStep};

/// Compute a deployment plan. `to_kill` pins specific instances a scale
/// down should remove first.
pub fn plan(
    original: &RootGroup,
    target: &RootGroup,
    to_kill: &HashMap<PathId, Vec<InstanceId>>,
    version: u64,
) -> DeploymentPlan {
    let original_ids = original.transitive_ids();
    let target_ids = target.transitive_ids();
    let mut steps = Vec::new();

    // Step 0: stop everything that is gone from the target.
    let stops: Vec<DeploymentAction> = original_ids
        .difference(&target_ids)
        .filter_map(|id| original.run_spec(id))
        .map(|spec| DeploymentAction::Stop { spec: spec.clone() })
        .collect();
    steps.push(DeploymentStep { actions: stops });

    // Step 1: register new specs at zero instances.
    let starts: Vec<DeploymentAction> = target_ids
        .difference(&original_ids)
        .filter_map(|id| target.run_spec(id))
        .map(|spec| DeploymentAction::Start {
            spec: spec.clone().with_instances(0),
        })
        .collect();
    steps.push(DeploymentStep { actions: starts });

    // Layered steps over the affected specs, grouped by longest dependency
    // chain in the target graph. BTreeMap keeps layers ascending and the
    // id sort inside each layer makes plans reproducible.
    let layers = DependencyGraph::from_root(target).longest_path_lengths();
    let mut layered: BTreeMap<usize, Vec<DeploymentAction>> = BTreeMap::new();
    for id in &target_ids {
        let Some(spec) = target.run_spec(id) else {
            continue;
        };
        let action = match original.run_spec(id) {
            None => Some(DeploymentAction::Scale {
                spec: spec.clone(),
                to: spec.instances(),
                sentenced: Vec::new(),
            }),
            Some(old) if old == spec => None,
            Some(old) if old.needs_restart(spec) => {
                Some(DeploymentAction::Restart { spec: spec.clone() })
            }
            Some(old) if old.instances() != spec.instances() || spec.instances() == 0 => {
                Some(DeploymentAction::Scale {
                    spec: spec.clone(),
                    to: spec.instances(),
                    sentenced: to_kill.get(id).cloned().unwrap_or_default(),
                })
            }
            // Spec bytes changed (e.g. a bare version bump) but nothing
            // that warrants scaling or restarting.
            Some(_) => None,
        };
        if let Some(action) = action {
            let layer = layers.get(id).copied().unwrap_or(0);
            layered.entry(layer).or_default().push(action);
        }
    }
    for (_, actions) in layered {
        steps.push(DeploymentStep { actions });
    }

    // Empty steps never make it into the final plan.
    steps.retain(|s| !s.is_empty());
    let plan = DeploymentPlan::new(original.clone(), target.clone(), steps, version);
    debug!(
        plan = %plan.id,
        steps = plan.steps.len(),
        affected = plan.affected_run_spec_ids().len(),
        "deployment plan computed"
    );
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::AppSpec;

    fn id(s: &str) -> PathId {
        s.parse().unwrap()
    }

    fn app(path: &str, version: u64) -> AppSpec {
        AppSpec::new(id(path), version)
    }

    fn root_with(apps: &[AppSpec], version: u64) -> RootGroup {
        let mut root = RootGroup::new("*", version);
        for a in apps {
            root = root.put_app(a.clone(), version).unwrap();
        }
        root
    }

    fn empty() -> RootGroup {
        RootGroup::new("*", 0)
    }

    fn no_kills() -> HashMap<PathId, Vec<InstanceId>> {
        HashMap::new()
    }

    #[test]
    fn planning_a_root_against_itself_is_a_noop() {
        let root = root_with(&[app("/a", 1), app("/b", 1)], 1);
        let plan = plan(&root, &root, &no_kills(), 2);
        assert!(plan.is_empty());
    }

    #[test]
    fn single_new_app_yields_start_then_scale() {
        let target = root_with(&[{
            let mut a = app("/test/app", 1);
            a.cmd = Some("test cmd".to_string());
            a
        }], 1);
        let plan = plan(&empty(), &target, &no_kills(), 1);

        assert_eq!(plan.steps.len(), 2);
        match &plan.steps[0].actions[..] {
            [DeploymentAction::Start { spec }] => {
                assert_eq!(spec.id(), &id("/test/app"));
                assert_eq!(spec.instances(), 0);
            }
            other => panic!("unexpected step 0: {other:?}"),
        }
        match &plan.steps[1].actions[..] {
            [DeploymentAction::Scale { spec, to, .. }] => {
                assert_eq!(spec.id(), &id("/test/app"));
                assert_eq!(*to, 1);
            }
            other => panic!("unexpected step 1: {other:?}"),
        }
    }

    #[test]
    fn removed_apps_are_stopped_first() {
        let original = root_with(&[app("/old", 1), app("/keep", 1)], 1);
        let target = root_with(&[app("/keep", 1)], 2);
        let plan = plan(&original, &target, &no_kills(), 2);

        assert_eq!(plan.steps.len(), 1);
        match &plan.steps[0].actions[..] {
            [DeploymentAction::Stop { spec }] => assert_eq!(spec.id(), &id("/old")),
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[test]
    fn affected_ids_are_symmetric() {
        let a = root_with(&[app("/x", 1), app("/shared", 1)], 1);
        let b = root_with(&[app("/y", 2), app("/shared", 1)], 2);
        let forward = plan(&a, &b, &no_kills(), 3);
        let backward = plan(&b, &a, &no_kills(), 3);
        assert_eq!(
            forward.affected_run_spec_ids(),
            backward.affected_run_spec_ids()
        );
    }

    #[test]
    fn dependency_layers_run_leaves_first() {
        let mut db = app("/db", 1);
        db.instances = 1;
        let mut service = app("/service", 1);
        service.dependencies.insert(id("/db"));
        let mut frontend = app("/frontend", 1);
        frontend.dependencies.insert(id("/service"));

        let target = root_with(&[db, service, frontend], 1);
        let plan = plan(&empty(), &target, &no_kills(), 1);

        // One start step, then three layered scale steps.
        assert_eq!(plan.steps.len(), 4);
        assert_eq!(plan.steps[0].actions.len(), 3);
        let layer_ids: Vec<&PathId> = plan.steps[1..]
            .iter()
            .map(|s| {
                assert_eq!(s.actions.len(), 1);
                s.actions[0].run_spec_id()
            })
            .collect();
        assert_eq!(layer_ids, [&id("/db"), &id("/service"), &id("/frontend")]);
    }

    #[test]
    fn dependency_monotonicity_holds_within_the_plan() {
        let mut cache = app("/cache", 1);
        cache.dependencies.insert(id("/db"));
        let mut service = app("/service", 1);
        service.dependencies.insert(id("/db"));
        service.dependencies.insert(id("/cache"));
        let target = root_with(&[app("/db", 1), cache, service], 1);
        let plan = plan(&empty(), &target, &no_kills(), 1);

        let mut step_of: HashMap<PathId, usize> = HashMap::new();
        for (k, step) in plan.steps.iter().enumerate() {
            for action in &step.actions {
                step_of.insert(action.run_spec_id().clone(), k);
            }
        }
        let affected = plan.affected_run_spec_ids();
        for step in &plan.steps {
            for action in &step.actions {
                let k = step_of[action.run_spec_id()];
                for dep in action.spec().dependencies() {
                    if affected.contains(dep) {
                        assert!(
                            step_of[dep] <= k,
                            "{dep} must not run after {}",
                            action.run_spec_id()
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn scale_only_change_emits_scale_with_sentenced_instances() {
        let original = root_with(&[{
            let mut a = app("/a", 1);
            a.instances = 3;
            a
        }], 1);
        let target = root_with(&[{
            let mut a = app("/a", 1);
            a.instances = 1;
            a
        }], 2);

        let victim = InstanceId::fresh(id("/a"));
        let mut to_kill = HashMap::new();
        to_kill.insert(id("/a"), vec![victim.clone()]);

        let plan = plan(&original, &target, &to_kill, 2);
        assert_eq!(plan.steps.len(), 1);
        match &plan.steps[0].actions[..] {
            [DeploymentAction::Scale { to, sentenced, .. }] => {
                assert_eq!(*to, 1);
                assert_eq!(sentenced, &[victim]);
            }
            other => panic!("unexpected actions: {other:?}"),
        }
    }

    #[test]
    fn config_change_emits_restart() {
        let original = root_with(&[app("/a", 1)], 1);
        let target = root_with(&[{
            let mut a = app("/a", 1);
            a.cmd = Some("new".to_string());
            a
        }], 2);
        let plan = plan(&original, &target, &no_kills(), 2);
        assert_eq!(plan.steps.len(), 1);
        assert!(matches!(
            plan.steps[0].actions[..],
            [DeploymentAction::Restart { .. }]
        ));
    }
}
