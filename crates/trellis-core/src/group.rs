//! Group tree and root-group update operations.
//!
//! Groups namespace run specs and carry the enforce-role flag. The root
//! group is the unit of atomic update: every change clones the tree,
//! applies a batch of operations, validates the result, and either returns
//! the new root or fails without side effects.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::depgraph::DependencyGraph;
use crate::error::{ValidationError, ValidationResult};
use crate::paths::PathId;
use crate::runspec::{AppSpec, PodSpec, RunSpec};

/// A node in the group tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: PathId,
    pub enforce_role: bool,
    pub groups: BTreeMap<PathId, Group>,
    pub run_specs: BTreeMap<PathId, RunSpec>,
    pub version: u64,
}

impl Group {
    fn empty(id: PathId, version: u64) -> Self {
        Self {
            id,
            enforce_role: false,
            groups: BTreeMap::new(),
            run_specs: BTreeMap::new(),
            version,
        }
    }

    fn find(&self, id: &PathId) -> Option<&Group> {
        if self.id == *id {
            return Some(self);
        }
        let child = id.prefix(self.id.segments().len() + 1);
        self.groups.get(&child).and_then(|g| g.find(id))
    }

    fn find_mut(&mut self, id: &PathId) -> Option<&mut Group> {
        if self.id == *id {
            return Some(self);
        }
        let child = id.prefix(self.id.segments().len() + 1);
        self.groups.get_mut(&child).and_then(|g| g.find_mut(id))
    }

    /// Walk down to `id`, creating intermediate groups. Fails when the path
    /// crosses an existing run spec.
    fn ensure(&mut self, id: &PathId, version: u64) -> ValidationResult<&mut Group> {
        if self.id == *id {
            return Ok(self);
        }
        let child = id.prefix(self.id.segments().len() + 1);
        if self.run_specs.contains_key(&child) {
            return Err(ValidationError::Conflict(format!(
                "{child} is a run spec, cannot create a group beneath it"
            )));
        }
        self.groups
            .entry(child.clone())
            .or_insert_with(|| Group::empty(child, version))
            .ensure(id, version)
    }

    fn collect_specs<'a>(&'a self, out: &mut Vec<&'a RunSpec>) {
        out.extend(self.run_specs.values());
        for group in self.groups.values() {
            group.collect_specs(out);
        }
    }
}

/// One operation inside a root-group update batch. Relative ids resolve
/// against the batch's target group path.
#[derive(Debug, Clone)]
pub enum GroupOp {
    PutApp(AppSpec),
    PutPod(PodSpec),
    PutGroup { id: PathId, enforce_role: bool },
    DeleteApp(PathId),
    DeletePod(PathId),
    DeleteGroup(PathId),
    SetEnforceRole { id: PathId, enforce_role: bool },
}

/// The tree of groups and run specs rooted at `/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootGroup {
    root: Group,
    /// Role assigned to run specs that neither declare one nor sit under
    /// an enforcing top-level group.
    pub default_role: String,
    pub version: u64,
}

impl RootGroup {
    pub fn new(default_role: impl Into<String>, version: u64) -> Self {
        Self {
            root: Group::empty(PathId::root(), version),
            default_role: default_role.into(),
            version,
        }
    }

    pub fn group(&self, id: &PathId) -> Option<&Group> {
        self.root.find(id)
    }

    pub fn run_spec(&self, id: &PathId) -> Option<&RunSpec> {
        self.root.find(&id.parent()).and_then(|g| g.run_specs.get(id))
    }

    pub fn app(&self, id: &PathId) -> Option<&AppSpec> {
        match self.run_spec(id) {
            Some(RunSpec::App(app)) => Some(app),
            _ => None,
        }
    }

    /// Every run spec in the tree, depth first.
    pub fn transitive_run_specs(&self) -> Vec<&RunSpec> {
        let mut out = Vec::new();
        self.root.collect_specs(&mut out);
        out
    }

    pub fn transitive_ids(&self) -> BTreeSet<PathId> {
        self.transitive_run_specs()
            .into_iter()
            .map(|s| s.id().clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.root.groups.is_empty() && self.root.run_specs.is_empty()
    }

    /// Insert a run spec verbatim, creating parent groups as needed. No
    /// role or version normalization; used by plan revert and tests that
    /// need structural edits.
    pub fn with_run_spec(&self, spec: RunSpec) -> ValidationResult<RootGroup> {
        let mut next = self.clone();
        next.insert_spec(spec, next.version)?;
        Ok(next)
    }

    /// Remove a run spec if present. Empty intermediate groups are kept.
    pub fn without_run_spec(&self, id: &PathId) -> RootGroup {
        let mut next = self.clone();
        if let Some(parent) = next.root.find_mut(&id.parent()) {
            parent.run_specs.remove(id);
        }
        next
    }

    // ── Single-operation conveniences ──────────────────────────────

    pub fn put_app(&self, app: AppSpec, version: u64) -> ValidationResult<RootGroup> {
        self.update_many(&PathId::root(), vec![GroupOp::PutApp(app)], version)
    }

    pub fn put_pod(&self, pod: PodSpec, version: u64) -> ValidationResult<RootGroup> {
        self.update_many(&PathId::root(), vec![GroupOp::PutPod(pod)], version)
    }

    pub fn put_group(
        &self,
        id: PathId,
        enforce_role: bool,
        version: u64,
    ) -> ValidationResult<RootGroup> {
        self.update_many(
            &PathId::root(),
            vec![GroupOp::PutGroup { id, enforce_role }],
            version,
        )
    }

    pub fn delete_app(&self, id: PathId, version: u64) -> ValidationResult<RootGroup> {
        self.update_many(&PathId::root(), vec![GroupOp::DeleteApp(id)], version)
    }

    pub fn delete_pod(&self, id: PathId, version: u64) -> ValidationResult<RootGroup> {
        self.update_many(&PathId::root(), vec![GroupOp::DeletePod(id)], version)
    }

    pub fn delete_group(&self, id: PathId, version: u64) -> ValidationResult<RootGroup> {
        self.update_many(&PathId::root(), vec![GroupOp::DeleteGroup(id)], version)
    }

    pub fn set_enforce_role(
        &self,
        id: PathId,
        enforce_role: bool,
        version: u64,
    ) -> ValidationResult<RootGroup> {
        self.update_many(
            &PathId::root(),
            vec![GroupOp::SetEnforceRole { id, enforce_role }],
            version,
        )
    }

    // ── Batch update ───────────────────────────────────────────────

    /// Apply a batch of operations against a copy of this root and return
    /// the validated result. `base` anchors relative ids in the batch.
    pub fn update_many(
        &self,
        base: &PathId,
        ops: Vec<GroupOp>,
        version: u64,
    ) -> ValidationResult<RootGroup> {
        let mut next = self.clone();
        // Top-level groups whose run specs change in this batch, and those
        // whose enforce-role flag flips. Overlap is rejected so a role
        // migration can never be ambiguous.
        let mut changed_spec_tops: BTreeSet<String> = BTreeSet::new();
        let mut toggled_tops: BTreeSet<String> = BTreeSet::new();

        for op in ops {
            match op {
                GroupOp::PutApp(mut app) => {
                    app.id = app.id.canonical(base);
                    app.dependencies = app
                        .dependencies
                        .into_iter()
                        .map(|d| d.canonical(base))
                        .collect();
                    if let Some(top) = app.id.top_level() {
                        changed_spec_tops.insert(top.to_string());
                    }
                    next.put_spec(RunSpec::App(app), version)?;
                }
                GroupOp::PutPod(mut pod) => {
                    pod.id = pod.id.canonical(base);
                    pod.dependencies = pod
                        .dependencies
                        .into_iter()
                        .map(|d| d.canonical(base))
                        .collect();
                    if let Some(top) = pod.id.top_level() {
                        changed_spec_tops.insert(top.to_string());
                    }
                    next.put_spec(RunSpec::Pod(pod), version)?;
                }
                GroupOp::PutGroup { id, enforce_role } => {
                    let id = id.canonical(base);
                    if id.is_root() {
                        return Err(ValidationError::Failure(
                            "cannot replace the root group".to_string(),
                        ));
                    }
                    if enforce_role && id.segments().len() != 1 {
                        return Err(ValidationError::Failure(format!(
                            "enforce_role is only valid on top-level groups, not {id}"
                        )));
                    }
                    if next.run_spec(&id).is_some() {
                        return Err(ValidationError::Conflict(format!(
                            "{id} already names a run spec"
                        )));
                    }
                    match next.root.find_mut(&id) {
                        Some(existing) => {
                            if existing.enforce_role != enforce_role {
                                if let Some(top) = id.top_level() {
                                    toggled_tops.insert(top.to_string());
                                }
                            }
                            existing.enforce_role = enforce_role;
                            existing.version = version;
                        }
                        None => {
                            let group = next.root.ensure(&id, version)?;
                            group.enforce_role = enforce_role;
                        }
                    }
                }
                GroupOp::DeleteApp(id) | GroupOp::DeletePod(id) => {
                    let id = id.canonical(base);
                    if let Some(top) = id.top_level() {
                        changed_spec_tops.insert(top.to_string());
                    }
                    if let Some(parent) = next.root.find_mut(&id.parent()) {
                        parent.run_specs.remove(&id);
                    }
                }
                GroupOp::DeleteGroup(id) => {
                    let id = id.canonical(base);
                    if id.is_root() {
                        return Err(ValidationError::Failure(
                            "cannot delete the root group".to_string(),
                        ));
                    }
                    if let Some(top) = id.top_level() {
                        changed_spec_tops.insert(top.to_string());
                    }
                    if let Some(parent) = next.root.find_mut(&id.parent()) {
                        parent.groups.remove(&id);
                    }
                }
                GroupOp::SetEnforceRole { id, enforce_role } => {
                    let id = id.canonical(base);
                    if id.segments().len() != 1 {
                        return Err(ValidationError::Failure(format!(
                            "enforce_role is only valid on top-level groups, not {id}"
                        )));
                    }
                    let group = next.root.find_mut(&id).ok_or_else(|| {
                        ValidationError::Failure(format!("unknown group {id}"))
                    })?;
                    if group.enforce_role != enforce_role {
                        if let Some(top) = id.top_level() {
                            toggled_tops.insert(top.to_string());
                        }
                    }
                    group.enforce_role = enforce_role;
                    group.version = version;
                }
            }
        }

        if let Some(top) = toggled_tops.intersection(&changed_spec_tops).next() {
            return Err(ValidationError::Failure(format!(
                "cannot change enforce_role of /{top} and its run specs in the same update"
            )));
        }

        next.validate()?;
        next.version = version;
        next.root.version = version;
        debug!(version, "root group updated");
        Ok(next)
    }

    /// Normalize and insert a run spec as part of an update: resolves the
    /// effective role, derives version info from the stored predecessor,
    /// and rejects id collisions.
    fn put_spec(&mut self, mut spec: RunSpec, version: u64) -> ValidationResult<()> {
        let id = spec.id().clone();
        if !id.is_absolute() || id.is_root() {
            return Err(ValidationError::Failure(format!(
                "run spec id must be a non-root absolute path, got {id}"
            )));
        }
        if self.group(&id).is_some() {
            return Err(ValidationError::Conflict(format!("{id} already names a group")));
        }

        // Role inheritance: under an enforcing top-level group the group's
        // name is the role.
        let enforcing = id
            .top_level()
            .and_then(|top| self.group(&id.prefix(1)).map(|g| (top.to_string(), g.enforce_role)))
            .filter(|(_, enforce)| *enforce)
            .map(|(top, _)| top);
        let declared = spec.role().map(str::to_string);
        match (&enforcing, declared.as_deref()) {
            (Some(top), Some(role)) if role != top.as_str() => {
                return Err(ValidationError::Failure(format!(
                    "{id} declares role `{role}` but /{top} enforces role `{top}`"
                )));
            }
            (Some(top), _) => spec.set_role(top.clone()),
            (None, None) => spec.set_role(self.default_role.clone()),
            (None, Some(_)) => {}
        }

        // Version info derives from the stored predecessor so callers
        // never have to thread it through.
        let info = match self.run_spec(&id) {
            Some(old) if old.needs_restart(&spec) => old.version_info().config_changed(version),
            Some(old) if old.instances() != spec.instances() => {
                old.version_info().scaled(version)
            }
            Some(old) => old.version_info().clone(),
            None => crate::runspec::VersionInfo::OnlyVersion { version },
        };
        spec.set_version_info(info);
        self.insert_spec(spec, version)
    }

    fn insert_spec(&mut self, spec: RunSpec, version: u64) -> ValidationResult<()> {
        let id = spec.id().clone();
        let parent = self.root.ensure(&id.parent(), version)?;
        if parent.groups.contains_key(&id) {
            return Err(ValidationError::Conflict(format!("{id} already names a group")));
        }
        parent.run_specs.insert(id, spec);
        Ok(())
    }

    fn validate(&self) -> ValidationResult<()> {
        let specs = self.transitive_run_specs();
        let ids: BTreeSet<&PathId> = specs.iter().map(|s| s.id()).collect();
        for spec in &specs {
            for dep in spec.dependencies() {
                if !ids.contains(dep) {
                    return Err(ValidationError::Failure(format!(
                        "{} depends on unknown run spec {dep}",
                        spec.id()
                    )));
                }
            }
            let upgrade = spec.upgrade();
            if !(0.0..=1.0).contains(&upgrade.minimum_health_capacity)
                || !(0.0..=1.0).contains(&upgrade.maximum_over_capacity)
            {
                return Err(ValidationError::Failure(format!(
                    "{} upgrade capacities must be within [0, 1]",
                    spec.id()
                )));
            }
        }
        if let Some(on) = DependencyGraph::from_specs(&specs).find_cycle() {
            return Err(ValidationError::Cycle(on));
        }
        Ok(())
    }
}
