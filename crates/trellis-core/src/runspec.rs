//! Immutable run specifications: apps, pods, and the shared attribute set.
//!
//! A `RunSpec` is the declared target for a workload. Specs never mutate in
//! place; every change produces a new version that replaces the prior one
//! atomically inside a root-group update.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::paths::PathId;

/// Per-instance resource demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub gpus: f64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            mem: 128.0,
            disk: 0.0,
            gpus: 0.0,
        }
    }
}

/// How to treat instances on agents that stop reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UnreachableStrategy {
    /// Never act on unreachable instances.
    Disabled,
    /// After `inactive_after_secs` the instance stops counting toward the
    /// spec's capacity; after `expunge_after_secs` it is removed entirely.
    Enabled {
        inactive_after_secs: u64,
        expunge_after_secs: u64,
    },
}

impl Default for UnreachableStrategy {
    fn default() -> Self {
        Self::Enabled {
            inactive_after_secs: 300,
            expunge_after_secs: 600,
        }
    }
}

/// Capacity bounds honoured while replacing instances during an upgrade.
///
/// Both capacities are fractions of the target instance count in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    pub minimum_health_capacity: f64,
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 1.0,
        }
    }
}

impl UpgradeStrategy {
    /// Minimum number of old-plus-new instances that must stay up while
    /// restarting toward `target` instances.
    pub fn minimum_healthy(&self, target: u32) -> u32 {
        (self.minimum_health_capacity * f64::from(target)).ceil() as u32
    }

    /// Maximum number of instances allowed to exist concurrently while
    /// restarting toward `target` instances.
    pub fn maximum_capacity(&self, target: u32) -> u32 {
        target + (self.maximum_over_capacity * f64::from(target)).floor() as u32
    }
}

/// Where a spec version came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VersionInfo {
    /// A spec that has only ever had one version.
    OnlyVersion { version: u64 },
    /// A spec that has been scaled or reconfigured since creation.
    FullVersion {
        version: u64,
        last_scaling_at: u64,
        last_config_change_at: u64,
    },
}

impl VersionInfo {
    pub fn version(&self) -> u64 {
        match self {
            Self::OnlyVersion { version } => *version,
            Self::FullVersion { version, .. } => *version,
        }
    }

    /// Version info after a scale-only change at `at`.
    pub fn scaled(&self, at: u64) -> VersionInfo {
        let config = match self {
            Self::OnlyVersion { version } => *version,
            Self::FullVersion {
                last_config_change_at,
                ..
            } => *last_config_change_at,
        };
        Self::FullVersion {
            version: at,
            last_scaling_at: at,
            last_config_change_at: config,
        }
    }

    /// Version info after a config change at `at`.
    pub fn config_changed(&self, at: u64) -> VersionInfo {
        Self::FullVersion {
            version: at,
            last_scaling_at: at,
            last_config_change_at: at,
        }
    }
}

/// Health probe attached to an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub path: Option<String>,
    pub grace_period_secs: u64,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub max_consecutive_failures: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            path: None,
            grace_period_secs: 300,
            interval_secs: 60,
            timeout_secs: 20,
            max_consecutive_failures: 3,
        }
    }
}

/// Probe that must pass before a new instance counts as ready during an
/// upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessCheckSpec {
    pub name: String,
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for ReadinessCheckSpec {
    fn default() -> Self {
        Self {
            name: "readiness-check".to_string(),
            path: "/".to_string(),
            interval_secs: 30,
            timeout_secs: 10,
        }
    }
}

/// A single-task application specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub id: PathId,
    pub cmd: Option<String>,
    pub env: BTreeMap<String, String>,
    pub instances: u32,
    pub resources: Resources,
    /// Mesos reservation role. `None` means "inherit": the enforcing
    /// top-level group's name, or the configured default role.
    pub role: Option<String>,
    pub version_info: VersionInfo,
    pub upgrade: UpgradeStrategy,
    pub unreachable: UnreachableStrategy,
    pub health_checks: Vec<HealthCheckSpec>,
    pub readiness_checks: Vec<ReadinessCheckSpec>,
    pub dependencies: BTreeSet<PathId>,
}

impl AppSpec {
    pub fn new(id: PathId, version: u64) -> Self {
        Self {
            id,
            cmd: None,
            env: BTreeMap::new(),
            instances: 1,
            resources: Resources::default(),
            role: None,
            version_info: VersionInfo::OnlyVersion { version },
            upgrade: UpgradeStrategy::default(),
            unreachable: UnreachableStrategy::default(),
            health_checks: Vec::new(),
            readiness_checks: Vec::new(),
            dependencies: BTreeSet::new(),
        }
    }
}

/// One container inside a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub resources: Resources,
    pub image: Option<String>,
    pub exec: Option<String>,
}

/// A multi-container pod specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub id: PathId,
    pub containers: Vec<ContainerSpec>,
    pub env: BTreeMap<String, String>,
    pub instances: u32,
    pub role: Option<String>,
    pub version_info: VersionInfo,
    pub upgrade: UpgradeStrategy,
    pub unreachable: UnreachableStrategy,
    pub readiness_checks: Vec<ReadinessCheckSpec>,
    pub dependencies: BTreeSet<PathId>,
}

impl PodSpec {
    pub fn new(id: PathId, version: u64) -> Self {
        Self {
            id,
            containers: Vec::new(),
            env: BTreeMap::new(),
            instances: 1,
            role: None,
            version_info: VersionInfo::OnlyVersion { version },
            upgrade: UpgradeStrategy::default(),
            unreachable: UnreachableStrategy::default(),
            readiness_checks: Vec::new(),
            dependencies: BTreeSet::new(),
        }
    }
}

/// Either an app or a pod. Behaviour that varies by kind is an exhaustive
/// match over this tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunSpec {
    App(AppSpec),
    Pod(PodSpec),
}

impl RunSpec {
    pub fn id(&self) -> &PathId {
        match self {
            Self::App(a) => &a.id,
            Self::Pod(p) => &p.id,
        }
    }

    pub fn instances(&self) -> u32 {
        match self {
            Self::App(a) => a.instances,
            Self::Pod(p) => p.instances,
        }
    }

    pub fn with_instances(mut self, instances: u32) -> Self {
        match &mut self {
            Self::App(a) => a.instances = instances,
            Self::Pod(p) => p.instances = instances,
        }
        self
    }

    pub fn role(&self) -> Option<&str> {
        match self {
            Self::App(a) => a.role.as_deref(),
            Self::Pod(p) => p.role.as_deref(),
        }
    }

    pub fn set_role(&mut self, role: String) {
        match self {
            Self::App(a) => a.role = Some(role),
            Self::Pod(p) => p.role = Some(role),
        }
    }

    pub fn version_info(&self) -> &VersionInfo {
        match self {
            Self::App(a) => &a.version_info,
            Self::Pod(p) => &p.version_info,
        }
    }

    pub fn set_version_info(&mut self, info: VersionInfo) {
        match self {
            Self::App(a) => a.version_info = info,
            Self::Pod(p) => p.version_info = info,
        }
    }

    pub fn version(&self) -> u64 {
        self.version_info().version()
    }

    pub fn upgrade(&self) -> &UpgradeStrategy {
        match self {
            Self::App(a) => &a.upgrade,
            Self::Pod(p) => &p.upgrade,
        }
    }

    pub fn unreachable(&self) -> &UnreachableStrategy {
        match self {
            Self::App(a) => &a.unreachable,
            Self::Pod(p) => &p.unreachable,
        }
    }

    pub fn readiness_checks(&self) -> &[ReadinessCheckSpec] {
        match self {
            Self::App(a) => &a.readiness_checks,
            Self::Pod(p) => &p.readiness_checks,
        }
    }

    pub fn health_checks(&self) -> &[HealthCheckSpec] {
        match self {
            Self::App(a) => &a.health_checks,
            Self::Pod(_) => &[],
        }
    }

    pub fn dependencies(&self) -> &BTreeSet<PathId> {
        match self {
            Self::App(a) => &a.dependencies,
            Self::Pod(p) => &p.dependencies,
        }
    }

    pub fn is_pod(&self) -> bool {
        matches!(self, Self::Pod(_))
    }

    pub fn is_scaled_to_zero(&self) -> bool {
        self.instances() == 0
    }

    /// Container names a launched instance will carry as tasks. Apps run a
    /// single unnamed task.
    pub fn container_names(&self) -> Vec<Option<String>> {
        match self {
            Self::App(_) => vec![None],
            Self::Pod(p) => p.containers.iter().map(|c| Some(c.name.clone())).collect(),
        }
    }

    /// A copy with instance count and version info neutralized, used to
    /// compare two versions of a spec by configuration alone. Comparing on
    /// this form means a version bump with identical configuration never
    /// triggers a restart.
    fn config_only(&self) -> RunSpec {
        let mut stripped = self.clone().with_instances(0);
        stripped.set_version_info(VersionInfo::OnlyVersion { version: 0 });
        stripped
    }

    /// True when the two versions differ only in instance count.
    pub fn is_only_scale_change(&self, to: &RunSpec) -> bool {
        self.instances() != to.instances() && self.config_only() == to.config_only()
    }

    /// True when moving from `self` to `to` requires replacing running
    /// instances rather than scaling.
    pub fn needs_restart(&self, to: &RunSpec) -> bool {
        self.config_only() != to.config_only()
    }
}
