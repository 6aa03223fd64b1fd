//! Task and instance conditions, goals, and goal-change reasons.

use serde::{Deserialize, Serialize};

/// Lifecycle condition of a task or instance.
///
/// Declaration order is severity order, most severe first: the condition
/// reducer takes the minimum over a task set, so the worst condition wins.
/// `UnreachableInactive` and `Scheduled` exist only at the instance level
/// and never appear on tasks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Error,
    Failed,
    Gone,
    Dropped,
    Unreachable,
    Killing,
    Starting,
    Staging,
    Unknown,
    Provisioned,
    Running,
    Finished,
    Killed,
    UnreachableInactive,
    Scheduled,
}

impl Condition {
    /// Terminal conditions: the task will never report again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Error
                | Self::Failed
                | Self::Finished
                | Self::Killed
                | Self::Gone
                | Self::Dropped
                | Self::Unknown
        )
    }

    /// Terminal for capacity purposes: includes `UnreachableInactive`,
    /// which the scale loop treats as gone even though the agent may still
    /// resurface.
    pub fn is_considered_terminal(&self) -> bool {
        self.is_terminal() || matches!(self, Self::UnreachableInactive)
    }

    /// Conditions that count toward a run spec's live capacity.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Provisioned
                | Self::Staging
                | Self::Starting
                | Self::Running
                | Self::Unreachable
                | Self::Killing
        )
    }
}

/// What the orchestrator wants to happen to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    /// Keep the instance running; relaunch on failure.
    Running,
    /// Kill tasks but retain the instance and its reservation.
    Stopped,
    /// Kill tasks, release reservations, expunge once terminal.
    Decommissioned,
}

/// Why a goal changed; carried on events and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalChangeReason {
    /// Reconciliation found no run spec for the instance.
    Orphaned,
    /// A deployment scaled the run spec down.
    OverCapacity,
    /// The run spec was deleted or stopped.
    DeletingRunSpec,
    /// An operator asked for it.
    UserRequest,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_order_matches_declaration_order() {
        assert!(Condition::Error < Condition::Failed);
        assert!(Condition::Failed < Condition::Unreachable);
        assert!(Condition::Unreachable < Condition::Running);
        assert!(Condition::Running < Condition::Killed);
    }

    #[test]
    fn terminal_set() {
        for c in [
            Condition::Error,
            Condition::Failed,
            Condition::Finished,
            Condition::Killed,
            Condition::Gone,
            Condition::Dropped,
            Condition::Unknown,
        ] {
            assert!(c.is_terminal(), "{c:?} should be terminal");
        }
        for c in [
            Condition::Running,
            Condition::Staging,
            Condition::Unreachable,
            Condition::Provisioned,
            Condition::Scheduled,
        ] {
            assert!(!c.is_terminal(), "{c:?} should not be terminal");
        }
        assert!(Condition::UnreachableInactive.is_considered_terminal());
        assert!(!Condition::UnreachableInactive.is_terminal());
    }

    #[test]
    fn active_set_excludes_scheduled_and_terminal() {
        assert!(Condition::Running.is_active());
        assert!(Condition::Staging.is_active());
        assert!(Condition::Unreachable.is_active());
        assert!(!Condition::Scheduled.is_active());
        assert!(!Condition::Killed.is_active());
        assert!(!Condition::UnreachableInactive.is_active());
    }
}
