//! The multi-task condition reducer and health aggregation.
//!
//! Pure functions over a task set; the tracker applies them after every
//! task update to derive the instance-level state.

use std::collections::BTreeMap;

use trellis_core::UnreachableStrategy;

use crate::condition::{Condition, Goal};
use crate::id::TaskId;
use crate::instance::{InstanceState, Task};

/// Reduce a task set to one instance condition: the minimum under the
/// severity order (most severe wins), with one exception: a reduced
/// `Unreachable` is promoted to `UnreachableInactive` when the strategy
/// allows it and any task has been unreachable past `inactive_after`.
pub fn reduce_condition(
    tasks: &BTreeMap<TaskId, Task>,
    strategy: &UnreachableStrategy,
    now_ms: u64,
) -> Condition {
    let min = match tasks.values().map(|t| t.condition).min() {
        Some(c) => c,
        None => return Condition::Unknown,
    };
    if min == Condition::Unreachable {
        if let UnreachableStrategy::Enabled {
            inactive_after_secs,
            ..
        } = strategy
        {
            let limit_ms = inactive_after_secs.saturating_mul(1000);
            let expired = tasks.values().any(|t| {
                t.condition == Condition::Unreachable
                    && t.unreachable_since
                        .is_some_and(|since| now_ms.saturating_sub(since) >= limit_ms)
            });
            if expired {
                return Condition::UnreachableInactive;
            }
        }
    }
    min
}

/// Aggregate task health into an instance-level verdict.
pub fn aggregate_health(tasks: &BTreeMap<TaskId, Task>) -> Option<bool> {
    // Any running task reporting unhealthy condemns the instance.
    if tasks
        .values()
        .any(|t| t.condition == Condition::Running && t.healthy == Some(false))
    {
        return Some(false);
    }
    // A task still on its way up leaves health unknown.
    if tasks
        .values()
        .any(|t| t.condition != Condition::Running && t.condition != Condition::Finished)
    {
        return None;
    }
    if tasks
        .values()
        .any(|t| t.condition == Condition::Running && t.healthy == Some(true))
    {
        return Some(true);
    }
    None
}

/// Earliest task start, or `None` if nothing has started.
pub fn active_since(tasks: &BTreeMap<TaskId, Task>) -> Option<u64> {
    tasks.values().filter_map(|t| t.started_at).min()
}

/// Derive the next instance state from the task set, preserving `since`
/// when `(condition, healthy)` did not change. An instance that was
/// already promoted to `UnreachableInactive` stays there until its tasks
/// go terminal; only re-scheduling clears the promotion.
pub fn next_state(
    prev: &InstanceState,
    tasks: &BTreeMap<TaskId, Task>,
    strategy: &UnreachableStrategy,
    goal: Goal,
    now_ms: u64,
) -> InstanceState {
    let reduced = reduce_condition(tasks, strategy, now_ms);
    let condition = if prev.condition == Condition::UnreachableInactive && !reduced.is_terminal()
    {
        Condition::UnreachableInactive
    } else {
        reduced
    };
    let healthy = aggregate_health(tasks);
    let since = if prev.condition == condition && prev.healthy == healthy {
        prev.since
    } else {
        now_ms
    };
    InstanceState {
        condition,
        since,
        active_since: active_since(tasks),
        healthy,
        goal,
    }
}
