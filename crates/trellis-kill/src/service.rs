//! Kill service actor.
//!
//! One event loop owns two collections: a pending queue and an in-flight
//! map capped at `chunk_size`. Kill requests go to the offer layer; task
//! terminality comes back through the instance event stream, never from
//! the kill request itself. Unanswered kills are re-issued after
//! `retry_timeout`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use trellis_instance::{
    Condition, Goal, Instance, InstanceEvent, InstanceId, InstanceTracker, TaskId,
};

/// Offer-layer kill operation. Kills are idempotent; re-issuing the same
/// kill is defined behavior.
pub trait TaskKiller: Send + Sync {
    fn kill_task(&self, task_id: &TaskId);
}

#[derive(Debug, Clone)]
pub struct KillConfig {
    /// Maximum concurrently in-flight kill requests.
    pub chunk_size: usize,
    /// How long to wait for a terminal status before re-issuing.
    pub retry_timeout: Duration,
}

impl Default for KillConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            retry_timeout: Duration::from_secs(600),
        }
    }
}

enum Msg {
    KillInstances {
        instances: Vec<Instance>,
        reply: oneshot::Sender<()>,
    },
    KillUnknownTask {
        task_id: TaskId,
        reply: oneshot::Sender<()>,
    },
    InFlightCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the kill service actor.
#[derive(Clone)]
pub struct KillServiceHandle {
    tx: mpsc::Sender<Msg>,
}

impl KillServiceHandle {
    /// Spawn the actor. Instances already marked `Stopped` or
    /// `Decommissioned` with live tasks are enqueued right away, so kills
    /// survive a leader failover.
    pub fn spawn(
        tracker: InstanceTracker,
        killer: Arc<dyn TaskKiller>,
        config: KillConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(run(tracker, killer, config, rx));
        Self { tx }
    }

    /// Kill every task of the given instances and wait until each instance
    /// is confirmed terminal. Scheduled instances complete immediately.
    pub async fn kill_instances(&self, instances: Vec<Instance>) {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(Msg::KillInstances { instances, reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = done.await;
    }

    /// Issue one kill for a task the tracker does not know and wait for
    /// the matching `UnknownInstanceTerminated` event.
    pub async fn kill_unknown_task(&self, task_id: TaskId) {
        let (reply, done) = oneshot::channel();
        if self
            .tx
            .send(Msg::KillUnknownTask { task_id, reply })
            .await
            .is_err()
        {
            return;
        }
        let _ = done.await;
    }

    /// Current in-flight count; used by tests and diagnostics.
    pub async fn in_flight(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Msg::InFlightCount { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

struct InFlight {
    last_issued: Instant,
    attempts: u32,
}

struct Watcher {
    remaining: HashSet<InstanceId>,
    reply: Option<oneshot::Sender<()>>,
}

struct KillActor {
    tracker: InstanceTracker,
    killer: Arc<dyn TaskKiller>,
    config: KillConfig,
    pending: VecDeque<TaskId>,
    in_flight: HashMap<TaskId, InFlight>,
    watchers: Vec<Watcher>,
    unknown_watchers: HashMap<InstanceId, Vec<oneshot::Sender<()>>>,
}

async fn run(
    tracker: InstanceTracker,
    killer: Arc<dyn TaskKiller>,
    config: KillConfig,
    mut rx: mpsc::Receiver<Msg>,
) {
    let mut events = tracker.subscribe();
    let tick = config.retry_timeout.div_f64(2.0).max(Duration::from_millis(10));
    let mut retry = tokio::time::interval(tick);
    retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut actor = KillActor {
        tracker,
        killer,
        config,
        pending: VecDeque::new(),
        in_flight: HashMap::new(),
        watchers: Vec::new(),
        unknown_watchers: HashMap::new(),
    };
    actor.warm_start().await;

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(Msg::KillInstances { instances, reply }) => {
                        actor.handle_kill_instances(instances, reply).await;
                    }
                    Some(Msg::KillUnknownTask { task_id, reply }) => {
                        actor.handle_kill_unknown(task_id, reply);
                    }
                    Some(Msg::InFlightCount { reply }) => {
                        let _ = reply.send(actor.in_flight.len());
                    }
                    None => break,
                }
            }
            event = events.recv() => {
                match event {
                    Ok(InstanceEvent::Changed { instance }) => actor.handle_changed(&instance),
                    Ok(InstanceEvent::UnknownTerminated { id }) => actor.handle_unknown_terminated(&id),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "kill service lagged behind the instance event stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = retry.tick() => actor.retry_stale(),
        }
    }
    debug!("kill service stopped");
}

impl KillActor {
    /// Pick up instances whose goal already demands death.
    async fn warm_start(&mut self) {
        let mut enqueued = 0;
        for instance in self.tracker.list().await {
            if instance.state.goal == Goal::Running
                || instance.state.condition.is_considered_terminal()
                || instance.state.condition == Condition::Scheduled
            {
                continue;
            }
            for task in instance.tasks.values() {
                if Self::needs_kill(task.condition) {
                    self.enqueue(task.id.clone());
                    enqueued += 1;
                }
            }
        }
        if enqueued > 0 {
            info!(tasks = enqueued, "kill service warm start");
        }
        self.fill_slots();
    }

    /// Tasks already terminal need nothing. Unreachable tasks get no kill
    /// request either: the agent is gone, so the only exit is a status
    /// update or the mesos-side terminal mark.
    fn needs_kill(condition: Condition) -> bool {
        !condition.is_terminal() && condition != Condition::Unreachable
    }

    async fn handle_kill_instances(&mut self, instances: Vec<Instance>, reply: oneshot::Sender<()>) {
        let mut remaining = HashSet::new();
        for instance in instances {
            // The caller's snapshot may be stale; an instance the tracker
            // no longer knows is already gone.
            let Some(instance) = self.tracker.get(&instance.id).await else {
                continue;
            };
            // Scheduled instances were never launched; nothing to kill.
            if instance.state.condition == Condition::Scheduled {
                continue;
            }
            if instance.state.condition.is_considered_terminal() {
                continue;
            }
            remaining.insert(instance.id.clone());
            for task in instance.tasks.values() {
                if Self::needs_kill(task.condition) {
                    self.enqueue(task.id.clone());
                }
            }
        }
        if remaining.is_empty() {
            let _ = reply.send(());
        } else {
            debug!(instances = remaining.len(), "killing instances");
            self.watchers.push(Watcher {
                remaining,
                reply: Some(reply),
            });
        }
        self.fill_slots();
    }

    fn handle_kill_unknown(&mut self, task_id: TaskId, reply: oneshot::Sender<()>) {
        debug!(task = %task_id, "killing unknown task");
        self.unknown_watchers
            .entry(task_id.instance.clone())
            .or_default()
            .push(reply);
        self.enqueue(task_id);
        self.fill_slots();
    }

    fn enqueue(&mut self, task_id: TaskId) {
        if self.in_flight.contains_key(&task_id) || self.pending.contains(&task_id) {
            return;
        }
        self.pending.push_back(task_id);
    }

    fn fill_slots(&mut self) {
        while self.in_flight.len() < self.config.chunk_size {
            let Some(task_id) = self.pending.pop_front() else {
                break;
            };
            self.killer.kill_task(&task_id);
            self.in_flight.insert(
                task_id,
                InFlight {
                    last_issued: Instant::now(),
                    attempts: 1,
                },
            );
        }
    }

    fn handle_changed(&mut self, instance: &Instance) {
        for task in instance.tasks.values() {
            if task.condition.is_terminal() {
                self.in_flight.remove(&task.id);
                self.pending.retain(|t| t != &task.id);
            }
        }
        if instance.state.condition.is_considered_terminal() {
            // The instance is done even if some task never reached a
            // terminal state (e.g. it went unreachable mid-kill).
            self.in_flight.retain(|t, _| t.instance != instance.id);
            self.pending.retain(|t| t.instance != instance.id);
            self.finish_instance(&instance.id);
        }
        self.fill_slots();
    }

    fn handle_unknown_terminated(&mut self, id: &InstanceId) {
        self.in_flight.retain(|t, _| t.instance != *id);
        self.pending.retain(|t| t.instance != *id);
        self.finish_instance(id);
        self.fill_slots();
    }

    fn finish_instance(&mut self, id: &InstanceId) {
        for watcher in &mut self.watchers {
            watcher.remaining.remove(id);
            if watcher.remaining.is_empty() {
                if let Some(reply) = watcher.reply.take() {
                    let _ = reply.send(());
                }
            }
        }
        self.watchers.retain(|w| w.reply.is_some());
        if let Some(replies) = self.unknown_watchers.remove(id) {
            for reply in replies {
                let _ = reply.send(());
            }
        }
    }

    fn retry_stale(&mut self) {
        let now = Instant::now();
        for (task_id, in_flight) in &mut self.in_flight {
            if now.duration_since(in_flight.last_issued) >= self.config.retry_timeout {
                in_flight.attempts += 1;
                in_flight.last_issued = now;
                warn!(
                    task = %task_id,
                    attempts = in_flight.attempts,
                    "kill not confirmed, re-issuing"
                );
                self.killer.kill_task(task_id);
            }
        }
    }
}
