//! Per-run-spec deployment locks.
//!
//! A mapping `run spec id → deployment id`. A plan acquires locks for its
//! whole affected set atomically or not at all; no two plans may mutate
//! overlapping run-spec sets concurrently.

use std::collections::{BTreeSet, HashMap};

use trellis_core::PathId;

#[derive(Debug, Default)]
pub struct LockTable {
    held: HashMap<PathId, String>,
}

impl LockTable {
    /// Deployment ids currently holding locks on any of `ids`.
    pub fn conflicts(&self, ids: &BTreeSet<PathId>) -> Vec<String> {
        let mut holders: Vec<String> = ids
            .iter()
            .filter_map(|id| self.held.get(id).cloned())
            .collect();
        holders.sort();
        holders.dedup();
        holders
    }

    /// Acquire all locks for a deployment, or fail with the conflicting
    /// holders and acquire nothing.
    pub fn acquire(
        &mut self,
        ids: &BTreeSet<PathId>,
        deployment_id: &str,
    ) -> Result<(), Vec<String>> {
        let conflicts = self.conflicts(ids);
        if !conflicts.is_empty() {
            return Err(conflicts);
        }
        for id in ids {
            self.held.insert(id.clone(), deployment_id.to_string());
        }
        Ok(())
    }

    /// Release every lock a deployment holds.
    pub fn release(&mut self, deployment_id: &str) {
        self.held.retain(|_, holder| holder != deployment_id);
    }

    pub fn holder(&self, id: &PathId) -> Option<&str> {
        self.held.get(id).map(String::as_str)
    }
}
