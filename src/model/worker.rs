use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::meta::ObjectMeta;

/// Availability of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    Available,
    Reserved,
    Processing,
    Unknown,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Available => "Available",
            WorkerState::Reserved => "Reserved",
            WorkerState::Processing => "Processing",
            WorkerState::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// One registered worker agent inside a pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    /// Display name reported by the agent.
    pub name: String,
    /// Stable node identity; also the entry's key in the pool map.
    pub node: String,
    pub registered_time: DateTime<Utc>,
    /// Refreshed on every heartbeat and state change. Orders scheduling.
    pub last_update_time: DateTime<Utc>,
    #[serde(default)]
    pub calculations_processed: u64,
    pub state: WorkerState,
}

impl Worker {
    pub fn new(name: impl Into<String>, node: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            node: node.into(),
            registered_time: now,
            last_update_time: now,
            calculations_processed: 0,
            state: WorkerState::Available,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPoolSpec {
    /// Workers keyed by node name.
    #[serde(default)]
    pub workers: BTreeMap<String, Worker>,
}

/// Registry of worker agents sharing a scheduling domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPool {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub spec: WorkerPoolSpec,
}

impl WorkerPool {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            spec: WorkerPoolSpec::default(),
        }
    }

    /// Workers ordered by ascending last update time, so the longest-idle
    /// worker is considered first.
    pub fn sorted_workers(&self) -> Vec<&Worker> {
        let mut workers: Vec<&Worker> = self.spec.workers.values().collect();
        workers.sort_by_key(|w| w.last_update_time);
        workers
    }

    /// First available worker in heartbeat order, if any.
    pub fn first_available(&self) -> Option<&Worker> {
        self.sorted_workers()
            .into_iter()
            .find(|w| w.state == WorkerState::Available)
    }

    /// Update a worker's state by node key, refreshing its update time.
    pub fn set_worker_state(&mut self, node: &str, state: WorkerState, now: DateTime<Utc>) -> bool {
        match self.spec.workers.get_mut(node) {
            Some(worker) => {
                worker.state = state;
                worker.last_update_time = now;
                true
            }
            None => false,
        }
    }

    /// Update a worker's state by display name. Used when only the reported
    /// name is known, not the node key.
    pub fn set_worker_state_by_name(
        &mut self,
        name: &str,
        state: WorkerState,
        now: DateTime<Utc>,
    ) -> bool {
        for worker in self.spec.workers.values_mut() {
            if worker.name == name {
                worker.state = state;
                worker.last_update_time = now;
                return true;
            }
        }
        false
    }
}
