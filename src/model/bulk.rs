use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::calculation::{Params, Phase, Pipeline, Step};
use super::meta::ObjectMeta;

/// Aggregate state of a bulk, derived from its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkState {
    Available,
    Processing,
    Unknown,
}

/// One member of a bulk: the inputs for a single calculation plus the phase
/// mirrored back from the created calculation object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkCalculation {
    pub params: Params,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// None until a calculation exists for this member; then mirrors the
    /// calculation's phase.
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub input_files: Option<Vec<String>>,
    #[serde(default)]
    pub pipeline: Pipeline,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkStatus {
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub state: Option<BulkState>,
}

/// A batch of related calculations dispatched into one worker pool.
///
/// Members are keyed by a caller-chosen stable string; keys order the bulk's
/// scheduling pass deterministically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalculationBulk {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub worker_pool: String,
    #[serde(default)]
    pub root_folder: String,
    #[serde(default)]
    pub calculations: BTreeMap<String, BulkCalculation>,
    /// Optional calculation run once after every member finishes.
    #[serde(default)]
    pub post_calculation: Option<BulkCalculation>,
    #[serde(default)]
    pub status: BulkStatus,
}

impl CalculationBulk {
    /// Creation time used for oldest-first ordering. Falls back to the
    /// object's creation time when status was never stamped.
    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        self.status.created_time.or(self.meta.creation_time)
    }

    /// Keys of members that have no calculation yet, in key order.
    pub fn unscheduled_members(&self) -> Vec<&str> {
        self.calculations
            .iter()
            .filter(|(_, m)| m.phase.is_none())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// True once every member has reached a terminal phase.
    pub fn members_all_finished(&self) -> bool {
        !self.calculations.is_empty()
            && self
                .calculations
                .values()
                .all(|m| m.phase.is_some_and(Phase::is_terminal))
    }

    pub fn set_member_phase(&mut self, key: &str, phase: Option<Phase>) -> bool {
        match self.calculations.get_mut(key) {
            Some(member) => {
                member.phase = phase;
                true
            }
            None => false,
        }
    }

    pub fn set_post_phase(&mut self, phase: Option<Phase>) -> bool {
        match self.post_calculation.as_mut() {
            Some(post) => {
                post.phase = phase;
                true
            }
            None => false,
        }
    }
}
