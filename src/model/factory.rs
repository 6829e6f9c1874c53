use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::calculation::Phase;
use super::meta::ObjectMeta;

/// Condition appended to a factory as its generation calculation settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub condition_type: String,
    pub status: bool,
    pub reason: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Map a generation calculation's final phase onto a factory condition.
    pub fn from_phase(phase: Phase, now: DateTime<Utc>) -> Self {
        match phase {
            Phase::Completed => Self {
                condition_type: "Available".to_string(),
                status: true,
                reason: "Completed".to_string(),
                last_transition_time: now,
            },
            _ => Self {
                condition_type: "Unavailable".to_string(),
                status: false,
                reason: "Failed".to_string(),
                last_transition_time: now,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactoryStatus {
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Set once the bulk produced from this factory's output file exists.
    #[serde(default)]
    pub bulk_created: bool,
}

/// Runs one generation calculation whose output file, once collected, is
/// decoded into a CalculationBulk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalculationBulkFactory {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub worker_pool: String,
    /// Directory under the shared root where the factory's files live.
    #[serde(default)]
    pub root_folder: String,
    /// File name (relative to the root folder) the generation calculation
    /// writes the bulk definition into.
    #[serde(default)]
    pub bulk_output: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub input_files: Option<Vec<String>>,
    #[serde(default)]
    pub status: FactoryStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_phase_yields_available_condition() {
        let now = Utc::now();
        let cond = Condition::from_phase(Phase::Completed, now);
        assert_eq!(cond.condition_type, "Available");
        assert!(cond.status);
        assert_eq!(cond.reason, "Completed");
    }

    #[test]
    fn failed_phase_yields_unavailable_condition() {
        let now = Utc::now();
        let cond = Condition::from_phase(Phase::Failed, now);
        assert_eq!(cond.condition_type, "Unavailable");
        assert!(!cond.status);
        assert_eq!(cond.reason, "Failed");
    }
}
