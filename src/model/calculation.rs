use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bulk::BulkCalculation;
use super::labels;
use super::meta::ObjectMeta;
use super::names;

/// Lifecycle phase of a calculation or of a single step.
///
/// A bulk member that has not been turned into a calculation yet carries no
/// phase at all, which is modelled as `Option<Phase>` on the member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Created,
    Processing,
    Completed,
    Failed,
}

impl Phase {
    /// Completed and Failed are terminal; nothing transitions out of them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Created => "Created",
            Phase::Processing => "Processing",
            Phase::Completed => "Completed",
            Phase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// One command in a calculation's pipeline. `status` stays unset until the
/// executor reports the step's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub status: Option<Phase>,
}

impl Step {
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            status: None,
        }
    }
}

/// Physical input parameters identifying a calculation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub teff: f64,
    pub log_g: f64,
}

/// Which pipeline a calculation runs. The standard pipeline is the fixed
/// three-step sequence; `Custom` means the steps were spelled out on the
/// bulk member itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pipeline {
    #[default]
    Standard,
    Custom,
}

impl Pipeline {
    /// The fixed step sequence run when no explicit steps are given.
    pub fn canonical_steps() -> Vec<Step> {
        vec![
            Step::new("atlas12_ada", &["s"]),
            Step::new("atlas12_ada", &["r"]),
            Step::new("/bin/bash", &["-c", "synspec49 < input_tlusty_fortfive"]),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalculationSpec {
    pub params: Params,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalculationStatus {
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pending_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completion_time: Option<DateTime<Utc>>,
}

/// A unit of dispatchable work, bound to at most one worker at a time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Calculation {
    pub meta: ObjectMeta,
    pub spec: CalculationSpec,
    /// Node name of the worker this calculation is bound to. Mirrored into
    /// the assign label when set by the scheduler.
    #[serde(default)]
    pub assign: Option<String>,
    #[serde(default)]
    pub worker_pool: String,
    #[serde(default)]
    pub phase: Option<Phase>,
    #[serde(default)]
    pub status: CalculationStatus,
    #[serde(default)]
    pub input_files: Option<Vec<String>>,
    #[serde(default)]
    pub pipeline: Pipeline,
}

impl Calculation {
    /// Build the calculation object for a bulk member.
    ///
    /// Custom steps on the member win; otherwise the standard pipeline is
    /// expanded. The name is derived from the member's parameters so that
    /// re-creating the same member maps onto the same object.
    pub fn from_member(
        member: &BulkCalculation,
        namespace: &str,
        worker_pool: &str,
    ) -> Self {
        let (steps, pipeline) = if member.steps.is_empty() {
            (Pipeline::canonical_steps(), Pipeline::Standard)
        } else {
            (member.steps.clone(), Pipeline::Custom)
        };

        Self {
            meta: ObjectMeta::new(namespace, names::calculation_name(&member.params)),
            spec: CalculationSpec {
                params: member.params,
                steps,
            },
            assign: None,
            worker_pool: worker_pool.to_string(),
            phase: Some(Phase::Created),
            status: CalculationStatus {
                start_time: Some(Utc::now()),
                ..Default::default()
            },
            input_files: member.input_files.clone(),
            pipeline,
        }
    }

    pub fn is_assigned_to(&self, node: &str) -> bool {
        self.assign.as_deref() == Some(node)
    }

    pub fn factory_name(&self) -> Option<&str> {
        self.meta.label(labels::FACTORY)
    }

    pub fn bulk_name(&self) -> Option<&str> {
        self.meta.label(labels::BULK)
    }
}

/// True once every step carries a status.
pub fn steps_finished(steps: &[Step]) -> bool {
    !steps.is_empty() && steps.iter().all(|s| s.status.is_some())
}

/// Collapse finished step statuses into the calculation's final phase.
/// Any failed step fails the calculation.
pub fn final_step_phase(steps: &[Step]) -> Phase {
    if steps.iter().any(|s| s.status == Some(Phase::Failed)) {
        Phase::Failed
    } else {
        Phase::Completed
    }
}
