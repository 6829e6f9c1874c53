//! Gauges exported for the operations dashboards.

use metrics::gauge;

use crate::model::Calculation;

/// Per-calculation gauge. The value is the creation timestamp so the
/// dashboard can both count calculations per phase and age them.
pub fn record_calculation_phase(calc: &Calculation) {
    let phase = match calc.phase {
        Some(phase) => phase.to_string(),
        None => "Unscheduled".to_string(),
    };
    let created = calc
        .meta
        .creation_time
        .map(|t| t.timestamp() as f64)
        .unwrap_or(0.0);
    gauge!(
        "calc_dispatch_calculation_info",
        "calculation" => calc.meta.name.clone(),
        "phase" => phase,
    )
    .set(created);
}

/// Liveness gauge for a worker's host process.
pub fn record_process_status(name: &str, running: bool) {
    gauge!(
        "calc_dispatch_worker_process_running",
        "process" => name.to_string(),
    )
    .set(if running { 1.0 } else { 0.0 });
}
