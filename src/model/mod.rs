pub mod bulk;
pub mod calculation;
pub mod factory;
pub mod labels;
pub mod meta;
pub mod names;
pub mod process;
pub mod worker;

pub use bulk::{BulkCalculation, BulkState, BulkStatus, CalculationBulk};
pub use calculation::{
    final_step_phase, steps_finished, Calculation, CalculationSpec, CalculationStatus, Params,
    Phase, Pipeline, Step,
};
pub use factory::{CalculationBulkFactory, Condition, FactoryStatus};
pub use meta::ObjectMeta;
pub use names::{calculation_name, factory_calculation_name, input_hash, post_calculation_name};
pub use process::WorkerProcess;
pub use worker::{Worker, WorkerPool, WorkerPoolSpec, WorkerState};
