use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::store::MemoryStore;

use super::bulks::BulksController;
use super::calculations::CalculationsController;
use super::factory::FactoryController;
use super::liveness::LivenessController;
use super::scheduler::Scheduler;
use super::workerpools::WorkerPoolsController;

/// Wires up and runs every dispatcher-side control loop plus the scheduler
/// that consumes their hand-off channel.
pub struct Operator {
    store: MemoryStore,
    config: DispatcherConfig,
}

impl Operator {
    pub fn new(store: MemoryStore, config: DispatcherConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let (tx, rx) = mpsc::channel(self.config.scheduler.channel_capacity);

        let calculations = CalculationsController::new(self.store.clone(), &self.config);
        let bulks = BulksController::new(self.store.clone(), &self.config, tx.clone());
        let factories = FactoryController::new(self.store.clone(), &self.config, tx.clone());
        let pools = WorkerPoolsController::new(self.store.clone(), &self.config);
        let liveness = LivenessController::new(self.store.clone(), &self.config);
        let scheduler = Scheduler::new(self.store.clone(), &self.config, tx);

        tracing::info!(namespace = %self.config.namespace, "Dispatcher starting");

        let mut tasks = JoinSet::new();
        tasks.spawn(calculations.run(cancel.clone()));
        tasks.spawn(bulks.run(cancel.clone()));
        tasks.spawn(factories.run(cancel.clone()));
        tasks.spawn(pools.run(cancel.clone()));
        tasks.spawn(liveness.run(cancel.clone()));
        tasks.spawn(scheduler.run(rx, cancel.clone()));

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "Control loop failed");
                    if outcome.is_ok() {
                        outcome = Err(err);
                    }
                    cancel.cancel();
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "Control loop panicked");
                    if outcome.is_ok() {
                        outcome = Err(DispatchError::Internal(join_err.to_string()));
                    }
                    cancel.cancel();
                }
            }
        }
        tracing::info!("Dispatcher stopped");
        outcome
    }
}
