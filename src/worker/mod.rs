//! Worker-side agent.
//!
//! A worker process registers itself into a pool, watches for calculations
//! assigned to it, and hands them to an out-of-process executor over a
//! narrow channel contract:
//!
//! 1. [`WorkerAgent::new`] returns the [`ExecutorChannels`] the executor
//!    drives: it receives [`Calculation`]s, reports per-step
//!    [`StepResult`]s, and reports whole-calculation [`CalcError`]s.
//! 2. The [`Registrar`] heartbeats the pool entry.
//! 3. The [`WorkerController`] moves assigned calculations through their
//!    phases and keeps the pool entry's state in step.

pub mod controller;
pub mod registrar;

pub use controller::{CalcError, ResultUpdater, StepResult, WorkerController};
pub use registrar::Registrar;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{DispatchError, Result};
use crate::model::{Calculation, WorkerPool};
use crate::store::MemoryStore;

/// Executor side of the agent's channels.
pub struct ExecutorChannels {
    pub calculations: mpsc::Receiver<Calculation>,
    pub step_results: mpsc::Sender<StepResult>,
    pub errors: mpsc::Sender<CalcError>,
}

/// Everything a worker process runs besides the executor itself.
pub struct WorkerAgent {
    store: MemoryStore,
    config: WorkerConfig,
    execute_tx: mpsc::Sender<Calculation>,
    step_rx: mpsc::Receiver<StepResult>,
    error_rx: mpsc::Receiver<CalcError>,
}

impl WorkerAgent {
    pub fn new(store: MemoryStore, config: WorkerConfig) -> (Self, ExecutorChannels) {
        let (execute_tx, execute_rx) = mpsc::channel(1);
        let (step_tx, step_rx) = mpsc::channel(64);
        let (error_tx, error_rx) = mpsc::channel(16);
        (
            Self {
                store,
                config,
                execute_tx,
                step_rx,
                error_rx,
            },
            ExecutorChannels {
                calculations: execute_rx,
                step_results: step_tx,
                errors: error_tx,
            },
        )
    }

    /// Run registrar, controller and result updater until cancelled.
    ///
    /// A [`DispatchError::Fatal`] from any of them propagates so the
    /// process exits instead of limping on with a stuck pool slot.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.ensure_pool().await?;

        let registrar = Registrar::new(self.store.clone(), self.config.clone());
        let controller =
            WorkerController::new(self.store.clone(), &self.config, self.execute_tx.clone());
        let updater = ResultUpdater::new(self.store.clone(), &self.config);

        tracing::info!(
            pool = %self.config.worker_pool,
            node = %self.config.nodename,
            "Worker agent starting"
        );

        let mut tasks = JoinSet::new();
        {
            let cancel = cancel.clone();
            tasks.spawn(async move { registrar.run(cancel).await });
        }
        tasks.spawn(Arc::clone(&controller).run(cancel.clone()));
        {
            let cancel = cancel.clone();
            let step_rx = self.step_rx;
            let error_rx = self.error_rx;
            tasks.spawn(async move { updater.run(step_rx, error_rx, cancel).await });
        }

        let mut outcome = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "Worker task failed");
                    if outcome.is_ok() {
                        outcome = Err(err);
                    }
                    cancel.cancel();
                }
                Err(join_err) => {
                    tracing::error!(error = %join_err, "Worker task panicked");
                    if outcome.is_ok() {
                        outcome = Err(DispatchError::Internal(join_err.to_string()));
                    }
                    cancel.cancel();
                }
            }
        }
        tracing::info!("Worker agent stopped");
        outcome
    }

    async fn ensure_pool(&self) -> Result<()> {
        let pool = WorkerPool::new(&self.config.namespace, &self.config.worker_pool);
        match self.store.pools.create(pool).await {
            Ok(_) => {
                tracing::info!(pool = %self.config.worker_pool, "Created worker pool");
                Ok(())
            }
            Err(err) if err.is_already_exists() => Ok(()),
            Err(err) => Err(err),
        }
    }
}
