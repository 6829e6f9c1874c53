use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{DispatchError, Result};
use crate::model::{final_step_phase, steps_finished, Calculation, Phase, WorkerState};
use crate::queue::{ObjectKey, TaskQueue};
use crate::store::{retry_on_conflict, MemoryStore};

/// Outcome of one executed pipeline step, reported by the executor.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub calc_name: String,
    pub step: usize,
    pub status: Phase,
}

/// Executor-level failure that takes down the whole calculation.
#[derive(Debug, Clone)]
pub struct CalcError {
    pub calc_name: String,
    pub error: String,
}

/// Drives the calculations assigned to this worker through their lifecycle:
/// hands fresh ones to the executor and finalizes finished ones, keeping
/// the pool entry's state in step.
pub struct WorkerController {
    store: MemoryStore,
    config: WorkerConfig,
    queue: Arc<TaskQueue>,
    execute_tx: mpsc::Sender<Calculation>,
}

impl WorkerController {
    pub fn new(
        store: MemoryStore,
        config: &WorkerConfig,
        execute_tx: mpsc::Sender<Calculation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config: config.clone(),
            queue: TaskQueue::new(config.queue.clone()),
            execute_tx,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let hostname = self.config.hostname.clone();
        let pump = crate::dispatcher::spawn_event_pump(
            self.store.calculations.clone(),
            self.config.namespace.clone(),
            Arc::clone(&self.queue),
            cancel.clone(),
            move |event| event.object().is_assigned_to(&hostname),
        );

        let controller = Arc::clone(&self);
        let result = Arc::clone(&self.queue)
            .run_worker(move |key| {
                let controller = Arc::clone(&controller);
                async move { controller.reconcile(key).await }
            }, cancel)
            .await;
        pump.abort();
        result
    }

    pub async fn reconcile(&self, key: ObjectKey) -> Result<()> {
        let calc = self
            .store
            .calculations
            .get(&key.namespace, &key.name)
            .await?;
        if !calc.is_assigned_to(&self.config.hostname) {
            return Ok(());
        }

        match calc.phase {
            Some(Phase::Created) => self.start(calc).await,
            Some(Phase::Processing) if steps_finished(&calc.spec.steps) => {
                self.finish(&key).await
            }
            _ => Ok(()),
        }
    }

    /// Claim the slot, hand the work to the executor, then record the
    /// calculation as Processing.
    async fn start(&self, calc: Calculation) -> Result<()> {
        let nodename = self.config.nodename.clone();
        retry_on_conflict(
            &self.store.pools,
            &self.config.namespace,
            &self.config.worker_pool,
            |pool| {
                pool.set_worker_state(&nodename, WorkerState::Processing, Utc::now());
                Ok(())
            },
        )
        .await?;

        let name = calc.meta.name.clone();
        let namespace = calc.meta.namespace.clone();
        self.execute_tx
            .send(calc)
            .await
            .map_err(|_| DispatchError::ChannelClosed("executor"))?;

        retry_on_conflict(&self.store.calculations, &namespace, &name, |c| {
            if c.phase == Some(Phase::Created) {
                c.phase = Some(Phase::Processing);
                c.status.pending_time = Some(Utc::now());
            }
            Ok(())
        })
        .await?;
        tracing::info!(calculation = %name, "Started calculation");
        Ok(())
    }

    /// Finalize the phase and release the slot. The post-job pool update
    /// must land; on failure the process terminates instead of keeping the
    /// slot stuck.
    async fn finish(&self, key: &ObjectKey) -> Result<()> {
        let updated = retry_on_conflict(
            &self.store.calculations,
            &key.namespace,
            &key.name,
            |c| {
                if c.phase == Some(Phase::Processing) && steps_finished(&c.spec.steps) {
                    c.phase = Some(final_step_phase(&c.spec.steps));
                    c.status.completion_time = Some(Utc::now());
                }
                Ok(())
            },
        )
        .await?;
        tracing::info!(
            calculation = %key.name,
            phase = ?updated.phase,
            "Finished calculation"
        );

        let nodename = self.config.nodename.clone();
        retry_on_conflict(
            &self.store.pools,
            &self.config.namespace,
            &self.config.worker_pool,
            |pool| {
                if let Some(worker) = pool.spec.workers.get_mut(&nodename) {
                    worker.state = WorkerState::Available;
                    worker.last_update_time = Utc::now();
                    worker.calculations_processed += 1;
                }
                Ok(())
            },
        )
        .await
        .map_err(|err| {
            DispatchError::Fatal(format!(
                "failed to release worker slot after {}: {err}",
                key.name
            ))
        })?;
        Ok(())
    }
}

/// Applies executor reports to the stored calculations: per-step statuses
/// and whole-calculation failures.
pub struct ResultUpdater {
    store: MemoryStore,
    namespace: String,
}

impl ResultUpdater {
    pub fn new(store: MemoryStore, config: &WorkerConfig) -> Self {
        Self {
            store,
            namespace: config.namespace.clone(),
        }
    }

    pub async fn run(
        &self,
        mut steps: mpsc::Receiver<StepResult>,
        mut errors: mpsc::Receiver<CalcError>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = steps.recv() => match received {
                    Some(result) => {
                        if let Err(err) = self.apply_step(result).await {
                            tracing::error!(error = %err, "Failed to record step result");
                        }
                    }
                    None => break,
                },
                received = errors.recv() => match received {
                    Some(report) => {
                        if let Err(err) = self.apply_error(report).await {
                            tracing::error!(error = %err, "Failed to record calculation error");
                        }
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }

    async fn apply_step(&self, result: StepResult) -> Result<()> {
        retry_on_conflict(
            &self.store.calculations,
            &self.namespace,
            &result.calc_name,
            |c| {
                match c.spec.steps.get_mut(result.step) {
                    Some(step) => step.status = Some(result.status),
                    None => {
                        tracing::warn!(
                            calculation = %result.calc_name,
                            step = result.step,
                            "Step index out of range"
                        );
                    }
                }
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    async fn apply_error(&self, report: CalcError) -> Result<()> {
        tracing::warn!(
            calculation = %report.calc_name,
            error = %report.error,
            "Executor reported failure"
        );
        retry_on_conflict(
            &self.store.calculations,
            &self.namespace,
            &report.calc_name,
            |c| {
                c.phase = Some(Phase::Failed);
                c.status.completion_time = Some(Utc::now());
                Ok(())
            },
        )
        .await?;
        Ok(())
    }
}
