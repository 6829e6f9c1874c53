use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{DispatcherConfig, NoCapacityPolicy};
use crate::error::Result;
use crate::metrics;
use crate::model::{labels, Calculation, WorkerState};
use crate::store::{retry_on_conflict, MemoryStore};

/// Single consumer of the bounded calculation hand-off channel.
///
/// Producers (the bulk and factory reconcilers) block while the scheduler
/// works through the backlog; the channel capacity bounds the in-flight
/// hand-off.
pub struct Scheduler {
    store: MemoryStore,
    namespace: String,
    policy: NoCapacityPolicy,
    /// Clone of the producer side, used only to re-offer under the
    /// requeue policy.
    tx: mpsc::Sender<Calculation>,
}

impl Scheduler {
    pub fn new(
        store: MemoryStore,
        config: &DispatcherConfig,
        tx: mpsc::Sender<Calculation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            namespace: config.namespace.clone(),
            policy: config.scheduler.no_capacity_policy,
            tx,
        })
    }

    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<Calculation>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Some(calc) => {
                        if let Err(err) = self.schedule(calc).await {
                            tracing::error!(error = %err, "Scheduling pass failed");
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::info!("Scheduler stopped");
        Ok(())
    }

    /// Place one calculation onto the longest-idle available worker of its
    /// target pool.
    pub async fn schedule(&self, mut calc: Calculation) -> Result<()> {
        let pool = match self.store.pools.get(&self.namespace, &calc.worker_pool).await {
            Ok(pool) => pool,
            Err(err) if err.is_not_found() => {
                tracing::warn!(
                    calculation = %calc.meta.name,
                    pool = %calc.worker_pool,
                    "Target worker pool does not exist, dropping calculation"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let Some(worker) = pool.first_available() else {
            self.handle_no_capacity(calc);
            return Ok(());
        };
        let worker_name = worker.name.clone();
        let worker_node = worker.node.clone();

        calc.assign = Some(worker_name.clone());
        calc.meta
            .labels
            .insert(labels::ASSIGN.to_string(), worker_name.clone());

        let name = calc.meta.name.clone();
        match self.store.calculations.create(calc).await {
            Ok(created) => {
                tracing::info!(
                    calculation = %created.meta.name,
                    worker = %worker_name,
                    "Scheduled calculation"
                );
                retry_on_conflict(&self.store.pools, &self.namespace, &pool.meta.name, |p| {
                    p.set_worker_state(&worker_node, WorkerState::Reserved, Utc::now());
                    Ok(())
                })
                .await?;
                metrics::record_calculation_phase(&created);
            }
            Err(err) if err.is_already_exists() => {
                tracing::debug!(calculation = %name, "Calculation already exists, skipping");
            }
            Err(err) => return Err(err),
        }
        Ok(())
    }

    fn handle_no_capacity(&self, calc: Calculation) {
        match self.policy {
            NoCapacityPolicy::Drop => {
                tracing::warn!(
                    calculation = %calc.meta.name,
                    pool = %calc.worker_pool,
                    "No available worker, dropping calculation"
                );
            }
            NoCapacityPolicy::Requeue { delay_ms } => {
                tracing::debug!(
                    calculation = %calc.meta.name,
                    pool = %calc.worker_pool,
                    delay_ms,
                    "No available worker, re-offering after delay"
                );
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    if tx.send(calc).await.is_err() {
                        tracing::debug!("Scheduler channel closed, dropping re-offer");
                    }
                });
            }
        }
    }
}
