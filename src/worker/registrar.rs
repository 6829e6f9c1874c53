use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::Result;
use crate::model::{Worker, WorkerState};
use crate::store::{retry_on_conflict, MemoryStore};

/// Announces this node in its worker pool on a fixed heartbeat.
///
/// The registrar is the sole writer of "alive and idle": every tick upserts
/// the node's entry with a fresh update time and state Available. On
/// graceful shutdown the entry is removed so the scheduler stops
/// considering the node.
pub struct Registrar {
    store: MemoryStore,
    config: WorkerConfig,
}

impl Registrar {
    pub fn new(store: MemoryStore, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.heartbeat().await {
                        tracing::error!(error = %err, "Heartbeat failed");
                    }
                }
            }
        }
        self.deregister().await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        let nodename = self.config.nodename.clone();
        let hostname = self.config.hostname.clone();
        let outcome = retry_on_conflict(
            &self.store.pools,
            &self.config.namespace,
            &self.config.worker_pool,
            |pool| {
                let now = Utc::now();
                match pool.spec.workers.get_mut(&nodename) {
                    Some(worker) => {
                        worker.last_update_time = now;
                        worker.state = WorkerState::Available;
                    }
                    None => {
                        pool.spec
                            .workers
                            .insert(nodename.clone(), Worker::new(hostname.clone(), nodename.clone(), now));
                    }
                }
                Ok(())
            },
        )
        .await;

        match outcome {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                tracing::warn!(
                    pool = %self.config.worker_pool,
                    "Worker pool does not exist, skipping heartbeat"
                );
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn deregister(&self) -> Result<()> {
        let nodename = self.config.nodename.clone();
        let outcome = retry_on_conflict(
            &self.store.pools,
            &self.config.namespace,
            &self.config.worker_pool,
            |pool| {
                pool.spec.workers.remove(&nodename);
                Ok(())
            },
        )
        .await;

        match outcome {
            Ok(_) => {
                tracing::info!(
                    pool = %self.config.worker_pool,
                    node = %self.config.nodename,
                    "Deregistered from pool"
                );
                Ok(())
            }
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err),
        }
    }
}
