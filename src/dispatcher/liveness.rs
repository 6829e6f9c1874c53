use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::metrics;
use crate::model::{labels, Phase, WorkerState};
use crate::queue::{ObjectKey, TaskQueue};
use crate::store::{retry_on_conflict, MemoryStore, Selector};

/// Watches worker host processes. A vanished process marks its pool entry
/// Unknown and releases the calculations it was bound to so they can be
/// re-assigned elsewhere.
pub struct LivenessController {
    store: MemoryStore,
    namespace: String,
    queue: Arc<TaskQueue>,
}

impl LivenessController {
    pub fn new(store: MemoryStore, config: &DispatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            namespace: config.namespace.clone(),
            queue: TaskQueue::new(config.queue.clone()),
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let pump = super::spawn_event_pump(
            self.store.processes.clone(),
            self.namespace.clone(),
            Arc::clone(&self.queue),
            cancel.clone(),
            |event| event.object().is_worker(),
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
        match self.store.processes.get(&key.namespace, &key.name).await {
            Ok(process) => {
                metrics::record_process_status(&process.meta.name, process.running);
                Ok(())
            }
            Err(err) if err.is_not_found() => self.recover(&key).await,
            Err(err) => Err(err),
        }
    }

    /// Cleanup after a vanished worker process.
    async fn recover(&self, key: &ObjectKey) -> Result<()> {
        tracing::warn!(process = %key.name, "Worker process gone, recovering its work");
        metrics::record_process_status(&key.name, false);

        let pools = self
            .store
            .pools
            .list(&key.namespace, &Selector::everything())
            .await?;
        for pool in pools {
            if !pool.spec.workers.values().any(|w| w.name == key.name) {
                continue;
            }
            let process_name = key.name.clone();
            retry_on_conflict(&self.store.pools, &key.namespace, &pool.meta.name, |p| {
                p.set_worker_state_by_name(&process_name, WorkerState::Unknown, Utc::now());
                Ok(())
            })
            .await?;
        }

        let assigned = self
            .store
            .calculations
            .list(
                &key.namespace,
                &Selector::everything().eq(labels::ASSIGN, &key.name),
            )
            .await?;
        let doomed: Vec<_> = assigned
            .into_iter()
            .filter(|c| !c.phase.is_some_and(Phase::is_terminal))
            .collect();
        if doomed.len() > 1 {
            tracing::warn!(
                process = %key.name,
                count = doomed.len(),
                "Worker had more than one active calculation"
            );
        }

        for calc in doomed {
            match self
                .store
                .calculations
                .delete(&key.namespace, &calc.meta.name)
                .await
            {
                Ok(_) => {
                    tracing::info!(calculation = %calc.meta.name, process = %key.name, "Deleted orphaned calculation");
                }
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            }

            let (Some(bulk_name), Some(member_key)) =
                (calc.bulk_name(), calc.meta.label(labels::CALCULATION_NAME))
            else {
                continue;
            };
            let member_key = member_key.to_string();
            match retry_on_conflict(
                &self.store.bulks,
                &key.namespace,
                bulk_name,
                |b| {
                    b.set_member_phase(&member_key, None);
                    Ok(())
                },
            )
            .await
            {
                Ok(_) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
