use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::model::{BulkState, Calculation};
use crate::queue::{ObjectKey, TaskQueue};
use crate::store::{retry_on_conflict, MemoryStore};

/// Reconciles calculation bulks: marks them Processing, fans their
/// unscheduled members out to the scheduler, and launches the
/// post-calculation once every member finished.
pub struct BulksController {
    store: MemoryStore,
    namespace: String,
    queue: Arc<TaskQueue>,
    scheduler_tx: mpsc::Sender<Calculation>,
}

impl BulksController {
    pub fn new(
        store: MemoryStore,
        config: &DispatcherConfig,
        scheduler_tx: mpsc::Sender<Calculation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            namespace: config.namespace.clone(),
            queue: TaskQueue::new(config.queue.clone()),
            scheduler_tx,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let pump = super::spawn_event_pump(
            self.store.bulks.clone(),
            self.namespace.clone(),
            Arc::clone(&self.queue),
            cancel.clone(),
            |event| !matches!(event, crate::store::Event::Deleted(_)),
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
        let bulk = self.store.bulks.get(&key.namespace, &key.name).await?;

        if bulk.status.state != Some(BulkState::Processing) {
            retry_on_conflict(&self.store.bulks, &key.namespace, &key.name, |b| {
                b.status.state = Some(BulkState::Processing);
                Ok(())
            })
            .await?;
        }

        if bulk.members_all_finished() {
            if let Some(post) = &bulk.post_calculation {
                if post.phase.is_none() {
                    tracing::info!(bulk = %bulk.meta.name, "All members finished, launching post-calculation");
                    self.offer(super::bulk_post_calculation(&bulk, post)).await?;
                }
            }
            return Ok(());
        }

        for member_key in bulk.unscheduled_members() {
            let member = &bulk.calculations[member_key];
            tracing::debug!(bulk = %bulk.meta.name, member = %member_key, "Offering member to scheduler");
            self.offer(super::bulk_member_calculation(&bulk, member_key, member))
                .await?;
        }
        Ok(())
    }

    /// Bounded send; a busy scheduler stalls this reconciler.
    async fn offer(&self, calc: Calculation) -> Result<()> {
        self.scheduler_tx
            .send(calc)
            .await
            .map_err(|_| DispatchError::ChannelClosed("scheduler"))
    }
}
