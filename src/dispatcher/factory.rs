use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::model::{Calculation, CalculationBulk};
use crate::queue::{ObjectKey, TaskQueue};
use crate::store::{retry_on_conflict, MemoryStore};

/// Reconciles bulk factories: launches the generation calculation, and once
/// it finished, decodes its output file into a CalculationBulk.
pub struct FactoryController {
    store: MemoryStore,
    namespace: String,
    shared_root: PathBuf,
    queue: Arc<TaskQueue>,
    scheduler_tx: mpsc::Sender<Calculation>,
}

impl FactoryController {
    pub fn new(
        store: MemoryStore,
        config: &DispatcherConfig,
        scheduler_tx: mpsc::Sender<Calculation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            namespace: config.namespace.clone(),
            shared_root: config.shared_root.clone(),
            queue: TaskQueue::new(config.queue.clone()),
            scheduler_tx,
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let pump = super::spawn_event_pump(
            self.store.factories.clone(),
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
        let factory = self.store.factories.get(&key.namespace, &key.name).await?;

        if factory.status.completion_time.is_some() && !factory.status.bulk_created {
            return self.create_bulk(&key).await;
        }

        tracing::debug!(factory = %factory.meta.name, "Offering generation calculation to scheduler");
        self.scheduler_tx
            .send(super::factory_calculation(&factory))
            .await
            .map_err(|_| DispatchError::ChannelClosed("scheduler"))
    }

    /// Decode the factory's output file and create the bulk it describes.
    ///
    /// The generation command may still be writing the file when the
    /// completion condition lands, so an undecodable file means "not ready
    /// yet" and ends the pass without a retry. A read error is transient
    /// and surfaces for backoff.
    async fn create_bulk(&self, key: &ObjectKey) -> Result<()> {
        let factory = self.store.factories.get(&key.namespace, &key.name).await?;
        let path = self
            .shared_root
            .join(&factory.root_folder)
            .join(&factory.bulk_output);

        let raw = tokio::fs::read_to_string(&path).await?;
        let mut bulk: CalculationBulk = match serde_yaml::from_str(&raw) {
            Ok(bulk) => bulk,
            Err(err) => {
                tracing::debug!(
                    factory = %factory.meta.name,
                    path = %path.display(),
                    error = %err,
                    "Bulk output not decodable yet"
                );
                return Ok(());
            }
        };

        bulk.meta.namespace = key.namespace.clone();
        if bulk.meta.name.is_empty() {
            bulk.meta.name = format!("{}-bulk", factory.meta.name);
        }
        if bulk.worker_pool.is_empty() {
            bulk.worker_pool = factory.worker_pool.clone();
        }
        if bulk.root_folder.is_empty() {
            bulk.root_folder = factory.root_folder.clone();
        }

        let bulk_name = bulk.meta.name.clone();
        match self.store.bulks.create(bulk).await {
            Ok(_) => {
                tracing::info!(factory = %factory.meta.name, bulk = %bulk_name, "Created bulk from factory output");
            }
            Err(err) if err.is_already_exists() => {
                tracing::debug!(factory = %factory.meta.name, bulk = %bulk_name, "Bulk already exists");
            }
            Err(err) => return Err(err),
        }

        retry_on_conflict(&self.store.factories, &key.namespace, &key.name, |f| {
            f.status.bulk_created = true;
            Ok(())
        })
        .await?;
        Ok(())
    }
}
