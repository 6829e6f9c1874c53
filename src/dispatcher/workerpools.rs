use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::model::{labels, Phase, WorkerState};
use crate::queue::{ObjectKey, TaskQueue};
use crate::store::{retry_on_conflict, MemoryStore, Selector};

/// Reconciles worker pools: whenever a pool has an available worker, hands
/// it the next unscheduled member of the oldest bulk.
pub struct WorkerPoolsController {
    store: MemoryStore,
    namespace: String,
    queue: Arc<TaskQueue>,
}

impl WorkerPoolsController {
    pub fn new(store: MemoryStore, config: &DispatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            namespace: config.namespace.clone(),
            queue: TaskQueue::new(config.queue.clone()),
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let pump = super::spawn_event_pump(
            self.store.pools.clone(),
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

    /// One assignment at most per pass; the pool update it ends with
    /// triggers the next pass.
    pub async fn reconcile(&self, key: ObjectKey) -> Result<()> {
        let pool = self.store.pools.get(&key.namespace, &key.name).await?;
        let Some(worker) = pool.first_available() else {
            return Ok(());
        };
        let worker_name = worker.name.clone();
        let worker_node = worker.node.clone();

        let bulks = self
            .store
            .bulks
            .list(&key.namespace, &Selector::everything())
            .await?;
        let Some(bulk) = bulks
            .into_iter()
            .filter(|b| b.worker_pool == key.name)
            .min_by_key(|b| b.created_time())
        else {
            return Ok(());
        };

        let Some((member_key, member)) = bulk
            .calculations
            .iter()
            .find(|(_, member)| member.phase.is_none())
        else {
            return Ok(());
        };

        let mut calc = super::bulk_member_calculation(&bulk, member_key, member);
        calc.assign = Some(worker_name.clone());
        calc.meta
            .labels
            .insert(labels::ASSIGN.to_string(), worker_name.clone());

        let created = self.store.calculations.create(calc).await?;
        tracing::info!(
            calculation = %created.meta.name,
            bulk = %bulk.meta.name,
            member = %member_key,
            worker = %worker_name,
            "Assigned bulk member to worker"
        );

        let member_key = member_key.clone();
        retry_on_conflict(&self.store.bulks, &key.namespace, &bulk.meta.name, |b| {
            b.set_member_phase(&member_key, Some(Phase::Processing));
            Ok(())
        })
        .await?;

        retry_on_conflict(&self.store.pools, &key.namespace, &key.name, |p| {
            p.set_worker_state(&worker_node, WorkerState::Reserved, Utc::now());
            Ok(())
        })
        .await?;
        Ok(())
    }
}
