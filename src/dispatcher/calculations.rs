use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::metrics;
use crate::model::{
    final_step_phase, labels, steps_finished, Calculation, Condition, Phase,
};
use crate::queue::{ObjectKey, TaskQueue};
use crate::store::{retry_on_conflict, MemoryStore, Selector};

/// Reconciles individual calculations: binds free workers to fresh ones,
/// finalizes finished ones, and mirrors phase changes back into the owning
/// bulk or factory.
pub struct CalculationsController {
    store: MemoryStore,
    namespace: String,
    queue: Arc<TaskQueue>,
}

impl CalculationsController {
    pub fn new(store: MemoryStore, config: &DispatcherConfig) -> Arc<Self> {
        Arc::new(Self {
            store,
            namespace: config.namespace.clone(),
            queue: TaskQueue::new(config.queue.clone()),
        })
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let pump = super::spawn_event_pump(
            self.store.calculations.clone(),
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
        let mut calc = self
            .store
            .calculations
            .get(&key.namespace, &key.name)
            .await?;

        if calc.phase == Some(Phase::Processing) && steps_finished(&calc.spec.steps) {
            calc = self.finalize(&key).await?;
        }

        if calc.phase == Some(Phase::Created) && calc.assign.is_none() {
            calc = self.try_assign(calc).await?;
        }

        self.mirror_into_bulk(&calc).await?;
        self.mirror_into_factory(&calc).await?;

        metrics::record_calculation_phase(&calc);
        Ok(())
    }

    /// Collapse finished step statuses into the calculation's final phase,
    /// exactly once.
    async fn finalize(&self, key: &ObjectKey) -> Result<Calculation> {
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
            "Calculation finished"
        );
        Ok(updated)
    }

    /// Bind an unassigned calculation to the first free worker process.
    ///
    /// Busy workers are those named by currently Processing calculations;
    /// free workers are the running worker processes that are not busy.
    /// With nobody free the calculation stays unassigned until the next
    /// event.
    async fn try_assign(&self, calc: Calculation) -> Result<Calculation> {
        let processing = self
            .store
            .calculations
            .list_in_phase(&self.namespace, Phase::Processing)
            .await?;
        let busy: HashSet<&str> = processing
            .iter()
            .filter_map(|c| c.assign.as_deref())
            .collect();

        let processes = self
            .store
            .processes
            .list(
                &self.namespace,
                &Selector::everything().eq(labels::ROLE, labels::ROLE_WORKER),
            )
            .await?;
        let mut free: Vec<String> = processes
            .into_iter()
            .filter(|p| p.running && !busy.contains(p.meta.name.as_str()))
            .map(|p| p.meta.name)
            .collect();
        free.sort();

        let Some(worker) = free.into_iter().next() else {
            tracing::debug!(
                calculation = %calc.meta.name,
                "No free worker process, leaving unassigned"
            );
            return Ok(calc);
        };

        let updated = retry_on_conflict(
            &self.store.calculations,
            &calc.meta.namespace,
            &calc.meta.name,
            |c| {
                if c.assign.is_none() {
                    c.assign = Some(worker.clone());
                    c.meta
                        .labels
                        .insert(labels::ASSIGN.to_string(), worker.clone());
                }
                Ok(())
            },
        )
        .await?;
        tracing::info!(calculation = %updated.meta.name, worker = %worker, "Assigned calculation");
        Ok(updated)
    }

    /// Mirror the calculation's phase into its bulk member or the bulk's
    /// post-calculation slot.
    async fn mirror_into_bulk(&self, calc: &Calculation) -> Result<()> {
        let Some(bulk_name) = calc.bulk_name() else {
            return Ok(());
        };

        let bulk = match self.store.bulks.get(&calc.meta.namespace, bulk_name).await {
            Ok(bulk) => bulk,
            Err(err) if err.is_not_found() => {
                tracing::warn!(bulk = %bulk_name, calculation = %calc.meta.name, "Owning bulk is gone");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if calc.meta.has_label(labels::POST_CALCULATION) {
            let current = bulk.post_calculation.as_ref().and_then(|p| p.phase);
            if current == calc.phase {
                return Ok(());
            }
            let phase = calc.phase;
            retry_on_conflict(&self.store.bulks, &calc.meta.namespace, bulk_name, |b| {
                b.set_post_phase(phase);
                Ok(())
            })
            .await?;
            return Ok(());
        }

        let Some(member_key) = calc.meta.label(labels::CALCULATION_NAME) else {
            return Ok(());
        };
        let current = bulk.calculations.get(member_key).and_then(|m| m.phase);
        if current == calc.phase {
            return Ok(());
        }
        let member_key = member_key.to_string();
        let phase = calc.phase;
        retry_on_conflict(&self.store.bulks, &calc.meta.namespace, bulk_name, |b| {
            if !b.set_member_phase(&member_key, phase) {
                tracing::warn!(bulk = %b.meta.name, member = %member_key, "Unknown bulk member");
            }
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Append an availability condition on the factory once its generation
    /// calculation moves past Created.
    async fn mirror_into_factory(&self, calc: &Calculation) -> Result<()> {
        let Some(factory_name) = calc.factory_name() else {
            return Ok(());
        };
        let Some(phase) = calc.phase else {
            return Ok(());
        };
        if phase == Phase::Created {
            return Ok(());
        }

        let condition = Condition::from_phase(phase, Utc::now());
        match retry_on_conflict(
            &self.store.factories,
            &calc.meta.namespace,
            factory_name,
            |f| {
                let duplicate = f.status.conditions.last().is_some_and(|last| {
                    last.condition_type == condition.condition_type
                        && last.reason == condition.reason
                });
                if !duplicate {
                    f.status.conditions.push(condition.clone());
                    f.status.completion_time = Some(condition.last_transition_time);
                }
                Ok(())
            },
        )
        .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.is_not_found() => {
                tracing::warn!(factory = %factory_name, calculation = %calc.meta.name, "Owning factory is gone");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
