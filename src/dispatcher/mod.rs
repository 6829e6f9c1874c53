//! Dispatcher-side control loops.
//!
//! Each controller owns a watch subscription, a task queue, and a single
//! reconcile worker. The bulk and factory controllers additionally feed
//! synthetic calculations into the bounded scheduling channel consumed by
//! the [`scheduler::Scheduler`].

pub mod bulks;
pub mod calculations;
pub mod factory;
pub mod liveness;
pub mod operator;
pub mod scheduler;
pub mod workerpools;

pub use operator::Operator;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::model::{
    labels, names, BulkCalculation, Calculation, CalculationBulk, CalculationBulkFactory,
    CalculationSpec, CalculationStatus, ObjectMeta, Params, Phase, Pipeline, Step,
};
use crate::queue::{ObjectKey, TaskQueue};
use crate::store::{Collection, Event, Object, Selector};

/// Forward change events from a collection into a controller's queue,
/// filtered to the managed namespace plus a per-controller predicate.
///
/// Objects that already exist at startup are enqueued once before the
/// watch loop takes over, so a restarted controller picks up in-flight
/// state. The subscription is taken before the list, at worst an object
/// is enqueued twice and the queue dedupes it.
pub(crate) fn spawn_event_pump<T, F>(
    collection: Collection<T>,
    namespace: String,
    queue: Arc<TaskQueue>,
    cancel: CancellationToken,
    accept: F,
) -> tokio::task::JoinHandle<()>
where
    T: Object,
    F: Fn(&Event<T>) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut events = collection.watch();
        match collection.list(&namespace, &Selector::everything()).await {
            Ok(existing) => {
                for object in existing {
                    let event = Event::Created(object);
                    if accept(&event) {
                        queue.enqueue(ObjectKey::from_meta(event.meta()));
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "Initial list failed");
            }
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events.recv() => match received {
                    Ok(event) => {
                        if event.meta().namespace == namespace && accept(&event) {
                            queue.enqueue(ObjectKey::from_meta(event.meta()));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Watch lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}

/// Calculation for one bulk member, carrying the labels the out-of-tree
/// result collector keys on.
pub(crate) fn bulk_member_calculation(
    bulk: &CalculationBulk,
    key: &str,
    member: &BulkCalculation,
) -> Calculation {
    let mut calc = Calculation::from_member(member, &bulk.meta.namespace, &bulk.worker_pool);
    calc.meta
        .labels
        .insert(labels::BULK.to_string(), bulk.meta.name.clone());
    calc.meta
        .labels
        .insert(labels::CALCULATION_NAME.to_string(), key.to_string());
    if !bulk.root_folder.is_empty() {
        calc.meta
            .labels
            .insert(labels::ROOT_FOLDER.to_string(), bulk.root_folder.clone());
    }
    calc
}

/// The single calculation run after every bulk member finished.
pub(crate) fn bulk_post_calculation(
    bulk: &CalculationBulk,
    post: &BulkCalculation,
) -> Calculation {
    let mut calc = Calculation::from_member(post, &bulk.meta.namespace, &bulk.worker_pool);
    calc.meta.name = names::post_calculation_name(&bulk.meta.name);
    calc.meta
        .labels
        .insert(labels::BULK.to_string(), bulk.meta.name.clone());
    calc.meta
        .labels
        .insert(labels::POST_CALCULATION.to_string(), "true".to_string());
    if !bulk.root_folder.is_empty() {
        calc.meta
            .labels
            .insert(labels::ROOT_FOLDER.to_string(), bulk.root_folder.clone());
    }
    calc
}

/// Generation calculation running a factory's command.
pub(crate) fn factory_calculation(factory: &CalculationBulkFactory) -> Calculation {
    let mut calc = Calculation {
        meta: ObjectMeta::new(
            &factory.meta.namespace,
            names::factory_calculation_name(&factory.meta.name),
        ),
        spec: CalculationSpec {
            params: Params::default(),
            steps: vec![Step {
                command: factory.command.clone(),
                args: factory.args.clone(),
                status: None,
            }],
        },
        assign: None,
        worker_pool: factory.worker_pool.clone(),
        phase: Some(Phase::Created),
        status: CalculationStatus {
            start_time: Some(Utc::now()),
            ..Default::default()
        },
        input_files: factory.input_files.clone(),
        pipeline: Pipeline::Custom,
    };
    calc.meta
        .labels
        .insert(labels::FACTORY.to_string(), factory.meta.name.clone());
    if !factory.root_folder.is_empty() {
        calc.meta
            .labels
            .insert(labels::ROOT_FOLDER.to_string(), factory.root_folder.clone());
    }
    calc
}
