//! Integration tests for the scheduler consuming the hand-off channel.


use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use calc_dispatch::config::NoCapacityPolicy;
use calc_dispatch::dispatcher::scheduler::Scheduler;
use calc_dispatch::model::{labels, Calculation, ObjectMeta, Phase, WorkerState};
use calc_dispatch::store::{MemoryStore, Selector};

use test_harness::{
    assert_eventually, set_pool_worker_state, store_with_pool, test_dispatcher_config, NAMESPACE,
    POOL,
};

fn spawn_scheduler(
    store: &MemoryStore,
    policy: NoCapacityPolicy,
) -> (mpsc::Sender<Calculation>, CancellationToken) {
    let mut config = test_dispatcher_config();
    config.scheduler.no_capacity_policy = policy;
    let (tx, rx) = mpsc::channel(config.scheduler.channel_capacity);
    let scheduler = Scheduler::new(store.clone(), &config, tx.clone());
    let cancel = CancellationToken::new();
    tokio::spawn(scheduler.run(rx, cancel.clone()));
    (tx, cancel)
}

fn pending_calculation(name: &str) -> Calculation {
    Calculation {
        meta: ObjectMeta::new(NAMESPACE, name),
        worker_pool: POOL.to_string(),
        phase: Some(Phase::Created),
        ..Default::default()
    }
}

#[tokio::test]
async fn schedules_onto_the_longest_idle_worker() {
    let store = store_with_pool(&["w1", "w2"]).await;
    let (tx, cancel) = spawn_scheduler(&store, NoCapacityPolicy::Drop);

    tx.send(pending_calculation("calc-x"))
        .await
        .expect("offer calculation");

    let store_ref = &store;
    assert_eventually(
        move || async move {
            match store_ref.calculations.get(NAMESPACE, "calc-x").await {
                Ok(calc) => {
                    calc.assign.as_deref() == Some("w1")
                        && calc.meta.label(labels::ASSIGN) == Some("w1")
                }
                Err(_) => false,
            }
        },
        Duration::from_secs(5),
        "calculation should land on the longest-idle worker",
    )
    .await;

    assert_eventually(
        move || async move {
            store_ref.pools.get(NAMESPACE, POOL).await.is_ok_and(|p| {
                p.spec.workers["w1"].state == WorkerState::Reserved
                    && p.spec.workers["w2"].state == WorkerState::Available
            })
        },
        Duration::from_secs(5),
        "only the chosen worker should be reserved",
    )
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn missing_pool_drops_the_calculation() {
    let store = MemoryStore::new();
    let (tx, cancel) = spawn_scheduler(&store, NoCapacityPolicy::Drop);

    tx.send(pending_calculation("calc-x"))
        .await
        .expect("offer calculation");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let calcs = store
        .calculations
        .list(NAMESPACE, &Selector::everything())
        .await
        .expect("list calculations");
    assert!(calcs.is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn drop_policy_discards_without_capacity() {
    let store = store_with_pool(&["w1"]).await;
    set_pool_worker_state(&store, "w1", WorkerState::Reserved).await;
    let (tx, cancel) = spawn_scheduler(&store, NoCapacityPolicy::Drop);

    tx.send(pending_calculation("calc-x"))
        .await
        .expect("offer calculation");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let calcs = store
        .calculations
        .list(NAMESPACE, &Selector::everything())
        .await
        .expect("list calculations");
    assert!(calcs.is_empty());
    cancel.cancel();
}

#[tokio::test]
async fn requeue_policy_reoffers_until_capacity_frees() {
    let store = store_with_pool(&["w1"]).await;
    set_pool_worker_state(&store, "w1", WorkerState::Reserved).await;
    let (tx, cancel) = spawn_scheduler(&store, NoCapacityPolicy::Requeue { delay_ms: 20 });

    tx.send(pending_calculation("calc-x"))
        .await
        .expect("offer calculation");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.calculations.get(NAMESPACE, "calc-x").await.is_err());

    set_pool_worker_state(&store, "w1", WorkerState::Available).await;

    let store_ref = &store;
    assert_eventually(
        move || async move {
            store_ref
                .calculations
                .get(NAMESPACE, "calc-x")
                .await
                .is_ok_and(|c| c.assign.as_deref() == Some("w1"))
        },
        Duration::from_secs(5),
        "re-offered calculation should be scheduled once a worker frees up",
    )
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn existing_calculation_skips_the_reservation() {
    let store = store_with_pool(&["w1"]).await;
    store
        .calculations
        .create(pending_calculation("calc-x"))
        .await
        .expect("pre-create calculation");
    let (tx, cancel) = spawn_scheduler(&store, NoCapacityPolicy::Drop);

    tx.send(pending_calculation("calc-x"))
        .await
        .expect("offer calculation");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let pool = store.pools.get(NAMESPACE, POOL).await.expect("get pool");
    assert_eq!(pool.spec.workers["w1"].state, WorkerState::Available);
    cancel.cancel();
}
