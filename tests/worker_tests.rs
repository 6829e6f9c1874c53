//! Integration tests for the worker-side agent: registrar heartbeats, the
//! controller driving assigned calculations, and the result updater.


use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use calc_dispatch::model::{Phase, Step, WorkerPool, WorkerState};
use calc_dispatch::store::MemoryStore;
use calc_dispatch::worker::{
    CalcError, Registrar, ResultUpdater, StepResult, WorkerAgent, WorkerController,
};

use test_harness::{
    assert_eventually, assigned_calculation, set_pool_worker_state, store_with_pool,
    test_worker_config, NAMESPACE, POOL,
};

fn finished_step(status: Phase) -> Step {
    let mut step = Step::new("atlas12_ada", &["s"]);
    step.status = Some(status);
    step
}

#[tokio::test]
async fn registrar_registers_and_deregisters() {
    let store = MemoryStore::new();
    store
        .pools
        .create(WorkerPool::new(NAMESPACE, POOL))
        .await
        .expect("create pool");

    let registrar = Registrar::new(store.clone(), test_worker_config("w1"));
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { registrar.run(run_cancel).await });

    let store_ref = &store;
    assert_eventually(
        move || async move {
            store_ref.pools.get(NAMESPACE, POOL).await.is_ok_and(|p| {
                p.spec
                    .workers
                    .get("w1")
                    .is_some_and(|w| w.state == WorkerState::Available)
            })
        },
        Duration::from_secs(5),
        "heartbeat should register the node as Available",
    )
    .await;

    cancel.cancel();
    handle
        .await
        .expect("registrar task")
        .expect("registrar run");

    let pool = store.pools.get(NAMESPACE, POOL).await.expect("get pool");
    assert!(!pool.spec.workers.contains_key("w1"));
}

#[tokio::test]
async fn heartbeat_forces_the_entry_back_to_available() {
    let store = store_with_pool(&["w1"]).await;
    set_pool_worker_state(&store, "w1", WorkerState::Unknown).await;

    let registrar = Registrar::new(store.clone(), test_worker_config("w1"));
    registrar.heartbeat().await.expect("heartbeat");

    let pool = store.pools.get(NAMESPACE, POOL).await.expect("get pool");
    assert_eq!(pool.spec.workers["w1"].state, WorkerState::Available);
}

#[tokio::test]
async fn heartbeat_without_a_pool_is_skipped() {
    let store = MemoryStore::new();
    let registrar = Registrar::new(store.clone(), test_worker_config("w1"));
    registrar.heartbeat().await.expect("heartbeat");
    assert!(store.pools.get(NAMESPACE, POOL).await.is_err());
}

#[tokio::test]
async fn controller_hands_created_calculation_to_the_executor() {
    let store = store_with_pool(&["w1"]).await;
    let config = test_worker_config("w1");
    let (execute_tx, mut execute_rx) = mpsc::channel(1);
    let controller = WorkerController::new(store.clone(), &config, execute_tx);
    let cancel = CancellationToken::new();
    tokio::spawn(controller.run(cancel.clone()));

    store
        .calculations
        .create(assigned_calculation("calc-x", "w1", Phase::Created))
        .await
        .expect("create calculation");

    let handed = tokio::time::timeout(Duration::from_secs(5), execute_rx.recv())
        .await
        .expect("no calculation handed over within timeout")
        .expect("executor channel closed");
    assert_eq!(handed.meta.name, "calc-x");

    let store_ref = &store;
    assert_eventually(
        move || async move {
            let started = store_ref
                .calculations
                .get(NAMESPACE, "calc-x")
                .await
                .is_ok_and(|c| {
                    c.phase == Some(Phase::Processing) && c.status.pending_time.is_some()
                });
            let slot_taken = store_ref
                .pools
                .get(NAMESPACE, POOL)
                .await
                .is_ok_and(|p| p.spec.workers["w1"].state == WorkerState::Processing);
            started && slot_taken
        },
        Duration::from_secs(5),
        "calculation should move to Processing and claim the pool slot",
    )
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn controller_finalizes_and_releases_the_slot() {
    let store = store_with_pool(&["w1"]).await;
    set_pool_worker_state(&store, "w1", WorkerState::Processing).await;

    let config = test_worker_config("w1");
    let (execute_tx, _execute_rx) = mpsc::channel(1);
    let controller = WorkerController::new(store.clone(), &config, execute_tx);
    let cancel = CancellationToken::new();
    tokio::spawn(controller.run(cancel.clone()));

    let mut calc = assigned_calculation("calc-x", "w1", Phase::Processing);
    calc.spec.steps = vec![finished_step(Phase::Completed)];
    store
        .calculations
        .create(calc)
        .await
        .expect("create calculation");

    let store_ref = &store;
    assert_eventually(
        move || async move {
            let finished = store_ref
                .calculations
                .get(NAMESPACE, "calc-x")
                .await
                .is_ok_and(|c| {
                    c.phase == Some(Phase::Completed) && c.status.completion_time.is_some()
                });
            let slot_released = store_ref.pools.get(NAMESPACE, POOL).await.is_ok_and(|p| {
                let worker = &p.spec.workers["w1"];
                worker.state == WorkerState::Available && worker.calculations_processed == 1
            });
            finished && slot_released
        },
        Duration::from_secs(5),
        "calculation should finalize and the slot should be released",
    )
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn result_updater_records_steps_and_failures() {
    let store = MemoryStore::new();
    let mut calc = assigned_calculation("calc-x", "w1", Phase::Processing);
    calc.spec.steps = vec![Step::new("atlas12_ada", &["s"]), Step::new("atlas12_ada", &["r"])];
    store
        .calculations
        .create(calc)
        .await
        .expect("create calculation");

    let updater = ResultUpdater::new(store.clone(), &test_worker_config("w1"));
    let (step_tx, step_rx) = mpsc::channel(8);
    let (error_tx, error_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    tokio::spawn(async move { updater.run(step_rx, error_rx, run_cancel).await });

    step_tx
        .send(StepResult {
            calc_name: "calc-x".to_string(),
            step: 0,
            status: Phase::Completed,
        })
        .await
        .expect("send step result");

    let store_ref = &store;
    assert_eventually(
        move || async move {
            store_ref
                .calculations
                .get(NAMESPACE, "calc-x")
                .await
                .is_ok_and(|c| c.spec.steps[0].status == Some(Phase::Completed))
        },
        Duration::from_secs(5),
        "step result should be recorded on the calculation",
    )
    .await;

    error_tx
        .send(CalcError {
            calc_name: "calc-x".to_string(),
            error: "atlas core dumped".to_string(),
        })
        .await
        .expect("send calc error");

    assert_eventually(
        move || async move {
            store_ref
                .calculations
                .get(NAMESPACE, "calc-x")
                .await
                .is_ok_and(|c| {
                    c.phase == Some(Phase::Failed) && c.status.completion_time.is_some()
                })
        },
        Duration::from_secs(5),
        "executor failure should fail the calculation",
    )
    .await;
    cancel.cancel();
}

#[tokio::test]
async fn worker_agent_runs_a_calculation_end_to_end() {
    let store = MemoryStore::new();
    let (agent, mut channels) = WorkerAgent::new(store.clone(), test_worker_config("w1"));
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move { agent.run(run_cancel).await });

    // The agent creates its pool and the registrar announces the node.
    let store_ref = &store;
    assert_eventually(
        move || async move {
            store_ref
                .pools
                .get(NAMESPACE, POOL)
                .await
                .is_ok_and(|p| p.spec.workers.contains_key("w1"))
        },
        Duration::from_secs(5),
        "agent should create the pool and register itself",
    )
    .await;

    let mut calc = assigned_calculation("calc-x", "w1", Phase::Created);
    calc.spec.steps = vec![Step::new("atlas12_ada", &["s"])];
    store
        .calculations
        .create(calc)
        .await
        .expect("create calculation");

    let handed = tokio::time::timeout(Duration::from_secs(5), channels.calculations.recv())
        .await
        .expect("no calculation handed over within timeout")
        .expect("executor channel closed");
    assert_eq!(handed.meta.name, "calc-x");

    channels
        .step_results
        .send(StepResult {
            calc_name: "calc-x".to_string(),
            step: 0,
            status: Phase::Completed,
        })
        .await
        .expect("report step result");

    assert_eventually(
        move || async move {
            let finished = store_ref
                .calculations
                .get(NAMESPACE, "calc-x")
                .await
                .is_ok_and(|c| c.phase == Some(Phase::Completed));
            let counted = store_ref.pools.get(NAMESPACE, POOL).await.is_ok_and(|p| {
                p.spec
                    .workers
                    .get("w1")
                    .is_some_and(|w| w.calculations_processed == 1)
            });
            finished && counted
        },
        Duration::from_secs(5),
        "agent should finalize the calculation and count it",
    )
    .await;

    cancel.cancel();
    handle.await.expect("agent task").expect("agent run");

    // Graceful shutdown removes the pool entry.
    let pool = store.pools.get(NAMESPACE, POOL).await.expect("get pool");
    assert!(!pool.spec.workers.contains_key("w1"));
}
