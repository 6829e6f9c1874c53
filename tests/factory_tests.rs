//! Integration tests for the bulk factory reconciler.


use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use calc_dispatch::dispatcher::factory::FactoryController;
use calc_dispatch::model::{labels, Calculation, CalculationBulkFactory, FactoryStatus, ObjectMeta};
use calc_dispatch::store::MemoryStore;

use test_harness::{
    assert_eventually, bulk_with_members, test_dispatcher_config, NAMESPACE, POOL,
};

fn spawn_controller(
    store: &MemoryStore,
    shared_root: &Path,
) -> (mpsc::Receiver<Calculation>, CancellationToken) {
    let mut config = test_dispatcher_config();
    config.shared_root = shared_root.to_path_buf();
    let (tx, rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let controller = FactoryController::new(store.clone(), &config, tx);
    tokio::spawn(controller.run(cancel.clone()));
    (rx, cancel)
}

fn test_factory(completed: bool) -> CalculationBulkFactory {
    CalculationBulkFactory {
        meta: ObjectMeta::new(NAMESPACE, "vega"),
        worker_pool: POOL.to_string(),
        root_folder: "runs/vega".to_string(),
        bulk_output: "bulk.yaml".to_string(),
        command: "generate_bulk".to_string(),
        args: vec!["--grid".to_string()],
        status: FactoryStatus {
            completion_time: completed.then(Utc::now),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn offers_generation_calculation_until_complete() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = MemoryStore::new();
    let (mut rx, cancel) = spawn_controller(&store, dir.path());

    store
        .factories
        .create(test_factory(false))
        .await
        .expect("create factory");

    let calc = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no calculation offered within timeout")
        .expect("scheduling channel closed");
    assert_eq!(calc.meta.name, "calc-factory-vega");
    assert_eq!(calc.meta.label(labels::FACTORY), Some("vega"));
    assert_eq!(calc.spec.steps.len(), 1);
    assert_eq!(calc.spec.steps[0].command, "generate_bulk");
    assert_eq!(calc.spec.steps[0].args, vec!["--grid"]);
    cancel.cancel();
}

#[tokio::test]
async fn decodes_output_file_into_a_bulk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out_dir = dir.path().join("runs/vega");
    std::fs::create_dir_all(&out_dir).expect("create output dir");
    let bulk = bulk_with_members("vega-bulk", 2);
    std::fs::write(
        out_dir.join("bulk.yaml"),
        serde_yaml::to_string(&bulk).expect("encode bulk"),
    )
    .expect("write bulk output");

    let store = MemoryStore::new();
    let (_rx, cancel) = spawn_controller(&store, dir.path());

    store
        .factories
        .create(test_factory(true))
        .await
        .expect("create factory");

    let store_ref = &store;
    assert_eventually(
        move || async move {
            let bulk_exists = store_ref.bulks.get(NAMESPACE, "vega-bulk").await.is_ok();
            let flagged = store_ref
                .factories
                .get(NAMESPACE, "vega")
                .await
                .is_ok_and(|f| f.status.bulk_created);
            bulk_exists && flagged
        },
        Duration::from_secs(5),
        "bulk should be created and the factory flagged",
    )
    .await;

    let created = store
        .bulks
        .get(NAMESPACE, "vega-bulk")
        .await
        .expect("get bulk");
    assert_eq!(created.calculations.len(), 2);
    assert_eq!(created.worker_pool, POOL);
    cancel.cancel();
}

#[tokio::test]
async fn undecodable_output_means_not_ready() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out_dir = dir.path().join("runs/vega");
    std::fs::create_dir_all(&out_dir).expect("create output dir");
    std::fs::write(out_dir.join("bulk.yaml"), "::: not a bulk [").expect("write garbage");

    let store = MemoryStore::new();
    let (_rx, cancel) = spawn_controller(&store, dir.path());

    store
        .factories
        .create(test_factory(true))
        .await
        .expect("create factory");

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.bulks.get(NAMESPACE, "vega-bulk").await.is_err());
    let factory = store
        .factories
        .get(NAMESPACE, "vega")
        .await
        .expect("get factory");
    assert!(!factory.status.bulk_created);
    cancel.cancel();
}

#[tokio::test]
async fn existing_bulk_is_tolerated() {
    let dir = tempfile::tempdir().expect("tempdir");
    let out_dir = dir.path().join("runs/vega");
    std::fs::create_dir_all(&out_dir).expect("create output dir");
    let bulk = bulk_with_members("vega-bulk", 1);
    std::fs::write(
        out_dir.join("bulk.yaml"),
        serde_yaml::to_string(&bulk).expect("encode bulk"),
    )
    .expect("write bulk output");

    let store = MemoryStore::new();
    store
        .bulks
        .create(bulk_with_members("vega-bulk", 1))
        .await
        .expect("pre-create bulk");
    let (_rx, cancel) = spawn_controller(&store, dir.path());

    store
        .factories
        .create(test_factory(true))
        .await
        .expect("create factory");

    let store_ref = &store;
    assert_eventually(
        move || async move {
            store_ref
                .factories
                .get(NAMESPACE, "vega")
                .await
                .is_ok_and(|f| f.status.bulk_created)
        },
        Duration::from_secs(5),
        "factory should be flagged even when the bulk already exists",
    )
    .await;
    cancel.cancel();
}
