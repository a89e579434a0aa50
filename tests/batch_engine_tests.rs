mod common;

use common::{order, orders_v2_schema, seeded_storage};
use live_migrate::batch::{CutoffStrategy, ExactCutoff};
use live_migrate::core::{ConflictPolicy, RowPredicate, Value};
use live_migrate::state::{BatchOutcome, JobStatus, MigrationJob, StateStore};
use live_migrate::storage::FaultPoint;
use live_migrate::{BatchEngine, InMemoryStateStore, SchemaMapping, StorageEngine};
use std::sync::Arc;
use std::time::Duration;

fn mapping() -> SchemaMapping {
    SchemaMapping::new("orders", "orders_v2")
        .map("id", "id")
        .map("amount", "amount")
        .map("status", "status")
        .with_constant("migration_source", "migrated")
}

async fn setup(
    n: i64,
) -> (
    Arc<live_migrate::InMemoryStorage>,
    Arc<InMemoryStateStore>,
    BatchEngine,
) {
    let storage = seeded_storage(n).await;
    storage
        .create_table(orders_v2_schema("orders_v2"))
        .await
        .unwrap();
    let state = Arc::new(InMemoryStateStore::new());
    let engine = BatchEngine::new(storage.clone(), state.clone()).with_batch_delay(Duration::ZERO);
    (storage, state, engine)
}

#[tokio::test]
async fn test_rerunning_a_copy_changes_nothing() {
    let (storage, _, engine) = setup(250).await;

    let first = engine
        .create_job(MigrationJob::new(mapping(), RowPredicate::All, 100))
        .await
        .unwrap();
    let summary = engine.run_batch_job(first.id, None, None).await.unwrap();
    assert_eq!(summary.rows_written, 250);
    let before = storage.all_rows("orders_v2").await.unwrap();

    let second = engine
        .create_job(MigrationJob::new(mapping(), RowPredicate::All, 100))
        .await
        .unwrap();
    let summary = engine.run_batch_job(second.id, None, None).await.unwrap();
    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.rows_processed, 250);
    assert_eq!(summary.rows_written, 0);
    assert_eq!(storage.all_rows("orders_v2").await.unwrap(), before);
}

#[tokio::test]
async fn test_update_policy_refreshes_changed_rows_only() {
    let (storage, _, engine) = setup(50).await;
    let job = engine
        .create_job(MigrationJob::new(mapping(), RowPredicate::All, 20))
        .await
        .unwrap();
    engine.run_batch_job(job.id, None, None).await.unwrap();

    storage
        .upsert_rows(
            "orders",
            vec![vec![Value::Integer(7), Value::Integer(1), Value::Text("paid".into())]],
            ConflictPolicy::Update,
        )
        .await
        .unwrap();
    let refresh = engine
        .create_job(
            MigrationJob::new(mapping(), RowPredicate::All, 20)
                .with_conflict_policy(ConflictPolicy::Update),
        )
        .await
        .unwrap();
    let summary = engine.run_batch_job(refresh.id, None, None).await.unwrap();
    assert_eq!(summary.rows_written, 1);
    let row = storage.get_row("orders_v2", &Value::Integer(7)).await.unwrap().unwrap();
    assert_eq!(row[2], Value::Text("paid".into()));
}

#[tokio::test]
async fn test_failed_batch_is_recorded_and_resumes_from_checkpoint() {
    let (storage, state, engine) = setup(95).await;
    let job = engine
        .create_job(MigrationJob::new(mapping(), RowPredicate::All, 30))
        .await
        .unwrap();

    storage.inject_fault(FaultPoint::Upsert, 1).unwrap();
    let err = engine.run_batch_job(job.id, None, None).await.unwrap_err();
    assert!(err.to_string().contains("injected fault"));

    let failed = state.get_job(job.id).await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.processed_rows, 30);
    assert_eq!(failed.last_processed_cursor, Some(Value::Integer(30)));
    assert!(failed.error_detail.is_some());
    assert_eq!(storage.row_count("orders_v2").await.unwrap(), 30);

    let summary = engine.run_batch_job(job.id, None, None).await.unwrap();
    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(summary.rows_processed, 65);
    assert_eq!(storage.row_count("orders_v2").await.unwrap(), 95);

    let records = state.batch_records(job.id).await.unwrap();
    let outcomes: Vec<_> = records.iter().map(|r| (r.batch_number, r.outcome)).collect();
    assert_eq!(
        outcomes,
        vec![
            (1, BatchOutcome::Succeeded),
            (2, BatchOutcome::Failed),
            (2, BatchOutcome::Succeeded),
            (3, BatchOutcome::Succeeded),
            (4, BatchOutcome::Succeeded),
        ]
    );
    assert_eq!(records[1].cursor_end, None);
    assert_eq!(records[1].cursor_start, Some(Value::Integer(30)));
}

#[tokio::test]
async fn test_checkpoint_never_moves_backwards() {
    let (_, state, engine) = setup(120).await;
    let job = engine
        .create_job(MigrationJob::new(mapping(), RowPredicate::All, 25))
        .await
        .unwrap();
    engine.run_batch_job(job.id, None, None).await.unwrap();

    let records = state.batch_records(job.id).await.unwrap();
    let ends: Vec<Value> = records.iter().filter_map(|r| r.cursor_end.clone()).collect();
    assert_eq!(ends.len(), 5);
    assert!(ends.windows(2).all(|w| w[0] < w[1]));
    for pair in records.windows(2) {
        assert_eq!(pair[1].cursor_start, pair[0].cursor_end);
    }

    let mut stored = state.get_job(job.id).await.unwrap();
    assert!(stored.advance_checkpoint(Value::Integer(10), 1).is_err());
}

#[tokio::test]
async fn test_pause_between_batches_then_resume() {
    let (storage, state, engine) = setup(60).await;
    let engine = engine.with_max_batches(2);
    let job = engine
        .create_job(MigrationJob::new(mapping(), RowPredicate::All, 10))
        .await
        .unwrap();
    engine.run_batch_job(job.id, None, None).await.unwrap();
    engine.pause_job(job.id).await.unwrap();

    let summary = engine.run_batch_job(job.id, None, None).await.unwrap();
    assert_eq!(summary.status, JobStatus::Paused);
    assert_eq!(summary.batches, 0);
    assert_eq!(storage.row_count("orders_v2").await.unwrap(), 20);

    engine.resume_job(job.id).await.unwrap();
    let engine = BatchEngine::new(storage.clone(), state.clone()).with_batch_delay(Duration::ZERO);
    let summary = engine.run_batch_job(job.id, None, None).await.unwrap();
    assert_eq!(summary.status, JobStatus::Completed);
    assert_eq!(storage.row_count("orders_v2").await.unwrap(), 60);
}

#[tokio::test]
async fn test_cutoff_splits_thousand_rows() {
    let (storage, _, engine) = setup(1000).await;
    storage
        .create_table(common::orders_schema("orders_archive"))
        .await
        .unwrap();

    let cutoff = ExactCutoff
        .select(storage.as_ref(), "orders", "id", 0.1)
        .await
        .unwrap();
    assert_eq!(cutoff.boundary, Some(Value::Integer(901)));

    let archive = engine
        .create_job(MigrationJob::new(
            SchemaMapping::by_name(
                &common::orders_schema("orders"),
                &common::orders_schema("orders_archive"),
            ),
            cutoff.archive_predicate().unwrap(),
            128,
        ))
        .await
        .unwrap();
    let migrate = engine
        .create_job(MigrationJob::new(mapping(), cutoff.retain_predicate().unwrap(), 128))
        .await
        .unwrap();
    engine.run_batch_job(archive.id, None, None).await.unwrap();
    engine.run_batch_job(migrate.id, None, None).await.unwrap();

    assert_eq!(storage.row_count("orders_archive").await.unwrap(), 900);
    assert_eq!(storage.row_count("orders_v2").await.unwrap(), 100);
    assert_eq!(
        storage.get_row("orders_v2", &Value::Integer(901)).await.unwrap().map(|r| r[1].clone()),
        Some(Value::Float(9010.0))
    );
    assert!(storage.get_row("orders_archive", &Value::Integer(900)).await.unwrap().is_some());
    assert_eq!(storage.get_row("orders", &Value::Integer(1)).await.unwrap(), Some(order(1)));
}

#[tokio::test]
async fn test_cutoff_cannot_change_after_progress() {
    let (_, _, engine) = setup(40).await;
    let engine = engine.with_max_batches(1);
    let job = engine
        .create_job(MigrationJob::new(mapping(), RowPredicate::All, 10))
        .await
        .unwrap();
    engine.run_batch_job(job.id, None, None).await.unwrap();

    let moved = RowPredicate::AtOrAfter {
        column: "id".into(),
        value: Value::Integer(20),
    };
    let err = engine
        .run_batch_job(job.id, Some(moved), None)
        .await
        .unwrap_err();
    assert!(err.is_validation());
}
