mod common;

use common::{orders_schema, orders_v2_schema, seeded_storage_with};
use live_migrate::core::{Column, DataType, ForeignKey, TableSchema, Value};
use live_migrate::cutover::{SwitchReport, backup_name, parse_backup_timestamp};
use live_migrate::storage::FaultPoint;
use live_migrate::{CutoverEngine, InMemoryStorage, StorageEngine, SwitchStatus};
use std::sync::Arc;

/// `orders` (3 rows), `orders_v2` (2 rows) and `invoices` referencing `orders`.
async fn layout(transactional_ddl: bool) -> Arc<InMemoryStorage> {
    let storage = seeded_storage_with(InMemoryStorage::with_transactional_ddl(transactional_ddl), 3).await;
    storage.create_table(orders_v2_schema("orders_v2")).await.unwrap();
    storage
        .insert_rows(
            "orders_v2",
            vec![
                vec![Value::Integer(1), Value::Float(10.0), Value::Null, Value::Null, Value::Null],
                vec![Value::Integer(2), Value::Float(20.0), Value::Null, Value::Null, Value::Null],
            ],
        )
        .await
        .unwrap();
    storage
        .create_table(
            TableSchema::new(
                "invoices",
                vec![
                    Column::new("id", DataType::Integer).not_null(),
                    Column::new("order_id", DataType::Integer),
                ],
                "id",
            )
            .unwrap(),
        )
        .await
        .unwrap();
    storage
        .add_foreign_key(ForeignKey::new("fk_invoice_order", "invoices", "order_id", "orders", "id"))
        .await
        .unwrap();
    storage
}

async fn invoice_target(storage: &InMemoryStorage) -> String {
    storage
        .foreign_keys()
        .await
        .unwrap()
        .into_iter()
        .find(|fk| fk.name == "fk_invoice_order")
        .map(|fk| fk.referenced_table)
        .unwrap()
}

async fn assert_untouched(storage: &InMemoryStorage, report: &SwitchReport) {
    assert_eq!(report.status, SwitchStatus::RolledBack, "{:?}", report);
    assert!(report.error.is_some());
    assert_eq!(storage.row_count("orders").await.unwrap(), 3);
    assert_eq!(storage.row_count("orders_v2").await.unwrap(), 2);
    assert!(!storage.table_exists(&report.backup_name).await.unwrap());
    assert_eq!(invoice_target(storage).await, "orders");
    let mut tables = storage.list_tables().await.unwrap();
    tables.sort();
    assert_eq!(tables, vec!["invoices", "orders", "orders_v2"]);
}

#[tokio::test]
async fn test_switch_swaps_names_and_repoints_dependents() {
    let storage = layout(true).await;
    let engine = CutoverEngine::new(storage.clone());
    let report = engine
        .atomic_switch("orders", "orders_v2", "backup", false)
        .await
        .unwrap();

    assert!(report.is_completed());
    assert_eq!(report.steps_completed, 4);
    assert_eq!(report.foreign_keys_repointed, 1);
    assert!(report.backup_name.starts_with("orders_backup_"));
    assert!(parse_backup_timestamp(&report.backup_name).is_some());

    assert_eq!(storage.table_schema("orders").await.unwrap(), orders_v2_schema("orders_v2").renamed("orders"));
    assert_eq!(storage.row_count("orders").await.unwrap(), 2);
    assert_eq!(storage.row_count(&report.backup_name).await.unwrap(), 3);
    assert!(!storage.table_exists("orders_v2").await.unwrap());
    assert_eq!(invoice_target(&storage).await, "orders");
}

#[tokio::test]
async fn test_fault_at_every_step_rolls_back() {
    let faults = [
        (FaultPoint::RenameTable, 0),
        (FaultPoint::RenameTable, 1),
        (FaultPoint::DropForeignKey, 0),
        (FaultPoint::AddForeignKey, 0),
        (FaultPoint::CommitDdl, 0),
    ];
    for transactional in [true, false] {
        for (point, skip) in faults {
            let storage = layout(transactional).await;
            storage.inject_fault(point, skip).unwrap();
            let engine = CutoverEngine::new(storage.clone());
            let report = engine
                .atomic_switch("orders", "orders_v2", "backup", false)
                .await
                .unwrap();
            assert!(!report.is_completed(), "{:?}/{} transactional={}", point, skip, transactional);
            assert_untouched(&storage, &report).await;
        }
    }
}

#[tokio::test]
async fn test_failed_unwind_is_reported_partial() {
    let storage = layout(false).await;
    // Both swap renames succeed, commit fails, and the first unwind rename fails.
    storage.inject_fault(FaultPoint::CommitDdl, 0).unwrap();
    storage.inject_fault(FaultPoint::RenameTable, 2).unwrap();
    let engine = CutoverEngine::new(storage.clone());
    let report = engine
        .atomic_switch("orders", "orders_v2", "backup", false)
        .await
        .unwrap();
    assert_eq!(report.status, SwitchStatus::RollbackPartial);
    assert!(!report.manual_intervention.is_empty());
}

#[tokio::test]
async fn test_preconditions_fail_without_changes() {
    let storage = layout(true).await;
    let engine = CutoverEngine::new(storage.clone());

    assert!(engine.atomic_switch("orders", "orders", "backup", false).await.unwrap_err().is_validation());
    assert!(engine.atomic_switch("orders", "missing", "backup", false).await.unwrap_err().is_validation());
    assert!(engine.atomic_switch("orders", "orders_v2", " ", false).await.unwrap_err().is_validation());

    storage.set_accepts_writes(false);
    let err = engine.atomic_switch("orders", "orders_v2", "backup", false).await.unwrap_err();
    assert!(err.is_validation());
    assert!(engine.atomic_switch("orders", "orders_v2", "backup", true).await.unwrap().is_completed());
}

#[tokio::test]
async fn test_operator_rollback_restores_legacy_relation() {
    let storage = layout(true).await;
    let engine = CutoverEngine::new(storage.clone());
    let switched = engine
        .atomic_switch("orders", "orders_v2", "backup", false)
        .await
        .unwrap();

    let restored = engine
        .rollback("orders", &switched.backup_name, false)
        .await
        .unwrap();
    assert!(restored.is_completed());
    assert!(restored.backup_name.starts_with("orders_rolled_back_"));
    assert_eq!(storage.table_schema("orders").await.unwrap(), orders_schema("orders"));
    assert_eq!(storage.row_count("orders").await.unwrap(), 3);
    assert_eq!(storage.row_count(&restored.backup_name).await.unwrap(), 2);
    assert!(!storage.table_exists(&switched.backup_name).await.unwrap());
    assert_eq!(invoice_target(&storage).await, "orders");
}

#[tokio::test]
async fn test_cleanup_drops_only_expired_backups() {
    let storage = layout(true).await;
    let now = chrono::Utc::now();
    let old = backup_name("orders", "backup", now - chrono::Duration::days(10));
    let fresh = backup_name("orders", "backup", now - chrono::Duration::hours(1));
    for name in [&old, &fresh] {
        storage.create_table(orders_schema(name)).await.unwrap();
    }
    storage.create_table(orders_schema("orders_backup_manual")).await.unwrap();
    let engine = CutoverEngine::new(storage.clone());

    let preview = engine
        .cleanup_old_backups("orders_backup_%", chrono::Duration::days(7), true)
        .await
        .unwrap();
    assert_eq!(preview.expired.iter().map(|b| b.name.clone()).collect::<Vec<_>>(), vec![old.clone()]);
    assert!(preview.dropped.is_empty());
    assert!(storage.table_exists(&old).await.unwrap());

    let report = engine
        .cleanup_old_backups("orders_backup_%", chrono::Duration::days(7), false)
        .await
        .unwrap();
    assert_eq!(report.dropped, vec![old.clone()]);
    assert!(!storage.table_exists(&old).await.unwrap());
    assert!(storage.table_exists(&fresh).await.unwrap());
    assert!(storage.table_exists("orders_backup_manual").await.unwrap());
    assert!(storage.table_exists("orders").await.unwrap());

    assert!(engine
        .cleanup_old_backups("orders_backup_%", chrono::Duration::days(-1), false)
        .await
        .is_err());
}
