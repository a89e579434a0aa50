mod common;

use common::{order, orders_mapping, orders_plan, orders_schema, orders_v2_schema, seeded_storage};
use live_migrate::core::{RowChange, Value};
use live_migrate::state::{ControlStore, JobStatus, StateStore};
use live_migrate::storage::FaultPoint;
use live_migrate::transport::ReplicationMarker;
use live_migrate::{
    InMemoryReplicationHub, InMemoryStateStore, InMemoryStorage, MigrationPlan, MigrationRequest,
    Migrator, MigratorConfig, OperationStatus, ReplicationTransport, StorageEngine,
};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Site {
    storage: Arc<InMemoryStorage>,
    store: Arc<InMemoryStateStore>,
    transport: Arc<dyn ReplicationTransport>,
    migrator: Migrator,
}

async fn site(hub: &InMemoryReplicationHub, name: &str, partner: &str) -> Site {
    site_with_delay(hub, name, partner, Duration::ZERO).await
}

async fn site_with_delay(
    hub: &InMemoryReplicationHub,
    name: &str,
    partner: &str,
    batch_delay: Duration,
) -> Site {
    let storage = seeded_storage(1000).await;
    let store = Arc::new(InMemoryStateStore::new());
    let subscription = format!("from_{}", partner);
    let transport: Arc<dyn ReplicationTransport> = Arc::new(
        hub.register_site(name, &[subscription.clone()]).await.unwrap(),
    );
    let config = MigratorConfig::new(name)
        .partner_site(partner)
        .batch_size(128)
        .batch_delay(batch_delay)
        .readiness_poll(Duration::from_secs(10), 5)
        .subscription(&subscription);
    let migrator = Migrator::with_store(config, storage.clone(), store.clone(), transport.clone()).unwrap();
    Site {
        storage,
        store,
        transport,
        migrator,
    }
}

async fn assert_replication_open(site: &Site) {
    for subscription in site.transport.subscriptions().await.unwrap() {
        assert!(subscription.enabled, "{} left disabled", subscription.name);
    }
    let entry = site.store.control_entry("orders").await.unwrap();
    assert!(entry.map(|e| e.replication_enabled).unwrap_or(true));
}

#[tokio::test(start_paused = true)]
async fn test_two_sites_complete_the_protocol() {
    let hub = InMemoryReplicationHub::new();
    let east = site(&hub, "east", "west").await;
    let west = site(&hub, "west", "east").await;
    let id = Uuid::new_v4();

    let (coordinator, partner) = tokio::join!(
        east.migrator
            .start_coordinated_migration(MigrationRequest::coordinator(orders_plan(0.1)).with_operation_id(id)),
        west.migrator
            .start_coordinated_migration(MigrationRequest::partner(orders_plan(0.1), id)),
    );
    let coordinator = coordinator.unwrap();
    let partner = partner.unwrap();

    for (site, report) in [(&east, &coordinator), (&west, &partner)] {
        assert_eq!(report.status(), OperationStatus::Completed, "{:?}", report.operation.notes);
        assert_eq!(report.operation.phase, 8);
        assert!(report.error.is_none());
        let conservation = report.conservation.clone().unwrap();
        assert!(conservation.holds);
        assert_eq!(conservation.archived_rows, 900);
        assert_eq!(conservation.migrated_rows, 100);

        assert_eq!(site.storage.row_count("orders").await.unwrap(), 1000);
        assert_eq!(site.storage.row_count("orders_archive").await.unwrap(), 900);
        assert_eq!(site.storage.row_count("orders_v2").await.unwrap(), 100);
        assert_replication_open(site).await;
        assert!(site.store.control_entry("orders").await.unwrap().unwrap().last_sync_at.is_some());

        let phases: Vec<String> = site
            .store
            .audit_log(Some(id))
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.action == "phase")
            .map(|e| e.detail)
            .collect();
        assert_eq!(phases.first().map(String::as_str), Some("PREPARING"));
        assert_eq!(phases.last().map(String::as_str), Some("COMPLETED"));
        assert_eq!(phases.len(), 8);
    }
    assert!(coordinator.operation.is_coordinator);
    assert!(coordinator.operation.partner_ready);
    assert!(!partner.operation.is_coordinator);

    let status = east.migrator.check_status(id).await.unwrap();
    assert_eq!(status.operation.status, OperationStatus::Completed);
    assert_eq!(status.jobs.len(), 2);
    assert!(status.jobs.iter().all(|j| j.job.status == JobStatus::Completed));
    assert!(status.jobs.iter().all(|j| j.progress_percent == Some(100.0)));
}

#[tokio::test(start_paused = true)]
async fn test_partner_holds_pause_until_coordinator_pauses() {
    let hub = InMemoryReplicationHub::new();
    let east = site(&hub, "east", "west").await;
    let west = site(&hub, "west", "east").await;
    let id = Uuid::new_v4();

    let (coordinator, partner) = tokio::join!(
        east.migrator
            .start_coordinated_migration(MigrationRequest::coordinator(orders_plan(0.5)).with_operation_id(id)),
        west.migrator.start_coordinated_migration(MigrationRequest::partner(
            orders_plan(0.5).wait_for_coordinator_pause(true),
            id
        )),
    );
    assert_eq!(coordinator.unwrap().status(), OperationStatus::Completed);
    let partner = partner.unwrap();
    assert_eq!(partner.status(), OperationStatus::Completed, "{:?}", partner.operation.notes);
    assert!(partner
        .operation
        .notes
        .iter()
        .any(|n| n.contains("coordinator 'east' paused")));
}

#[tokio::test(start_paused = true)]
async fn test_absent_partner_fails_within_bounded_wait() {
    let hub = InMemoryReplicationHub::new();
    let east = site(&hub, "east", "west").await;

    let started = tokio::time::Instant::now();
    let report = east
        .migrator
        .start_coordinated_migration(MigrationRequest::coordinator(orders_plan(0.1)))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(50) && elapsed < Duration::from_secs(60), "{:?}", elapsed);
    assert_eq!(report.status(), OperationStatus::Failed);
    assert_eq!(report.operation.phase, 1);
    assert!(report.error.as_deref().unwrap().contains("partner not ready"));
    assert!(!east.storage.table_exists("orders_v2").await.unwrap());
    assert!(!east.storage.table_exists("orders_archive").await.unwrap());
    assert_replication_open(&east).await;

    let stored = east.store.get_operation(report.operation.operation_id).await.unwrap();
    assert_eq!(stored.status, OperationStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_second_coordinator_claim_is_rejected() {
    let hub = InMemoryReplicationHub::new();
    let east = site(&hub, "east", "west").await;
    let rogue = hub.register_site("west", &[]).await.unwrap();
    let id = Uuid::new_v4();
    rogue
        .emit_marker(ReplicationMarker::PartnerReady {
            operation_id: id,
            site: "west".into(),
            coordinator: true,
        })
        .await
        .unwrap();

    let report = east
        .migrator
        .start_coordinated_migration(MigrationRequest::coordinator(orders_plan(0.1)).with_operation_id(id))
        .await
        .unwrap();
    assert_eq!(report.status(), OperationStatus::Failed);
    assert!(report.error.unwrap().contains("also claims the coordinator role"));
}

#[tokio::test]
async fn test_copy_failure_reenables_replication_and_rolls_back() {
    let hub = InMemoryReplicationHub::new();
    let east = site(&hub, "east", "west").await;
    east.storage.inject_fault(FaultPoint::Upsert, 2).unwrap();

    let report = east
        .migrator
        .start_coordinated_migration(MigrationRequest::coordinator(orders_plan(0.1)).wait_for_partner(false))
        .await
        .unwrap();

    assert_eq!(report.status(), OperationStatus::RolledBack, "{:?}", report.operation.notes);
    assert_eq!(report.operation.phase, 5);
    assert!(report.error.unwrap().contains("injected fault"));
    assert!(!east.storage.table_exists("orders_v2").await.unwrap());
    assert!(!east.storage.table_exists("orders_archive").await.unwrap());
    assert!(east.storage.observers("orders").await.unwrap().is_empty());
    assert_eq!(east.storage.row_count("orders").await.unwrap(), 1000);
    assert_replication_open(&east).await;

    let jobs = east.store.jobs_for_operation(report.operation.operation_id).await.unwrap();
    assert!(!jobs.is_empty());
    assert!(jobs.iter().all(|j| j.status == JobStatus::Failed));
}

#[tokio::test]
async fn test_unreachable_subscription_control_leaves_operation_failed() {
    let hub = InMemoryReplicationHub::new();
    let east = site(&hub, "east", "west").await;
    hub.reject_subscription_changes("east", true).await.unwrap();

    let report = east
        .migrator
        .start_coordinated_migration(MigrationRequest::coordinator(orders_plan(0.1)).wait_for_partner(false))
        .await
        .unwrap();

    assert_eq!(report.status(), OperationStatus::Failed);
    assert!(report.operation.notes.iter().any(|n| n.contains("re-enable of 'from_west' failed")));
    assert!(!east.storage.table_exists("orders_v2").await.unwrap());
}

#[tokio::test]
async fn test_protocol_cutover_swaps_and_detaches_capture() {
    let hub = InMemoryReplicationHub::new();
    let east = site(&hub, "east", "west").await;

    let report = east
        .migrator
        .start_coordinated_migration(
            MigrationRequest::coordinator(orders_plan(0.1).with_cutover(true)).wait_for_partner(false),
        )
        .await
        .unwrap();

    assert_eq!(report.status(), OperationStatus::Completed, "{:?}", report.operation.notes);
    let switch = report.switch.unwrap();
    assert!(switch.is_completed());
    assert_eq!(
        east.storage.table_schema("orders").await.unwrap(),
        orders_v2_schema("orders_v2").renamed("orders")
    );
    assert_eq!(east.storage.row_count("orders").await.unwrap(), 100);
    assert_eq!(east.storage.row_count(&switch.backup_name).await.unwrap(), 1000);
    assert!(east.storage.observers(&switch.backup_name).await.unwrap().is_empty());
    assert!(east.storage.observers("orders").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_operation_id_cannot_be_reused() {
    let hub = InMemoryReplicationHub::new();
    let east = site(&hub, "east", "west").await;
    let id = Uuid::new_v4();
    let request = MigrationRequest::coordinator(orders_plan(0.1))
        .with_operation_id(id)
        .wait_for_partner(false);

    let first = east.migrator.start_coordinated_migration(request.clone()).await.unwrap();
    assert_eq!(first.status(), OperationStatus::Completed);
    let err = east.migrator.start_coordinated_migration(request).await.unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test(start_paused = true)]
async fn test_live_writes_during_copy_keep_rows_conserved() {
    let hub = InMemoryReplicationHub::new();
    let east = site_with_delay(&hub, "east", "west", Duration::from_millis(100)).await;

    let writes = async {
        // The archive job has copied its first chunk by now; the migrate job has not started.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let changes = [
            RowChange::delete("orders", order(1), "east"),
            RowChange::update(
                "orders",
                order(5),
                vec![Value::Integer(5), Value::Integer(555), Value::Text("paid".into())],
                "east",
            ),
            RowChange::insert("orders", order(1001), "east"),
            RowChange::update(
                "orders",
                order(950),
                vec![Value::Integer(950), Value::Integer(9), Value::Text("paid".into())],
                "east",
            ),
            RowChange::delete("orders", order(999), "east"),
        ];
        for change in changes {
            east.storage.apply_change(change).await.unwrap();
        }
    };
    let (report, ()) = tokio::join!(
        east.migrator.start_coordinated_migration(
            MigrationRequest::coordinator(orders_plan(0.1)).wait_for_partner(false)
        ),
        writes,
    );
    let report = report.unwrap();

    assert_eq!(report.status(), OperationStatus::Completed, "{:?}", report.operation.notes);
    let conservation = report.conservation.unwrap();
    assert!(conservation.holds);
    assert_eq!(conservation.source_rows, 1000);
    assert_eq!(conservation.changed_keys, 5);
    assert_eq!(conservation.archived_rows, 898);
    assert_eq!(conservation.migrated_rows, 98);

    assert_eq!(east.storage.row_count("orders").await.unwrap(), 999);
    let updated = east.storage.get_row("orders_v2", &Value::Integer(950)).await.unwrap().unwrap();
    assert_eq!(updated[1], Value::Float(9.0));
    assert!(east.storage.get_row("orders_v2", &Value::Integer(1001)).await.unwrap().is_some());
    assert!(east.storage.get_row("orders_v2", &Value::Integer(999)).await.unwrap().is_none());
    assert!(east.storage.observers("orders").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_null_ordering_values_fail_before_any_relation_exists() {
    let hub = InMemoryReplicationHub::new();
    let east = site(&hub, "east", "west").await;
    east.storage
        .apply_change(RowChange::update(
            "orders",
            order(40),
            vec![Value::Integer(40), Value::Null, Value::Text("new".into())],
            "east",
        ))
        .await
        .unwrap();
    let plan = MigrationPlan::new("orders", orders_v2_schema("orders_v2"), orders_mapping(), "amount", 0.1);

    let report = east
        .migrator
        .start_coordinated_migration(MigrationRequest::coordinator(plan).wait_for_partner(false))
        .await
        .unwrap();

    assert_eq!(report.status(), OperationStatus::Failed);
    assert_eq!(report.operation.phase, 1);
    assert!(report.error.unwrap().contains("1 NULL value"));
    assert!(!east.storage.table_exists("orders_v2").await.unwrap());
    assert!(!east.storage.table_exists("orders_archive").await.unwrap());
    assert_replication_open(&east).await;
}

#[tokio::test]
async fn test_failure_after_cutover_restores_legacy_and_drops_archive() {
    let hub = InMemoryReplicationHub::new();
    let east = site(&hub, "east", "west").await;
    // The pause goes through; resuming the subscription fails once.
    hub.fail_subscription_change("east", 1).await.unwrap();

    let report = east
        .migrator
        .start_coordinated_migration(
            MigrationRequest::coordinator(orders_plan(0.1).with_cutover(true)).wait_for_partner(false),
        )
        .await
        .unwrap();

    assert_eq!(report.status(), OperationStatus::RolledBack, "{:?}", report.operation.notes);
    assert!(report.switch.unwrap().is_completed());
    assert!(report.error.unwrap().contains("injected fault"));

    assert_eq!(east.storage.table_schema("orders").await.unwrap(), orders_schema("orders"));
    assert_eq!(east.storage.row_count("orders").await.unwrap(), 1000);
    assert!(!east.storage.table_exists("orders_archive").await.unwrap());
    let tables = east.storage.list_tables().await.unwrap();
    let parked: Vec<&String> = tables.iter().filter(|t| t.starts_with("orders_rolled_back_")).collect();
    assert_eq!(parked.len(), 1);
    assert_eq!(east.storage.row_count(parked[0]).await.unwrap(), 100);
    assert!(!tables.iter().any(|t| t.starts_with("orders_backup_")));
    assert!(east.storage.observers("orders").await.unwrap().is_empty());
    assert!(report.operation.notes.iter().any(|n| n.contains("dropped 'orders_archive'")));
    assert_replication_open(&east).await;
}
