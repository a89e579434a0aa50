#![allow(dead_code)]

use live_migrate::core::{Column, DataType, Row, TableSchema, Value};
use live_migrate::{InMemoryStorage, MigrationPlan, SchemaMapping, StorageEngine};
use std::sync::Arc;

/// Legacy layout: `id` is both key and ordering column.
pub fn orders_schema(name: &str) -> TableSchema {
    TableSchema::new(
        name,
        vec![
            Column::new("id", DataType::Integer).not_null(),
            Column::new("amount", DataType::Integer),
            Column::new("status", DataType::Text),
        ],
        "id",
    )
    .unwrap()
}

/// Replacement layout: widened amount plus provenance and migration tag.
pub fn orders_v2_schema(name: &str) -> TableSchema {
    TableSchema::new(
        name,
        vec![
            Column::new("id", DataType::Integer).not_null(),
            Column::new("amount", DataType::Float),
            Column::new("status", DataType::Text),
            Column::new("origin_site", DataType::Text),
            Column::new("migration_source", DataType::Text),
        ],
        "id",
    )
    .unwrap()
}

pub fn order(id: i64) -> Row {
    vec![
        Value::Integer(id),
        Value::Integer(id * 10),
        Value::Text("new".into()),
    ]
}

pub fn orders_mapping() -> SchemaMapping {
    SchemaMapping::new("orders", "orders_v2")
        .map("id", "id")
        .map("amount", "amount")
        .map("status", "status")
}

pub fn orders_plan(retention: f64) -> MigrationPlan {
    MigrationPlan::new(
        "orders",
        orders_v2_schema("orders_v2"),
        orders_mapping(),
        "id",
        retention,
    )
}

/// Storage holding `orders` with ids `1..=n`.
pub async fn seeded_storage(n: i64) -> Arc<InMemoryStorage> {
    seeded_storage_with(InMemoryStorage::new(), n).await
}

pub async fn seeded_storage_with(storage: InMemoryStorage, n: i64) -> Arc<InMemoryStorage> {
    let storage = Arc::new(storage);
    storage.create_table(orders_schema("orders")).await.unwrap();
    storage
        .insert_rows("orders", (1..=n).map(order).collect())
        .await
        .unwrap();
    storage
}
