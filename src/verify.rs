//! Post-migration consistency: row count plus an order-stable checksum.

use crate::batch::mapping::SchemaMapping;
use crate::core::{Result, RowPredicate, Value};
use crate::storage::StorageEngine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDigest {
    pub table: String,
    pub rows: u64,
    /// Hex SHA-256 over the selected columns of every row, in key order.
    pub checksum: String,
}

/// Which columns of which rows must agree between two relations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyCheck {
    pub source_table: String,
    pub target_table: String,
    /// (source column, target column), compared in this order.
    pub column_pairs: Vec<(String, String)>,
    pub source_predicate: RowPredicate,
    pub target_predicate: RowPredicate,
}

impl ConsistencyCheck {
    pub fn from_mapping(mapping: &SchemaMapping) -> Self {
        Self {
            source_table: mapping.source_table.clone(),
            target_table: mapping.target_table.clone(),
            column_pairs: mapping
                .columns
                .iter()
                .map(|c| (c.source.clone(), c.target.clone()))
                .collect(),
            source_predicate: RowPredicate::All,
            target_predicate: RowPredicate::All,
        }
    }

    pub fn source_rows(mut self, predicate: RowPredicate) -> Self {
        self.source_predicate = predicate;
        self
    }

    pub fn target_rows(mut self, predicate: RowPredicate) -> Self {
        self.target_predicate = predicate;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub source: RelationDigest,
    pub target: RelationDigest,
    pub columns: Vec<(String, String)>,
    pub consistent: bool,
    pub mismatch: Option<String>,
}

/// Digests `columns` of the rows of `table` matching `predicate`.
pub async fn relation_digest(
    storage: &dyn StorageEngine,
    table: &str,
    columns: &[String],
    predicate: &RowPredicate,
) -> Result<RelationDigest> {
    let schema = storage.table_schema(table).await?;
    let indexes = columns
        .iter()
        .map(|c| schema.column_index(c))
        .collect::<Result<Vec<_>>>()?;
    let key_index = schema.key_index();

    let mut hasher = Sha256::new();
    let mut rows = 0u64;
    let mut cursor: Option<Value> = None;
    let mut buf = Vec::new();
    loop {
        let page = storage
            .scan_after(table, cursor.as_ref(), PAGE_SIZE, predicate)
            .await?;
        let Some(last) = page.last() else {
            break;
        };
        cursor = Some(last[key_index].clone());
        for row in &page {
            buf.clear();
            for idx in &indexes {
                row[*idx].canonical_bytes(&mut buf);
            }
            hasher.update(&buf);
            rows += 1;
        }
    }
    Ok(RelationDigest {
        table: table.to_string(),
        rows,
        checksum: hex::encode(hasher.finalize()),
    })
}

pub async fn verify_consistency(
    storage: &dyn StorageEngine,
    check: &ConsistencyCheck,
) -> Result<ConsistencyReport> {
    let (source_columns, target_columns): (Vec<String>, Vec<String>) =
        check.column_pairs.iter().cloned().unzip();
    let source = relation_digest(
        storage,
        &check.source_table,
        &source_columns,
        &check.source_predicate,
    )
    .await?;
    let target = relation_digest(
        storage,
        &check.target_table,
        &target_columns,
        &check.target_predicate,
    )
    .await?;

    let mismatch = if source.rows != target.rows {
        Some(format!(
            "row count differs: '{}' has {}, '{}' has {}",
            source.table, source.rows, target.table, target.rows
        ))
    } else if source.checksum != target.checksum {
        Some("row contents differ".to_string())
    } else {
        None
    };
    Ok(ConsistencyReport {
        consistent: mismatch.is_none(),
        mismatch,
        columns: check.column_pairs.clone(),
        source,
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, ConflictPolicy, DataType, TableSchema};
    use crate::storage::InMemoryStorage;

    async fn pair() -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        storage
            .create_table(
                TableSchema::new(
                    "a",
                    vec![
                        Column::new("id", DataType::Integer).not_null(),
                        Column::new("v", DataType::Integer),
                    ],
                    "id",
                )
                .unwrap(),
            )
            .await
            .unwrap();
        storage
            .create_table(
                TableSchema::new(
                    "b",
                    vec![
                        Column::new("id", DataType::Integer).not_null(),
                        Column::new("v", DataType::Float),
                        Column::new("tag", DataType::Text),
                    ],
                    "id",
                )
                .unwrap(),
            )
            .await
            .unwrap();
        let rows: Vec<_> = (1..=1500).map(|i| vec![Value::Integer(i), Value::Integer(i * 2)]).collect();
        storage.insert_rows("a", rows).await.unwrap();
        let widened: Vec<_> = (1..=1500)
            .map(|i| vec![Value::Integer(i), Value::Float((i * 2) as f64), Value::Null])
            .collect();
        storage.insert_rows("b", widened).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_widened_copy_is_consistent() {
        let storage = pair().await;
        let check = ConsistencyCheck::from_mapping(&SchemaMapping::new("a", "b").map("id", "id").map("v", "v"));
        let report = verify_consistency(&storage, &check).await.unwrap();
        assert!(report.consistent, "{:?}", report.mismatch);
        assert_eq!(report.source.rows, 1500);
    }

    #[tokio::test]
    async fn test_changed_value_is_detected() {
        let storage = pair().await;
        storage
            .upsert_rows(
                "b",
                vec![vec![Value::Integer(700), Value::Float(1.5), Value::Null]],
                ConflictPolicy::Update,
            )
            .await
            .unwrap();
        let check = ConsistencyCheck::from_mapping(&SchemaMapping::new("a", "b").map("id", "id").map("v", "v"));
        let report = verify_consistency(&storage, &check).await.unwrap();
        assert!(!report.consistent);
        assert_eq!(report.mismatch.as_deref(), Some("row contents differ"));
    }
}
