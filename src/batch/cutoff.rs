use crate::core::{MigrateError, Result, RowPredicate, Value};
use crate::storage::StorageEngine;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where the historical split falls for one relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutoffSelection {
    pub column: String,
    /// Rows with a non-null ordering value; the rank is taken over these.
    pub total_rows: u64,
    /// Rows whose ordering value is NULL. Neither side's predicate matches them.
    #[serde(default)]
    pub null_rows: u64,
    /// Rows expected on the retained (new) side: floor(N * r).
    pub retained_target: u64,
    /// First retained value of the ordering column. `None` when nothing is retained.
    pub boundary: Option<Value>,
    pub approximate: bool,
}

impl CutoffSelection {
    fn empty(column: &str, total_rows: u64, null_rows: u64, approximate: bool) -> Self {
        Self {
            column: column.to_string(),
            total_rows,
            null_rows,
            retained_target: 0,
            boundary: None,
            approximate,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows == 0
    }

    /// Rows that belong in the archive, or `None` when there is nothing to move.
    pub fn archive_predicate(&self) -> Option<RowPredicate> {
        if self.is_empty() {
            return None;
        }
        Some(match &self.boundary {
            Some(value) => RowPredicate::Before {
                column: self.column.clone(),
                value: value.clone(),
            },
            None => RowPredicate::All,
        })
    }

    /// Rows that are carried into the new relation.
    pub fn retain_predicate(&self) -> Option<RowPredicate> {
        self.boundary.as_ref().map(|value| RowPredicate::AtOrAfter {
            column: self.column.clone(),
            value: value.clone(),
        })
    }
}

/// (ranked rows, NULL rows) of the ordering column.
async fn population(storage: &dyn StorageEngine, table: &str, column: &str) -> Result<(u64, u64)> {
    let rows = storage.row_count(table).await?;
    let nulls = storage
        .count_matching(
            table,
            &RowPredicate::Equals {
                column: column.to_string(),
                value: Value::Null,
            },
        )
        .await?;
    Ok((rows.saturating_sub(nulls), nulls))
}

/// Rejects an ordering column holding NULLs; those rows fall on neither side
/// of the split. Returns the number of ranked rows.
pub async fn require_ordering_values(
    storage: &dyn StorageEngine,
    table: &str,
    column: &str,
) -> Result<u64> {
    let (ranked, nulls) = population(storage, table, column).await?;
    if nulls > 0 {
        return Err(MigrateError::Validation(format!(
            "Ordering column '{}' of '{}' has {} NULL value(s)",
            column, table, nulls
        )));
    }
    Ok(ranked)
}

fn retained_target(total_rows: u64, retention: f64) -> Result<u64> {
    if !retention.is_finite() || !(0.0..=1.0).contains(&retention) {
        return Err(MigrateError::Validation(format!(
            "Retention fraction must be within [0, 1], got {}",
            retention
        )));
    }
    Ok(((total_rows as f64 * retention).floor() as u64).min(total_rows))
}

/// Picks the boundary value that splits a relation into archive and retained rows.
#[async_trait]
pub trait CutoffStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn select(
        &self,
        storage: &dyn StorageEngine,
        table: &str,
        column: &str,
        retention: f64,
    ) -> Result<CutoffSelection>;
}

/// Order-statistic query: the value at ascending rank N - floor(N * r).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactCutoff;

#[async_trait]
impl CutoffStrategy for ExactCutoff {
    fn name(&self) -> &'static str {
        "exact"
    }

    async fn select(
        &self,
        storage: &dyn StorageEngine,
        table: &str,
        column: &str,
        retention: f64,
    ) -> Result<CutoffSelection> {
        let (total_rows, null_rows) = population(storage, table, column).await?;
        let target = retained_target(total_rows, retention)?;
        if total_rows == 0 || target == 0 {
            return Ok(CutoffSelection::empty(column, total_rows, null_rows, false));
        }
        let boundary = storage.nth_value(table, column, total_rows - target).await?;
        Ok(CutoffSelection {
            column: column.to_string(),
            total_rows,
            null_rows,
            retained_target: target,
            boundary,
            approximate: false,
        })
    }
}

/// Boundary estimated from a bounded sample of the ordering column.
#[derive(Debug, Clone, Copy)]
pub struct SampledCutoff {
    pub max_samples: usize,
}

impl Default for SampledCutoff {
    fn default() -> Self {
        Self { max_samples: 10_000 }
    }
}

#[async_trait]
impl CutoffStrategy for SampledCutoff {
    fn name(&self) -> &'static str {
        "sampled"
    }

    async fn select(
        &self,
        storage: &dyn StorageEngine,
        table: &str,
        column: &str,
        retention: f64,
    ) -> Result<CutoffSelection> {
        let (total_rows, null_rows) = population(storage, table, column).await?;
        let target = retained_target(total_rows, retention)?;
        if total_rows == 0 || target == 0 {
            return Ok(CutoffSelection::empty(column, total_rows, null_rows, true));
        }
        let mut samples = storage.sample_values(table, column, self.max_samples).await?;
        if samples.is_empty() {
            return Ok(CutoffSelection::empty(column, total_rows, null_rows, true));
        }
        samples.sort();
        let rank = (total_rows - target) as f64 / total_rows as f64;
        let index = ((samples.len() as f64 * rank).floor() as usize).min(samples.len() - 1);
        Ok(CutoffSelection {
            column: column.to_string(),
            total_rows,
            null_rows,
            retained_target: target,
            boundary: samples.into_iter().nth(index),
            approximate: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Column, DataType, TableSchema};
    use crate::storage::InMemoryStorage;

    async fn storage_with(n: i64) -> InMemoryStorage {
        let storage = InMemoryStorage::new();
        let schema = TableSchema::new(
            "events",
            vec![
                Column::new("id", DataType::Integer).not_null(),
                Column::new("seq", DataType::Integer),
            ],
            "id",
        )
        .unwrap();
        storage.create_table(schema).await.unwrap();
        let rows = (1..=n).map(|i| vec![Value::Integer(i), Value::Integer(i)]).collect();
        storage.insert_rows("events", rows).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn test_exact_cutoff_tenth_of_thousand() {
        let storage = storage_with(1000).await;
        let selection = ExactCutoff.select(&storage, "events", "seq", 0.1).await.unwrap();
        assert_eq!(selection.retained_target, 100);
        assert_eq!(selection.boundary, Some(Value::Integer(901)));

        let archived = storage
            .count_matching("events", &selection.archive_predicate().unwrap())
            .await
            .unwrap();
        let retained = storage
            .count_matching("events", &selection.retain_predicate().unwrap())
            .await
            .unwrap();
        assert_eq!((archived, retained), (900, 100));
    }

    #[tokio::test]
    async fn test_null_ordering_values_are_left_out_of_the_rank() {
        let storage = storage_with(100).await;
        storage
            .apply_change(crate::core::RowChange::update(
                "events",
                vec![Value::Integer(50), Value::Integer(50)],
                vec![Value::Integer(50), Value::Null],
                "east",
            ))
            .await
            .unwrap();

        let selection = ExactCutoff.select(&storage, "events", "seq", 0.1).await.unwrap();
        assert_eq!((selection.total_rows, selection.null_rows), (99, 1));
        assert_eq!(selection.retained_target, 9);
        let retained = storage
            .count_matching("events", &selection.retain_predicate().unwrap())
            .await
            .unwrap();
        let archived = storage
            .count_matching("events", &selection.archive_predicate().unwrap())
            .await
            .unwrap();
        assert_eq!(retained, selection.retained_target);
        assert_eq!(archived + retained, selection.total_rows);
    }

    #[tokio::test]
    async fn test_zero_retention_archives_everything() {
        let storage = storage_with(10).await;
        let selection = ExactCutoff.select(&storage, "events", "seq", 0.0).await.unwrap();
        assert_eq!(selection.boundary, None);
        assert_eq!(selection.archive_predicate(), Some(RowPredicate::All));
        assert_eq!(selection.retain_predicate(), None);
    }

    #[tokio::test]
    async fn test_empty_relation_has_nothing_to_do() {
        let storage = storage_with(0).await;
        let selection = ExactCutoff.select(&storage, "events", "seq", 0.5).await.unwrap();
        assert!(selection.is_empty());
        assert_eq!(selection.archive_predicate(), None);
    }

    #[tokio::test]
    async fn test_retention_out_of_range_is_rejected() {
        let storage = storage_with(10).await;
        for bad in [-0.1, 1.5, f64::NAN] {
            let err = ExactCutoff.select(&storage, "events", "seq", bad).await.unwrap_err();
            assert!(err.is_validation());
        }
    }

    #[tokio::test]
    async fn test_sampled_cutoff_is_close() {
        let storage = storage_with(1000).await;
        let selection = SampledCutoff { max_samples: 100 }
            .select(&storage, "events", "seq", 0.1)
            .await
            .unwrap();
        assert!(selection.approximate);
        let boundary = selection.boundary.and_then(|v| v.as_i64()).unwrap();
        assert!((880..=920).contains(&boundary), "boundary {}", boundary);
    }
}
