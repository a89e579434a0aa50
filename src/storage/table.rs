use crate::core::{ConflictPolicy, MigrateError, Result, Row, RowPredicate, TableSchema, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Row storage of one relation, ordered by primary key.
///
/// The schema lives in the catalog; callers pass it in so a rename never
/// has to touch the rows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "TableImage", into = "TableImage")]
pub struct Table {
    rows: BTreeMap<Value, Row>,
    key_index: usize,
}

/// Serialized form: JSON maps only allow string keys.
#[derive(Serialize, Deserialize)]
struct TableImage {
    key_index: usize,
    rows: Vec<Row>,
}

impl From<TableImage> for Table {
    fn from(image: TableImage) -> Self {
        let rows = image
            .rows
            .into_iter()
            .filter_map(|row| row.get(image.key_index).cloned().map(|key| (key, row)))
            .collect();
        Self {
            rows,
            key_index: image.key_index,
        }
    }
}

impl From<Table> for TableImage {
    fn from(table: Table) -> Self {
        Self {
            key_index: table.key_index,
            rows: table.rows.into_values().collect(),
        }
    }
}

impl Table {
    pub fn new(schema: &TableSchema) -> Self {
        Self {
            rows: BTreeMap::new(),
            key_index: schema.key_index(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, key: &Value) -> Option<&Row> {
        self.rows.get(key)
    }

    /// Plain insert; an existing key is a constraint violation.
    pub fn insert(&mut self, schema: &TableSchema, row: Row) -> Result<()> {
        schema.validate_row(&row)?;
        let key = row[self.key_index].clone();
        if self.rows.contains_key(&key) {
            return Err(MigrateError::ConstraintViolation(format!(
                "Duplicate key {} in '{}'",
                key,
                schema.name()
            )));
        }
        self.rows.insert(key, row);
        Ok(())
    }

    /// Inserts or, depending on `policy`, ignores / overwrites existing keys.
    ///
    /// Returns whether the row was actually written.
    pub fn upsert(&mut self, schema: &TableSchema, row: Row, policy: ConflictPolicy) -> Result<bool> {
        schema.validate_row(&row)?;
        let key = row[self.key_index].clone();
        match (self.rows.get(&key), policy) {
            (Some(_), ConflictPolicy::Ignore) => Ok(false),
            (Some(existing), ConflictPolicy::Update) if *existing == row => Ok(false),
            _ => {
                self.rows.insert(key, row);
                Ok(true)
            }
        }
    }

    /// Replaces the row stored under `old_key` with `row` (the key may change).
    pub fn replace(&mut self, schema: &TableSchema, old_key: &Value, row: Row) -> Result<Option<Row>> {
        schema.validate_row(&row)?;
        let new_key = row[self.key_index].clone();
        if new_key != *old_key && self.rows.contains_key(&new_key) {
            return Err(MigrateError::ConstraintViolation(format!(
                "Duplicate key {} in '{}'",
                new_key,
                schema.name()
            )));
        }
        let previous = self.rows.remove(old_key);
        if previous.is_some() {
            self.rows.insert(new_key, row);
        }
        Ok(previous)
    }

    pub fn delete(&mut self, key: &Value) -> Option<Row> {
        self.rows.remove(key)
    }

    /// Keyset scan: rows with key strictly greater than `after`, matching
    /// `predicate`, in key order, at most `limit`.
    pub fn scan_after(
        &self,
        schema: &TableSchema,
        after: Option<&Value>,
        limit: usize,
        predicate: &RowPredicate,
    ) -> Result<Vec<Row>> {
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let mut out = Vec::new();
        for (_, row) in self.rows.range::<Value, _>((lower, Bound::Unbounded)) {
            if out.len() >= limit {
                break;
            }
            if predicate.matches(schema, row)? {
                out.push(row.clone());
            }
        }
        Ok(out)
    }

    pub fn count_matching(&self, schema: &TableSchema, predicate: &RowPredicate) -> Result<u64> {
        let mut count = 0;
        for row in self.rows.values() {
            if predicate.matches(schema, row)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Non-null values of one column, in key order.
    pub fn column_values(&self, column_index: usize) -> Vec<Value> {
        self.rows
            .values()
            .map(|row| row[column_index].clone())
            .filter(|value| !value.is_null())
            .collect()
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }
}
