use crate::core::{ChangeKind, Result, Row, RowChange, Value};
use crate::storage::{ChangeObserver, StorageEngine};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Rows on each side of the historical split, measured against the source
/// as it stood when replication was paused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConservationCheck {
    /// Source rows at the pause.
    pub source_rows: u64,
    /// Keys the application wrote while the copy ran. They are left out of
    /// every count below.
    pub changed_keys: u64,
    pub archived_rows: u64,
    pub migrated_rows: u64,
    pub holds: bool,
}

/// Records the keys written on the source between the pause and the check.
///
/// The value says whether the key already existed at the pause: the first
/// change seen for a key is an insert only for rows created afterwards.
pub(crate) struct ChangeTally {
    name: String,
    key_index: usize,
    touched: Mutex<BTreeMap<Value, bool>>,
}

impl ChangeTally {
    pub(crate) fn new(name: impl Into<String>, key_index: usize) -> Self {
        Self {
            name: name.into(),
            key_index,
            touched: Mutex::new(BTreeMap::new()),
        }
    }

    fn key(&self, row: Option<&Row>) -> Option<Value> {
        row.and_then(|row| row.get(self.key_index)).cloned()
    }

    pub(crate) fn touched(&self) -> Result<BTreeMap<Value, bool>> {
        Ok(self.touched.lock()?.clone())
    }
}

#[async_trait]
impl ChangeObserver for ChangeTally {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_change(&self, change: &RowChange) -> Result<()> {
        let old = self.key(change.old.as_ref());
        let new = self.key(change.new.as_ref());
        let mut touched = self.touched.lock()?;
        match change.kind {
            ChangeKind::Insert => {
                if let Some(key) = new {
                    touched.entry(key).or_insert(false);
                }
            }
            ChangeKind::Update => {
                if let Some(key) = old {
                    touched.entry(key).or_insert(true);
                }
                if let Some(key) = new {
                    touched.entry(key).or_insert(false);
                }
            }
            ChangeKind::Delete => {
                if let Some(key) = old {
                    touched.entry(key).or_insert(true);
                }
            }
        }
        Ok(())
    }
}

/// Counts rows of `table` whose key is in `keys` and that pass `keep`.
pub(crate) async fn count_present<F>(
    storage: &dyn StorageEngine,
    table: &str,
    keys: impl Iterator<Item = &Value>,
    keep: F,
) -> Result<u64>
where
    F: Fn(&Row) -> bool,
{
    let mut present = 0;
    for key in keys {
        if let Some(row) = storage.get_row(table, key).await? {
            if keep(&row) {
                present += 1;
            }
        }
    }
    Ok(present)
}
