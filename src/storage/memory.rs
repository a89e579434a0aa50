use super::engine::{ChangeObserver, StorageEngine};
use super::persistence::{read_json, write_json_atomic};
use super::{Catalog, Table};
use crate::core::{
    ChangeKind, ConflictPolicy, ForeignKey, MigrateError, Result, Row, RowChange, RowPredicate,
    TableSchema, Value,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, RwLock};

/// Mutation points where a test can make the in-memory engine fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultPoint {
    CreateTable,
    DropTable,
    RenameTable,
    AddForeignKey,
    DropForeignKey,
    CommitDdl,
    Scan,
    Upsert,
    Delete,
    ApplyChange,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StorageState {
    catalog: Catalog,
    tables: HashMap<String, Table>,
}

impl StorageState {
    fn table(&self, name: &str) -> Result<(&TableSchema, &Table)> {
        let schema = self.catalog.get_table(name)?;
        let table = self
            .tables
            .get(name)
            .ok_or_else(|| MigrateError::TableNotFound(name.to_string()))?;
        Ok((schema, table))
    }

    fn table_mut(&mut self, name: &str) -> Result<(TableSchema, &mut Table)> {
        let schema = self.catalog.get_table(name)?.clone();
        let table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| MigrateError::TableNotFound(name.to_string()))?;
        Ok((schema, table))
    }
}

type ObserverMap = HashMap<String, Vec<Arc<dyn ChangeObserver>>>;

/// State captured when a DDL unit opens. Observers follow renames, so they
/// are restored together with the catalog.
struct DdlImage {
    state: StorageState,
    observers: ObserverMap,
}

/// How to reverse one application write if an observer rejects it.
struct WriteUndo {
    table: String,
    remove_key: Option<Value>,
    restore: Option<Row>,
}

/// Reference implementation of the storage boundary.
///
/// Tables and catalog live behind one async `RwLock`; a DDL unit keeps a
/// copy-on-write image of the whole state for rollback. With
/// `transactional_ddl` disabled, `rollback_ddl` succeeds without restoring,
/// which mirrors engines whose DDL commits implicitly.
pub struct InMemoryStorage {
    state: RwLock<StorageState>,
    ddl_image: Mutex<Option<DdlImage>>,
    observers: RwLock<ObserverMap>,
    faults: StdMutex<HashMap<FaultPoint, usize>>,
    transactional_ddl: bool,
    accepts_writes: AtomicBool,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_transactional_ddl(true)
    }

    pub fn with_transactional_ddl(transactional_ddl: bool) -> Self {
        Self {
            state: RwLock::new(StorageState::default()),
            ddl_image: Mutex::new(None),
            observers: RwLock::new(HashMap::new()),
            faults: StdMutex::new(HashMap::new()),
            transactional_ddl,
            accepts_writes: AtomicBool::new(true),
        }
    }

    /// Marks this store as a standby (`false`) or primary (`true`).
    pub fn set_accepts_writes(&self, accepts: bool) {
        self.accepts_writes.store(accepts, Ordering::SeqCst);
    }

    /// The call to `point` after `skip` successful ones fails once.
    pub fn inject_fault(&self, point: FaultPoint, skip: usize) -> Result<()> {
        let mut faults = self.faults.lock()?;
        faults.insert(point, skip);
        Ok(())
    }

    pub fn clear_faults(&self) -> Result<()> {
        self.faults.lock()?.clear();
        Ok(())
    }

    fn check_fault(&self, point: FaultPoint) -> Result<()> {
        let mut faults = self.faults.lock()?;
        if let Some(remaining) = faults.get_mut(&point) {
            if *remaining == 0 {
                faults.remove(&point);
                return Err(MigrateError::Storage(format!("injected fault at {:?}", point)));
            }
            *remaining -= 1;
        }
        Ok(())
    }

    /// Bulk-loads rows without firing observers (fixtures, restores).
    pub async fn insert_rows(&self, table: &str, rows: Vec<Row>) -> Result<u64> {
        let mut state = self.state.write().await;
        let (schema, data) = state.table_mut(table)?;
        let mut written = 0;
        for row in rows {
            data.insert(&schema, row)?;
            written += 1;
        }
        Ok(written)
    }

    /// Fetches one row by primary key.
    /// All rows of a table in key order.
    pub async fn all_rows(&self, table: &str) -> Result<Vec<Row>> {
        let state = self.state.read().await;
        let (_, data) = state.table(table)?;
        Ok(data.rows().cloned().collect())
    }

    /// Writes the catalog and every table to `path` as JSON.
    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let state = self.state.read().await;
        write_json_atomic(path, &*state)
    }

    /// Replaces the current contents with a snapshot written by `save_snapshot`.
    pub async fn load_snapshot(&self, path: &Path) -> Result<()> {
        let restored: StorageState = read_json(path)?;
        *self.state.write().await = restored;
        Ok(())
    }

    async fn write_change(&self, change: &RowChange) -> Result<Option<WriteUndo>> {
        let mut state = self.state.write().await;
        let (schema, data) = state.table_mut(&change.table)?;
        let key_index = schema.key_index();

        let missing_image = || {
            MigrateError::Validation(format!(
                "{:?} on '{}' is missing its row image",
                change.kind, change.table
            ))
        };

        let key_of = |row: &Row| {
            row.get(key_index).cloned().ok_or_else(|| {
                MigrateError::Validation(format!(
                    "{:?} on '{}' carries a row image without its key column",
                    change.kind, change.table
                ))
            })
        };

        match change.kind {
            ChangeKind::Insert => {
                let row = change.new.clone().ok_or_else(missing_image)?;
                schema.validate_row(&row)?;
                let key = key_of(&row)?;
                data.insert(&schema, row)?;
                Ok(Some(WriteUndo {
                    table: change.table.clone(),
                    remove_key: Some(key),
                    restore: None,
                }))
            }
            ChangeKind::Update => {
                let old = change.old.as_ref().ok_or_else(missing_image)?;
                let new = change.new.clone().ok_or_else(missing_image)?;
                schema.validate_row(&new)?;
                let old_key = key_of(old)?;
                let new_key = key_of(&new)?;
                let previous = data.replace(&schema, &old_key, new)?;
                Ok(previous.map(|row| WriteUndo {
                    table: change.table.clone(),
                    remove_key: Some(new_key),
                    restore: Some(row),
                }))
            }
            ChangeKind::Delete => {
                let old = change.old.as_ref().ok_or_else(missing_image)?;
                let previous = data.delete(&key_of(old)?);
                Ok(previous.map(|row| WriteUndo {
                    table: change.table.clone(),
                    remove_key: None,
                    restore: Some(row),
                }))
            }
        }
    }

    async fn undo_write(&self, undo: WriteUndo) -> Result<()> {
        let mut state = self.state.write().await;
        let (schema, data) = state.table_mut(&undo.table)?;
        if let Some(key) = undo.remove_key {
            data.delete(&key);
        }
        if let Some(row) = undo.restore {
            data.upsert(&schema, row, ConflictPolicy::Update)?;
        }
        Ok(())
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageEngine for InMemoryStorage {
    async fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.read().await.catalog.table_exists(name))
    }

    async fn table_schema(&self, name: &str) -> Result<TableSchema> {
        Ok(self.state.read().await.catalog.get_table(name)?.clone())
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .catalog
            .list_tables()
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    async fn foreign_keys(&self) -> Result<Vec<ForeignKey>> {
        Ok(self.state.read().await.catalog.foreign_keys().to_vec())
    }

    async fn create_table(&self, schema: TableSchema) -> Result<()> {
        self.check_fault(FaultPoint::CreateTable)?;
        let mut state = self.state.write().await;
        let name = schema.name().to_string();
        let table = Table::new(&schema);
        state.catalog = state.catalog.clone().with_table(schema)?;
        state.tables.insert(name, table);
        Ok(())
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        self.check_fault(FaultPoint::DropTable)?;
        let mut state = self.state.write().await;
        state.catalog = state.catalog.clone().without_table(name)?;
        state.tables.remove(name);
        drop(state);
        self.observers.write().await.remove(name);
        Ok(())
    }

    async fn rename_table(&self, from: &str, to: &str) -> Result<()> {
        self.check_fault(FaultPoint::RenameTable)?;
        let mut state = self.state.write().await;
        state.catalog = state.catalog.clone().renamed(from, to)?;
        if let Some(table) = state.tables.remove(from) {
            state.tables.insert(to.to_string(), table);
        }
        drop(state);
        // Row hooks belong to the relation, like triggers.
        let mut observers = self.observers.write().await;
        if let Some(attached) = observers.remove(from) {
            observers.insert(to.to_string(), attached);
        }
        Ok(())
    }

    async fn add_foreign_key(&self, fk: ForeignKey) -> Result<()> {
        self.check_fault(FaultPoint::AddForeignKey)?;
        let mut state = self.state.write().await;
        state.catalog = state.catalog.clone().with_foreign_key(fk)?;
        Ok(())
    }

    async fn drop_foreign_key(&self, table: &str, name: &str) -> Result<()> {
        self.check_fault(FaultPoint::DropForeignKey)?;
        let mut state = self.state.write().await;
        state.catalog = state.catalog.clone().without_foreign_key(table, name)?;
        Ok(())
    }

    async fn begin_ddl(&self) -> Result<()> {
        let mut image = self.ddl_image.lock().await;
        if image.is_some() {
            return Err(MigrateError::Storage("A DDL unit is already open".to_string()));
        }
        *image = Some(DdlImage {
            state: self.state.read().await.clone(),
            observers: self.observers.read().await.clone(),
        });
        Ok(())
    }

    async fn commit_ddl(&self) -> Result<()> {
        self.check_fault(FaultPoint::CommitDdl)?;
        let mut image = self.ddl_image.lock().await;
        if image.take().is_none() {
            return Err(MigrateError::Storage("No DDL unit is open".to_string()));
        }
        Ok(())
    }

    async fn rollback_ddl(&self) -> Result<()> {
        let mut image = self.ddl_image.lock().await;
        let saved = image
            .take()
            .ok_or_else(|| MigrateError::Storage("No DDL unit is open".to_string()))?;
        if self.transactional_ddl {
            *self.state.write().await = saved.state;
            *self.observers.write().await = saved.observers;
        }
        Ok(())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let state = self.state.read().await;
        let (_, data) = state.table(table)?;
        Ok(data.row_count() as u64)
    }

    async fn count_matching(&self, table: &str, predicate: &RowPredicate) -> Result<u64> {
        let state = self.state.read().await;
        let (schema, data) = state.table(table)?;
        data.count_matching(schema, predicate)
    }

    async fn scan_after(
        &self,
        table: &str,
        after: Option<&Value>,
        limit: usize,
        predicate: &RowPredicate,
    ) -> Result<Vec<Row>> {
        self.check_fault(FaultPoint::Scan)?;
        let state = self.state.read().await;
        let (schema, data) = state.table(table)?;
        data.scan_after(schema, after, limit, predicate)
    }

    async fn upsert_rows(&self, table: &str, rows: Vec<Row>, policy: ConflictPolicy) -> Result<u64> {
        self.check_fault(FaultPoint::Upsert)?;
        let mut state = self.state.write().await;
        let (schema, data) = state.table_mut(table)?;
        // Validate the whole chunk first so a bad row leaves the table untouched.
        for row in &rows {
            schema.validate_row(row)?;
        }
        let mut written = 0;
        for row in rows {
            if data.upsert(&schema, row, policy)? {
                written += 1;
            }
        }
        Ok(written)
    }

    async fn delete_by_key(&self, table: &str, keys: &[Value]) -> Result<u64> {
        self.check_fault(FaultPoint::Delete)?;
        let mut state = self.state.write().await;
        let (_, data) = state.table_mut(table)?;
        Ok(keys.iter().filter(|key| data.delete(key).is_some()).count() as u64)
    }

    async fn get_row(&self, table: &str, key: &Value) -> Result<Option<Row>> {
        let state = self.state.read().await;
        let (_, data) = state.table(table)?;
        Ok(data.get(key).cloned())
    }

    async fn apply_change(&self, change: RowChange) -> Result<()> {
        self.check_fault(FaultPoint::ApplyChange)?;
        let Some(undo) = self.write_change(&change).await? else {
            // Zero rows affected: row hooks do not fire.
            return Ok(());
        };

        let attached = self
            .observers
            .read()
            .await
            .get(&change.table)
            .cloned()
            .unwrap_or_default();
        for observer in attached {
            if let Err(err) = observer.on_change(&change).await {
                self.undo_write(undo).await?;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn nth_value(&self, table: &str, column: &str, offset: u64) -> Result<Option<Value>> {
        let state = self.state.read().await;
        let (schema, data) = state.table(table)?;
        let mut values = data.column_values(schema.column_index(column)?);
        values.sort();
        Ok(usize::try_from(offset)
            .ok()
            .and_then(|offset| values.into_iter().nth(offset)))
    }

    async fn sample_values(&self, table: &str, column: &str, max_samples: usize) -> Result<Vec<Value>> {
        let state = self.state.read().await;
        let (schema, data) = state.table(table)?;
        let values = data.column_values(schema.column_index(column)?);
        if max_samples == 0 || values.is_empty() {
            return Ok(Vec::new());
        }
        // Systematic sample over key order.
        let stride = values.len().div_ceil(max_samples).max(1);
        Ok(values.into_iter().step_by(stride).collect())
    }

    async fn accepts_writes(&self) -> Result<bool> {
        Ok(self.accepts_writes.load(Ordering::SeqCst))
    }

    async fn attach_observer(&self, table: &str, observer: Arc<dyn ChangeObserver>) -> Result<()> {
        if !self.table_exists(table).await? {
            return Err(MigrateError::TableNotFound(table.to_string()));
        }
        let mut observers = self.observers.write().await;
        let attached = observers.entry(table.to_string()).or_default();
        if attached.iter().any(|existing| existing.name() == observer.name()) {
            return Err(MigrateError::Validation(format!(
                "Observer '{}' is already attached to '{}'",
                observer.name(),
                table
            )));
        }
        attached.push(observer);
        Ok(())
    }

    async fn detach_observer(&self, table: &str, name: &str) -> Result<bool> {
        let mut observers = self.observers.write().await;
        let Some(attached) = observers.get_mut(table) else {
            return Ok(false);
        };
        let before = attached.len();
        attached.retain(|observer| observer.name() != name);
        Ok(attached.len() != before)
    }

    async fn observers(&self, table: &str) -> Result<Vec<String>> {
        let observers = self.observers.read().await;
        Ok(observers
            .get(table)
            .map(|attached| attached.iter().map(|o| o.name().to_string()).collect())
            .unwrap_or_default())
    }
}
