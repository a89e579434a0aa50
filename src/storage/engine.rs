use crate::core::{ConflictPolicy, ForeignKey, Result, Row, RowChange, RowPredicate, TableSchema, Value};
use async_trait::async_trait;
use std::sync::Arc;

/// Storage boundary: the relational store the orchestrator drives.
///
/// Everything is request/response; an implementation may sit on top of any
/// wire protocol. Methods that alter the catalog are expected to honour an
/// open DDL unit (`begin_ddl` .. `commit_ddl` / `rollback_ddl`) where the
/// engine supports transactional DDL.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    // ---- catalog ------------------------------------------------------

    async fn table_exists(&self, name: &str) -> Result<bool>;

    async fn table_schema(&self, name: &str) -> Result<TableSchema>;

    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Every foreign-key constraint in the store.
    async fn foreign_keys(&self) -> Result<Vec<ForeignKey>>;

    /// Constraints whose referenced relation is `table`.
    async fn foreign_keys_referencing(&self, table: &str) -> Result<Vec<ForeignKey>> {
        Ok(self
            .foreign_keys()
            .await?
            .into_iter()
            .filter(|fk| fk.referenced_table == table)
            .collect())
    }

    // ---- DDL ----------------------------------------------------------

    async fn create_table(&self, schema: TableSchema) -> Result<()>;

    async fn drop_table(&self, name: &str) -> Result<()>;

    async fn rename_table(&self, from: &str, to: &str) -> Result<()>;

    async fn add_foreign_key(&self, fk: ForeignKey) -> Result<()>;

    async fn drop_foreign_key(&self, table: &str, name: &str) -> Result<()>;

    /// Opens an all-or-nothing DDL unit.
    async fn begin_ddl(&self) -> Result<()>;

    async fn commit_ddl(&self) -> Result<()>;

    /// Discards the open DDL unit. Engines without transactional DDL may
    /// succeed here without restoring anything.
    async fn rollback_ddl(&self) -> Result<()>;

    // ---- DML ----------------------------------------------------------

    async fn row_count(&self, table: &str) -> Result<u64>;

    async fn count_matching(&self, table: &str, predicate: &RowPredicate) -> Result<u64>;

    /// Point lookup by primary key.
    async fn get_row(&self, table: &str, key: &Value) -> Result<Option<Row>>;

    /// Keyset page: up to `limit` rows with primary key strictly greater than
    /// `after` that satisfy `predicate`, ordered by primary key.
    async fn scan_after(
        &self,
        table: &str,
        after: Option<&Value>,
        limit: usize,
        predicate: &RowPredicate,
    ) -> Result<Vec<Row>>;

    /// Writes rows keyed by the table's primary key. Returns rows written.
    async fn upsert_rows(&self, table: &str, rows: Vec<Row>, policy: ConflictPolicy) -> Result<u64>;

    async fn delete_by_key(&self, table: &str, keys: &[Value]) -> Result<u64>;

    /// Application write path. Observers attached to the table run
    /// synchronously after the write; an observer error aborts the write.
    async fn apply_change(&self, change: RowChange) -> Result<()>;

    // ---- order statistics ---------------------------------------------

    /// Value of `column` at ascending rank `offset` (NULLs excluded).
    async fn nth_value(&self, table: &str, column: &str, offset: u64) -> Result<Option<Value>>;

    /// Up to `max_samples` non-null values of `column`, unordered.
    async fn sample_values(&self, table: &str, column: &str, max_samples: usize) -> Result<Vec<Value>>;

    // ---- role & hooks -------------------------------------------------

    /// False on a standby / read-only replica.
    async fn accepts_writes(&self) -> Result<bool>;

    async fn attach_observer(&self, table: &str, observer: Arc<dyn ChangeObserver>) -> Result<()>;

    /// Returns whether an observer with that name was attached.
    async fn detach_observer(&self, table: &str, name: &str) -> Result<bool>;

    async fn observers(&self, table: &str) -> Result<Vec<String>>;
}

/// Row-level hook fired for every application write on a table.
#[async_trait]
pub trait ChangeObserver: Send + Sync {
    fn name(&self) -> &str;

    async fn on_change(&self, change: &RowChange) -> Result<()>;
}
