use super::records::{
    AuditEntry, BatchExecutionRecord, CoordinationOperation, MigrationJob,
    ReplicationControlEntry,
};
use crate::core::{MigrateError, Result};
use crate::storage::Journal;
use crate::storage::persistence::{read_json, write_json_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex as StdMutex;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Keyed per-table replication switches, read on every forwarded write.
#[async_trait]
pub trait ControlStore: Send + Sync {
    async fn control_entry(&self, table: &str) -> Result<Option<ReplicationControlEntry>>;

    async fn put_control_entry(&self, entry: ReplicationControlEntry) -> Result<()>;

    async fn control_entries(&self) -> Result<Vec<ReplicationControlEntry>>;
}

/// Durable orchestrator state: jobs, batch log, operations, audit log.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Registers a job. Fails while another active job targets the same relation.
    async fn create_job(&self, job: MigrationJob) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<MigrationJob>;

    async fn update_job(&self, job: &MigrationJob) -> Result<()>;

    async fn jobs_for_operation(&self, operation_id: Uuid) -> Result<Vec<MigrationJob>>;

    async fn append_batch_record(&self, record: BatchExecutionRecord) -> Result<()>;

    async fn batch_records(&self, job_id: Uuid) -> Result<Vec<BatchExecutionRecord>>;

    async fn last_batch_record(&self, job_id: Uuid) -> Result<Option<BatchExecutionRecord>>;

    async fn save_operation(&self, operation: &CoordinationOperation) -> Result<()>;

    async fn get_operation(&self, operation_id: Uuid) -> Result<CoordinationOperation>;

    async fn list_operations(&self) -> Result<Vec<CoordinationOperation>>;

    /// Retention cleanup: removes terminal operations initiated before `cutoff`.
    async fn purge_operations_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn append_audit(
        &self,
        site_name: &str,
        operation_id: Option<Uuid>,
        action: &str,
        detail: &str,
    ) -> Result<AuditEntry>;

    async fn audit_log(&self, operation_id: Option<Uuid>) -> Result<Vec<AuditEntry>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateImage {
    jobs: HashMap<Uuid, MigrationJob>,
    batch_records: Vec<BatchExecutionRecord>,
    operations: HashMap<Uuid, CoordinationOperation>,
    controls: HashMap<String, ReplicationControlEntry>,
    audit: Vec<AuditEntry>,
    next_audit_sequence: u64,
}

/// In-process `StateStore` + `ControlStore`, with JSON snapshots and an
/// optional audit journal on disk.
pub struct InMemoryStateStore {
    image: RwLock<StateImage>,
    audit_journal: StdMutex<Option<Journal<AuditEntry>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            image: RwLock::new(StateImage::default()),
            audit_journal: StdMutex::new(None),
        }
    }

    /// Mirrors every audit entry into a MessagePack journal at `path`.
    pub fn with_audit_journal(self, path: &Path) -> Result<Self> {
        let journal = Journal::open(path, false)?;
        *self.audit_journal.lock()? = Some(journal);
        Ok(self)
    }

    pub async fn save_snapshot(&self, path: &Path) -> Result<()> {
        let image = self.image.read().await;
        write_json_atomic(path, &*image)
    }

    pub async fn load_snapshot(&self, path: &Path) -> Result<()> {
        let restored: StateImage = read_json(path)?;
        *self.image.write().await = restored;
        Ok(())
    }

    /// Reads the audit journal back (e.g. after a restart without snapshot).
    pub fn replay_audit_journal(path: &Path) -> Result<Vec<AuditEntry>> {
        Journal::<AuditEntry>::read_all(path)
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ControlStore for InMemoryStateStore {
    async fn control_entry(&self, table: &str) -> Result<Option<ReplicationControlEntry>> {
        Ok(self.image.read().await.controls.get(table).cloned())
    }

    async fn put_control_entry(&self, entry: ReplicationControlEntry) -> Result<()> {
        let mut image = self.image.write().await;
        image.controls.insert(entry.table_name.clone(), entry);
        Ok(())
    }

    async fn control_entries(&self) -> Result<Vec<ReplicationControlEntry>> {
        let image = self.image.read().await;
        let mut entries: Vec<_> = image.controls.values().cloned().collect();
        entries.sort_by(|a, b| a.table_name.cmp(&b.table_name));
        Ok(entries)
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn create_job(&self, job: MigrationJob) -> Result<()> {
        let mut image = self.image.write().await;
        if let Some(active) = image
            .jobs
            .values()
            .find(|j| j.target_table == job.target_table && j.status.is_active())
        {
            return Err(MigrateError::Validation(format!(
                "Relation '{}' already has an active job {}",
                job.target_table, active.id
            )));
        }
        image.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<MigrationJob> {
        self.image
            .read()
            .await
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| MigrateError::JobNotFound(id.to_string()))
    }

    async fn update_job(&self, job: &MigrationJob) -> Result<()> {
        let mut image = self.image.write().await;
        let slot = image
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| MigrateError::JobNotFound(job.id.to_string()))?;
        *slot = job.clone();
        Ok(())
    }

    async fn jobs_for_operation(&self, operation_id: Uuid) -> Result<Vec<MigrationJob>> {
        let image = self.image.read().await;
        let mut jobs: Vec<_> = image
            .jobs
            .values()
            .filter(|j| j.operation_id == Some(operation_id))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn append_batch_record(&self, record: BatchExecutionRecord) -> Result<()> {
        self.image.write().await.batch_records.push(record);
        Ok(())
    }

    async fn batch_records(&self, job_id: Uuid) -> Result<Vec<BatchExecutionRecord>> {
        let image = self.image.read().await;
        Ok(image
            .batch_records
            .iter()
            .filter(|r| r.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn last_batch_record(&self, job_id: Uuid) -> Result<Option<BatchExecutionRecord>> {
        let image = self.image.read().await;
        Ok(image
            .batch_records
            .iter()
            .rev()
            .find(|r| r.job_id == job_id)
            .cloned())
    }

    async fn save_operation(&self, operation: &CoordinationOperation) -> Result<()> {
        let mut image = self.image.write().await;
        image
            .operations
            .insert(operation.operation_id, operation.clone());
        Ok(())
    }

    async fn get_operation(&self, operation_id: Uuid) -> Result<CoordinationOperation> {
        self.image
            .read()
            .await
            .operations
            .get(&operation_id)
            .cloned()
            .ok_or_else(|| MigrateError::OperationNotFound(operation_id.to_string()))
    }

    async fn list_operations(&self) -> Result<Vec<CoordinationOperation>> {
        let image = self.image.read().await;
        let mut operations: Vec<_> = image.operations.values().cloned().collect();
        operations.sort_by_key(|op| op.initiated_at);
        Ok(operations)
    }

    async fn purge_operations_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut image = self.image.write().await;
        let before = image.operations.len();
        image
            .operations
            .retain(|_, op| !(op.status.is_terminal() && op.initiated_at < cutoff));
        Ok((before - image.operations.len()) as u64)
    }

    async fn append_audit(
        &self,
        site_name: &str,
        operation_id: Option<Uuid>,
        action: &str,
        detail: &str,
    ) -> Result<AuditEntry> {
        let entry = {
            let mut image = self.image.write().await;
            image.next_audit_sequence += 1;
            let entry = AuditEntry {
                sequence: image.next_audit_sequence,
                recorded_at: Utc::now(),
                site_name: site_name.to_string(),
                operation_id,
                action: action.to_string(),
                detail: detail.to_string(),
            };
            image.audit.push(entry.clone());
            entry
        };
        if let Some(journal) = self.audit_journal.lock()?.as_mut() {
            journal.append(&entry)?;
        }
        Ok(entry)
    }

    async fn audit_log(&self, operation_id: Option<Uuid>) -> Result<Vec<AuditEntry>> {
        let image = self.image.read().await;
        Ok(image
            .audit
            .iter()
            .filter(|e| operation_id.is_none() || e.operation_id == operation_id)
            .cloned()
            .collect())
    }
}
