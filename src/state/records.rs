//! The five durable record kinds.

use crate::batch::mapping::SchemaMapping;
use crate::core::{ConflictPolicy, MigrateError, Result, RowPredicate, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// MigrationJob
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    /// Jobs in these states hold their target relation.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }
}

/// One bulk-copy task, checkpointed by primary key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub id: Uuid,
    pub operation_id: Option<Uuid>,
    pub source_table: String,
    pub target_table: String,
    pub mapping: SchemaMapping,
    pub predicate: RowPredicate,
    pub conflict_policy: ConflictPolicy,
    pub batch_size: usize,
    pub total_rows_estimate: u64,
    pub processed_rows: u64,
    /// Exclusive lower bound (source primary key) for the next batch.
    pub last_processed_cursor: Option<Value>,
    pub next_batch_number: u64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_detail: Option<String>,
}

impl MigrationJob {
    pub fn new(mapping: SchemaMapping, predicate: RowPredicate, batch_size: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation_id: None,
            source_table: mapping.source_table.clone(),
            target_table: mapping.target_table.clone(),
            mapping,
            predicate,
            conflict_policy: ConflictPolicy::Ignore,
            batch_size,
            total_rows_estimate: 0,
            processed_rows: 0,
            last_processed_cursor: None,
            next_batch_number: 1,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_detail: None,
        }
    }

    pub fn for_operation(mut self, operation_id: Uuid) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    pub fn with_total_estimate(mut self, total: u64) -> Self {
        self.total_rows_estimate = total;
        self
    }

    /// Moves the checkpoint forward after a committed batch.
    ///
    /// The cursor never moves backwards and the processed count never shrinks.
    pub fn advance_checkpoint(&mut self, cursor: Value, rows: u64) -> Result<()> {
        if let Some(current) = &self.last_processed_cursor {
            if cursor < *current {
                return Err(MigrateError::Validation(format!(
                    "Checkpoint of job {} would move backwards from {} to {}",
                    self.id, current, cursor
                )));
            }
        }
        self.last_processed_cursor = Some(cursor);
        self.processed_rows = self.processed_rows.saturating_add(rows);
        self.next_batch_number += 1;
        Ok(())
    }

    pub fn progress_percent(&self) -> Option<f64> {
        if self.total_rows_estimate == 0 {
            return None;
        }
        Some((self.processed_rows as f64 / self.total_rows_estimate as f64 * 100.0).min(100.0))
    }
}

// ============================================================================
// BatchExecutionRecord
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchOutcome {
    Succeeded,
    Failed,
}

/// Append-only log row for one chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExecutionRecord {
    pub job_id: Uuid,
    pub batch_number: u64,
    pub cursor_start: Option<Value>,
    pub cursor_end: Option<Value>,
    pub rows_affected: u64,
    pub duration_ms: u64,
    pub outcome: BatchOutcome,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

// ============================================================================
// CoordinationOperation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationStatus {
    Initiated,
    Preparing,
    Prepared,
    SyncStopping,
    SyncStopped,
    Executing,
    MigrationCompleted,
    SyncResumed,
    Completed,
    Failed,
    RolledBack,
}

impl OperationStatus {
    const HAPPY_PATH: [OperationStatus; 9] = [
        Self::Initiated,
        Self::Preparing,
        Self::Prepared,
        Self::SyncStopping,
        Self::SyncStopped,
        Self::Executing,
        Self::MigrationCompleted,
        Self::SyncResumed,
        Self::Completed,
    ];

    /// Position on the happy path; FAILED / ROLLED_BACK have none.
    pub fn phase(self) -> Option<u8> {
        Self::HAPPY_PATH
            .iter()
            .position(|s| *s == self)
            .map(|p| p as u8)
    }

    pub fn next(self) -> Option<Self> {
        self.phase()
            .and_then(|p| Self::HAPPY_PATH.get(p as usize + 1).copied())
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Whether replication may be disabled on this site while in this state.
    pub fn sync_may_be_paused(self) -> bool {
        matches!(
            self,
            Self::SyncStopping | Self::SyncStopped | Self::Executing | Self::MigrationCompleted
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Failed, Self::RolledBack) => true,
            (from, Self::Failed) => !from.is_terminal(),
            (from, to) => from.next() == Some(to),
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Initiated => "INITIATED",
            Self::Preparing => "PREPARING",
            Self::Prepared => "PREPARED",
            Self::SyncStopping => "SYNC_STOPPING",
            Self::SyncStopped => "SYNC_STOPPED",
            Self::Executing => "EXECUTING",
            Self::MigrationCompleted => "MIGRATION_COMPLETED",
            Self::SyncResumed => "SYNC_RESUMED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        };
        f.write_str(text)
    }
}

/// A site's own row for one cross-site migration attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationOperation {
    pub operation_id: Uuid,
    pub site_name: String,
    pub table_name: String,
    pub status: OperationStatus,
    /// Last happy-path phase reached; kept when the status becomes FAILED.
    pub phase: u8,
    pub is_coordinator: bool,
    pub partner_ready: bool,
    pub initiated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Vec<String>,
}

impl CoordinationOperation {
    pub fn new(
        operation_id: Uuid,
        site_name: impl Into<String>,
        table_name: impl Into<String>,
        is_coordinator: bool,
    ) -> Self {
        Self {
            operation_id,
            site_name: site_name.into(),
            table_name: table_name.into(),
            status: OperationStatus::Initiated,
            phase: 0,
            is_coordinator,
            partner_ready: false,
            initiated_at: Utc::now(),
            completed_at: None,
            notes: Vec::new(),
        }
    }

    pub fn transition(&mut self, next: OperationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(MigrateError::InvalidTransition(format!(
                "operation {} cannot move from {} to {}",
                self.operation_id, self.status, next
            )));
        }
        self.status = next;
        if let Some(phase) = next.phase() {
            self.phase = phase;
        }
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn note(&mut self, text: impl Into<String>) {
        self.notes
            .push(format!("{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%SZ"), text.into()));
    }
}

// ============================================================================
// ReplicationControlEntry
// ============================================================================

/// Per-table switch consulted before every forwarded write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationControlEntry {
    pub table_name: String,
    pub replication_enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub maintenance_window_start: Option<DateTime<Utc>>,
    pub maintenance_window_end: Option<DateTime<Utc>>,
}

impl ReplicationControlEntry {
    pub fn enabled(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            replication_enabled: true,
            last_sync_at: None,
            maintenance_window_start: None,
            maintenance_window_end: None,
        }
    }

    pub fn disabled(table_name: impl Into<String>) -> Self {
        Self {
            replication_enabled: false,
            ..Self::enabled(table_name)
        }
    }

    pub fn with_maintenance_window(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.maintenance_window_start = Some(start);
        self.maintenance_window_end = Some(end);
        self
    }

    pub fn in_maintenance_window(&self, now: DateTime<Utc>) -> bool {
        match (self.maintenance_window_start, self.maintenance_window_end) {
            (Some(start), Some(end)) => start <= now && now < end,
            (Some(start), None) => start <= now,
            _ => false,
        }
    }

    pub fn forwarding_enabled(&self, now: DateTime<Utc>) -> bool {
        self.replication_enabled && !self.in_maintenance_window(now)
    }
}

// ============================================================================
// AuditEntry
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub site_name: String,
    pub operation_id: Option<Uuid>,
    pub action: String,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_happy_path_transitions() {
        let mut op = CoordinationOperation::new(Uuid::new_v4(), "east", "orders", true);
        let mut status = OperationStatus::Initiated;
        while let Some(next) = status.next() {
            op.transition(next).unwrap();
            status = next;
        }
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.phase, 8);
        assert!(op.completed_at.is_some());
    }

    #[test]
    fn test_failed_reachable_everywhere_and_rolled_back_only_from_failed() {
        assert!(OperationStatus::Executing.can_transition_to(OperationStatus::Failed));
        assert!(OperationStatus::Initiated.can_transition_to(OperationStatus::Failed));
        assert!(!OperationStatus::Completed.can_transition_to(OperationStatus::Failed));
        assert!(OperationStatus::Failed.can_transition_to(OperationStatus::RolledBack));
        assert!(!OperationStatus::Executing.can_transition_to(OperationStatus::RolledBack));
        assert!(!OperationStatus::Prepared.can_transition_to(OperationStatus::Executing));
    }

    #[test]
    fn test_failure_keeps_phase() {
        let mut op = CoordinationOperation::new(Uuid::new_v4(), "east", "orders", false);
        op.transition(OperationStatus::Preparing).unwrap();
        op.transition(OperationStatus::Failed).unwrap();
        assert_eq!(op.phase, 1);
    }

    #[test]
    fn test_checkpoint_is_monotonic() {
        let mapping = SchemaMapping::new("a", "b");
        let mut job = MigrationJob::new(mapping, RowPredicate::All, 10);
        job.advance_checkpoint(Value::Integer(10), 10).unwrap();
        job.advance_checkpoint(Value::Integer(20), 10).unwrap();
        assert!(job.advance_checkpoint(Value::Integer(5), 1).is_err());
        assert_eq!(job.last_processed_cursor, Some(Value::Integer(20)));
        assert_eq!(job.processed_rows, 20);
        assert_eq!(job.next_batch_number, 3);
    }

    #[test]
    fn test_maintenance_window_pauses_forwarding() {
        let now = Utc::now();
        let entry = ReplicationControlEntry::enabled("orders")
            .with_maintenance_window(now - Duration::minutes(5), now + Duration::minutes(5));
        assert!(!entry.forwarding_enabled(now));
        assert!(entry.forwarding_enabled(now + Duration::minutes(10)));
        assert!(!ReplicationControlEntry::disabled("orders").forwarding_enabled(now));
    }
}
