use super::mapping::RowMapper;
use crate::core::{MigrateError, Result, RowPredicate, Value};
use crate::state::{BatchExecutionRecord, BatchOutcome, JobStatus, MigrationJob, StateStore};
use crate::storage::StorageEngine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

/// Result of one `run_batch_job` invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRunSummary {
    pub job_id: Uuid,
    /// Rows read from the source during this invocation.
    pub rows_processed: u64,
    /// Rows actually written to the target during this invocation.
    pub rows_written: u64,
    pub batches: u64,
    pub status: JobStatus,
    pub exhausted_batch_limit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemainingEstimate {
    pub job_id: Uuid,
    pub remaining_rows: u64,
    pub remaining_batches: u64,
    pub last_batch_duration_ms: Option<u64>,
    pub estimated_ms: Option<u64>,
}

struct ChunkOutcome {
    scanned: u64,
    written: u64,
    cursor_end: Value,
}

/// Drives checkpointed keyset copies from one relation into another.
pub struct BatchEngine {
    storage: Arc<dyn StorageEngine>,
    state: Arc<dyn StateStore>,
    batch_delay: Duration,
    max_batches: u64,
}

impl BatchEngine {
    pub fn new(storage: Arc<dyn StorageEngine>, state: Arc<dyn StateStore>) -> Self {
        Self {
            storage,
            state,
            batch_delay: Duration::from_millis(100),
            max_batches: 100_000,
        }
    }

    pub fn with_batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn with_max_batches(mut self, max_batches: u64) -> Self {
        self.max_batches = max_batches;
        self
    }

    /// Validates a job against the live schemas and registers it as PENDING.
    pub async fn create_job(&self, job: MigrationJob) -> Result<MigrationJob> {
        if job.batch_size == 0 {
            return Err(MigrateError::Validation("Batch size must be greater than 0".to_string()));
        }
        self.compile(&job).await?;
        let total = self
            .storage
            .count_matching(&job.source_table, &job.predicate)
            .await?;
        let job = job.with_total_estimate(total);
        self.state.create_job(job.clone()).await?;
        event!(
            Level::INFO,
            job_id = %job.id,
            source = %job.source_table,
            target = %job.target_table,
            total_rows = total,
            "migration job created"
        );
        Ok(job)
    }

    /// Copies batches until the source is exhausted, the job is paused, or
    /// the batch limit is hit.
    ///
    /// `cutoff` and `batch_size` override the job's stored values; a cutoff
    /// can only change before the first row is processed.
    pub async fn run_batch_job(
        &self,
        job_id: Uuid,
        cutoff: Option<RowPredicate>,
        batch_size: Option<usize>,
    ) -> Result<BatchRunSummary> {
        let mut job = self.state.get_job(job_id).await?;
        if let Some(size) = batch_size {
            job.batch_size = size;
        }
        if job.batch_size == 0 {
            return Err(MigrateError::Validation("Batch size must be greater than 0".to_string()));
        }
        if let Some(predicate) = cutoff {
            if predicate != job.predicate && job.processed_rows > 0 {
                return Err(MigrateError::Validation(format!(
                    "Job {} already processed {} rows; its cutoff cannot change",
                    job.id, job.processed_rows
                )));
            }
            job.predicate = predicate;
        }

        let mut summary = BatchRunSummary {
            job_id,
            rows_processed: 0,
            rows_written: 0,
            batches: 0,
            status: job.status,
            exhausted_batch_limit: false,
        };
        match job.status {
            JobStatus::Completed | JobStatus::Paused => return Ok(summary),
            JobStatus::Pending | JobStatus::Running | JobStatus::Failed => {}
        }

        let mapper = self.compile(&job).await?;
        job.status = JobStatus::Running;
        job.error_detail = None;
        job.started_at.get_or_insert_with(Utc::now);
        self.state.update_job(&job).await?;

        let span = info_span!(
            "batch.job",
            job_id = %job.id,
            source = %job.source_table,
            target = %job.target_table
        );
        self.drive(job, &mapper, summary).instrument(span).await
    }

    async fn drive(
        &self,
        mut job: MigrationJob,
        mapper: &RowMapper,
        mut summary: BatchRunSummary,
    ) -> Result<BatchRunSummary> {
        event!(
            Level::INFO,
            cursor = ?job.last_processed_cursor,
            batch_size = job.batch_size,
            "batch job started"
        );
        loop {
            if summary.batches >= self.max_batches {
                summary.exhausted_batch_limit = true;
                event!(Level::WARN, batches = summary.batches, "batch limit reached, job left running");
                break;
            }
            if self.state.get_job(job.id).await?.status == JobStatus::Paused {
                job.status = JobStatus::Paused;
                event!(Level::INFO, "batch job paused");
                break;
            }

            let batch_number = job.next_batch_number;
            let cursor_start = job.last_processed_cursor.clone();
            let started = Instant::now();
            match self.run_chunk(&job, mapper).await {
                Ok(None) => {
                    job.status = JobStatus::Completed;
                    job.completed_at = Some(Utc::now());
                    self.persist(&mut job).await?;
                    event!(Level::INFO, processed_rows = job.processed_rows, "batch job completed");
                    break;
                }
                Ok(Some(chunk)) => {
                    job.advance_checkpoint(chunk.cursor_end.clone(), chunk.scanned)?;
                    self.persist(&mut job).await?;
                    self.state
                        .append_batch_record(BatchExecutionRecord {
                            job_id: job.id,
                            batch_number,
                            cursor_start,
                            cursor_end: Some(chunk.cursor_end),
                            rows_affected: chunk.written,
                            duration_ms: started.elapsed().as_millis() as u64,
                            outcome: BatchOutcome::Succeeded,
                            error: None,
                            recorded_at: Utc::now(),
                        })
                        .await?;
                    summary.batches += 1;
                    summary.rows_processed += chunk.scanned;
                    summary.rows_written += chunk.written;
                    event!(
                        Level::DEBUG,
                        batch = batch_number,
                        rows = chunk.scanned,
                        written = chunk.written,
                        "batch committed"
                    );
                    if !self.batch_delay.is_zero() {
                        tokio::time::sleep(self.batch_delay).await;
                    }
                }
                Err(err) => {
                    event!(Level::ERROR, batch = batch_number, error = %err, "batch failed");
                    self.state
                        .append_batch_record(BatchExecutionRecord {
                            job_id: job.id,
                            batch_number,
                            cursor_start,
                            cursor_end: None,
                            rows_affected: 0,
                            duration_ms: started.elapsed().as_millis() as u64,
                            outcome: BatchOutcome::Failed,
                            error: Some(err.to_string()),
                            recorded_at: Utc::now(),
                        })
                        .await?;
                    job.status = JobStatus::Failed;
                    job.error_detail = Some(err.to_string());
                    self.state.update_job(&job).await?;
                    return Err(err);
                }
            }
        }
        summary.status = job.status;
        Ok(summary)
    }

    async fn run_chunk(&self, job: &MigrationJob, mapper: &RowMapper) -> Result<Option<ChunkOutcome>> {
        let rows = self
            .storage
            .scan_after(
                &job.source_table,
                job.last_processed_cursor.as_ref(),
                job.batch_size,
                &job.predicate,
            )
            .await?;
        let source_key = self.storage.table_schema(&job.source_table).await?.key_index();
        let Some(cursor_end) = rows.last().map(|row| row[source_key].clone()) else {
            return Ok(None);
        };
        let mapped = rows
            .iter()
            .map(|row| mapper.map_row(row))
            .collect::<Result<Vec<_>>>()?;
        let written = self
            .storage
            .upsert_rows(&job.target_table, mapped, job.conflict_policy)
            .await?;
        Ok(Some(ChunkOutcome {
            scanned: rows.len() as u64,
            written,
            cursor_end,
        }))
    }

    /// Saves the checkpoint without clobbering a pause issued meanwhile.
    async fn persist(&self, job: &mut MigrationJob) -> Result<()> {
        if job.status == JobStatus::Running
            && self.state.get_job(job.id).await?.status == JobStatus::Paused
        {
            job.status = JobStatus::Paused;
        }
        self.state.update_job(job).await
    }

    async fn compile(&self, job: &MigrationJob) -> Result<RowMapper> {
        let source = self.storage.table_schema(&job.source_table).await?;
        let target = self.storage.table_schema(&job.target_table).await?;
        if let Some(column) = job.predicate.column() {
            source.column_index(column)?;
        }
        job.mapping.compile(&source, &target)
    }

    pub async fn pause_job(&self, job_id: Uuid) -> Result<MigrationJob> {
        let mut job = self.state.get_job(job_id).await?;
        match job.status {
            JobStatus::Running | JobStatus::Pending => {
                job.status = JobStatus::Paused;
                self.state.update_job(&job).await?;
                event!(Level::INFO, job_id = %job.id, "batch job pause requested");
                Ok(job)
            }
            JobStatus::Paused => Ok(job),
            other => Err(MigrateError::InvalidTransition(format!(
                "job {} is {:?} and cannot be paused",
                job.id, other
            ))),
        }
    }

    /// Flips a paused job back to RUNNING; the next `run_batch_job` continues
    /// from the checkpoint.
    pub async fn resume_job(&self, job_id: Uuid) -> Result<MigrationJob> {
        let mut job = self.state.get_job(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(MigrateError::InvalidTransition(format!(
                "job {} is {:?}, only paused jobs can resume",
                job.id, job.status
            )));
        }
        job.status = JobStatus::Running;
        self.state.update_job(&job).await?;
        event!(Level::INFO, job_id = %job.id, "batch job resumed");
        Ok(job)
    }

    pub async fn estimate_remaining(&self, job_id: Uuid) -> Result<RemainingEstimate> {
        let job = self.state.get_job(job_id).await?;
        let remaining_rows = if job.status == JobStatus::Completed {
            0
        } else {
            job.total_rows_estimate.saturating_sub(job.processed_rows)
        };
        let batch_size = job.batch_size.max(1) as u64;
        let remaining_batches = remaining_rows.div_ceil(batch_size);
        let last_batch_duration_ms = self
            .state
            .last_batch_record(job_id)
            .await?
            .filter(|record| record.outcome == BatchOutcome::Succeeded)
            .map(|record| record.duration_ms);
        let delay_ms = self.batch_delay.as_millis() as u64;
        Ok(RemainingEstimate {
            job_id,
            remaining_rows,
            remaining_batches,
            last_batch_duration_ms,
            estimated_ms: last_batch_duration_ms
                .map(|duration| remaining_batches.saturating_mul(duration + delay_ms)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::mapping::SchemaMapping;
    use crate::core::{Column, DataType, TableSchema};
    use crate::state::InMemoryStateStore;
    use crate::storage::InMemoryStorage;

    async fn fixture(n: i64) -> (Arc<InMemoryStorage>, Arc<InMemoryStateStore>, BatchEngine) {
        let storage = Arc::new(InMemoryStorage::new());
        let columns = vec![
            Column::new("id", DataType::Integer).not_null(),
            Column::new("v", DataType::Integer),
        ];
        storage
            .create_table(TableSchema::new("src", columns.clone(), "id").unwrap())
            .await
            .unwrap();
        storage
            .create_table(TableSchema::new("dst", columns, "id").unwrap())
            .await
            .unwrap();
        let rows = (1..=n).map(|i| vec![Value::Integer(i), Value::Integer(i)]).collect();
        storage.insert_rows("src", rows).await.unwrap();
        let state = Arc::new(InMemoryStateStore::new());
        let engine = BatchEngine::new(storage.clone(), state.clone()).with_batch_delay(Duration::ZERO);
        (storage, state, engine)
    }

    fn job(batch_size: usize) -> MigrationJob {
        let mapping = SchemaMapping::new("src", "dst").map("id", "id").map("v", "v");
        MigrationJob::new(mapping, RowPredicate::All, batch_size)
    }

    #[tokio::test]
    async fn test_zero_batch_size_rejected() {
        let (_, _, engine) = fixture(3).await;
        assert!(engine.create_job(job(0)).await.unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn test_runs_to_completion_in_chunks() {
        let (storage, state, engine) = fixture(25).await;
        let job = engine.create_job(job(10)).await.unwrap();
        let summary = engine.run_batch_job(job.id, None, None).await.unwrap();
        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.rows_processed, 25);
        assert_eq!(summary.batches, 3);
        assert_eq!(storage.row_count("dst").await.unwrap(), 25);

        let records = state.batch_records(job.id).await.unwrap();
        let numbers: Vec<_> = records.iter().map(|r| r.batch_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(records[2].cursor_end, Some(Value::Integer(25)));
    }

    #[tokio::test]
    async fn test_batch_limit_leaves_job_running() {
        let (_, _, engine) = fixture(25).await;
        let engine = engine.with_max_batches(1);
        let job = engine.create_job(job(10)).await.unwrap();
        let summary = engine.run_batch_job(job.id, None, None).await.unwrap();
        assert!(summary.exhausted_batch_limit);
        assert_eq!(summary.status, JobStatus::Running);
        assert_eq!(summary.rows_processed, 10);
    }

    #[tokio::test]
    async fn test_paused_job_does_not_run() {
        let (storage, _, engine) = fixture(5).await;
        let job = engine.create_job(job(2)).await.unwrap();
        engine.pause_job(job.id).await.unwrap();
        let summary = engine.run_batch_job(job.id, None, None).await.unwrap();
        assert_eq!(summary.status, JobStatus::Paused);
        assert_eq!(storage.row_count("dst").await.unwrap(), 0);
        assert!(engine.resume_job(job.id).await.is_ok());
        assert!(engine.resume_job(job.id).await.is_err());
    }

    #[tokio::test]
    async fn test_estimate_remaining_counts_batches() {
        let (_, _, engine) = fixture(25).await;
        let engine = engine.with_max_batches(1);
        let job = engine.create_job(job(10)).await.unwrap();
        engine.run_batch_job(job.id, None, None).await.unwrap();
        let estimate = engine.estimate_remaining(job.id).await.unwrap();
        assert_eq!(estimate.remaining_rows, 15);
        assert_eq!(estimate.remaining_batches, 2);
        assert!(estimate.last_batch_duration_ms.is_some());
    }
}
