use crate::core::{ForeignKey, MigrateError, Result};
use crate::storage::StorageEngine;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const TIMESTAMP_LEN: usize = 15;

/// `{table}_{suffix}_{YYYYMMDD_HHMMSS}`.
pub fn backup_name(table: &str, suffix: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}_{}", table, suffix, at.format(TIMESTAMP_FORMAT))
}

/// Timestamp embedded at the end of a name built by `backup_name`.
pub fn parse_backup_timestamp(name: &str) -> Option<DateTime<Utc>> {
    let split = name.len().checked_sub(TIMESTAMP_LEN)?;
    let tail = name.get(split..)?;
    if split == 0 || !name[..split].ends_with('_') {
        return None;
    }
    NaiveDateTime::parse_from_str(tail, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn temp_name(table: &str) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("{}_swap_{}", table, &token[..8])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwitchStatus {
    Completed,
    /// A step failed and the original layout was restored and verified.
    RolledBack,
    /// The unwind itself failed somewhere; see `manual_intervention`.
    RollbackPartial,
    /// The unwind ran but the restored layout could not be confirmed.
    RollbackUnverified,
}

/// In-flight state of one swap. `step` alone decides how far the unwind goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchOperation {
    pub old_name: String,
    pub new_name: String,
    pub backup_name: String,
    pub temp_name: String,
    pub step: u8,
    pub dependent_foreign_keys: Vec<ForeignKey>,
    pub old_row_count: u64,
    pub new_row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchReport {
    pub status: SwitchStatus,
    pub old_name: String,
    pub new_name: String,
    pub backup_name: String,
    pub steps_completed: u8,
    pub old_row_count: u64,
    pub new_row_count: u64,
    pub foreign_keys_repointed: usize,
    pub error: Option<String>,
    pub manual_intervention: Vec<String>,
}

impl SwitchReport {
    fn from_operation(op: &SwitchOperation, status: SwitchStatus) -> Self {
        Self {
            status,
            old_name: op.old_name.clone(),
            new_name: op.new_name.clone(),
            backup_name: op.backup_name.clone(),
            steps_completed: op.step,
            old_row_count: op.old_row_count,
            new_row_count: op.new_row_count,
            foreign_keys_repointed: 0,
            error: None,
            manual_intervention: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == SwitchStatus::Completed
    }
}

/// Rename-based relation swap with foreign-key rewiring and unwind.
pub struct CutoverEngine {
    storage: Arc<dyn StorageEngine>,
}

impl CutoverEngine {
    pub fn new(storage: Arc<dyn StorageEngine>) -> Self {
        Self { storage }
    }

    pub(crate) fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Swaps `new` into the place of `old`; `old` survives as a timestamped
    /// backup.
    ///
    /// Precondition failures return `Err` before anything is touched. Once
    /// the swap has started, failures are reported through
    /// [`SwitchReport::status`].
    pub async fn atomic_switch(
        &self,
        old: &str,
        new: &str,
        backup_suffix: &str,
        allow_standby_override: bool,
    ) -> Result<SwitchReport> {
        if backup_suffix.trim().is_empty() {
            return Err(MigrateError::Validation("Backup suffix must not be empty".to_string()));
        }
        let backup = backup_name(old, backup_suffix, Utc::now());
        let op = self.prepare(old, new, backup, allow_standby_override).await?;
        let span = info_span!("cutover.switch", old = %old, new = %new, backup = %op.backup_name);
        self.execute(op).instrument(span).await
    }

    /// Validates names, role and counts; discovers dependent constraints.
    pub(crate) async fn prepare(
        &self,
        old: &str,
        new: &str,
        backup: String,
        allow_standby_override: bool,
    ) -> Result<SwitchOperation> {
        if old == new {
            return Err(MigrateError::Validation(format!(
                "Cannot switch '{}' with itself",
                old
            )));
        }
        for name in [old, new] {
            if !self.storage.table_exists(name).await? {
                return Err(MigrateError::TableNotFound(name.to_string()));
            }
        }
        let temp = temp_name(old);
        for name in [&backup, &temp] {
            if self.storage.table_exists(name).await? {
                return Err(MigrateError::TableExists(name.clone()));
            }
        }
        if !allow_standby_override && !self.storage.accepts_writes().await? {
            return Err(MigrateError::Validation(
                "Site is a standby and does not accept writes; pass the standby override to proceed"
                    .to_string(),
            ));
        }

        // Self-references travel with the old relation into the backup.
        let dependent_foreign_keys = self
            .storage
            .foreign_keys_referencing(old)
            .await?
            .into_iter()
            .filter(|fk| fk.table != old && fk.table != new)
            .collect();

        Ok(SwitchOperation {
            old_name: old.to_string(),
            new_name: new.to_string(),
            backup_name: backup,
            temp_name: temp,
            step: 0,
            dependent_foreign_keys,
            old_row_count: self.storage.row_count(old).await?,
            new_row_count: self.storage.row_count(new).await?,
        })
    }

    pub(crate) async fn execute(&self, mut op: SwitchOperation) -> Result<SwitchReport> {
        event!(
            Level::INFO,
            old_rows = op.old_row_count,
            new_rows = op.new_row_count,
            dependents = op.dependent_foreign_keys.len(),
            "cutover validated"
        );
        self.storage.begin_ddl().await?;

        match self.run_steps(&mut op).await {
            Ok(repointed) => {
                let mut report = SwitchReport::from_operation(&op, SwitchStatus::Completed);
                report.foreign_keys_repointed = repointed;
                event!(Level::INFO, repointed, "cutover completed");
                Ok(report)
            }
            Err(err) => {
                event!(Level::ERROR, step = op.step, error = %err, "cutover step failed, rolling back");
                let mut report = self.unwind(&op).await;
                report.error = Some(err.to_string());
                Ok(report)
            }
        }
    }

    async fn run_steps(&self, op: &mut SwitchOperation) -> Result<usize> {
        self.storage.rename_table(&op.old_name, &op.backup_name).await?;
        op.step = 1;
        self.storage.rename_table(&op.new_name, &op.old_name).await?;
        op.step = 2;
        for fk in &op.dependent_foreign_keys {
            // The rename in step 1 carried the constraint over to the backup.
            self.storage.drop_foreign_key(&fk.table, &fk.name).await?;
            self.storage.add_foreign_key(fk.pointing_at(&op.old_name)).await?;
        }
        op.step = 3;
        self.storage.commit_ddl().await?;
        op.step = 4;
        Ok(op.dependent_foreign_keys.len())
    }

    /// Restores the pre-swap layout. Every action tolerates work that is
    /// already undone (missing relation, name already restored).
    async fn unwind(&self, op: &SwitchOperation) -> SwitchReport {
        let mut manual = Vec::new();

        if let Err(err) = self.storage.rollback_ddl().await {
            event!(Level::WARN, error = %err, "DDL rollback failed, unwinding manually");
        }

        if op.step >= 1 {
            if let Err(err) = self.unwind_renames(op, &mut manual).await {
                manual.push(format!("rename unwind failed: {}", err));
            }
            if let Err(err) = self.restore_foreign_keys(op).await {
                manual.push(format!("foreign key restore failed: {}", err));
            }
        }

        let status = if !manual.is_empty() {
            SwitchStatus::RollbackPartial
        } else {
            match self.verify_restored(op).await {
                Ok(problems) if problems.is_empty() => SwitchStatus::RolledBack,
                Ok(problems) => {
                    manual.extend(problems);
                    SwitchStatus::RollbackUnverified
                }
                Err(err) => {
                    manual.push(format!("verification failed: {}", err));
                    SwitchStatus::RollbackUnverified
                }
            }
        };

        match status {
            SwitchStatus::RolledBack => event!(Level::WARN, "cutover rolled back"),
            _ => event!(Level::ERROR, ?status, notes = ?manual, "cutover rollback needs attention"),
        }
        let mut report = SwitchReport::from_operation(op, status);
        report.manual_intervention = manual;
        report
    }

    async fn unwind_renames(&self, op: &SwitchOperation, manual: &mut Vec<String>) -> Result<()> {
        let backup_present = self.storage.table_exists(&op.backup_name).await?;
        if !backup_present {
            // Step 1 never took effect or was already reverted.
            return Ok(());
        }
        if self.storage.table_exists(&op.old_name).await? {
            // Step 2 took effect: move the new relation off the old name.
            let parking = if self.storage.table_exists(&op.new_name).await? {
                manual.push(format!(
                    "'{}' was occupied; new relation parked as '{}'",
                    op.new_name, op.temp_name
                ));
                &op.temp_name
            } else {
                &op.new_name
            };
            self.storage.rename_table(&op.old_name, parking).await?;
        }
        self.storage.rename_table(&op.backup_name, &op.old_name).await
    }

    async fn restore_foreign_keys(&self, op: &SwitchOperation) -> Result<()> {
        let current = self.storage.foreign_keys().await?;
        for fk in &op.dependent_foreign_keys {
            match current.iter().find(|c| c.table == fk.table && c.name == fk.name) {
                Some(existing) if existing.referenced_table == op.old_name => {}
                Some(_) => {
                    self.storage.drop_foreign_key(&fk.table, &fk.name).await?;
                    self.storage.add_foreign_key(fk.pointing_at(&op.old_name)).await?;
                }
                None => self.storage.add_foreign_key(fk.pointing_at(&op.old_name)).await?,
            }
        }
        Ok(())
    }

    async fn verify_restored(&self, op: &SwitchOperation) -> Result<Vec<String>> {
        let mut problems = Vec::new();
        if !self.storage.table_exists(&op.old_name).await? {
            problems.push(format!("'{}' is missing", op.old_name));
        } else if self.storage.row_count(&op.old_name).await? != op.old_row_count {
            problems.push(format!("'{}' row count changed", op.old_name));
        }
        if !self.storage.table_exists(&op.new_name).await? {
            problems.push(format!("'{}' is missing", op.new_name));
        }
        if self.storage.table_exists(&op.backup_name).await? {
            problems.push(format!("'{}' still exists", op.backup_name));
        }
        let current = self.storage.foreign_keys().await?;
        for fk in &op.dependent_foreign_keys {
            let restored = current.iter().any(|c| {
                c.table == fk.table && c.name == fk.name && c.referenced_table == op.old_name
            });
            if !restored {
                problems.push(format!(
                    "constraint '{}' on '{}' does not reference '{}'",
                    fk.name, fk.table, op.old_name
                ));
            }
        }
        Ok(problems)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_name_round_trips_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let name = backup_name("orders", "backup", at);
        assert_eq!(name, "orders_backup_20240309_140507");
        assert_eq!(parse_backup_timestamp(&name), Some(at));
    }

    #[test]
    fn test_parse_rejects_untimestamped_names() {
        assert_eq!(parse_backup_timestamp("orders"), None);
        assert_eq!(parse_backup_timestamp("orders_backup"), None);
        assert_eq!(parse_backup_timestamp("20240309_140507"), None);
        assert_eq!(parse_backup_timestamp("x20240309_140507"), None);
    }
}
