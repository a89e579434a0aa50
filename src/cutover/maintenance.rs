//! Operator-side cutover maintenance: restoring a backup and expiring old ones.

use super::switch::{CutoverEngine, SwitchReport, backup_name, parse_backup_timestamp};
use crate::core::{MigrateError, Result};
use crate::storage::pattern::eval_like;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{Instrument, Level, event, info_span};

/// Suffix for the relation displaced by an operator rollback.
pub const ROLLED_BACK_SUFFIX: &str = "rolled_back";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRelation {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub row_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedBackup {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub pattern: String,
    pub dry_run: bool,
    pub threshold: DateTime<Utc>,
    /// Expired relations: dropped, or the ones that would be in a dry run.
    pub expired: Vec<BackupRelation>,
    pub dropped: Vec<String>,
    pub retained: Vec<String>,
    pub skipped: Vec<SkippedBackup>,
}

impl CutoverEngine {
    /// Puts `backup` back under the name `current`.
    ///
    /// The displaced relation is kept as `{current}_rolled_back_{timestamp}`
    /// and foreign keys that referenced `current` are re-pointed at the
    /// restored relation. Runs through the same guarded swap as a cutover.
    pub async fn rollback(
        &self,
        current: &str,
        backup: &str,
        allow_standby_override: bool,
    ) -> Result<SwitchReport> {
        let parked = backup_name(current, ROLLED_BACK_SUFFIX, Utc::now());
        let op = self
            .prepare(current, backup, parked, allow_standby_override)
            .await?;
        let span = info_span!("cutover.rollback", current = %current, backup = %backup);
        self.execute(op).instrument(span).await
    }

    /// Drops relations whose name matches the LIKE `pattern` and whose
    /// embedded timestamp is older than `older_than`.
    pub async fn cleanup_old_backups(
        &self,
        pattern: &str,
        older_than: Duration,
        dry_run: bool,
    ) -> Result<CleanupReport> {
        if older_than < Duration::zero() {
            return Err(MigrateError::Validation("Cleanup age must not be negative".to_string()));
        }
        let threshold = Utc::now() - older_than;
        let mut report = CleanupReport {
            pattern: pattern.to_string(),
            dry_run,
            threshold,
            expired: Vec::new(),
            dropped: Vec::new(),
            retained: Vec::new(),
            skipped: Vec::new(),
        };

        for name in self.storage().list_tables().await? {
            if !eval_like(&name, pattern)? {
                continue;
            }
            let Some(created_at) = parse_backup_timestamp(&name) else {
                report.skipped.push(SkippedBackup {
                    name,
                    reason: "no embedded timestamp".to_string(),
                });
                continue;
            };
            if created_at >= threshold {
                report.retained.push(name);
                continue;
            }
            let row_count = self.storage().row_count(&name).await?;
            report.expired.push(BackupRelation {
                name: name.clone(),
                created_at,
                row_count,
            });
            if dry_run {
                continue;
            }
            match self.storage().drop_table(&name).await {
                Ok(()) => {
                    event!(Level::INFO, table = %name, rows = row_count, "backup dropped");
                    report.dropped.push(name);
                }
                Err(err) => {
                    event!(Level::WARN, table = %name, error = %err, "backup drop failed");
                    report.skipped.push(SkippedBackup {
                        name,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }
}
