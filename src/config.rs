use crate::batch::mapping::SchemaMapping;
use crate::capture::CaptureMode;
use crate::core::{MigrateError, Result, TableSchema};
use crate::storage::persistence::read_json;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Per-site orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigratorConfig {
    /// Name of this site; stamped into provenance columns and markers
    pub site_name: String,

    /// Name of the peer site, used in generated partner scripts
    pub partner_site: Option<String>,

    /// Rows per batch
    pub batch_size: usize,

    /// Pause between batches
    #[serde(with = "millis", rename = "batch_delay_ms")]
    pub batch_delay: Duration,

    /// Safety valve on batches per job invocation
    pub max_batches: u64,

    /// Interval between partner readiness checks
    #[serde(with = "millis", rename = "readiness_poll_interval_ms")]
    pub readiness_poll_interval: Duration,

    /// Readiness checks before giving up
    pub readiness_max_attempts: u32,

    pub backup_suffix: String,

    /// Allow cutover on a site that does not accept writes
    pub allow_standby_override: bool,

    /// Inbound replication subscriptions paused during the migration
    pub subscriptions: Vec<String>,

    pub capture_mode: CaptureMode,

    /// Bound on the suppressed-forwarding error log
    pub capture_error_capacity: usize,

    /// Target column holding the originating site
    pub provenance_column: String,

    /// Target column marking rows copied by the migration
    pub migration_tag_column: String,

    pub migration_tag_value: String,

    /// When set, the cutoff is estimated from this many samples
    pub cutoff_sample_size: Option<usize>,

    /// Clean up (and report ROLLED_BACK) after a failed operation
    pub rollback_on_failure: bool,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self::new("local")
    }
}

impl MigratorConfig {
    pub fn new(site_name: &str) -> Self {
        Self {
            site_name: site_name.to_string(),
            partner_site: None,
            batch_size: 1000,
            batch_delay: Duration::from_millis(100),
            max_batches: 100_000,
            readiness_poll_interval: Duration::from_secs(10),
            readiness_max_attempts: 30,
            backup_suffix: "backup".to_string(),
            allow_standby_override: false,
            subscriptions: Vec::new(),
            capture_mode: CaptureMode::Strict,
            capture_error_capacity: 1024,
            provenance_column: "origin_site".to_string(),
            migration_tag_column: "migration_source".to_string(),
            migration_tag_value: "migrated".to_string(),
            cutoff_sample_size: None,
            rollback_on_failure: true,
        }
    }

    pub fn partner_site(mut self, partner: &str) -> Self {
        self.partner_site = Some(partner.to_string());
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn batch_delay(mut self, delay: Duration) -> Self {
        self.batch_delay = delay;
        self
    }

    pub fn max_batches(mut self, max: u64) -> Self {
        self.max_batches = max;
        self
    }

    /// Set the readiness poll interval and attempt count
    pub fn readiness_poll(mut self, interval: Duration, attempts: u32) -> Self {
        self.readiness_poll_interval = interval;
        self.readiness_max_attempts = attempts;
        self
    }

    pub fn backup_suffix(mut self, suffix: &str) -> Self {
        self.backup_suffix = suffix.to_string();
        self
    }

    pub fn allow_standby_override(mut self, allow: bool) -> Self {
        self.allow_standby_override = allow;
        self
    }

    pub fn subscription(mut self, name: &str) -> Self {
        self.subscriptions.push(name.to_string());
        self
    }

    pub fn capture_mode(mut self, mode: CaptureMode) -> Self {
        self.capture_mode = mode;
        self
    }

    pub fn provenance_column(mut self, column: &str) -> Self {
        self.provenance_column = column.to_string();
        self
    }

    pub fn migration_tag(mut self, column: &str, value: &str) -> Self {
        self.migration_tag_column = column.to_string();
        self.migration_tag_value = value.to_string();
        self
    }

    pub fn cutoff_sample_size(mut self, samples: usize) -> Self {
        self.cutoff_sample_size = Some(samples);
        self
    }

    pub fn rollback_on_failure(mut self, rollback: bool) -> Self {
        self.rollback_on_failure = rollback;
        self
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let config: Self = read_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(MigrateError::Config(msg.to_string()));
        if self.site_name.trim().is_empty() {
            return fail("site_name cannot be empty");
        }
        if self.partner_site.as_deref() == Some(self.site_name.as_str()) {
            return fail("partner_site must differ from site_name");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be > 0");
        }
        if self.max_batches == 0 {
            return fail("max_batches must be > 0");
        }
        if self.readiness_max_attempts == 0 {
            return fail("readiness_max_attempts must be > 0");
        }
        if self.backup_suffix.trim().is_empty() {
            return fail("backup_suffix cannot be empty");
        }
        if self.provenance_column.is_empty() || self.migration_tag_column.is_empty() {
            return fail("provenance and migration tag columns must be named");
        }
        if self.provenance_column == self.migration_tag_column {
            return fail("provenance and migration tag columns must differ");
        }
        if self.cutoff_sample_size == Some(0) {
            return fail("cutoff_sample_size must be > 0 when set");
        }
        Ok(())
    }

    /// Upper bound on the readiness wait.
    pub fn readiness_timeout(&self) -> Duration {
        self.readiness_poll_interval * self.readiness_max_attempts
    }
}

/// What one coordinated migration moves where.
///
/// Rows older than the cutoff on `ordering_column` go to `archive_table`
/// through `archive_mapping`; the rest go to `target_table` through
/// `mapping`, tagged and stamped with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub source_table: String,
    pub target_table: String,
    pub archive_table: String,
    pub target_schema: TableSchema,
    /// Defaults to the source layout under the archive name.
    #[serde(default)]
    pub archive_schema: Option<TableSchema>,
    pub mapping: SchemaMapping,
    /// Defaults to a by-name mapping from source to archive.
    #[serde(default)]
    pub archive_mapping: Option<SchemaMapping>,
    pub ordering_column: String,
    /// Fraction of rows (newest by `ordering_column`) kept in the new relation.
    pub retention: f64,
    #[serde(default)]
    pub perform_cutover: bool,
    /// Partner only: hold sync pause until the coordinator's pause marker arrives.
    #[serde(default)]
    pub wait_for_coordinator_pause: bool,
}

impl MigrationPlan {
    pub fn new(
        source_table: &str,
        target_schema: TableSchema,
        mapping: SchemaMapping,
        ordering_column: &str,
        retention: f64,
    ) -> Self {
        Self {
            source_table: source_table.to_string(),
            target_table: target_schema.name().to_string(),
            archive_table: format!("{}_archive", source_table),
            target_schema,
            archive_schema: None,
            mapping,
            archive_mapping: None,
            ordering_column: ordering_column.to_string(),
            retention,
            perform_cutover: false,
            wait_for_coordinator_pause: false,
        }
    }

    pub fn archive_table(mut self, name: &str) -> Self {
        self.archive_table = name.to_string();
        self
    }

    pub fn archive_schema(mut self, schema: TableSchema) -> Self {
        self.archive_table = schema.name().to_string();
        self.archive_schema = Some(schema);
        self
    }

    pub fn archive_mapping(mut self, mapping: SchemaMapping) -> Self {
        self.archive_mapping = Some(mapping);
        self
    }

    pub fn with_cutover(mut self, cutover: bool) -> Self {
        self.perform_cutover = cutover;
        self
    }

    pub fn wait_for_coordinator_pause(mut self, wait: bool) -> Self {
        self.wait_for_coordinator_pause = wait;
        self
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        read_json(path)
    }

    /// Static checks that need no storage access.
    pub fn validate(&self) -> Result<()> {
        let names = [&self.source_table, &self.target_table, &self.archive_table];
        if names.iter().any(|n| n.trim().is_empty()) {
            return Err(MigrateError::Validation("Relation names cannot be empty".to_string()));
        }
        if self.source_table == self.target_table
            || self.source_table == self.archive_table
            || self.target_table == self.archive_table
        {
            return Err(MigrateError::Validation(
                "Source, target and archive relations must be distinct".to_string(),
            ));
        }
        if !self.retention.is_finite() || !(0.0..=1.0).contains(&self.retention) {
            return Err(MigrateError::Validation(format!(
                "Retention fraction must be within [0, 1], got {}",
                self.retention
            )));
        }
        if self.target_schema.name() != self.target_table {
            return Err(MigrateError::Validation(format!(
                "Target schema is named '{}', expected '{}'",
                self.target_schema.name(),
                self.target_table
            )));
        }
        // Deserialized schemas skip the constructor checks.
        TableSchema::new(
            self.target_schema.name(),
            self.target_schema.columns().to_vec(),
            self.target_schema.primary_key(),
        )?;
        if let Some(archive) = &self.archive_schema {
            if archive.name() != self.archive_table {
                return Err(MigrateError::Validation(format!(
                    "Archive schema is named '{}', expected '{}'",
                    archive.name(),
                    self.archive_table
                )));
            }
            TableSchema::new(archive.name(), archive.columns().to_vec(), archive.primary_key())?;
        }
        if self.mapping.source_table != self.source_table
            || self.mapping.target_table != self.target_table
        {
            return Err(MigrateError::Validation(format!(
                "Mapping covers '{}' -> '{}', plan is '{}' -> '{}'",
                self.mapping.source_table,
                self.mapping.target_table,
                self.source_table,
                self.target_table
            )));
        }
        Ok(())
    }

    /// Archive layout, given the live source schema.
    pub fn resolved_archive_schema(&self, source: &TableSchema) -> TableSchema {
        self.archive_schema
            .clone()
            .unwrap_or_else(|| source.renamed(&self.archive_table))
    }

    pub fn resolved_archive_mapping(&self, source: &TableSchema, archive: &TableSchema) -> SchemaMapping {
        self.archive_mapping
            .clone()
            .unwrap_or_else(|| SchemaMapping::by_name(source, archive))
    }
}
