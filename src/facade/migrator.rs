use crate::batch::{BatchEngine, RemainingEstimate, require_ordering_values};
use crate::capture::{CaptureError, CaptureErrorChannel, DrainReport};
use crate::config::{MigrationPlan, MigratorConfig};
use crate::coordination::{CoordinationDriver, OperationReport, SiteRole, StartRequest};
use crate::core::{MigrateError, Result, TableSchema};
use crate::cutover::{CleanupReport, CutoverEngine, SwitchReport};
use crate::state::{
    ControlStore, CoordinationOperation, InMemoryStateStore, MigrationJob, StateStore,
};
use crate::storage::StorageEngine;
use crate::transport::{ReplicationTransport, SubscriptionStatus};
use crate::verify::{self, ConsistencyCheck, ConsistencyReport};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{Level, event};
use uuid::Uuid;

/// Operator request to start this site's side of a coordinated migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRequest {
    /// Minted when absent. The partner must be started with the same id.
    pub operation_id: Option<Uuid>,
    pub plan: MigrationPlan,
    pub is_coordinator: bool,
    #[serde(default)]
    pub wait_for_partner: bool,
}

impl MigrationRequest {
    pub fn coordinator(plan: MigrationPlan) -> Self {
        Self {
            operation_id: None,
            plan,
            is_coordinator: true,
            wait_for_partner: true,
        }
    }

    pub fn partner(plan: MigrationPlan, operation_id: Uuid) -> Self {
        Self {
            operation_id: Some(operation_id),
            plan,
            is_coordinator: false,
            wait_for_partner: false,
        }
    }

    pub fn with_operation_id(mut self, operation_id: Uuid) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    pub fn wait_for_partner(mut self, wait: bool) -> Self {
        self.wait_for_partner = wait;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job: MigrationJob,
    pub progress_percent: Option<f64>,
    pub remaining: Option<RemainingEstimate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub operation: CoordinationOperation,
    pub jobs: Vec<JobProgress>,
    pub replication_lag_bytes: u64,
    pub subscriptions: Vec<SubscriptionStatus>,
    pub capture_errors: Vec<CaptureError>,
    pub capture_errors_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub site: String,
    pub table: String,
    pub ready: bool,
    pub checks: Vec<ReadinessCheck>,
}

impl ReadinessReport {
    fn push(&mut self, name: &str, outcome: Result<String>) {
        let (passed, detail) = match outcome {
            Ok(detail) => (true, detail),
            Err(err) => (false, err.to_string()),
        };
        self.checks.push(ReadinessCheck {
            name: name.to_string(),
            passed,
            detail,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &ReadinessCheck> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

/// What the partner site's operator needs to join an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerScript {
    pub operation_id: Uuid,
    pub coordinator_site: String,
    pub partner_site: Option<String>,
    pub request: MigrationRequest,
    pub steps: Vec<String>,
}

impl PartnerScript {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub cutoff: DateTime<Utc>,
    pub purged: u64,
}

/// Operator surface of one site.
pub struct Migrator {
    config: MigratorConfig,
    storage: Arc<dyn StorageEngine>,
    state: Arc<dyn StateStore>,
    transport: Arc<dyn ReplicationTransport>,
    capture_errors: CaptureErrorChannel,
    driver: CoordinationDriver,
    cutover: CutoverEngine,
}

impl Migrator {
    pub fn new(
        config: MigratorConfig,
        storage: Arc<dyn StorageEngine>,
        state: Arc<dyn StateStore>,
        control: Arc<dyn ControlStore>,
        transport: Arc<dyn ReplicationTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let capture_errors = CaptureErrorChannel::new(config.capture_error_capacity);
        let driver = CoordinationDriver::new(
            config.clone(),
            storage.clone(),
            state.clone(),
            control,
            transport.clone(),
            capture_errors.clone(),
        );
        let cutover = CutoverEngine::new(storage.clone());
        Ok(Self {
            config,
            storage,
            state,
            transport,
            capture_errors,
            driver,
            cutover,
        })
    }

    /// One in-memory store serving as both job/operation state and control flags.
    pub fn with_store(
        config: MigratorConfig,
        storage: Arc<dyn StorageEngine>,
        store: Arc<InMemoryStateStore>,
        transport: Arc<dyn ReplicationTransport>,
    ) -> Result<Self> {
        Self::new(config, storage, store.clone(), store, transport)
    }

    pub fn config(&self) -> &MigratorConfig {
        &self.config
    }

    pub fn batch_engine(&self) -> &BatchEngine {
        self.driver.batch_engine()
    }

    pub fn capture_errors(&self) -> &CaptureErrorChannel {
        &self.capture_errors
    }

    async fn audit(&self, operation_id: Option<Uuid>, action: &str, detail: &str) {
        if let Err(err) = self
            .state
            .append_audit(&self.config.site_name, operation_id, action, detail)
            .await
        {
            event!(Level::WARN, error = %err, action, "audit append failed");
        }
    }

    pub async fn start_coordinated_migration(
        &self,
        request: MigrationRequest,
    ) -> Result<OperationReport> {
        let operation_id = request.operation_id.unwrap_or_else(Uuid::new_v4);
        self.audit(
            Some(operation_id),
            "start_coordinated_migration",
            &format!(
                "{} -> {} as {}",
                request.plan.source_table,
                request.plan.target_table,
                if request.is_coordinator { "coordinator" } else { "partner" }
            ),
        )
        .await;
        let role = if request.is_coordinator {
            SiteRole::Coordinator
        } else {
            SiteRole::Partner
        };
        let report = self
            .driver
            .run(StartRequest {
                operation_id,
                role,
                wait_for_partner: request.is_coordinator && request.wait_for_partner,
                plan: request.plan,
            })
            .await?;
        event!(
            Level::INFO,
            operation_id = %operation_id,
            status = %report.status(),
            "coordinated migration finished"
        );
        Ok(report)
    }

    pub async fn check_status(&self, operation_id: Uuid) -> Result<StatusReport> {
        let operation = self.state.get_operation(operation_id).await?;
        let mut jobs = Vec::new();
        for job in self.state.jobs_for_operation(operation_id).await? {
            let remaining = if job.status.is_active() {
                Some(self.batch_engine().estimate_remaining(job.id).await?)
            } else {
                None
            };
            jobs.push(JobProgress {
                progress_percent: job.progress_percent(),
                remaining,
                job,
            });
        }
        self.audit(Some(operation_id), "check_status", &operation.status.to_string())
            .await;
        Ok(StatusReport {
            operation,
            jobs,
            replication_lag_bytes: self.transport.lag_bytes().await?,
            subscriptions: self.transport.subscriptions().await?,
            capture_errors: self.capture_errors.snapshot(),
            capture_errors_dropped: self.capture_errors.dropped(),
        })
    }

    /// Runs every pre-flight check without mutating anything.
    pub async fn validate_readiness(&self, plan: &MigrationPlan) -> Result<ReadinessReport> {
        let mut report = ReadinessReport {
            site: self.config.site_name.clone(),
            table: plan.source_table.clone(),
            ready: false,
            checks: Vec::new(),
        };
        report.push("config", self.config.validate().map(|_| "valid".to_string()));
        report.push("plan", plan.validate().map(|_| "valid".to_string()));

        match self.storage.table_schema(&plan.source_table).await {
            Ok(source) => {
                report.push(
                    "source",
                    Ok(format!(
                        "'{}' present with {} rows",
                        plan.source_table,
                        self.storage.row_count(&plan.source_table).await?
                    )),
                );
                let ordering = match source.column_index(&plan.ordering_column) {
                    Ok(_) => require_ordering_values(
                        self.storage.as_ref(),
                        &plan.source_table,
                        &plan.ordering_column,
                    )
                    .await
                    .map(|ranked| {
                        format!("'{}' present, {} row(s) ranked", plan.ordering_column, ranked)
                    }),
                    Err(err) => Err(err),
                };
                report.push("ordering_column", ordering);
                let archive = plan.resolved_archive_schema(&source);
                for (name, schema) in [("target", &plan.target_schema), ("archive", &archive)] {
                    let outcome = self.relation_slot(schema).await;
                    report.push(name, outcome);
                }
                report.push(
                    "mapping",
                    plan.mapping
                        .compile(&source, &plan.target_schema)
                        .map(|_| format!("{} column(s) mapped", plan.mapping.columns.len())),
                );
                report.push(
                    "archive_mapping",
                    plan.resolved_archive_mapping(&source, &archive)
                        .compile(&source, &archive)
                        .map(|_| "compiles".to_string()),
                );
            }
            Err(err) => report.push("source", Err(err)),
        }

        let writable = self.storage.accepts_writes().await?;
        let role_check = if writable {
            Ok("site accepts writes".to_string())
        } else if !plan.perform_cutover {
            Ok("standby, no cutover planned".to_string())
        } else if self.config.allow_standby_override {
            Ok("standby, override enabled".to_string())
        } else {
            Err(MigrateError::Validation(
                "site is a standby and cutover needs the override".to_string(),
            ))
        };
        report.push("site_role", role_check);

        let known = self.transport.subscriptions().await?;
        let missing: Vec<&String> = self
            .config
            .subscriptions
            .iter()
            .filter(|name| !known.iter().any(|s| &s.name == *name))
            .collect();
        report.push(
            "subscriptions",
            if missing.is_empty() {
                Ok(format!("{} configured", self.config.subscriptions.len()))
            } else {
                Err(MigrateError::Transport(format!("unknown subscription(s): {:?}", missing)))
            },
        );

        let busy = self
            .state
            .list_operations()
            .await?
            .into_iter()
            .find(|op| op.table_name == plan.source_table && !op.status.is_terminal());
        report.push(
            "no_active_operation",
            match busy {
                Some(op) => Err(MigrateError::Validation(format!(
                    "operation {} is {}",
                    op.operation_id, op.status
                ))),
                None => Ok("none in flight".to_string()),
            },
        );

        report.ready = report.checks.iter().all(|c| c.passed);
        self.audit(
            None,
            "validate_readiness",
            &format!("{}: ready={}", plan.source_table, report.ready),
        )
        .await;
        Ok(report)
    }

    async fn relation_slot(&self, schema: &TableSchema) -> Result<String> {
        if !self.storage.table_exists(schema.name()).await? {
            return Ok(format!("'{}' will be created", schema.name()));
        }
        if self.storage.table_schema(schema.name()).await? == *schema {
            Ok(format!("'{}' exists with the planned layout", schema.name()))
        } else {
            Err(MigrateError::TableExists(schema.name().to_string()))
        }
    }

    /// Builds the instructions and request the partner site runs.
    pub async fn generate_partner_script(
        &self,
        plan: &MigrationPlan,
        operation_id: Uuid,
    ) -> Result<PartnerScript> {
        plan.validate()?;
        let partner = self.config.partner_site.clone();
        let request = MigrationRequest::partner(plan.clone(), operation_id);
        let steps = vec![
            format!(
                "On site '{}', load the same plan and run `live-migrate validate`.",
                partner.as_deref().unwrap_or("<partner>")
            ),
            format!(
                "Start the partner side with operation id {} before the coordinator times out ({:?}).",
                operation_id,
                self.config.readiness_timeout()
            ),
            format!(
                "Watch progress with `live-migrate status --operation-id {}` on both sites.",
                operation_id
            ),
            format!(
                "On failure, check that subscriptions {:?} are enabled on both sites.",
                self.config.subscriptions
            ),
        ];
        self.audit(Some(operation_id), "generate_partner_script", &plan.source_table)
            .await;
        Ok(PartnerScript {
            operation_id,
            coordinator_site: self.config.site_name.clone(),
            partner_site: partner,
            request,
            steps,
        })
    }

    pub async fn rollback(&self, current: &str, backup: &str) -> Result<SwitchReport> {
        let report = self
            .cutover
            .rollback(current, backup, self.config.allow_standby_override)
            .await?;
        self.audit(
            None,
            "rollback",
            &format!("{} <- {}: {:?}", current, backup, report.status),
        )
        .await;
        Ok(report)
    }

    pub async fn cleanup_old_backups(
        &self,
        pattern: &str,
        older_than: Duration,
        dry_run: bool,
    ) -> Result<CleanupReport> {
        let report = self
            .cutover
            .cleanup_old_backups(pattern, older_than, dry_run)
            .await?;
        self.audit(
            None,
            "cleanup_old_backups",
            &format!(
                "{} (dry_run={}): {} expired, {} dropped",
                pattern,
                dry_run,
                report.expired.len(),
                report.dropped.len()
            ),
        )
        .await;
        Ok(report)
    }

    pub async fn verify_consistency(&self, check: &ConsistencyCheck) -> Result<ConsistencyReport> {
        let report = verify::verify_consistency(self.storage.as_ref(), check).await?;
        self.audit(
            None,
            "verify_consistency",
            &format!(
                "{} vs {}: consistent={}",
                check.source_table, check.target_table, report.consistent
            ),
        )
        .await;
        Ok(report)
    }

    /// Forgets terminal operations started more than `older_than` ago.
    pub async fn purge_operations(&self, older_than: Duration) -> Result<PurgeReport> {
        if older_than < Duration::zero() {
            return Err(MigrateError::Validation("Purge age must not be negative".to_string()));
        }
        let cutoff = Utc::now() - older_than;
        let purged = self.state.purge_operations_before(cutoff).await?;
        self.audit(None, "purge_operations", &format!("{} before {}", purged, cutoff))
            .await;
        Ok(PurgeReport { cutoff, purged })
    }

    pub async fn pause_job(&self, job_id: Uuid) -> Result<MigrationJob> {
        let job = self.batch_engine().pause_job(job_id).await?;
        self.audit(job.operation_id, "pause_job", &job_id.to_string()).await;
        Ok(job)
    }

    pub async fn resume_job(&self, job_id: Uuid) -> Result<MigrationJob> {
        let job = self.batch_engine().resume_job(job_id).await?;
        self.audit(job.operation_id, "resume_job", &job_id.to_string()).await;
        Ok(job)
    }

    pub async fn drain_deferred_capture(&self) -> DrainReport {
        self.driver.drain_deferred().await
    }
}
