use super::conservation::{ChangeTally, ConservationCheck, count_present};
use super::readiness::{MarkerVerdict, ReadinessPoll};
use crate::batch::{
    BatchEngine, BatchRunSummary, CutoffSelection, CutoffStrategy, ExactCutoff, SampledCutoff,
    SchemaMapping, require_ordering_values,
};
use crate::capture::{
    CaptureErrorChannel, ChangeCapture, DeferredCaptureWorker, DrainReport, ForwardingRule,
};
use crate::config::{MigrationPlan, MigratorConfig};
use crate::core::{MigrateError, Result, RowPredicate, TableSchema, Value};
use crate::cutover::{CutoverEngine, SwitchReport};
use crate::state::{
    ControlStore, CoordinationOperation, JobStatus, MigrationJob, OperationStatus,
    ReplicationControlEntry, StateStore,
};
use crate::storage::{ChangeObserver, StorageEngine};
use crate::transport::{ReplicationMarker, ReplicationTransport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteRole {
    Coordinator,
    Partner,
}

impl fmt::Display for SiteRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Coordinator => f.write_str("coordinator"),
            Self::Partner => f.write_str("partner"),
        }
    }
}

/// Everything one site needs to take part in an operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Shared by both sites; the coordinator usually mints it.
    pub operation_id: Uuid,
    pub role: SiteRole,
    /// Coordinator only: hold relation creation until the partner is ready.
    pub wait_for_partner: bool,
    pub plan: MigrationPlan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationReport {
    pub operation: CoordinationOperation,
    pub cutoff: Option<CutoffSelection>,
    pub archive_job: Option<BatchRunSummary>,
    pub migrate_job: Option<BatchRunSummary>,
    pub conservation: Option<ConservationCheck>,
    pub switch: Option<SwitchReport>,
    pub capture_rule: Option<String>,
    pub error: Option<String>,
}

impl OperationReport {
    fn new(operation: CoordinationOperation) -> Self {
        Self {
            operation,
            cutoff: None,
            archive_job: None,
            migrate_job: None,
            conservation: None,
            switch: None,
            capture_rule: None,
            error: None,
        }
    }

    pub fn status(&self) -> OperationStatus {
        self.operation.status
    }
}

/// Schemas and mappings resolved against the live source during PREPARING.
struct ResolvedPlan {
    target_schema: TableSchema,
    archive_schema: TableSchema,
    migrate_mapping: SchemaMapping,
    archive_mapping: SchemaMapping,
    provenance_column: Option<String>,
    tag_column: Option<String>,
}

/// What this run changed, so a failure knows what to undo.
#[derive(Default)]
struct RunContext {
    prepare_position: u64,
    created_relations: Vec<String>,
    /// (relation the hook hangs off, rule name)
    installed_rule: Option<(String, String)>,
    /// Backup name once the cutover completed.
    swapped_backup: Option<String>,
    /// Source rows when replication was paused.
    paused_source_rows: u64,
    /// Attached to the source from the pause until the conservation check.
    tally: Option<Arc<ChangeTally>>,
}

impl RunContext {
    fn has_changes(&self) -> bool {
        !self.created_relations.is_empty()
            || self.installed_rule.is_some()
            || self.swapped_backup.is_some()
    }
}

/// Sequential per-site driver of the phased cross-site protocol.
pub struct CoordinationDriver {
    config: MigratorConfig,
    storage: Arc<dyn StorageEngine>,
    state: Arc<dyn StateStore>,
    control: Arc<dyn ControlStore>,
    transport: Arc<dyn ReplicationTransport>,
    batch: BatchEngine,
    cutover: CutoverEngine,
    capture_errors: CaptureErrorChannel,
    deferred: Mutex<Vec<DeferredCaptureWorker>>,
}

impl CoordinationDriver {
    pub fn new(
        config: MigratorConfig,
        storage: Arc<dyn StorageEngine>,
        state: Arc<dyn StateStore>,
        control: Arc<dyn ControlStore>,
        transport: Arc<dyn ReplicationTransport>,
        capture_errors: CaptureErrorChannel,
    ) -> Self {
        let batch = BatchEngine::new(storage.clone(), state.clone())
            .with_batch_delay(config.batch_delay)
            .with_max_batches(config.max_batches);
        let cutover = CutoverEngine::new(storage.clone());
        Self {
            config,
            storage,
            state,
            control,
            transport,
            batch,
            cutover,
            capture_errors,
            deferred: Mutex::new(Vec::new()),
        }
    }

    pub fn batch_engine(&self) -> &BatchEngine {
        &self.batch
    }

    /// Runs the protocol to a terminal state.
    ///
    /// Returns `Err` only when the request is rejected before an operation
    /// record exists. Anything later ends as a FAILED or ROLLED_BACK
    /// operation inside the report.
    pub async fn run(&self, request: StartRequest) -> Result<OperationReport> {
        request.plan.validate()?;
        if self.state.get_operation(request.operation_id).await.is_ok() {
            return Err(MigrateError::Validation(format!(
                "Operation {} already exists on site '{}'",
                request.operation_id, self.config.site_name
            )));
        }

        let mut op = CoordinationOperation::new(
            request.operation_id,
            &self.config.site_name,
            &request.plan.source_table,
            request.role == SiteRole::Coordinator,
        );
        op.note(format!("initiated as {}", request.role));
        self.state.save_operation(&op).await?;
        self.audit(&op, "initiated", &request.role.to_string()).await;

        let span = info_span!(
            "coordination.operation",
            operation_id = %request.operation_id,
            site = %self.config.site_name,
            role = %request.role,
            table = %request.plan.source_table
        );
        let mut ctx = RunContext::default();
        let mut report = OperationReport::new(op.clone());
        let outcome = self
            .drive(&mut op, &request, &mut ctx, &mut report)
            .instrument(span.clone())
            .await;
        if let Err(err) = outcome {
            report.error = Some(err.to_string());
            self.fail(&mut op, &request.plan, &mut ctx, &err)
                .instrument(span)
                .await;
        }
        report.operation = op;
        Ok(report)
    }

    async fn drive(
        &self,
        op: &mut CoordinationOperation,
        request: &StartRequest,
        ctx: &mut RunContext,
        report: &mut OperationReport,
    ) -> Result<()> {
        let plan = &request.plan;

        self.advance(op, OperationStatus::Preparing, "validating relations and mappings")
            .await?;
        let resolved = self.resolve(plan).await?;
        let cutoff = self.select_cutoff(plan).await?;
        ctx.prepare_position = self.transport.current_position().await?;
        op.note(format!(
            "cutoff on '{}' at {}: {} of {} rows retained{}; transport position {}",
            cutoff.column,
            cutoff
                .boundary
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_else(|| "none".to_string()),
            cutoff.retained_target,
            cutoff.total_rows,
            if cutoff.approximate { " (sampled)" } else { "" },
            ctx.prepare_position
        ));
        report.cutoff = Some(cutoff.clone());
        if request.role == SiteRole::Coordinator && request.wait_for_partner {
            self.await_partner(op).await?;
        }
        self.create_relations(&resolved, ctx).await?;
        self.advance(op, OperationStatus::Prepared, "relations created").await?;

        self.transport
            .emit_marker(ReplicationMarker::PartnerReady {
                operation_id: op.operation_id,
                site: self.config.site_name.clone(),
                coordinator: request.role == SiteRole::Coordinator,
            })
            .await?;
        if request.role == SiteRole::Partner {
            op.partner_ready = true;
            self.state.save_operation(op).await?;
        }

        self.advance(op, OperationStatus::SyncStopping, "pausing subscriptions")
            .await?;
        if request.role == SiteRole::Partner && plan.wait_for_coordinator_pause {
            self.await_coordinator_pause(op).await?;
        }
        let pause_note = self.pause_sync(op, plan, ctx).await?;
        self.advance(op, OperationStatus::SyncStopped, &pause_note).await?;

        self.advance(op, OperationStatus::Executing, "copying rows").await?;
        self.execute(op, plan, &resolved, &cutoff, ctx, report).await?;
        self.advance(op, OperationStatus::MigrationCompleted, "data moved")
            .await?;

        let resume_note = self.resume_sync(op, plan).await?;
        self.advance(op, OperationStatus::SyncResumed, &resume_note).await?;
        self.advance(op, OperationStatus::Completed, "operation closed").await?;
        Ok(())
    }

    async fn advance(
        &self,
        op: &mut CoordinationOperation,
        next: OperationStatus,
        note: &str,
    ) -> Result<()> {
        op.transition(next)?;
        op.note(format!("{}: {}", next, note));
        self.state.save_operation(op).await?;
        self.audit(op, "phase", &next.to_string()).await;
        event!(Level::INFO, status = %next, phase = op.phase, "{}", note);
        Ok(())
    }

    /// Audit failures are logged, never fatal to the protocol.
    async fn audit(&self, op: &CoordinationOperation, action: &str, detail: &str) {
        if let Err(err) = self
            .state
            .append_audit(&self.config.site_name, Some(op.operation_id), action, detail)
            .await
        {
            event!(Level::WARN, error = %err, action, "audit append failed");
        }
    }

    // ---- PREPARING ----------------------------------------------------

    async fn resolve(&self, plan: &MigrationPlan) -> Result<ResolvedPlan> {
        let source = self.storage.table_schema(&plan.source_table).await?;
        source.column_index(&plan.ordering_column)?;
        require_ordering_values(self.storage.as_ref(), &plan.source_table, &plan.ordering_column)
            .await?;

        let target_schema = plan.target_schema.clone();
        let archive_schema = plan.resolved_archive_schema(&source);
        for schema in [&target_schema, &archive_schema] {
            if self.storage.table_exists(schema.name()).await?
                && self.storage.table_schema(schema.name()).await? != *schema
            {
                return Err(MigrateError::TableExists(schema.name().to_string()));
            }
        }

        let tag_column = target_schema
            .get_column(&self.config.migration_tag_column)
            .map(|c| c.name.clone());
        let provenance_column = target_schema
            .get_column(&self.config.provenance_column)
            .map(|c| c.name.clone());
        let mut migrate_mapping = plan.mapping.clone();
        if let Some(column) = &tag_column {
            migrate_mapping =
                migrate_mapping.with_constant(column, self.config.migration_tag_value.as_str());
        }
        if let Some(column) = &provenance_column {
            migrate_mapping = migrate_mapping.with_constant(column, self.config.site_name.as_str());
        }
        migrate_mapping.compile(&source, &target_schema)?;

        let archive_mapping = plan.resolved_archive_mapping(&source, &archive_schema);
        archive_mapping.compile(&source, &archive_schema)?;

        if plan.perform_cutover
            && !self.config.allow_standby_override
            && !self.storage.accepts_writes().await?
        {
            return Err(MigrateError::Validation(
                "Site does not accept writes; cutover needs the standby override".to_string(),
            ));
        }

        Ok(ResolvedPlan {
            target_schema,
            archive_schema,
            migrate_mapping,
            archive_mapping,
            provenance_column,
            tag_column,
        })
    }

    async fn select_cutoff(&self, plan: &MigrationPlan) -> Result<CutoffSelection> {
        let strategy: Box<dyn CutoffStrategy> = match self.config.cutoff_sample_size {
            Some(max_samples) => Box::new(SampledCutoff { max_samples }),
            None => Box::new(ExactCutoff),
        };
        strategy
            .select(
                self.storage.as_ref(),
                &plan.source_table,
                &plan.ordering_column,
                plan.retention,
            )
            .await
    }

    fn poll(&self) -> ReadinessPoll {
        ReadinessPoll::new(
            self.config.readiness_poll_interval,
            self.config.readiness_max_attempts,
        )
    }

    async fn await_partner(&self, op: &mut CoordinationOperation) -> Result<()> {
        let poll = self.poll();
        let own_site = self.config.site_name.clone();
        let operation_id = op.operation_id;
        let seen = poll
            .wait_for(self.transport.as_ref(), |marker| match marker {
                ReplicationMarker::PartnerReady {
                    operation_id: id,
                    site,
                    coordinator,
                } if *id == operation_id && *site != own_site => {
                    if *coordinator {
                        MarkerVerdict::Reject(MigrateError::Validation(format!(
                            "site '{}' also claims the coordinator role for {}",
                            site, operation_id
                        )))
                    } else {
                        MarkerVerdict::Accept
                    }
                }
                _ => MarkerVerdict::Ignore,
            })
            .await?;

        match seen {
            Some(envelope) => {
                op.partner_ready = true;
                op.note(format!("partner '{}' ready", envelope.marker.site()));
                self.state.save_operation(op).await
            }
            None => Err(MigrateError::CoordinationTimeout(format!(
                "partner not ready after {:?} ({} waits of {:?})",
                poll.timeout(),
                poll.max_attempts,
                poll.interval
            ))),
        }
    }

    async fn await_coordinator_pause(&self, op: &mut CoordinationOperation) -> Result<()> {
        let poll = self.poll();
        let own_site = self.config.site_name.clone();
        let operation_id = op.operation_id;
        let seen = poll
            .wait_for(self.transport.as_ref(), |marker| match marker {
                ReplicationMarker::SyncPaused {
                    operation_id: id,
                    site,
                } if *id == operation_id && *site != own_site => MarkerVerdict::Accept,
                _ => MarkerVerdict::Ignore,
            })
            .await?;
        match seen {
            Some(envelope) => {
                op.note(format!(
                    "coordinator '{}' paused at position {}",
                    envelope.marker.site(),
                    envelope.position
                ));
                Ok(())
            }
            None => Err(MigrateError::CoordinationTimeout(format!(
                "no pause marker from the coordinator within {:?}",
                poll.timeout()
            ))),
        }
    }

    async fn create_relations(&self, resolved: &ResolvedPlan, ctx: &mut RunContext) -> Result<()> {
        for schema in [&resolved.target_schema, &resolved.archive_schema] {
            if self.storage.table_exists(schema.name()).await? {
                event!(Level::INFO, table = %schema.name(), "relation already present, reusing");
                continue;
            }
            self.storage.create_table(schema.clone()).await?;
            ctx.created_relations.push(schema.name().to_string());
            event!(Level::INFO, table = %schema.name(), "relation created");
        }
        Ok(())
    }

    // ---- SYNC_STOPPING / SYNC_RESUMED ---------------------------------

    async fn pause_sync(
        &self,
        op: &CoordinationOperation,
        plan: &MigrationPlan,
        ctx: &mut RunContext,
    ) -> Result<String> {
        for name in &self.config.subscriptions {
            self.transport.set_subscription_enabled(name, false).await?;
        }
        self.set_control(&plan.source_table, false).await?;

        let source = self.storage.table_schema(&plan.source_table).await?;
        let token = op.operation_id.simple().to_string();
        let tally = Arc::new(ChangeTally::new(
            format!("conservation_{}", &token[..8]),
            source.key_index(),
        ));
        self.storage
            .attach_observer(&plan.source_table, tally.clone())
            .await?;
        ctx.tally = Some(tally);
        ctx.paused_source_rows = self.storage.row_count(&plan.source_table).await?;

        let position = self.transport.current_position().await?;
        let lag = self.transport.lag_bytes().await?;
        self.transport
            .emit_marker(ReplicationMarker::SyncPaused {
                operation_id: op.operation_id,
                site: self.config.site_name.clone(),
            })
            .await?;
        Ok(format!(
            "{} subscription(s) paused at position {} ({} bytes since prepare), lag {} bytes; {} source rows",
            self.config.subscriptions.len(),
            position,
            position.saturating_sub(ctx.prepare_position),
            lag,
            ctx.paused_source_rows
        ))
    }

    async fn resume_sync(&self, op: &CoordinationOperation, plan: &MigrationPlan) -> Result<String> {
        for name in &self.config.subscriptions {
            self.transport.set_subscription_enabled(name, true).await?;
        }
        self.set_control(&plan.source_table, true).await?;
        self.transport
            .emit_marker(ReplicationMarker::SyncResumed {
                operation_id: op.operation_id,
                site: self.config.site_name.clone(),
            })
            .await?;
        let lag = self.transport.lag_bytes().await?;
        Ok(format!("subscriptions resumed, lag {} bytes", lag))
    }

    async fn set_control(&self, table: &str, enabled: bool) -> Result<()> {
        let mut entry = self
            .control
            .control_entry(table)
            .await?
            .unwrap_or_else(|| ReplicationControlEntry::enabled(table));
        entry.replication_enabled = enabled;
        if enabled {
            entry.last_sync_at = Some(Utc::now());
        }
        self.control.put_control_entry(entry).await
    }

    // ---- EXECUTING ----------------------------------------------------

    async fn execute(
        &self,
        op: &mut CoordinationOperation,
        plan: &MigrationPlan,
        resolved: &ResolvedPlan,
        cutoff: &CutoffSelection,
        ctx: &mut RunContext,
        report: &mut OperationReport,
    ) -> Result<()> {
        let token = op.operation_id.simple().to_string();
        let rule_name = format!("capture_{}_{}", plan.source_table, &token[..8]);
        let mut rule = ForwardingRule::new(&rule_name, resolved.migrate_mapping.clone())
            .with_control_key(&plan.target_table);
        if let Some(column) = &resolved.provenance_column {
            rule = rule.with_provenance_column(column);
        }
        let registered = ChangeCapture::register(
            rule,
            &self.config.site_name,
            self.config.capture_mode,
            &self.storage,
            self.control.clone(),
            self.capture_errors.clone(),
        )
        .await?;
        registered.capture.install(&self.storage).await?;
        ctx.installed_rule = Some((plan.source_table.clone(), rule_name.clone()));
        if let Some(worker) = registered.worker {
            self.deferred.lock().await.push(worker);
        }
        report.capture_rule = Some(rule_name.clone());
        op.note(format!("capture rule '{}' installed ({:?})", rule_name, self.config.capture_mode));

        if let Some(predicate) = cutoff.archive_predicate() {
            let job = MigrationJob::new(resolved.archive_mapping.clone(), predicate, self.config.batch_size)
                .for_operation(op.operation_id);
            report.archive_job = Some(self.run_job(job).await?);
        }
        if let Some(predicate) = cutoff.retain_predicate() {
            let job = MigrationJob::new(resolved.migrate_mapping.clone(), predicate, self.config.batch_size)
                .for_operation(op.operation_id);
            report.migrate_job = Some(self.run_job(job).await?);
        }
        self.drain_deferred().await;

        let conservation = self.check_conservation(plan, resolved, ctx).await?;
        report.conservation = Some(conservation.clone());
        op.note(format!(
            "row conservation: {} archived + {} migrated vs {} source rows at pause, {} key(s) changed during the copy",
            conservation.archived_rows,
            conservation.migrated_rows,
            conservation.source_rows,
            conservation.changed_keys
        ));
        if !conservation.holds {
            return Err(MigrateError::Consistency(format!(
                "{} archived + {} migrated do not account for {} source rows at pause ({} changed key(s) excluded)",
                conservation.archived_rows,
                conservation.migrated_rows,
                conservation.source_rows,
                conservation.changed_keys
            )));
        }

        if plan.perform_cutover {
            let switch = self
                .cutover
                .atomic_switch(
                    &plan.source_table,
                    &plan.target_table,
                    &self.config.backup_suffix,
                    self.config.allow_standby_override,
                )
                .await?;
            report.switch = Some(switch.clone());
            if !switch.is_completed() {
                return Err(MigrateError::Cutover(format!(
                    "{:?}: {}",
                    switch.status,
                    switch.error.as_deref().unwrap_or("unknown error")
                )));
            }
            ctx.swapped_backup = Some(switch.backup_name.clone());
            op.note(format!("cutover done, legacy kept as '{}'", switch.backup_name));
            // The hook followed the legacy relation into its backup.
            ChangeCapture::uninstall(&self.storage, &switch.backup_name, &rule_name).await?;
            ctx.installed_rule = None;
        }
        Ok(())
    }

    async fn run_job(&self, job: MigrationJob) -> Result<BatchRunSummary> {
        let job = self.batch.create_job(job).await?;
        let summary = self.batch.run_batch_job(job.id, None, None).await?;
        let status = summary.status;
        match status {
            JobStatus::Completed => Ok(summary),
            JobStatus::Paused => Err(MigrateError::InvalidTransition(format!(
                "job {} was paused before finishing",
                job.id
            ))),
            _ if summary.exhausted_batch_limit => Err(MigrateError::Config(format!(
                "job {} hit the limit of {} batches",
                job.id, self.config.max_batches
            ))),
            other => Err(MigrateError::InvalidTransition(format!(
                "job {} stopped in status {:?}",
                job.id, other
            ))),
        }
    }

    /// Compares the copy against the source as it stood at the pause. Keys
    /// the application wrote since then are left out on every side, since
    /// capture may have placed them in the new relation regardless of the
    /// cutoff.
    async fn check_conservation(
        &self,
        plan: &MigrationPlan,
        resolved: &ResolvedPlan,
        ctx: &mut RunContext,
    ) -> Result<ConservationCheck> {
        let touched = match ctx.tally.take() {
            Some(tally) => {
                self.storage
                    .detach_observer(&plan.source_table, tally.name())
                    .await?;
                tally.touched()?
            }
            None => Default::default(),
        };
        let existed = touched.values().filter(|existed| **existed).count() as u64;

        let archived_total = self.storage.row_count(&plan.archive_table).await?;
        let archived_changed =
            count_present(self.storage.as_ref(), &plan.archive_table, touched.keys(), |_| true)
                .await?;

        let (migrated_total, migrated_changed) = match &resolved.tag_column {
            Some(column) => {
                let tag = Value::Text(self.config.migration_tag_value.clone());
                let tagged = RowPredicate::Equals {
                    column: column.clone(),
                    value: tag.clone(),
                };
                let index = resolved.target_schema.column_index(column)?;
                let total = self.storage.count_matching(&plan.target_table, &tagged).await?;
                let changed = count_present(
                    self.storage.as_ref(),
                    &plan.target_table,
                    touched.keys(),
                    |row| row.get(index) == Some(&tag),
                )
                .await?;
                (total, changed)
            }
            None => {
                let total = self.storage.row_count(&plan.target_table).await?;
                let changed =
                    count_present(self.storage.as_ref(), &plan.target_table, touched.keys(), |_| true)
                        .await?;
                (total, changed)
            }
        };

        let archived_rows = archived_total.saturating_sub(archived_changed);
        let migrated_rows = migrated_total.saturating_sub(migrated_changed);
        let expected = ctx.paused_source_rows.saturating_sub(existed);
        Ok(ConservationCheck {
            source_rows: ctx.paused_source_rows,
            changed_keys: touched.len() as u64,
            archived_rows,
            migrated_rows,
            holds: archived_rows + migrated_rows == expected,
        })
    }

    /// Forwards everything queued by deferred capture hooks.
    pub async fn drain_deferred(&self) -> DrainReport {
        let mut total = DrainReport::default();
        for worker in self.deferred.lock().await.iter_mut() {
            let report = worker.drain().await;
            total.processed += report.processed;
            total.failed += report.failed;
        }
        total
    }

    // ---- failure path -------------------------------------------------

    async fn fail(
        &self,
        op: &mut CoordinationOperation,
        plan: &MigrationPlan,
        ctx: &mut RunContext,
        err: &MigrateError,
    ) {
        event!(Level::ERROR, status = %op.status, error = %err, "operation failed");
        op.note(format!("failed during {}: {}", op.status, err));
        if let Err(transition) = op.transition(OperationStatus::Failed) {
            event!(Level::WARN, error = %transition, "could not mark operation failed");
        }
        self.save_quietly(op).await;
        self.audit(op, "failed", &err.to_string()).await;

        let replication_restored = self.reenable_replication(op, plan).await;
        if let Some(tally) = ctx.tally.take() {
            if let Err(err) = self
                .storage
                .detach_observer(&plan.source_table, tally.name())
                .await
            {
                event!(Level::WARN, error = %err, "could not detach change tally");
                op.note(format!("change tally '{}' left attached: {}", tally.name(), err));
            }
        }

        if self.config.rollback_on_failure && ctx.has_changes() {
            match self.cleanup(op, plan, ctx).await {
                Ok(()) if replication_restored => {
                    op.note("cleanup complete");
                    match op.transition(OperationStatus::RolledBack) {
                        Ok(()) => self.audit(op, "rolled_back", "cleanup complete").await,
                        Err(e) => event!(Level::WARN, error = %e, "could not mark rolled back"),
                    }
                }
                Ok(()) => op.note("cleanup complete but replication state is uncertain"),
                Err(cleanup_err) => {
                    event!(Level::ERROR, error = %cleanup_err, "cleanup failed");
                    op.note(format!("cleanup incomplete: {}", cleanup_err));
                }
            }
        }
        self.release_jobs(op).await;
        self.save_quietly(op).await;
    }

    /// Re-enables every subscription and the control flag, each step
    /// isolated. Returns whether all of them succeeded.
    async fn reenable_replication(&self, op: &mut CoordinationOperation, plan: &MigrationPlan) -> bool {
        let mut restored = true;
        for name in &self.config.subscriptions {
            if let Err(err) = self.transport.set_subscription_enabled(name, true).await {
                restored = false;
                event!(Level::ERROR, subscription = %name, error = %err, "re-enable failed");
                op.note(format!("re-enable of '{}' failed: {}", name, err));
            }
        }
        if let Err(err) = self.set_control(&plan.source_table, true).await {
            restored = false;
            event!(Level::ERROR, error = %err, "control entry reset failed");
            op.note(format!("control entry reset failed: {}", err));
        }
        if restored {
            op.note("replication re-enabled");
        }
        restored
    }

    async fn cleanup(
        &self,
        op: &mut CoordinationOperation,
        plan: &MigrationPlan,
        ctx: &mut RunContext,
    ) -> Result<()> {
        if let Some((table, rule)) = ctx.installed_rule.take() {
            ChangeCapture::uninstall(&self.storage, &table, &rule).await?;
            op.note(format!("capture rule '{}' removed", rule));
        }
        if let Some(backup) = ctx.swapped_backup.take() {
            let restored = self
                .cutover
                .rollback(&plan.source_table, &backup, self.config.allow_standby_override)
                .await?;
            if !restored.is_completed() {
                return Err(MigrateError::Cutover(format!(
                    "restoring '{}' from '{}' ended {:?}",
                    plan.source_table, backup, restored.status
                )));
            }
            op.note(format!(
                "legacy relation restored; new relation parked as '{}'",
                restored.backup_name
            ));
        }
        while let Some(name) = ctx.created_relations.pop() {
            if self.storage.table_exists(&name).await? {
                self.storage.drop_table(&name).await?;
                op.note(format!("dropped '{}'", name));
            }
        }
        Ok(())
    }

    /// Active jobs of a failed operation would block the relation forever.
    async fn release_jobs(&self, op: &CoordinationOperation) {
        let jobs = match self.state.jobs_for_operation(op.operation_id).await {
            Ok(jobs) => jobs,
            Err(err) => {
                event!(Level::WARN, error = %err, "could not list jobs of failed operation");
                return;
            }
        };
        for mut job in jobs.into_iter().filter(|j| j.status.is_active()) {
            job.status = JobStatus::Failed;
            job.error_detail = Some(format!("operation {} failed", op.operation_id));
            if let Err(err) = self.state.update_job(&job).await {
                event!(Level::WARN, job_id = %job.id, error = %err, "could not release job");
            }
        }
    }

    async fn save_quietly(&self, op: &CoordinationOperation) {
        if let Err(err) = self.state.save_operation(op).await {
            event!(Level::ERROR, error = %err, "could not persist operation state");
        }
    }
}
