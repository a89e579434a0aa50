use super::deferred::DeferredCaptureWorker;
use super::errors::{CaptureError, CaptureErrorChannel};
use crate::batch::mapping::{RowMapper, SchemaMapping};
use crate::core::{ChangeKind, ConflictPolicy, MigrateError, Result, Row, RowChange, Value};
use crate::state::ControlStore;
use crate::storage::{ChangeObserver, StorageEngine};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{Level, event};

/// How the forwarding hook behaves inside the originating write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    /// Control check, provenance filter, errors isolated.
    #[default]
    Strict,
    /// Provenance filter only; forwarding errors fail the write.
    MinimalOverhead,
    /// Enqueue the change and return; a worker forwards later.
    Deferred,
}

/// Declares which relation feeds which, and how columns line up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingRule {
    pub name: String,
    pub mapping: SchemaMapping,
    /// Target column stamped with the originating site.
    pub provenance_column: Option<String>,
    /// Control-store key consulted before forwarding; defaults to the source.
    pub control_key: String,
}

impl ForwardingRule {
    pub fn new(name: impl Into<String>, mapping: SchemaMapping) -> Self {
        let control_key = mapping.source_table.clone();
        Self {
            name: name.into(),
            mapping,
            provenance_column: None,
            control_key,
        }
    }

    pub fn with_provenance_column(mut self, column: impl Into<String>) -> Self {
        self.provenance_column = Some(column.into());
        self
    }

    pub fn with_control_key(mut self, key: impl Into<String>) -> Self {
        self.control_key = key.into();
        self
    }

    pub fn source_table(&self) -> &str {
        &self.mapping.source_table
    }

    pub fn target_table(&self) -> &str {
        &self.mapping.target_table
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureStats {
    pub forwarded: u64,
    pub skipped_foreign_origin: u64,
    pub skipped_disabled: u64,
    pub failed: u64,
    pub queued: u64,
}

#[derive(Default)]
struct Counters {
    forwarded: AtomicU64,
    skipped_foreign_origin: AtomicU64,
    skipped_disabled: AtomicU64,
    failed: AtomicU64,
    queued: AtomicU64,
}

/// Applies captured changes to the target relation. Shared by the inline
/// hook and the deferred worker.
pub(crate) struct Forwarder {
    pub(crate) rule: ForwardingRule,
    site_name: String,
    storage: Weak<dyn StorageEngine>,
    control: Arc<dyn ControlStore>,
    mapper: RowMapper,
    target_key_index: usize,
    provenance_index: Option<usize>,
    pub(crate) errors: CaptureErrorChannel,
    counters: Counters,
}

impl Forwarder {
    pub(crate) fn is_local(&self, change: &RowChange) -> bool {
        if change.origin_site == self.site_name {
            return true;
        }
        self.counters.skipped_foreign_origin.fetch_add(1, Ordering::Relaxed);
        false
    }

    /// Missing entry means forwarding is on.
    pub(crate) async fn forwarding_enabled(&self) -> Result<bool> {
        let enabled = match self.control.control_entry(&self.rule.control_key).await? {
            Some(entry) => entry.forwarding_enabled(Utc::now()),
            None => true,
        };
        if !enabled {
            self.counters.skipped_disabled.fetch_add(1, Ordering::Relaxed);
        }
        Ok(enabled)
    }

    /// Forwards a change the control store allows, recording instead of
    /// returning any failure. Returns false when a failure was recorded.
    pub(crate) async fn forward_isolated(&self, change: &RowChange) -> bool {
        let outcome = match self.forwarding_enabled().await {
            Ok(true) => self.forward(change).await,
            Ok(false) => Ok(()),
            Err(err) => Err(err),
        };
        match outcome {
            Ok(()) => true,
            Err(err) => {
                self.record_failure(change, &err);
                false
            }
        }
    }

    pub(crate) fn record_failure(&self, change: &RowChange, err: &MigrateError) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        let key = change
            .key_row()
            .and_then(|row| self.mapper.target_key(row, self.target_key_index).ok());
        event!(
            Level::WARN,
            rule = %self.rule.name,
            kind = ?change.kind,
            key = ?key,
            error = %err,
            "change forwarding failed"
        );
        self.errors.record(CaptureError {
            rule: self.rule.name.clone(),
            kind: change.kind,
            key,
            error: err.to_string(),
            recorded_at: Utc::now(),
        });
    }

    pub(crate) async fn forward(&self, change: &RowChange) -> Result<()> {
        let storage = self.storage.upgrade().ok_or_else(|| {
            MigrateError::Storage(format!("storage behind rule '{}' was dropped", self.rule.name))
        })?;
        let target = self.rule.target_table();
        let missing = || {
            MigrateError::Validation(format!(
                "{:?} captured by '{}' has no row image",
                change.kind, self.rule.name
            ))
        };
        match change.kind {
            ChangeKind::Insert => {
                let row = self.map(change.new.as_ref().ok_or_else(missing)?, &change.origin_site)?;
                storage.upsert_rows(target, vec![row], ConflictPolicy::Ignore).await?;
            }
            ChangeKind::Update => {
                let old = change.old.as_ref().ok_or_else(missing)?;
                let new = change.new.as_ref().ok_or_else(missing)?;
                let old_key = self.mapper.target_key(old, self.target_key_index)?;
                let row = self.map(new, &change.origin_site)?;
                if row[self.target_key_index] != old_key {
                    storage.delete_by_key(target, &[old_key]).await?;
                }
                storage.upsert_rows(target, vec![row], ConflictPolicy::Update).await?;
            }
            ChangeKind::Delete => {
                let old = change.old.as_ref().ok_or_else(missing)?;
                let key = self.mapper.target_key(old, self.target_key_index)?;
                storage.delete_by_key(target, &[key]).await?;
            }
        }
        self.counters.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn map(&self, row: &Row, origin: &str) -> Result<Row> {
        match self.provenance_index {
            Some(idx) => self
                .mapper
                .map_row_with(row, &[(idx, Value::Text(origin.to_string()))]),
            None => self.mapper.map_row(row),
        }
    }

    pub(crate) fn note_queued(&self) {
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
    }

    fn stats(&self) -> CaptureStats {
        CaptureStats {
            forwarded: self.counters.forwarded.load(Ordering::Relaxed),
            skipped_foreign_origin: self.counters.skipped_foreign_origin.load(Ordering::Relaxed),
            skipped_disabled: self.counters.skipped_disabled.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
        }
    }
}

/// Row-level forwarding hook attached to the legacy relation.
pub struct ChangeCapture {
    forwarder: Arc<Forwarder>,
    mode: CaptureMode,
    queue: Option<mpsc::UnboundedSender<RowChange>>,
}

/// A registered capture plus, in deferred mode, the worker that drains it.
pub struct RegisteredCapture {
    pub capture: Arc<ChangeCapture>,
    pub worker: Option<DeferredCaptureWorker>,
}

impl ChangeCapture {
    /// Resolves the rule's mapping against the live schemas. Nothing is
    /// attached yet; see [`ChangeCapture::install`].
    pub async fn register(
        rule: ForwardingRule,
        site_name: impl Into<String>,
        mode: CaptureMode,
        storage: &Arc<dyn StorageEngine>,
        control: Arc<dyn ControlStore>,
        errors: CaptureErrorChannel,
    ) -> Result<RegisteredCapture> {
        let source = storage.table_schema(rule.source_table()).await?;
        let target = storage.table_schema(rule.target_table()).await?;
        let mapper = rule.mapping.compile(&source, &target)?;
        let provenance_index = match &rule.provenance_column {
            Some(column) => Some(target.column_index(column)?),
            None => None,
        };

        let forwarder = Arc::new(Forwarder {
            site_name: site_name.into(),
            storage: Arc::downgrade(storage),
            control,
            target_key_index: target.key_index(),
            provenance_index,
            mapper,
            errors,
            counters: Counters::default(),
            rule,
        });

        let (queue, worker) = if mode == CaptureMode::Deferred {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(DeferredCaptureWorker::new(forwarder.clone(), rx)))
        } else {
            (None, None)
        };

        Ok(RegisteredCapture {
            capture: Arc::new(Self {
                forwarder,
                mode,
                queue,
            }),
            worker,
        })
    }

    pub fn rule(&self) -> &ForwardingRule {
        &self.forwarder.rule
    }

    pub fn mode(&self) -> CaptureMode {
        self.mode
    }

    pub fn errors(&self) -> &CaptureErrorChannel {
        &self.forwarder.errors
    }

    pub fn stats(&self) -> CaptureStats {
        self.forwarder.stats()
    }

    /// Attaches the hook to the rule's source relation.
    pub async fn install(self: &Arc<Self>, storage: &Arc<dyn StorageEngine>) -> Result<()> {
        storage
            .attach_observer(self.rule().source_table(), self.clone())
            .await?;
        event!(
            Level::INFO,
            rule = %self.rule().name,
            source = %self.rule().source_table(),
            target = %self.rule().target_table(),
            mode = ?self.mode,
            "capture rule installed"
        );
        Ok(())
    }

    /// Detaches the hook from `table` (the relation it currently hangs off,
    /// which differs from the source after a rename).
    pub async fn uninstall(storage: &Arc<dyn StorageEngine>, table: &str, rule_name: &str) -> Result<bool> {
        let removed = storage.detach_observer(table, rule_name).await?;
        if removed {
            event!(Level::INFO, rule = %rule_name, table = %table, "capture rule removed");
        }
        Ok(removed)
    }
}

#[async_trait]
impl ChangeObserver for ChangeCapture {
    fn name(&self) -> &str {
        &self.forwarder.rule.name
    }

    async fn on_change(&self, change: &RowChange) -> Result<()> {
        if !self.forwarder.is_local(change) {
            return Ok(());
        }
        match self.mode {
            CaptureMode::Strict => {
                self.forwarder.forward_isolated(change).await;
                Ok(())
            }
            CaptureMode::MinimalOverhead => self.forwarder.forward(change).await,
            CaptureMode::Deferred => {
                let sent = match &self.queue {
                    Some(queue) => queue.send(change.clone()).is_ok(),
                    None => false,
                };
                if sent {
                    self.forwarder.note_queued();
                } else {
                    let err = MigrateError::Storage("deferred capture queue is closed".to_string());
                    self.forwarder.record_failure(change, &err);
                }
                Ok(())
            }
        }
    }
}
