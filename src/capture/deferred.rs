use super::rule::Forwarder;
use crate::core::RowChange;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub processed: u64,
    pub failed: u64,
}

/// Consumer side of a deferred capture: forwards queued changes with the
/// same control check and error isolation as strict mode.
pub struct DeferredCaptureWorker {
    forwarder: Arc<Forwarder>,
    receiver: mpsc::UnboundedReceiver<RowChange>,
}

impl DeferredCaptureWorker {
    pub(crate) fn new(forwarder: Arc<Forwarder>, receiver: mpsc::UnboundedReceiver<RowChange>) -> Self {
        Self { forwarder, receiver }
    }

    pub fn rule_name(&self) -> &str {
        &self.forwarder.rule.name
    }

    /// Forwards everything queued right now and returns.
    pub async fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        while let Ok(change) = self.receiver.try_recv() {
            self.process(&change, &mut report).await;
        }
        if report.processed > 0 {
            event!(
                Level::DEBUG,
                rule = %self.forwarder.rule.name,
                processed = report.processed,
                failed = report.failed,
                "deferred capture drained"
            );
        }
        report
    }

    /// Forwards until every sender is gone (the hook was detached and dropped).
    pub async fn run(mut self) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(change) = self.receiver.recv().await {
            self.process(&change, &mut report).await;
        }
        event!(Level::INFO, rule = %self.forwarder.rule.name, processed = report.processed, "deferred capture stopped");
        report
    }

    async fn process(&self, change: &RowChange, report: &mut DrainReport) {
        report.processed += 1;
        if !self.forwarder.forward_isolated(change).await {
            report.failed += 1;
        }
    }
}
