//! Boundary to the storage engine's native logical replication.
//!
//! The orchestrator never ships rows itself; it only pauses/resumes
//! subscriptions, reads stream positions and exchanges advisory markers that
//! travel inside the replicated stream.

pub mod memory;

use crate::core::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::{InMemoryReplicationEndpoint, InMemoryReplicationHub};

/// Advisory coordination signal. Delivery is at-least-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplicationMarker {
    PartnerReady {
        operation_id: Uuid,
        site: String,
        coordinator: bool,
    },
    SyncPaused {
        operation_id: Uuid,
        site: String,
    },
    SyncResumed {
        operation_id: Uuid,
        site: String,
    },
}

impl ReplicationMarker {
    pub fn operation_id(&self) -> Uuid {
        match self {
            Self::PartnerReady { operation_id, .. }
            | Self::SyncPaused { operation_id, .. }
            | Self::SyncResumed { operation_id, .. } => *operation_id,
        }
    }

    pub fn site(&self) -> &str {
        match self {
            Self::PartnerReady { site, .. }
            | Self::SyncPaused { site, .. }
            | Self::SyncResumed { site, .. } => site,
        }
    }
}

/// A marker as observed on the receiving site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerEnvelope {
    pub marker: ReplicationMarker,
    pub emitted_at: DateTime<Utc>,
    /// Sender's stream position when the marker was written.
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStatus {
    pub name: String,
    pub enabled: bool,
}

#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    fn site_name(&self) -> &str;

    /// Local write-ahead position, monotonic.
    async fn current_position(&self) -> Result<u64>;

    async fn emit_marker(&self, marker: ReplicationMarker) -> Result<()>;

    /// Every marker delivered to this site so far, oldest first.
    async fn received_markers(&self) -> Result<Vec<MarkerEnvelope>>;

    async fn set_subscription_enabled(&self, name: &str, enabled: bool) -> Result<()>;

    async fn subscriptions(&self) -> Result<Vec<SubscriptionStatus>>;

    /// Bytes of peer stream not yet applied here.
    async fn lag_bytes(&self) -> Result<u64>;
}
