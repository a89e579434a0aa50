use super::{MarkerEnvelope, ReplicationMarker, ReplicationTransport, SubscriptionStatus};
use crate::core::{MigrateError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Size a marker adds to the sender's stream.
const MARKER_BYTES: u64 = 64;

#[derive(Debug, Default)]
struct SiteLink {
    position: u64,
    subscriptions: BTreeMap<String, bool>,
    /// Applied position per peer site.
    applied: HashMap<String, u64>,
    inbox: Vec<MarkerEnvelope>,
    /// Markers that reached this site while its subscriptions were paused.
    held: Vec<MarkerEnvelope>,
    reject_subscription_changes: bool,
    /// Subscription changes to let through before one fails.
    subscription_fault: Option<usize>,
}

impl SiteLink {
    fn receiving(&self) -> bool {
        self.subscriptions.values().all(|enabled| *enabled)
    }
}

/// In-process stand-in for a bidirectional logical replication link.
///
/// Each registered site gets an endpoint. A marker emitted on one site is
/// delivered to every other site whose subscriptions are all enabled; a site
/// with a paused subscription holds incoming markers until it resumes.
#[derive(Clone, Default)]
pub struct InMemoryReplicationHub {
    sites: Arc<Mutex<HashMap<String, SiteLink>>>,
}

impl InMemoryReplicationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a site with its inbound subscription names (all enabled).
    pub async fn register_site(
        &self,
        site: impl Into<String>,
        subscriptions: &[String],
    ) -> Result<InMemoryReplicationEndpoint> {
        let site = site.into();
        if site.trim().is_empty() {
            return Err(MigrateError::Validation("site name must not be empty".to_string()));
        }
        let mut sites = self.sites.lock().await;
        if sites.contains_key(&site) {
            return Err(MigrateError::Validation(format!(
                "Site '{}' is already registered",
                site
            )));
        }
        let link = SiteLink {
            subscriptions: subscriptions.iter().map(|name| (name.clone(), true)).collect(),
            ..SiteLink::default()
        };
        sites.insert(site.clone(), link);
        Ok(InMemoryReplicationEndpoint {
            hub: self.clone(),
            site,
        })
    }

    /// Simulates `bytes` of application writes on `site`.
    pub async fn advance(&self, site: &str, bytes: u64) -> Result<u64> {
        let mut sites = self.sites.lock().await;
        let link = sites.get_mut(site).ok_or_else(|| unknown_site(site))?;
        link.position += bytes;
        let position = link.position;
        sync_applied(&mut sites, site, position);
        Ok(position)
    }

    /// Makes subscription enable/disable calls on `site` fail.
    pub async fn reject_subscription_changes(&self, site: &str, reject: bool) -> Result<()> {
        let mut sites = self.sites.lock().await;
        let link = sites.get_mut(site).ok_or_else(|| unknown_site(site))?;
        link.reject_subscription_changes = reject;
        Ok(())
    }

    /// Fails the subscription change that follows `skip` successful ones on
    /// `site`, once.
    pub async fn fail_subscription_change(&self, site: &str, skip: usize) -> Result<()> {
        let mut sites = self.sites.lock().await;
        let link = sites.get_mut(site).ok_or_else(|| unknown_site(site))?;
        link.subscription_fault = Some(skip);
        Ok(())
    }

    async fn emit(&self, site: &str, marker: ReplicationMarker) -> Result<()> {
        let mut sites = self.sites.lock().await;
        let link = sites.get_mut(site).ok_or_else(|| unknown_site(site))?;
        link.position += MARKER_BYTES;
        let envelope = MarkerEnvelope {
            marker,
            emitted_at: Utc::now(),
            position: link.position,
        };
        let position = link.position;
        for (name, peer) in sites.iter_mut() {
            if name == site {
                continue;
            }
            if peer.receiving() {
                peer.inbox.push(envelope.clone());
            } else {
                peer.held.push(envelope.clone());
            }
        }
        sync_applied(&mut sites, site, position);
        Ok(())
    }

    async fn set_subscription(&self, site: &str, name: &str, enabled: bool) -> Result<()> {
        let mut sites = self.sites.lock().await;
        let link = sites.get_mut(site).ok_or_else(|| unknown_site(site))?;
        if link.reject_subscription_changes {
            return Err(MigrateError::Transport(format!(
                "subscription '{}' on '{}' cannot be changed",
                name, site
            )));
        }
        match link.subscription_fault {
            Some(0) => {
                link.subscription_fault = None;
                return Err(MigrateError::Transport(format!(
                    "injected fault changing subscription '{}' on '{}'",
                    name, site
                )));
            }
            Some(remaining) => link.subscription_fault = Some(remaining - 1),
            None => {}
        }
        let slot = link.subscriptions.get_mut(name).ok_or_else(|| {
            MigrateError::Transport(format!("Subscription '{}' not found on '{}'", name, site))
        })?;
        *slot = enabled;
        if link.receiving() {
            let held = std::mem::take(&mut link.held);
            link.inbox.extend(held);
            let peers: Vec<(String, u64)> = sites
                .iter()
                .filter(|(peer, _)| peer.as_str() != site)
                .map(|(peer, l)| (peer.clone(), l.position))
                .collect();
            if let Some(link) = sites.get_mut(site) {
                link.applied.extend(peers);
            }
        }
        Ok(())
    }
}

fn sync_applied(sites: &mut HashMap<String, SiteLink>, sender: &str, position: u64) {
    for (name, peer) in sites.iter_mut() {
        if name != sender && peer.receiving() {
            peer.applied.insert(sender.to_string(), position);
        }
    }
}

fn unknown_site(site: &str) -> MigrateError {
    MigrateError::Transport(format!("Site '{}' is not registered with the hub", site))
}

/// One site's view of an [`InMemoryReplicationHub`].
#[derive(Clone)]
pub struct InMemoryReplicationEndpoint {
    hub: InMemoryReplicationHub,
    site: String,
}

impl InMemoryReplicationEndpoint {
    pub fn hub(&self) -> &InMemoryReplicationHub {
        &self.hub
    }
}

#[async_trait]
impl ReplicationTransport for InMemoryReplicationEndpoint {
    fn site_name(&self) -> &str {
        &self.site
    }

    async fn current_position(&self) -> Result<u64> {
        let sites = self.hub.sites.lock().await;
        Ok(sites.get(&self.site).ok_or_else(|| unknown_site(&self.site))?.position)
    }

    async fn emit_marker(&self, marker: ReplicationMarker) -> Result<()> {
        self.hub.emit(&self.site, marker).await
    }

    async fn received_markers(&self) -> Result<Vec<MarkerEnvelope>> {
        let sites = self.hub.sites.lock().await;
        Ok(sites
            .get(&self.site)
            .ok_or_else(|| unknown_site(&self.site))?
            .inbox
            .clone())
    }

    async fn set_subscription_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        self.hub.set_subscription(&self.site, name, enabled).await
    }

    async fn subscriptions(&self) -> Result<Vec<SubscriptionStatus>> {
        let sites = self.hub.sites.lock().await;
        let link = sites.get(&self.site).ok_or_else(|| unknown_site(&self.site))?;
        Ok(link
            .subscriptions
            .iter()
            .map(|(name, enabled)| SubscriptionStatus {
                name: name.clone(),
                enabled: *enabled,
            })
            .collect())
    }

    async fn lag_bytes(&self) -> Result<u64> {
        let sites = self.hub.sites.lock().await;
        let link = sites.get(&self.site).ok_or_else(|| unknown_site(&self.site))?;
        Ok(sites
            .iter()
            .filter(|(name, _)| name.as_str() != self.site)
            .map(|(name, peer)| {
                let applied = link.applied.get(name).copied().unwrap_or(0);
                peer.position.saturating_sub(applied)
            })
            .sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn subs(name: &str) -> Vec<String> {
        vec![name.to_string()]
    }

    #[tokio::test]
    async fn test_markers_are_delivered_to_peer() {
        let hub = InMemoryReplicationHub::new();
        let east = hub.register_site("east", &subs("from_west")).await.unwrap();
        let west = hub.register_site("west", &subs("from_east")).await.unwrap();

        let op = Uuid::new_v4();
        west.emit_marker(ReplicationMarker::PartnerReady {
            operation_id: op,
            site: "west".into(),
            coordinator: false,
        })
        .await
        .unwrap();

        let received = east.received_markers().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].marker.operation_id(), op);
        assert!(west.received_markers().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_paused_subscription_holds_markers_and_lags() {
        let hub = InMemoryReplicationHub::new();
        let east = hub.register_site("east", &subs("from_west")).await.unwrap();
        let west = hub.register_site("west", &subs("from_east")).await.unwrap();

        east.set_subscription_enabled("from_west", false).await.unwrap();
        hub.advance("west", 1_000).await.unwrap();
        assert_eq!(east.lag_bytes().await.unwrap(), 1_000);

        west
            .emit_marker(ReplicationMarker::SyncResumed {
                operation_id: Uuid::new_v4(),
                site: "west".into(),
            })
            .await
            .unwrap();
        assert!(east.received_markers().await.unwrap().is_empty());

        east.set_subscription_enabled("from_west", true).await.unwrap();
        assert_eq!(east.received_markers().await.unwrap().len(), 1);
        assert_eq!(east.lag_bytes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_subscription_is_an_error() {
        let hub = InMemoryReplicationHub::new();
        let east = hub.register_site("east", &subs("from_west")).await.unwrap();
        assert!(east.set_subscription_enabled("nope", false).await.is_err());
        assert!(hub.register_site("east", &[]).await.is_err());
    }
}
