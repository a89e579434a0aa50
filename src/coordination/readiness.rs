use crate::core::{MigrateError, Result};
use crate::transport::{MarkerEnvelope, ReplicationMarker, ReplicationTransport};
use std::time::Duration;
use tracing::{Level, event};

/// Bounded fixed-interval poll over the markers received on this site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPoll {
    pub interval: Duration,
    pub max_attempts: u32,
}

/// What a poll should do with a marker it sees.
pub enum MarkerVerdict {
    Accept,
    Ignore,
    Reject(MigrateError),
}

impl ReadinessPoll {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.interval * self.max_attempts
    }

    /// Checks the inbox right away and again after each of `max_attempts`
    /// waits of `interval`. Returns `Ok(None)` when the check that closes the
    /// last wait still misses, so the total wait is `interval * max_attempts`.
    pub async fn wait_for<F>(
        &self,
        transport: &dyn ReplicationTransport,
        mut classify: F,
    ) -> Result<Option<MarkerEnvelope>>
    where
        F: FnMut(&ReplicationMarker) -> MarkerVerdict + Send,
    {
        for attempt in 0..=self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(self.interval).await;
            }
            for envelope in transport.received_markers().await? {
                match classify(&envelope.marker) {
                    MarkerVerdict::Accept => {
                        event!(Level::INFO, attempt, site = %envelope.marker.site(), "marker received");
                        return Ok(Some(envelope));
                    }
                    MarkerVerdict::Reject(err) => return Err(err),
                    MarkerVerdict::Ignore => {}
                }
            }
            event!(
                Level::DEBUG,
                attempt,
                max_attempts = self.max_attempts,
                "marker not seen yet"
            );
        }
        Ok(None)
    }
}
