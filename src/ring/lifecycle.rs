//! Instance lifecycle in a ring: join, heartbeat, leave

use super::instance::{InstanceDesc, InstanceState};
use super::HashRing;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Keeps one instance registered and heartbeating in a ring
pub struct RingLifecycler {
    ring: Arc<HashRing>,
    id: String,
    addr: String,
    token_count: usize,
    heartbeat_period: Duration,
}

impl RingLifecycler {
    pub fn new(
        ring: Arc<HashRing>,
        id: impl Into<String>,
        addr: impl Into<String>,
        token_count: usize,
        heartbeat_period: Duration,
    ) -> Self {
        Self {
            ring,
            id: id.into(),
            addr: addr.into(),
            token_count,
            heartbeat_period,
        }
    }

    /// Claim tokens as `Joining`, then switch to `Active`.
    pub fn join(&self) -> Result<()> {
        self.ring.register(
            InstanceDesc::new(self.id.clone(), self.addr.clone()),
            self.token_count,
        )?;
        self.ring.set_state(&self.id, InstanceState::Active)
    }

    /// Join, heartbeat until `cancel` fires, then leave and unregister.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        self.join()?;
        let mut ticker = tokio::time::interval(self.heartbeat_period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.ring.heartbeat(&self.id) {
                        // Forgotten by a health check; claim tokens again.
                        warn!("Heartbeat for {} failed ({}), re-joining ring {}", self.id, e, self.ring.name());
                        if let Err(e) = self.join() {
                            error!("Failed to re-join ring {}: {}", self.ring.name(), e);
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Instance {} leaving ring {}", self.id, self.ring.name());
                    self.ring.leave(&self.id)?;
                    self.ring.unregister(&self.id)?;
                    return Ok(());
                }
            }
        }
    }

    /// Spawn [`RingLifecycler::run`] on the runtime
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(cancel))
    }
}
