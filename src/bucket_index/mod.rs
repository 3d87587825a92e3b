//! Per-tenant manifest of available blocks
//!
//! The manifest is rebuilt periodically, independent of queries. Queries
//! read the last published manifest and never wait for a rebuild. A failed
//! rebuild keeps the previous manifest and marks the tenant degraded.

use crate::clock::Clock;
use crate::model::TimeRange;
use crate::storage::{BlockMeta, BlockStore, DeletionMark};
use crate::storegateway::IndexCache;
use crate::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Blocks and deletion marks of one tenant at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketIndexManifest {
    pub tenant: String,
    /// Blocks ordered by (min time, id)
    pub blocks: Vec<BlockMeta>,
    pub deletion_marks: Vec<DeletionMark>,
    /// When the manifest was built (ms since the epoch)
    pub updated_at_ms: i64,
}

impl BucketIndexManifest {
    /// Blocks overlapping `range`. Blocks marked for deletion stay readable
    /// until they are removed.
    pub fn blocks_in(&self, range: &TimeRange) -> Vec<BlockMeta> {
        self.blocks
            .iter()
            .filter(|b| b.range().overlaps(range))
            .cloned()
            .collect()
    }

    pub fn block_ids(&self) -> HashSet<&str> {
        self.blocks.iter().map(|b| b.id.as_str()).collect()
    }
}

/// Outcome of the latest refresh for a tenant
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BucketIndexStatus {
    /// Time of the last successful refresh
    pub last_success_ms: Option<i64>,
    /// Error of the last refresh, if it failed
    pub last_error: Option<String>,
}

impl BucketIndexStatus {
    pub fn is_degraded(&self) -> bool {
        self.last_error.is_some()
    }
}

/// Builds, persists and serves bucket index manifests
pub struct BucketIndex {
    store: Arc<dyn BlockStore>,
    cache: Option<Arc<dyn IndexCache>>,
    clock: Arc<dyn Clock>,
    manifests: DashMap<String, Arc<BucketIndexManifest>>,
    status: DashMap<String, BucketIndexStatus>,
}

impl std::fmt::Debug for BucketIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketIndex")
            .field("tenants", &self.manifests.len())
            .finish()
    }
}

impl BucketIndex {
    pub fn new(store: Arc<dyn BlockStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            cache: None,
            clock,
            manifests: DashMap::new(),
            status: DashMap::new(),
        }
    }

    /// Invalidate entries of `cache` when blocks disappear
    pub fn with_index_cache(mut self, cache: Arc<dyn IndexCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Rebuild the tenant's manifest from storage, persist and publish it.
    ///
    /// On failure the previous manifest stays in effect and the tenant's
    /// status records the error.
    pub async fn refresh(&self, tenant: &str) -> Result<Arc<BucketIndexManifest>> {
        match self.build(tenant).await {
            Ok(manifest) => {
                let manifest = Arc::new(manifest);
                let previous = self.manifests.insert(tenant.to_string(), manifest.clone());
                self.status.insert(
                    tenant.to_string(),
                    BucketIndexStatus {
                        last_success_ms: Some(manifest.updated_at_ms),
                        last_error: None,
                    },
                );
                if let Some(previous) = previous {
                    self.invalidate_removed(&previous, &manifest).await;
                }
                debug!(
                    "Refreshed bucket index for tenant {}: {} blocks, {} deletion marks",
                    tenant,
                    manifest.blocks.len(),
                    manifest.deletion_marks.len()
                );
                Ok(manifest)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(
                    "Bucket index refresh for tenant {} failed, keeping previous manifest: {}",
                    tenant, reason
                );
                self.status
                    .entry(tenant.to_string())
                    .or_default()
                    .last_error = Some(reason.clone());
                Err(Error::StaleManifest {
                    tenant: tenant.to_string(),
                    reason,
                })
            }
        }
    }

    async fn build(&self, tenant: &str) -> Result<BucketIndexManifest> {
        let blocks = self.store.list_blocks(tenant, TimeRange::all()).await?;
        let deletion_marks = self.store.list_deletion_marks(tenant).await?;
        let manifest = BucketIndexManifest {
            tenant: tenant.to_string(),
            blocks,
            deletion_marks,
            updated_at_ms: self.clock.now_millis(),
        };
        self.store.write_bucket_index(&manifest).await?;
        Ok(manifest)
    }

    async fn invalidate_removed(&self, previous: &BucketIndexManifest, current: &BucketIndexManifest) {
        let Some(cache) = &self.cache else {
            return;
        };
        let present = current.block_ids();
        for block in &previous.blocks {
            if !present.contains(block.id.as_str()) {
                info!(
                    "Block {} of tenant {} was removed, invalidating its index cache entries",
                    block.id, current.tenant
                );
                cache.invalidate_block(&block.id).await;
            }
        }
    }

    /// The last published manifest, possibly stale
    pub fn current(&self, tenant: &str) -> Option<Arc<BucketIndexManifest>> {
        self.manifests.get(tenant).map(|m| m.value().clone())
    }

    /// Manifest for the query path: the published one, else the persisted
    /// one, else a one-off build. Never returns `StaleManifest`.
    pub async fn manifest_for(&self, tenant: &str) -> Result<Arc<BucketIndexManifest>> {
        if let Some(manifest) = self.current(tenant) {
            return Ok(manifest);
        }
        match self.store.read_bucket_index(tenant).await {
            Ok(Some(persisted)) => {
                let manifest = Arc::new(persisted);
                let published = self
                    .manifests
                    .entry(tenant.to_string())
                    .or_insert(manifest)
                    .clone();
                return Ok(published);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to read persisted bucket index of tenant {}: {}", tenant, e),
        }
        self.refresh(tenant).await.map_err(|e| {
            Error::ReadFailure(format!("no bucket index available for tenant {}: {}", tenant, e))
        })
    }

    /// Load a persisted manifest without rebuilding
    pub async fn load(&self, tenant: &str) -> Result<Option<Arc<BucketIndexManifest>>> {
        Ok(self.store.read_bucket_index(tenant).await?.map(Arc::new))
    }

    pub fn status(&self, tenant: &str) -> Option<BucketIndexStatus> {
        self.status.get(tenant).map(|s| s.value().clone())
    }

    /// Refresh every tenant found in storage. Returns (refreshed, failed).
    pub async fn refresh_all(&self) -> Result<(usize, usize)> {
        let mut tenants: HashSet<String> = self.store.list_tenants().await?.into_iter().collect();
        tenants.extend(self.manifests.iter().map(|m| m.key().clone()));

        let (mut refreshed, mut failed) = (0, 0);
        for tenant in tenants {
            match self.refresh(&tenant).await {
                Ok(_) => refreshed += 1,
                Err(_) => failed += 1,
            }
        }
        Ok((refreshed, failed))
    }

    /// Refresh all tenants every `interval` until `cancel` fires
    pub async fn run_refresh_loop(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refresh_all().await {
                        Ok((refreshed, failed)) => {
                            debug!("Bucket index refresh cycle: {} refreshed, {} failed", refreshed, failed)
                        }
                        Err(e) => warn!("Failed to list tenants for bucket index refresh: {}", e),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Bucket index refresh loop shutting down");
                    break;
                }
            }
        }
    }
}
