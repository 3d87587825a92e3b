//! Data tiers a query fans out to
//!
//! The federation engine only sees [`QueryableTier`]. The head tier asks
//! every ingester in the tenant's shard; the block tier assigns each block
//! to a store-gateway and re-asks another replica for blocks that were not
//! queried.

use super::telemetry;
use crate::bucket_index::BucketIndex;
use crate::limits::Overrides;
use crate::model::TimeRange;
use crate::replication::ReplicationCoordinator;
use crate::ring::{hash_key, HashRing, InstanceDesc, ShardStrategy};
use crate::storage::{BlockMeta, BlockStore};
use crate::transport::{Request, Response, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Responses of one tier
#[derive(Debug, Default)]
pub struct TierResult {
    /// Responses in a deterministic order
    pub responses: Vec<Response>,
    /// Some sources failed but coverage was still complete
    pub degraded: bool,
}

/// A data tier answering read requests for a time range
#[async_trait]
pub trait QueryableTier: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Answer `request`, which covers `range`.
    async fn query(
        &self,
        tenant: &str,
        range: TimeRange,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<TierResult>;
}

/// Recent data held by ingesters
#[derive(Debug)]
pub struct HeadTier {
    ring: Arc<HashRing>,
    strategy: Arc<dyn ShardStrategy>,
    overrides: Arc<Overrides>,
    replication: ReplicationCoordinator,
}

impl HeadTier {
    pub fn new(
        ring: Arc<HashRing>,
        strategy: Arc<dyn ShardStrategy>,
        overrides: Arc<Overrides>,
        replication: ReplicationCoordinator,
    ) -> Self {
        Self {
            ring,
            strategy,
            overrides,
            replication,
        }
    }
}

#[async_trait]
impl QueryableTier for HeadTier {
    fn name(&self) -> &'static str {
        "head"
    }

    async fn query(
        &self,
        tenant: &str,
        _range: TimeRange,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<TierResult> {
        let ring = self.ring.snapshot();
        let size = self.overrides.ingestion_tenant_shard_size(tenant);
        let shard = self.strategy.shard_for(tenant, size, &ring)?;
        let replicas = self.replication.read_replica_set(&shard)?;
        debug!(
            "Querying {} ingesters for tenant {}: {:?}",
            replicas.len(),
            tenant,
            replicas.ids()
        );

        let mut outcome = self.replication.read_all(&replicas, request, cancel).await?;
        // First value seen wins on merge; order by instance for stable results.
        outcome.responses.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(TierResult {
            responses: outcome.responses.into_iter().map(|(_, r)| r).collect(),
            degraded: outcome.degraded,
        })
    }
}

/// Where the block tier learns which blocks exist
#[derive(Debug, Clone)]
pub enum BlockSource {
    BucketIndex(Arc<BucketIndex>),
    Listing(Arc<dyn BlockStore>),
}

impl BlockSource {
    async fn blocks(&self, tenant: &str, range: TimeRange) -> Result<Vec<BlockMeta>> {
        match self {
            BlockSource::BucketIndex(index) => Ok(index.manifest_for(tenant).await?.blocks_in(&range)),
            BlockSource::Listing(store) => store.list_blocks(tenant, range).await,
        }
    }
}

/// Historical data in blocks, served by store-gateways
#[derive(Debug)]
pub struct BlockTier {
    ring: Arc<HashRing>,
    strategy: Arc<dyn ShardStrategy>,
    overrides: Arc<Overrides>,
    source: BlockSource,
    transport: Arc<dyn Transport>,
    replication_factor: usize,
    timeout: Duration,
}

impl BlockTier {
    pub fn new(
        ring: Arc<HashRing>,
        strategy: Arc<dyn ShardStrategy>,
        overrides: Arc<Overrides>,
        source: BlockSource,
        transport: Arc<dyn Transport>,
        replication_factor: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            ring,
            strategy,
            overrides,
            source,
            transport,
            replication_factor: replication_factor.max(1),
            timeout,
        }
    }
}

#[async_trait]
impl QueryableTier for BlockTier {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn query(
        &self,
        tenant: &str,
        range: TimeRange,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<TierResult> {
        let blocks = self.source.blocks(tenant, range).await.map_err(|e| match e {
            Error::Cancelled => e,
            other => Error::ReadFailure(format!("failed to list blocks: {}", other)),
        })?;
        if blocks.is_empty() {
            return Ok(TierResult::default());
        }

        let ring = self.ring.snapshot();
        let size = self.overrides.store_gateway_tenant_shard_size(tenant);
        let shard = self.strategy.shard_for(tenant, size, &ring)?;

        // Owners of each block in preference order
        let mut owners: BTreeMap<String, Vec<InstanceDesc>> = BTreeMap::new();
        for block in &blocks {
            let replicas = shard
                .get(hash_key(&block.id), self.replication_factor)
                .map_err(|e| Error::ReadFailure(e.to_string()))?;
            owners.insert(block.id.clone(), replicas.instances);
        }

        let child = cancel.child_token();
        let mut remaining: BTreeSet<String> = owners.keys().cloned().collect();
        let mut result = TierResult::default();
        let mut attempt = 0;

        while !remaining.is_empty() {
            let mut per_instance: BTreeMap<String, (InstanceDesc, Vec<String>)> = BTreeMap::new();
            let mut exhausted = Vec::new();
            for block_id in &remaining {
                match owners.get(block_id).and_then(|o| o.get(attempt)) {
                    Some(desc) => per_instance
                        .entry(desc.id.clone())
                        .or_insert_with(|| (desc.clone(), Vec::new()))
                        .1
                        .push(block_id.clone()),
                    None => exhausted.push(block_id.clone()),
                }
            }
            if !exhausted.is_empty() {
                child.cancel();
                return Err(Error::ReadFailure(format!(
                    "consistency check failed because some blocks were not queried: {}",
                    exhausted.join(", ")
                )));
            }
            if attempt > 0 {
                telemetry::record_blocks_retried(remaining.len() as u64);
                debug!("Retrying {} blocks on other store-gateways", remaining.len());
            }

            let mut tasks = FuturesUnordered::new();
            for (id, (desc, block_ids)) in per_instance {
                let transport = self.transport.clone();
                let request = request.for_blocks(block_ids);
                let timeout = self.timeout;
                let child = child.clone();
                tasks.push(tokio::spawn(async move {
                    let result = tokio::select! {
                        _ = child.cancelled() => Err(Error::Cancelled),
                        result = transport.send(&desc.addr, request, timeout) => result,
                    };
                    (id, result)
                }));
            }

            let mut answered: Vec<(String, Response)> = Vec::new();
            while let Some(joined) = tasks.next().await {
                let (id, outcome) =
                    joined.map_err(|e| Error::Internal(format!("store-gateway task failed: {}", e)))?;
                match outcome {
                    Ok(response) => answered.push((id, response)),
                    Err(_) if cancel.is_cancelled() => return Err(Error::Cancelled),
                    Err(e) => {
                        warn!("Store-gateway {} failed for tenant {}: {}", id, tenant, e);
                        result.degraded = true;
                    }
                }
            }

            answered.sort_by(|a, b| a.0.cmp(&b.0));
            for (_, response) in answered {
                for block_id in response.queried_blocks() {
                    remaining.remove(block_id);
                }
                result.responses.push(response);
            }
            attempt += 1;
        }

        Ok(result)
    }
}
