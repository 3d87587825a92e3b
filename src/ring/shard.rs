//! Per-tenant shard selection
//!
//! A [`ShardStrategy`] narrows a ring snapshot to the instances that may own
//! a tenant's data. The strategy is picked once at startup from
//! [`ShardingStrategy`].

use super::snapshot::RingSnapshot;
use crate::{Error, Result};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use twox_hash::XxHash64;

/// Configured sharding strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShardingStrategy {
    /// Every instance is eligible for every tenant
    #[default]
    Default,
    /// Each tenant gets a stable, bounded subset of instances
    ShuffleSharding,
}

impl ShardingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::ShuffleSharding => "shuffle-sharding",
        }
    }

    /// Resolve into a strategy object for a tier with the given replication factor.
    /// Use one object per ring: cached shards are keyed by snapshot version.
    pub fn build(&self, replication_factor: usize) -> Arc<dyn ShardStrategy> {
        match self {
            Self::Default => Arc::new(DefaultShardStrategy::new(replication_factor)),
            Self::ShuffleSharding => Arc::new(ShuffleShardStrategy::new(replication_factor)),
        }
    }
}

impl FromStr for ShardingStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(Self::Default),
            "shuffle-sharding" => Ok(Self::ShuffleSharding),
            other => Err(Error::Config(format!(
                "unknown sharding strategy {:?} (expected \"default\" or \"shuffle-sharding\")",
                other
            ))),
        }
    }
}

impl fmt::Display for ShardingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derives the instances eligible to hold a tenant's data
pub trait ShardStrategy: Send + Sync + fmt::Debug {
    /// The tenant's shard of `ring`. `size` 0 means the full ring.
    fn shard_for(
        &self,
        tenant: &str,
        size: usize,
        ring: &Arc<RingSnapshot>,
    ) -> Result<Arc<RingSnapshot>>;

    /// Minimum accepted non-zero shard size
    fn replication_factor(&self) -> usize;
}

fn validate_shard_size(size: usize, replication_factor: usize) -> Result<()> {
    if size != 0 && size < replication_factor {
        return Err(Error::InvalidShardSize {
            requested: size,
            replication_factor,
        });
    }
    Ok(())
}

/// Returns the entire ring for every tenant
#[derive(Debug)]
pub struct DefaultShardStrategy {
    replication_factor: usize,
}

impl DefaultShardStrategy {
    pub fn new(replication_factor: usize) -> Self {
        Self { replication_factor }
    }
}

impl ShardStrategy for DefaultShardStrategy {
    fn shard_for(
        &self,
        _tenant: &str,
        size: usize,
        ring: &Arc<RingSnapshot>,
    ) -> Result<Arc<RingSnapshot>> {
        validate_shard_size(size, self.replication_factor)?;
        Ok(ring.clone())
    }

    fn replication_factor(&self) -> usize {
        self.replication_factor
    }
}

#[derive(Debug)]
struct CachedShard {
    version: u64,
    shard: Arc<RingSnapshot>,
}

/// Selects `size` instances per tenant with a pseudo-random walk seeded by
/// the tenant's hash.
///
/// Each draw picks a random token and takes the first not-yet-chosen owner
/// at or after it. Draws cover every registered instance with tokens, so a
/// missed heartbeat leaves shards in place; lookups on the shard skip the
/// unhealthy member. Adding an instance only moves a tenant when one of the
/// tenant's draws lands on the new instance's tokens.
#[derive(Debug)]
pub struct ShuffleShardStrategy {
    replication_factor: usize,
    /// (tenant, size) -> shard computed for a ring version
    cache: DashMap<(String, usize), CachedShard>,
}

impl ShuffleShardStrategy {
    pub fn new(replication_factor: usize) -> Self {
        Self {
            replication_factor,
            cache: DashMap::new(),
        }
    }

    /// Number of cached tenant shards
    pub fn cached_shards(&self) -> usize {
        self.cache.len()
    }

    fn select(tenant: &str, size: usize, ring: &RingSnapshot) -> RingSnapshot {
        let mut rng = StdRng::seed_from_u64(XxHash64::oneshot(0, tenant.as_bytes()));
        let mut chosen: HashSet<String> = HashSet::with_capacity(size);

        while chosen.len() < size {
            let token: u32 = rng.gen();
            match ring.first_member_after(token, |id| chosen.contains(id)) {
                Some(owner) => {
                    chosen.insert(owner.to_string());
                }
                None => break,
            }
        }
        ring.subring(&chosen)
    }
}

impl ShardStrategy for ShuffleShardStrategy {
    fn shard_for(
        &self,
        tenant: &str,
        size: usize,
        ring: &Arc<RingSnapshot>,
    ) -> Result<Arc<RingSnapshot>> {
        validate_shard_size(size, self.replication_factor)?;
        if size == 0 || size >= ring.member_count() {
            return Ok(ring.clone());
        }

        let key = (tenant.to_string(), size);
        if let Some(cached) = self.cache.get(&key) {
            if cached.version == ring.version() {
                return Ok(cached.shard.clone());
            }
        }

        let shard = Arc::new(Self::select(tenant, size, ring));
        debug!(
            "Computed shuffle shard for tenant {} at ring version {}: {} instances, {} healthy",
            tenant,
            ring.version(),
            shard.member_count(),
            shard.healthy_count()
        );
        self.cache.insert(
            key,
            CachedShard {
                version: ring.version(),
                shard: shard.clone(),
            },
        );
        Ok(shard)
    }

    fn replication_factor(&self) -> usize {
        self.replication_factor
    }
}
