//! Configuration surface and component factory
//!
//! [`StrataConfig`] is read once at startup (defaults, then `STRATA_*`
//! environment variables) and validated. [`ComponentFactory`] resolves it
//! into the objects components share: object store, shard strategies and
//! index cache.

use crate::ingester::IngesterConfig;
use crate::limits::Limits;
use crate::querier::{QuerierConfig, SourceSelector, DEFAULT_LOOKBACK_DELTA};
use crate::replication::ReplicationConfig;
use crate::ring::{RingConfig, ShardStrategy, ShardingStrategy, DEFAULT_TOKENS_PER_INSTANCE};
use crate::storegateway::{DistributedIndexCache, InMemoryIndexCache, IndexCache, IndexCacheBackend};
use crate::{Error, Result};
use object_store::{aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, ObjectStore};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const HOUR: Duration = Duration::from_secs(3600);

/// Cluster-wide configuration
#[derive(Debug, Clone)]
pub struct StrataConfig {
    /// Ingester replicas per series
    pub replication_factor: usize,
    /// Store-gateway replicas per block
    pub store_gateway_replication_factor: usize,
    pub sharding_strategy: ShardingStrategy,
    pub index_cache_backend: IndexCacheBackend,
    pub index_cache_size_bytes: u64,
    /// Entry lifetime in the distributed index cache
    pub index_cache_ttl: Duration,
    pub bucket_index_enabled: bool,
    pub bucket_index_refresh_interval: Duration,
    pub query_sharding_enabled: bool,
    pub query_shards: usize,
    /// Ingesters are only queried for data newer than this (0 = always)
    pub query_ingesters_within: Duration,
    /// Blocks are only queried for data older than this (0 = always)
    pub query_store_after: Duration,
    pub ring: RingConfig,
    pub write_timeout: Duration,
    pub read_timeout: Duration,
    pub block_range: Duration,
    /// Defaults for every tenant
    pub limits: Limits,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            store_gateway_replication_factor: 1,
            sharding_strategy: ShardingStrategy::Default,
            index_cache_backend: IndexCacheBackend::InMemory,
            index_cache_size_bytes: 1 << 30,
            index_cache_ttl: 24 * HOUR,
            bucket_index_enabled: true,
            bucket_index_refresh_interval: Duration::from_secs(15 * 60),
            query_sharding_enabled: false,
            query_shards: 16,
            query_ingesters_within: 13 * HOUR,
            query_store_after: 12 * HOUR,
            ring: RingConfig {
                heartbeat_timeout: Duration::from_secs(60),
                forget_period: Duration::from_secs(600),
                tokens_per_instance: DEFAULT_TOKENS_PER_INSTANCE,
            },
            write_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(30),
            block_range: 2 * HOUR,
            limits: Limits::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {}={:?}: {}", name, raw, e)))
}

fn parse_duration(name: &str, raw: &str) -> Result<Duration> {
    humantime::parse_duration(raw.trim())
        .map_err(|e| Error::Config(format!("invalid {}={:?}: {}", name, raw, e)))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("invalid {}={:?}: expected a boolean", name, raw))),
    }
}

impl StrataConfig {
    /// Defaults overridden by `STRATA_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        macro_rules! apply {
            ($name:literal, $parse:expr, $field:expr) => {
                if let Some(raw) = lookup($name) {
                    $field = $parse($name, &raw)?;
                }
            };
        }

        apply!("STRATA_REPLICATION_FACTOR", parse_var, config.replication_factor);
        apply!(
            "STRATA_STORE_GATEWAY_REPLICATION_FACTOR",
            parse_var,
            config.store_gateway_replication_factor
        );
        apply!(
            "STRATA_INGESTER_SHARD_SIZE",
            parse_var,
            config.limits.ingestion_tenant_shard_size
        );
        apply!(
            "STRATA_STORE_GATEWAY_SHARD_SIZE",
            parse_var,
            config.limits.store_gateway_tenant_shard_size
        );
        apply!("STRATA_SHARDING_STRATEGY", parse_var, config.sharding_strategy);
        apply!("STRATA_INDEX_CACHE_BACKEND", parse_var, config.index_cache_backend);
        apply!("STRATA_INDEX_CACHE_SIZE_BYTES", parse_var, config.index_cache_size_bytes);
        apply!("STRATA_INDEX_CACHE_TTL", parse_duration, config.index_cache_ttl);
        apply!("STRATA_BUCKET_INDEX_ENABLED", parse_bool, config.bucket_index_enabled);
        apply!(
            "STRATA_BUCKET_INDEX_REFRESH_INTERVAL",
            parse_duration,
            config.bucket_index_refresh_interval
        );
        apply!("STRATA_QUERY_SHARDING_ENABLED", parse_bool, config.query_sharding_enabled);
        apply!("STRATA_QUERY_SHARDS", parse_var, config.query_shards);
        apply!(
            "STRATA_MAX_FETCHED_SERIES_PER_QUERY",
            parse_var,
            config.limits.max_fetched_series_per_query
        );
        apply!("STRATA_EVALUATION_DELAY", parse_duration, config.limits.evaluation_delay);
        apply!(
            "STRATA_QUERY_INGESTERS_WITHIN",
            parse_duration,
            config.query_ingesters_within
        );
        apply!("STRATA_QUERY_STORE_AFTER", parse_duration, config.query_store_after);
        apply!("STRATA_TOKENS_PER_INSTANCE", parse_var, config.ring.tokens_per_instance);
        apply!("STRATA_HEARTBEAT_TIMEOUT", parse_duration, config.ring.heartbeat_timeout);
        apply!("STRATA_RING_FORGET_PERIOD", parse_duration, config.ring.forget_period);
        apply!("STRATA_WRITE_TIMEOUT", parse_duration, config.write_timeout);
        apply!("STRATA_READ_TIMEOUT", parse_duration, config.read_timeout);
        apply!("STRATA_BLOCK_RANGE", parse_duration, config.block_range);

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            return Err(Error::Config("replication factor must be at least 1".to_string()));
        }
        if self.store_gateway_replication_factor == 0 {
            return Err(Error::Config(
                "store-gateway replication factor must be at least 1".to_string(),
            ));
        }
        let shard_sizes = [
            (
                "ingester",
                self.limits.ingestion_tenant_shard_size,
                self.replication_factor,
            ),
            (
                "store-gateway",
                self.limits.store_gateway_tenant_shard_size,
                self.store_gateway_replication_factor,
            ),
        ];
        for (tier, size, rf) in shard_sizes {
            if size != 0 && size < rf {
                return Err(Error::Config(format!(
                    "{} shard size {} is smaller than the replication factor {}",
                    tier, size, rf
                )));
            }
        }
        if self.query_shards == 0 {
            return Err(Error::Config("query shards must be at least 1".to_string()));
        }
        if self.ring.tokens_per_instance == 0 {
            return Err(Error::Config("tokens per instance must be at least 1".to_string()));
        }
        if self.block_range.is_zero() {
            return Err(Error::Config("block range must be positive".to_string()));
        }
        if !self.query_ingesters_within.is_zero()
            && !self.query_store_after.is_zero()
            && self.query_ingesters_within < self.query_store_after
        {
            return Err(Error::Config(format!(
                "query ingesters within ({}) must not be shorter than query store after ({}), \
                 or recent data would be missed",
                humantime::format_duration(self.query_ingesters_within),
                humantime::format_duration(self.query_store_after)
            )));
        }
        Ok(())
    }

    pub fn ingester_replication(&self) -> ReplicationConfig {
        ReplicationConfig {
            replication_factor: self.replication_factor,
            write_timeout: self.write_timeout,
            read_timeout: self.read_timeout,
        }
    }

    pub fn ingester_config(&self) -> IngesterConfig {
        let defaults = IngesterConfig::default();
        IngesterConfig {
            block_range: self.block_range,
            // Keep head data at least as long as the querier asks ingesters for it
            retain_period: if self.query_ingesters_within.is_zero() {
                defaults.retain_period
            } else {
                self.query_ingesters_within
            },
            ..defaults
        }
    }

    pub fn querier_config(&self) -> QuerierConfig {
        QuerierConfig {
            query_sharding_enabled: self.query_sharding_enabled,
            query_shards: self.query_shards,
            lookback_delta: DEFAULT_LOOKBACK_DELTA,
            timeout: self.read_timeout,
        }
    }

    pub fn source_selector(&self) -> SourceSelector {
        SourceSelector::new(self.query_ingesters_within, self.query_store_after)
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create object store from environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default), "local" or "s3"
    /// - LOCAL_STORAGE_PATH: directory for the local backend (default: ./data)
    /// - S3_BUCKET: S3 bucket name (required for s3)
    /// - S3_REGION: S3 region (default: us-east-1)
    /// - S3_ENDPOINT: Custom S3 endpoint (optional, for MinIO)
    /// - AWS_ACCESS_KEY_ID: AWS credentials (optional, uses IAM role if not set)
    /// - AWS_SECRET_ACCESS_KEY: AWS credentials (optional)
    pub fn create_object_store() -> Result<Arc<dyn ObjectStore>> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());

        match backend.as_str() {
            "memory" => {
                info!("Using in-memory object store (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            "local" => {
                let path = std::env::var("LOCAL_STORAGE_PATH").unwrap_or_else(|_| "./data".to_string());
                std::fs::create_dir_all(&path)?;
                info!("Using local filesystem object store at {}", path);
                Ok(Arc::new(LocalFileSystem::new_with_prefix(&path)?))
            }
            "s3" => {
                let bucket = std::env::var("S3_BUCKET").map_err(|_| {
                    Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?;
                let region = std::env::var("S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

                info!(
                    "Using S3 object store: bucket={}, region={}",
                    bucket, region
                );

                let mut builder = AmazonS3Builder::new()
                    .with_bucket_name(&bucket)
                    .with_region(&region);

                // MinIO, LocalStack
                if let Ok(endpoint) = std::env::var("S3_ENDPOINT") {
                    info!("Using custom S3 endpoint: {}", endpoint);
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }

                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(&key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(&secret);
                }

                Ok(Arc::new(builder.build()?))
            }
            _ => Err(Error::Config(format!(
                "Unknown STORAGE_BACKEND: {}. Use 'memory', 'local' or 's3'",
                backend
            ))),
        }
    }

    /// Shard strategy of the ingester ring
    pub fn ingester_shard_strategy(config: &StrataConfig) -> Arc<dyn ShardStrategy> {
        config.sharding_strategy.build(config.replication_factor)
    }

    /// Shard strategy of the store-gateway ring
    pub fn store_gateway_shard_strategy(config: &StrataConfig) -> Arc<dyn ShardStrategy> {
        config
            .sharding_strategy
            .build(config.store_gateway_replication_factor)
    }

    /// Index cache for store-gateways; the distributed backend lives on `store`.
    pub fn create_index_cache(config: &StrataConfig, store: Arc<dyn ObjectStore>) -> Arc<dyn IndexCache> {
        match config.index_cache_backend {
            IndexCacheBackend::InMemory => {
                info!(
                    "Using in-memory index cache of {} bytes",
                    config.index_cache_size_bytes
                );
                Arc::new(InMemoryIndexCache::new(config.index_cache_size_bytes))
            }
            IndexCacheBackend::Distributed => {
                info!(
                    "Using distributed index cache with TTL {}",
                    humantime::format_duration(config.index_cache_ttl)
                );
                Arc::new(DistributedIndexCache::new(
                    store,
                    "index-cache",
                    config.index_cache_ttl,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = StrataConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ingester_config().retain_period, 13 * HOUR);
        assert_eq!(config.ingester_replication().quorum(), 2);
    }

    #[test]
    fn test_env_overrides() {
        let config = StrataConfig::from_lookup(lookup(&[
            ("STRATA_REPLICATION_FACTOR", "5"),
            ("STRATA_SHARDING_STRATEGY", "shuffle-sharding"),
            ("STRATA_INGESTER_SHARD_SIZE", "6"),
            ("STRATA_INDEX_CACHE_BACKEND", "distributed"),
            ("STRATA_QUERY_SHARDING_ENABLED", "true"),
            ("STRATA_EVALUATION_DELAY", "1m"),
            ("STRATA_QUERY_STORE_AFTER", "0s"),
        ]))
        .unwrap();
        assert_eq!(config.replication_factor, 5);
        assert_eq!(config.sharding_strategy, ShardingStrategy::ShuffleSharding);
        assert_eq!(config.limits.ingestion_tenant_shard_size, 6);
        assert_eq!(config.index_cache_backend, IndexCacheBackend::Distributed);
        assert!(config.query_sharding_enabled);
        assert_eq!(config.limits.evaluation_delay, Duration::from_secs(60));
        assert!(config.query_store_after.is_zero());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let cases: &[&[(&str, &str)]] = &[
            &[("STRATA_REPLICATION_FACTOR", "0")],
            &[("STRATA_REPLICATION_FACTOR", "three")],
            &[("STRATA_INGESTER_SHARD_SIZE", "2")],
            &[("STRATA_QUERY_SHARDS", "0")],
            &[("STRATA_SHARDING_STRATEGY", "random")],
            &[("STRATA_BUCKET_INDEX_ENABLED", "maybe")],
            &[("STRATA_QUERY_INGESTERS_WITHIN", "1h")],
        ];
        for vars in cases {
            let err = StrataConfig::from_lookup(lookup(vars)).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{:?}: {}", vars, err);
        }
    }
}
