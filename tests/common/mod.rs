//! In-process cluster used by the integration tests
//!
//! Every component runs on a [`ManualClock`] and talks over a
//! [`LocalTransport`]; an instance's address is its ID.

#![allow(dead_code)]

use object_store::memory::InMemory;
use strata::bucket_index::BucketIndex;
use strata::clock::{Clock, ManualClock};
use strata::distributor::Distributor;
use strata::ingester::{Ingester, IngesterConfig};
use strata::limits::{Limits, Overrides};
use strata::model::{Labels, Sample, Series};
use strata::querier::{
    BlockSource, BlockTier, FederationEngine, HeadTier, Querier, QuerierConfig, SourceSelector,
};
use strata::replication::{ReplicationConfig, ReplicationCoordinator};
use strata::ring::{HashRing, InstanceDesc, InstanceState, RingConfig, ShardingStrategy};
use strata::storage::{BlockStore, ObjectStoreBlockStore};
use strata::storegateway::{IndexCache, InMemoryIndexCache, StoreGateway};
use strata::transport::{LocalTransport, Transport};

use std::sync::Arc;
use std::time::Duration;

pub const HOUR: i64 = 3_600_000;
pub const NOW: i64 = 100 * HOUR;
pub const TENANT: &str = "tenant-1";
pub const TOKENS: usize = 64;

/// Knobs for [`TestCluster::start`]
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    pub ingesters: usize,
    pub store_gateways: usize,
    pub replication_factor: usize,
    pub store_gateway_replication_factor: usize,
    pub sharding_strategy: ShardingStrategy,
    /// Force every series into the same head bucket
    pub collide_fingerprints: bool,
    pub query_sharding: bool,
    pub selector: SourceSelector,
    pub limits: Limits,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            ingesters: 3,
            store_gateways: 2,
            replication_factor: 3,
            store_gateway_replication_factor: 2,
            sharding_strategy: ShardingStrategy::Default,
            collide_fingerprints: false,
            query_sharding: false,
            selector: SourceSelector::new(Duration::ZERO, Duration::ZERO),
            limits: Limits::default(),
        }
    }
}

pub struct TestCluster {
    pub clock: Arc<ManualClock>,
    pub transport: Arc<LocalTransport>,
    pub ingester_ring: Arc<HashRing>,
    pub store_gateway_ring: Arc<HashRing>,
    pub ingesters: Vec<Arc<Ingester>>,
    pub store_gateways: Vec<Arc<StoreGateway>>,
    pub block_store: Arc<ObjectStoreBlockStore>,
    pub index_cache: Arc<InMemoryIndexCache>,
    pub bucket_index: Arc<BucketIndex>,
    pub overrides: Arc<Overrides>,
    pub distributor: Arc<Distributor>,
    pub querier: Arc<Querier>,
}

impl TestCluster {
    pub fn start(options: ClusterOptions) -> Self {
        let clock = Arc::new(ManualClock::new(NOW));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let transport = Arc::new(LocalTransport::new());
        let ring_config = RingConfig {
            tokens_per_instance: TOKENS,
            ..RingConfig::default()
        };

        let ingester_ring = Arc::new(HashRing::new("ingester", ring_config.clone(), dyn_clock.clone()));
        let mut ingesters = Vec::new();
        for i in 0..options.ingesters {
            let id = format!("ingester-{}", i);
            let mut ingester = Ingester::new(id.clone(), IngesterConfig::default());
            if options.collide_fingerprints {
                ingester = ingester.with_fingerprint_fn(Arc::new(|_: &Labels| 42));
            }
            let ingester = Arc::new(ingester);
            transport.register(id.clone(), ingester.clone());
            ingester_ring
                .register(InstanceDesc::new(id.clone(), id).with_state(InstanceState::Active), TOKENS)
                .unwrap();
            ingesters.push(ingester);
        }

        let block_store = Arc::new(ObjectStoreBlockStore::new(Arc::new(InMemory::new())));
        let index_cache = Arc::new(InMemoryIndexCache::new(64 * 1024 * 1024));
        let dyn_store: Arc<dyn BlockStore> = block_store.clone();
        let dyn_cache: Arc<dyn IndexCache> = index_cache.clone();

        let store_gateway_ring = Arc::new(HashRing::new("store-gateway", ring_config, dyn_clock.clone()));
        let mut store_gateways = Vec::new();
        for i in 0..options.store_gateways {
            let id = format!("store-gateway-{}", i);
            let gateway = Arc::new(StoreGateway::new(id.clone(), dyn_store.clone(), dyn_cache.clone()));
            transport.register(id.clone(), gateway.clone());
            store_gateway_ring
                .register(InstanceDesc::new(id.clone(), id).with_state(InstanceState::Active), TOKENS)
                .unwrap();
            store_gateways.push(gateway);
        }

        let bucket_index = Arc::new(
            BucketIndex::new(dyn_store.clone(), dyn_clock.clone()).with_index_cache(dyn_cache),
        );
        let overrides = Arc::new(Overrides::new(options.limits.clone()));

        let dyn_transport: Arc<dyn Transport> = transport.clone();
        let replication = ReplicationCoordinator::new(
            ReplicationConfig {
                replication_factor: options.replication_factor,
                write_timeout: Duration::from_secs(1),
                read_timeout: Duration::from_secs(1),
            },
            dyn_transport.clone(),
        );
        let ingester_strategy = options.sharding_strategy.build(options.replication_factor);
        let distributor = Arc::new(Distributor::new(
            ingester_ring.clone(),
            ingester_strategy.clone(),
            replication.clone(),
            overrides.clone(),
        ));

        let head_tier = HeadTier::new(
            ingester_ring.clone(),
            ingester_strategy,
            overrides.clone(),
            replication,
        );
        let block_tier = BlockTier::new(
            store_gateway_ring.clone(),
            options
                .sharding_strategy
                .build(options.store_gateway_replication_factor),
            overrides.clone(),
            BlockSource::BucketIndex(bucket_index.clone()),
            dyn_transport,
            options.store_gateway_replication_factor,
            Duration::from_secs(5),
        );
        let engine = FederationEngine::new(options.selector, dyn_clock)
            .with_head_tier(Arc::new(head_tier))
            .with_store_tier(Arc::new(block_tier));
        let querier = Arc::new(Querier::new(
            Arc::new(engine),
            overrides.clone(),
            QuerierConfig {
                query_sharding_enabled: options.query_sharding,
                query_shards: 4,
                ..QuerierConfig::default()
            },
        ));

        Self {
            clock,
            transport,
            ingester_ring,
            store_gateway_ring,
            ingesters,
            store_gateways,
            block_store,
            index_cache,
            bucket_index,
            overrides,
            distributor,
            querier,
        }
    }

    /// Ship every ingester's head data older than `before_ms` and refresh
    /// the bucket index.
    pub async fn flush_heads(&self, tenant: &str, before_ms: i64) {
        for ingester in &self.ingesters {
            ingester
                .cut_block(tenant, before_ms, self.block_store.as_ref())
                .await
                .unwrap();
        }
        self.bucket_index.refresh(tenant).await.unwrap();
    }
}

pub fn series(pairs: &[(&str, &str)], samples: &[(i64, f64)]) -> Series {
    Series::new(
        Labels::from_pairs(pairs),
        samples.iter().map(|&(ts, v)| Sample::new(ts, v)).collect(),
    )
}
