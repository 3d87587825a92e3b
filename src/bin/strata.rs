//! Strata single-process cluster
//!
//! Runs ingesters and store-gateways on the in-process transport, the
//! distributor and querier behind the HTTP API, and the background loops
//! (ring lifecyclers and health checks, head compaction, bucket index refresh).

use strata::api::{self, ApiServerConfig, ApiState};
use strata::bucket_index::BucketIndex;
use strata::clock::{Clock, SystemClock};
use strata::config::{ComponentFactory, StrataConfig};
use strata::distributor::Distributor;
use strata::ingester::Ingester;
use strata::limits::Overrides;
use strata::querier::{BlockSource, BlockTier, FederationEngine, HeadTier, Querier};
use strata::replication::ReplicationCoordinator;
use strata::ring::{HashRing, RingLifecycler};
use strata::storage::{BlockStore, ObjectStoreBlockStore};
use strata::storegateway::StoreGateway;
use strata::telemetry::Telemetry;
use strata::transport::{LocalTransport, Transport};
use strata::Error;

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Strata single-process cluster
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// HTTP API port
    #[arg(long, env = "STRATA_HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Number of in-process ingesters
    #[arg(long, env = "STRATA_INGESTERS", default_value = "3")]
    ingesters: usize,

    /// Number of in-process store-gateways
    #[arg(long, env = "STRATA_STORE_GATEWAYS", default_value = "1")]
    store_gateways: usize,

    /// Log level
    #[arg(long, env = "STRATA_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let _telemetry = Telemetry::init_for_component("strata", &args.log_level)?;

    let config = StrataConfig::from_env()?;
    if args.ingesters < config.replication_factor {
        return Err(Error::Config(format!(
            "{} ingesters cannot hold {} replicas",
            args.ingesters, config.replication_factor
        ))
        .into());
    }
    if args.store_gateways < config.store_gateway_replication_factor {
        return Err(Error::Config(format!(
            "{} store-gateways cannot hold {} replicas",
            args.store_gateways, config.store_gateway_replication_factor
        ))
        .into());
    }

    info!(
        replication_factor = config.replication_factor,
        sharding_strategy = %config.sharding_strategy,
        index_cache = %config.index_cache_backend,
        ingesters = args.ingesters,
        store_gateways = args.store_gateways,
        "Starting Strata"
    );

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let object_store = ComponentFactory::create_object_store()?;
    let block_store: Arc<dyn BlockStore> = Arc::new(ObjectStoreBlockStore::new(object_store.clone()));
    let index_cache = ComponentFactory::create_index_cache(&config, object_store);
    let overrides = Arc::new(Overrides::new(config.limits.clone()));
    let transport = Arc::new(LocalTransport::new());
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let heartbeat_period = config.ring.heartbeat_timeout / 4;
    let ingester_ring = Arc::new(HashRing::new("ingester", config.ring.clone(), clock.clone()));
    let store_gateway_ring = Arc::new(HashRing::new("store-gateway", config.ring.clone(), clock.clone()));

    for i in 0..args.ingesters {
        let id = format!("ingester-{}", i);
        let ingester = Arc::new(Ingester::new(id.clone(), config.ingester_config()));
        transport.register(id.clone(), ingester.clone());

        let lifecycler = RingLifecycler::new(
            ingester_ring.clone(),
            id.clone(),
            id,
            config.ring.tokens_per_instance,
            heartbeat_period,
        );
        lifecycler.join()?;
        tasks.push(tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(e) = lifecycler.run(cancel).await {
                    error!("Ingester lifecycler failed: {}", e);
                }
            }
        }));

        let (store, clock, cancel) = (block_store.clone(), clock.clone(), cancel.clone());
        tasks.push(tokio::spawn(async move {
            ingester.run_compaction_loop(store, clock, cancel).await;
        }));
    }

    for i in 0..args.store_gateways {
        let id = format!("store-gateway-{}", i);
        let gateway = Arc::new(StoreGateway::new(id.clone(), block_store.clone(), index_cache.clone()));
        transport.register(id.clone(), gateway);

        let lifecycler = RingLifecycler::new(
            store_gateway_ring.clone(),
            id.clone(),
            id,
            config.ring.tokens_per_instance,
            heartbeat_period,
        );
        lifecycler.join()?;
        tasks.push(tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if let Err(e) = lifecycler.run(cancel).await {
                    error!("Store-gateway lifecycler failed: {}", e);
                }
            }
        }));
    }

    for ring in [ingester_ring.clone(), store_gateway_ring.clone()] {
        let (cancel, interval) = (cancel.clone(), heartbeat_period);
        tasks.push(tokio::spawn(async move {
            ring.run_health_checks(interval, cancel).await;
        }));
    }

    let block_source = if config.bucket_index_enabled {
        let bucket_index = Arc::new(
            BucketIndex::new(block_store.clone(), clock.clone()).with_index_cache(index_cache.clone()),
        );
        let (index, cancel, interval) = (
            bucket_index.clone(),
            cancel.clone(),
            config.bucket_index_refresh_interval,
        );
        tasks.push(tokio::spawn(async move {
            index.run_refresh_loop(interval, cancel).await;
        }));
        BlockSource::BucketIndex(bucket_index)
    } else {
        BlockSource::Listing(block_store.clone())
    };

    let transport: Arc<dyn Transport> = transport;
    let ingester_strategy = ComponentFactory::ingester_shard_strategy(&config);
    let replication = ReplicationCoordinator::new(config.ingester_replication(), transport.clone());
    let distributor = Arc::new(Distributor::new(
        ingester_ring.clone(),
        ingester_strategy.clone(),
        replication.clone(),
        overrides.clone(),
    ));

    let head_tier = HeadTier::new(ingester_ring, ingester_strategy, overrides.clone(), replication);
    let block_tier = BlockTier::new(
        store_gateway_ring,
        ComponentFactory::store_gateway_shard_strategy(&config),
        overrides.clone(),
        block_source,
        transport.clone(),
        config.store_gateway_replication_factor,
        config.read_timeout,
    );
    let engine = FederationEngine::new(config.source_selector(), clock)
        .with_head_tier(Arc::new(head_tier))
        .with_store_tier(Arc::new(block_tier));
    let querier = Arc::new(Querier::new(Arc::new(engine), overrides, config.querier_config()));

    let api_config = ApiServerConfig {
        http_port: args.http_port,
        ..ApiServerConfig::default()
    };
    let router = api::build_http_router(
        ApiState {
            distributor,
            querier,
        },
        &api_config,
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], api_config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!(http_port = api_config.http_port, "Strata ready");

    let shutdown = cancel.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .map_err(|e| Error::Internal(format!("HTTP server error: {e}")))?;

    info!("Strata shutting down");
    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
