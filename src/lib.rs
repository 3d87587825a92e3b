//! # Strata
//!
//! Membership ring, replication and query federation for a multi-tenant
//! time-series database.
//!
//! ## Architecture
//!
//! - **Ring**: consistent-hash ring per tier with shuffle-sharding per tenant
//! - **Distributor**: routes series to ingester replicas and waits for quorum
//! - **Ingester**: in-memory head for recent data, cut into blocks on object storage
//! - **Store-gateway**: serves blocks through a bucket index and an index cache
//! - **Querier**: fans a query out to both tiers and merges the answers
//! - **Ruler**: evaluates instant queries against a remote querier

pub mod api;
pub mod bucket_index;
pub mod clock;
pub mod config;
pub mod distributor;
pub mod ingester;
pub mod limits;
pub mod model;
pub mod querier;
pub mod replication;
pub mod ring;
pub mod ruler;
pub mod storage;
pub mod storegateway;
pub mod telemetry;
pub mod transport;

mod error;

pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::bucket_index::BucketIndex;
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{ComponentFactory, StrataConfig};
    pub use crate::distributor::Distributor;
    pub use crate::ingester::{Ingester, IngesterConfig};
    pub use crate::limits::{Limits, Overrides};
    pub use crate::model::{Labels, Matcher, Sample, Series, TimeRange};
    pub use crate::querier::{FederationEngine, Querier, QuerierConfig, QueryResponse, Value};
    pub use crate::replication::{ReplicationConfig, ReplicationCoordinator};
    pub use crate::ring::{HashRing, RingConfig, ShardStrategy, ShardingStrategy};
    pub use crate::storage::{BlockStore, ObjectStoreBlockStore};
    pub use crate::storegateway::{IndexCache, StoreGateway};
    pub use crate::transport::{LocalTransport, Request, RequestHandler, Response, Transport};
    pub use crate::{Error, Result};
}
