//! Write path
//!
//! The distributor validates a tenant's series batch, narrows the ingester
//! ring to the tenant's shard and hands the batch to the replication
//! coordinator, keyed by each series' ring token.

use crate::limits::Overrides;
use crate::model::Series;
use crate::replication::ReplicationCoordinator;
use crate::ring::{HashRing, ShardStrategy};
use crate::transport::Request;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Routes writes to ingesters
#[derive(Debug)]
pub struct Distributor {
    ring: Arc<HashRing>,
    strategy: Arc<dyn ShardStrategy>,
    replication: ReplicationCoordinator,
    overrides: Arc<Overrides>,
}

impl Distributor {
    pub fn new(
        ring: Arc<HashRing>,
        strategy: Arc<dyn ShardStrategy>,
        replication: ReplicationCoordinator,
        overrides: Arc<Overrides>,
    ) -> Self {
        Self {
            ring,
            strategy,
            replication,
            overrides,
        }
    }

    pub fn ring(&self) -> &Arc<HashRing> {
        &self.ring
    }

    /// Write a batch for `tenant`; returns the number of samples sent.
    ///
    /// Succeeds once every series reached a quorum of its replicas.
    pub async fn write(&self, tenant: &str, batch: Vec<Series>) -> Result<usize> {
        let batch = validate(tenant, batch)?;
        if batch.is_empty() {
            return Ok(0);
        }
        let samples: usize = batch.iter().map(|s| s.samples.len()).sum();

        let ring = self.ring.snapshot();
        let shard_size = self.overrides.ingestion_tenant_shard_size(tenant);
        let shard = self.strategy.shard_for(tenant, shard_size, &ring)?;
        debug!(
            "Writing {} series for tenant {} to a shard of {} ingesters (ring version {})",
            batch.len(),
            tenant,
            shard.healthy_count(),
            shard.version()
        );

        let items: Vec<(u32, Series)> = batch
            .into_iter()
            .map(|s| (s.labels.shard_token(tenant), s))
            .collect();
        let tenant = tenant.to_string();
        self.replication
            .write_batch(&shard, items, |series| Request::Push {
                tenant: tenant.clone(),
                series,
            })
            .await?;
        Ok(samples)
    }
}

/// Reject malformed input and drop series without samples.
fn validate(tenant: &str, batch: Vec<Series>) -> Result<Vec<Series>> {
    if tenant.is_empty() {
        return Err(Error::Query("no tenant ID supplied".to_string()));
    }
    let mut out = Vec::with_capacity(batch.len());
    for mut series in batch {
        if series.labels.metric_name().is_none() {
            return Err(Error::Query(format!(
                "series {} has no metric name",
                series.labels
            )));
        }
        if series.samples.is_empty() {
            continue;
        }
        series.samples.sort_by_key(|s| s.timestamp_ms);
        out.push(series);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ingester::{Ingester, IngesterConfig};
    use crate::model::{Labels, Sample, METRIC_NAME};
    use crate::replication::ReplicationConfig;
    use crate::ring::{DefaultShardStrategy, InstanceDesc, InstanceState, RingConfig};
    use crate::transport::LocalTransport;

    fn cluster(n: usize) -> (Distributor, Vec<Arc<Ingester>>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let ring = Arc::new(HashRing::new("ingester", RingConfig::default(), clock));
        let transport = Arc::new(LocalTransport::new());
        let mut ingesters = Vec::new();
        for i in 0..n {
            let id = format!("ingester-{}", i);
            let ingester = Arc::new(Ingester::new(id.clone(), IngesterConfig::default()));
            transport.register(id.clone(), ingester.clone());
            ring.register(InstanceDesc::new(id.clone(), id).with_state(InstanceState::Active), 64)
                .unwrap();
            ingesters.push(ingester);
        }
        let distributor = Distributor::new(
            ring,
            Arc::new(DefaultShardStrategy::new(3)),
            ReplicationCoordinator::new(ReplicationConfig::default(), transport),
            Arc::new(Overrides::default()),
        );
        (distributor, ingesters)
    }

    fn series(name: &str) -> Series {
        Series::new(
            Labels::from_pairs(&[(METRIC_NAME, name)]),
            vec![Sample::new(20, 2.0), Sample::new(10, 1.0)],
        )
    }

    #[tokio::test]
    async fn test_write_reaches_every_replica() {
        let (distributor, ingesters) = cluster(3);
        let written = distributor.write("tenant-1", vec![series("a"), series("b")]).await.unwrap();
        assert_eq!(written, 4);

        // Stragglers may still be in flight after quorum.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        for ingester in &ingesters {
            assert_eq!(ingester.num_series("tenant-1"), 2);
        }
    }

    #[tokio::test]
    async fn test_rejects_series_without_name() {
        let (distributor, _) = cluster(3);
        let unnamed = Series::new(Labels::from_pairs(&[("job", "x")]), vec![Sample::new(1, 1.0)]);
        let err = distributor.write("tenant-1", vec![unnamed]).await.unwrap_err();
        assert!(matches!(err, Error::Query(_)));
        assert!(distributor.write("", vec![series("a")]).await.is_err());
    }

    #[test]
    fn test_validate_sorts_and_drops_empty() {
        let empty = Series::new(Labels::from_pairs(&[(METRIC_NAME, "e")]), vec![]);
        let out = validate("t", vec![series("a"), empty]).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].samples[0].timestamp_ms, 10);
    }
}
