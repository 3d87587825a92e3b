//! Quorum writes and full fan-out reads over a replica set
//!
//! Writes go to every replica of each key and succeed once a quorum of
//! `rf / 2 + 1` acknowledges; stragglers are logged but not awaited. Reads go
//! to every instance of a tenant's shard, because replicas can hold slightly
//! different data; correctness comes from merging, not voting.

use crate::ring::{InstanceDesc, InstanceState, ReplicaSet, RingSnapshot};
use crate::transport::{Request, Response, Transport};
use crate::{Error, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Number of acknowledgements required for a write with replication factor `rf`
pub fn quorum(replication_factor: usize) -> usize {
    replication_factor / 2 + 1
}

/// Replication settings for one tier
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Copies of each series
    pub replication_factor: usize,
    /// Per-replica timeout for writes
    pub write_timeout: Duration,
    /// Per-instance timeout for reads
    pub read_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            write_timeout: Duration::from_secs(2),
            read_timeout: Duration::from_secs(30),
        }
    }
}

impl ReplicationConfig {
    pub fn quorum(&self) -> usize {
        quorum(self.replication_factor)
    }

    /// Failed replicas a write tolerates
    pub fn write_max_errors(&self) -> usize {
        self.replication_factor - self.quorum()
    }

    /// Failed instances a full fan-out read tolerates
    pub fn read_max_errors(&self) -> usize {
        self.replication_factor / 2
    }
}

/// Responses gathered by [`ReplicationCoordinator::read_all`]
#[derive(Debug, Default)]
pub struct ReadOutcome {
    /// (instance ID, response) for every instance that answered
    pub responses: Vec<(String, Response)>,
    /// Instances that failed or timed out
    pub failed: Vec<String>,
    /// True when some instances failed but the read stayed within tolerance
    pub degraded: bool,
}

struct InstanceResult {
    instance: String,
    items: Vec<usize>,
    result: Result<Response>,
}

/// Drives replicated writes and reads through a [`Transport`]
#[derive(Debug, Clone)]
pub struct ReplicationCoordinator {
    config: ReplicationConfig,
    transport: Arc<dyn Transport>,
}

impl ReplicationCoordinator {
    pub fn new(config: ReplicationConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Write one request to the replicas of `key`.
    pub async fn write(&self, ring: &RingSnapshot, key: u32, request: Request) -> Result<()> {
        self.write_batch(ring, vec![(key, ())], |_| request.clone())
            .await
    }

    /// Write a batch of keyed items.
    ///
    /// Items are grouped per replica so each instance receives one request
    /// built by `build`. Returns once every item reached quorum, or as soon
    /// as one item can no longer reach it.
    pub async fn write_batch<T, F>(
        &self,
        ring: &RingSnapshot,
        items: Vec<(u32, T)>,
        build: F,
    ) -> Result<()>
    where
        T: Clone + Send + 'static,
        F: Fn(Vec<T>) -> Request,
    {
        if items.is_empty() {
            return Ok(());
        }
        let rf = self.config.replication_factor;
        let required = self.config.quorum();

        let mut replicas_per_item = Vec::with_capacity(items.len());
        let mut per_instance: BTreeMap<String, (InstanceDesc, Vec<usize>)> = BTreeMap::new();
        for (index, (key, _)) in items.iter().enumerate() {
            let replicas = ring.get(*key, rf)?;
            if replicas.len() < required {
                return Err(Error::QuorumFailure {
                    succeeded: 0,
                    required,
                    last_error: format!(
                        "only {} healthy replicas available for replication factor {}",
                        replicas.len(),
                        rf
                    ),
                });
            }
            replicas_per_item.push(replicas.len());
            for desc in replicas.instances {
                per_instance
                    .entry(desc.id.clone())
                    .or_insert_with(|| (desc, Vec::new()))
                    .1
                    .push(index);
            }
        }

        let (tx, mut rx) = mpsc::channel::<InstanceResult>(per_instance.len());
        for (id, (desc, indices)) in per_instance {
            let payload: Vec<T> = indices.iter().map(|i| items[*i].1.clone()).collect();
            let request = build(payload);
            let transport = self.transport.clone();
            let timeout = self.config.write_timeout;
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = transport.send(&desc.addr, request, timeout).await;
                let _ = tx
                    .send(InstanceResult {
                        instance: id,
                        items: indices,
                        result,
                    })
                    .await;
            });
        }
        drop(tx);

        let mut successes = vec![0usize; items.len()];
        let mut failures = vec![0usize; items.len()];
        let mut pending = items.len();
        let mut last_error = String::new();

        while let Some(outcome) = rx.recv().await {
            match outcome.result {
                Ok(_) => {
                    for i in outcome.items {
                        successes[i] += 1;
                        if successes[i] == required {
                            pending -= 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("Write to instance {} failed: {}", outcome.instance, e);
                    last_error = e.to_string();
                    for i in outcome.items {
                        failures[i] += 1;
                        if successes[i] < required && failures[i] > replicas_per_item[i] - required
                        {
                            return Err(Error::QuorumFailure {
                                succeeded: successes[i],
                                required,
                                last_error,
                            });
                        }
                    }
                }
            }

            if pending == 0 {
                tokio::spawn(async move {
                    while let Some(straggler) = rx.recv().await {
                        match straggler.result {
                            Ok(_) => debug!("Late write ack from {}", straggler.instance),
                            Err(e) => warn!(
                                "Write to instance {} failed after quorum: {}",
                                straggler.instance, e
                            ),
                        }
                    }
                });
                return Ok(());
            }
        }

        Err(Error::QuorumFailure {
            succeeded: successes.into_iter().min().unwrap_or(0),
            required,
            last_error,
        })
    }

    /// Replica set for a full fan-out read over a tenant's shard.
    ///
    /// Instances that are registered but not healthy count against the
    /// tolerated errors, since they may hold data the read cannot reach.
    pub fn read_replica_set(&self, shard: &RingSnapshot) -> Result<ReplicaSet> {
        let healthy = shard.healthy_instances();
        let unreachable = shard
            .instances()
            .filter(|d| d.state != InstanceState::Joining && !shard.is_healthy(&d.id))
            .count();
        let max_errors = self.config.read_max_errors();
        if healthy.is_empty() || unreachable > max_errors {
            return Err(Error::ReadFailure(format!(
                "{} healthy instances, {} unhealthy (at most {} tolerated)",
                healthy.len(),
                unreachable,
                max_errors
            )));
        }
        Ok(healthy.with_max_errors(max_errors - unreachable))
    }

    /// Send `request` to every instance in `replicas` and wait for all of
    /// them (each bounded by the read timeout).
    ///
    /// Up to `replicas.max_errors` failures yield a degraded outcome; more
    /// fail the read and cancel outstanding requests.
    pub async fn read_all(
        &self,
        replicas: &ReplicaSet,
        request: Request,
        cancel: &CancellationToken,
    ) -> Result<ReadOutcome> {
        let child = cancel.child_token();
        let mut tasks = FuturesUnordered::new();
        for desc in &replicas.instances {
            let transport = self.transport.clone();
            let request = request.clone();
            let timeout = self.config.read_timeout;
            let child = child.clone();
            let id = desc.id.clone();
            let addr = desc.addr.clone();
            tasks.push(tokio::spawn(async move {
                let result = tokio::select! {
                    _ = child.cancelled() => Err(Error::Cancelled),
                    result = transport.send(&addr, request, timeout) => result,
                };
                (id, result)
            }));
        }

        let mut outcome = ReadOutcome::default();
        while let Some(joined) = tasks.next().await {
            let (id, result) = joined.map_err(|e| Error::Internal(format!("read task failed: {}", e)))?;
            match result {
                Ok(response) => outcome.responses.push((id, response)),
                Err(Error::Cancelled) if cancel.is_cancelled() => {
                    child.cancel();
                    return Err(Error::Cancelled);
                }
                Err(e) => {
                    warn!("Read from instance {} failed: {}", id, e);
                    outcome.failed.push(id);
                    if outcome.failed.len() > replicas.max_errors {
                        child.cancel();
                        return Err(Error::ReadFailure(format!(
                            "{} of {} instances failed (at most {} tolerated), last error: {}",
                            outcome.failed.len(),
                            replicas.len(),
                            replicas.max_errors,
                            e
                        )));
                    }
                }
            }
        }

        outcome.degraded = !outcome.failed.is_empty();
        if outcome.degraded {
            warn!(
                "Degraded read: {} of {} instances failed",
                outcome.failed.len(),
                replicas.len()
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_math() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(2), 2);
        assert_eq!(quorum(3), 2);
        assert_eq!(quorum(5), 3);

        let config = ReplicationConfig::default();
        assert_eq!(config.write_max_errors(), 1);
        assert_eq!(config.read_max_errors(), 1);
    }
}
