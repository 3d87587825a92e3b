//! Recent-data tier
//!
//! An ingester keeps a per-tenant in-memory head of recently pushed series.
//! Series are bucketed by fingerprint, but identity is always the full label
//! set: colliding series live side by side in one bucket. Older samples are
//! periodically cut into blocks and shipped to block storage.

mod telemetry;

use crate::clock::Clock;
use crate::model::{Labels, Matcher, Sample, Series, SeriesFilter, TimeRange};
use crate::storage::{Block, BlockMeta, BlockStore};
use crate::storegateway::label_strings_of;
use crate::transport::{Request, RequestHandler, Response};
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Hash used to bucket series in the head.
pub type FingerprintFn = Arc<dyn Fn(&Labels) -> u64 + Send + Sync>;

/// Configuration for the ingester
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Blocks are cut on multiples of this range
    pub block_range: Duration,
    /// Samples younger than this stay in the head
    pub retain_period: Duration,
    /// How often the compaction loop runs
    pub compaction_interval: Duration,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            block_range: Duration::from_secs(2 * 3600),
            retain_period: Duration::from_secs(13 * 3600),
            compaction_interval: Duration::from_secs(60),
        }
    }
}

impl IngesterConfig {
    /// Cut boundary for the head at `now_ms`, aligned down to the block range.
    pub fn cut_boundary(&self, now_ms: i64) -> i64 {
        let range = (self.block_range.as_millis() as i64).max(1);
        let before = now_ms - self.retain_period.as_millis() as i64;
        before.div_euclid(range) * range
    }
}

struct MemSeries {
    labels: Labels,
    samples: BTreeMap<i64, f64>,
}

impl MemSeries {
    fn to_series(&self, range: TimeRange) -> Option<Series> {
        if range.start > range.end {
            return None;
        }
        let samples: Vec<Sample> = self
            .samples
            .range(range.start..=range.end)
            .map(|(t, v)| Sample::new(*t, *v))
            .collect();
        (!samples.is_empty()).then(|| Series::new(self.labels.clone(), samples))
    }
}

#[derive(Default)]
struct Head {
    buckets: HashMap<u64, Vec<MemSeries>>,
}

impl Head {
    /// Append samples; returns (appended, duplicates).
    fn append(&mut self, fingerprint: u64, series: Series) -> (u64, u64) {
        let bucket = self.buckets.entry(fingerprint).or_default();
        let index = match bucket.iter().position(|s| s.labels == series.labels) {
            Some(index) => index,
            None => {
                bucket.push(MemSeries {
                    labels: series.labels,
                    samples: BTreeMap::new(),
                });
                bucket.len() - 1
            }
        };
        let mem = &mut bucket[index];
        let (mut appended, mut duplicates) = (0, 0);
        for sample in series.samples {
            if mem.samples.contains_key(&sample.timestamp_ms) {
                duplicates += 1;
            } else {
                mem.samples.insert(sample.timestamp_ms, sample.value);
                appended += 1;
            }
        }
        (appended, duplicates)
    }

    fn select(&self, filter: &SeriesFilter, range: TimeRange) -> Vec<Series> {
        let mut out: Vec<Series> = self
            .buckets
            .values()
            .flatten()
            .filter(|s| filter.matches(&s.labels))
            .filter_map(|s| s.to_series(range))
            .collect();
        out.sort_by(|a, b| a.labels.cmp(&b.labels));
        out
    }

    /// Remove and return samples older than `before_ms`.
    fn cut(&mut self, before_ms: i64) -> Vec<Series> {
        let mut out = Vec::new();
        for bucket in self.buckets.values_mut() {
            for mem in bucket.iter_mut() {
                let kept = mem.samples.split_off(&before_ms);
                let old = std::mem::replace(&mut mem.samples, kept);
                if !old.is_empty() {
                    out.push(Series::new(
                        mem.labels.clone(),
                        old.into_iter().map(|(t, v)| Sample::new(t, v)).collect(),
                    ));
                }
            }
            bucket.retain(|s| !s.samples.is_empty());
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        out
    }

    fn delete(&mut self, filter: &SeriesFilter) -> usize {
        let mut deleted = 0;
        for bucket in self.buckets.values_mut() {
            let before = bucket.len();
            bucket.retain(|s| !filter.matches(&s.labels));
            deleted += before - bucket.len();
        }
        self.buckets.retain(|_, bucket| !bucket.is_empty());
        deleted
    }

    fn num_series(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

/// One recent-data tier instance
pub struct Ingester {
    id: String,
    config: IngesterConfig,
    fingerprint: FingerprintFn,
    heads: DashMap<String, RwLock<Head>>,
}

impl std::fmt::Debug for Ingester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingester")
            .field("id", &self.id)
            .field("tenants", &self.heads.len())
            .finish()
    }
}

impl Ingester {
    pub fn new(id: impl Into<String>, config: IngesterConfig) -> Self {
        Self {
            id: id.into(),
            config,
            fingerprint: Arc::new(|labels: &Labels| labels.fingerprint()),
            heads: DashMap::new(),
        }
    }

    /// Replace the head bucketing hash.
    pub fn with_fingerprint_fn(mut self, fingerprint: FingerprintFn) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &IngesterConfig {
        &self.config
    }

    /// Tenants with a head on this instance
    pub fn tenants(&self) -> Vec<String> {
        self.heads.iter().map(|e| e.key().clone()).collect()
    }

    /// In-memory series for `tenant`
    pub fn num_series(&self, tenant: &str) -> usize {
        self.heads
            .get(tenant)
            .map(|head| head.read().num_series())
            .unwrap_or(0)
    }

    /// Append series to the tenant's head; returns the number of new samples.
    ///
    /// A sample whose timestamp is already present is dropped.
    pub fn push(&self, tenant: &str, series: Vec<Series>) -> usize {
        let start = Instant::now();
        let head = self.heads.entry(tenant.to_string()).or_default();
        let mut head = head.write();
        let (mut appended, mut duplicates) = (0, 0);
        for s in series {
            let fingerprint = (self.fingerprint)(&s.labels);
            let (a, d) = head.append(fingerprint, s);
            appended += a;
            duplicates += d;
        }
        if duplicates > 0 {
            debug!(
                "Ingester {} dropped {} duplicate samples for tenant {}",
                self.id, duplicates, tenant
            );
        }
        telemetry::record_push(start.elapsed().as_secs_f64(), appended, duplicates);
        appended as usize
    }

    pub fn select(&self, tenant: &str, range: TimeRange, matchers: &[Matcher]) -> Result<Vec<Series>> {
        let filter = SeriesFilter::new(matchers)?;
        Ok(self
            .heads
            .get(tenant)
            .map(|head| head.read().select(&filter, range))
            .unwrap_or_default())
    }

    /// Label names of series with samples in `range`
    pub fn label_names(&self, tenant: &str, range: TimeRange, matchers: &[Matcher]) -> Result<Vec<String>> {
        Ok(label_strings_of(&self.select(tenant, range, matchers)?, None))
    }

    /// Values of `name` for series with samples in `range`
    pub fn label_values(
        &self,
        tenant: &str,
        name: &str,
        range: TimeRange,
        matchers: &[Matcher],
    ) -> Result<Vec<String>> {
        Ok(label_strings_of(
            &self.select(tenant, range, matchers)?,
            Some(name),
        ))
    }

    /// Drop every series matching `matchers`; returns how many were removed.
    pub fn delete_series(&self, tenant: &str, matchers: &[Matcher]) -> Result<usize> {
        let filter = SeriesFilter::new(matchers)?;
        let deleted = self
            .heads
            .get(tenant)
            .map(|head| head.write().delete(&filter))
            .unwrap_or(0);
        info!("Ingester {} deleted {} series of tenant {}", self.id, deleted, tenant);
        Ok(deleted)
    }

    /// Move samples older than `before_ms` into a block and upload it.
    ///
    /// On upload failure the samples are put back into the head.
    pub async fn cut_block(
        &self,
        tenant: &str,
        before_ms: i64,
        store: &dyn BlockStore,
    ) -> Result<Option<BlockMeta>> {
        let cut = match self.heads.get(tenant) {
            Some(head) => head.write().cut(before_ms),
            None => return Ok(None),
        };
        let Some(block) = Block::from_series(tenant, cut.clone()) else {
            return Ok(None);
        };

        match store.upload(&block).await {
            Ok(()) => {
                info!(
                    "Ingester {} shipped block {} for tenant {} ({} series, {}..{})",
                    self.id,
                    block.meta.id,
                    tenant,
                    block.meta.num_series,
                    block.meta.min_time,
                    block.meta.max_time
                );
                telemetry::record_block_upload_outcome("success");
                telemetry::record_block_cut(block.meta.num_series as u64);
                Ok(Some(block.meta))
            }
            Err(e) => {
                telemetry::record_block_upload_outcome("error");
                warn!(
                    "Ingester {} failed to upload block for tenant {}, restoring head: {}",
                    self.id, tenant, e
                );
                self.push(tenant, cut);
                Err(e)
            }
        }
    }

    /// Cut blocks for every tenant; returns the number of blocks shipped.
    pub async fn compact_all(&self, store: &dyn BlockStore, before_ms: i64) -> Result<usize> {
        let mut shipped = 0;
        for tenant in self.tenants() {
            if self.cut_block(&tenant, before_ms, store).await?.is_some() {
                shipped += 1;
            }
        }
        Ok(shipped)
    }

    /// Periodically cut blocks until cancelled.
    pub async fn run_compaction_loop(
        &self,
        store: Arc<dyn BlockStore>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(self.config.compaction_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let before_ms = self.config.cut_boundary(clock.now_millis());
                    match self.compact_all(store.as_ref(), before_ms).await {
                        Ok(0) => {}
                        Ok(n) => debug!("Ingester {} shipped {} blocks", self.id, n),
                        Err(e) => error!("Head compaction failed on ingester {}: {}", self.id, e),
                    }
                }
                _ = cancel.cancelled() => {
                    info!("Ingester {} compaction loop shutting down", self.id);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Ingester {
    async fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::Push { tenant, series } => {
                self.push(&tenant, series);
                Ok(Response::Ack)
            }
            Request::Select {
                tenant,
                range,
                matchers,
                ..
            } => Ok(Response::Series {
                series: self.select(&tenant, range, &matchers)?,
                queried_blocks: Vec::new(),
            }),
            Request::LabelNames {
                tenant,
                range,
                matchers,
                ..
            } => Ok(Response::Strings {
                values: self.label_names(&tenant, range, &matchers)?,
                queried_blocks: Vec::new(),
            }),
            Request::LabelValues {
                tenant,
                name,
                range,
                matchers,
                ..
            } => Ok(Response::Strings {
                values: self.label_values(&tenant, &name, range, &matchers)?,
                queried_blocks: Vec::new(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::METRIC_NAME;
    use crate::storage::ObjectStoreBlockStore;
    use object_store::memory::InMemory;

    fn series(name: &str, samples: &[(i64, f64)]) -> Series {
        Series::new(
            Labels::from_pairs(&[(METRIC_NAME, name)]),
            samples.iter().map(|(t, v)| Sample::new(*t, *v)).collect(),
        )
    }

    #[test]
    fn test_first_write_wins_for_duplicate_timestamp() {
        let ingester = Ingester::new("ingester-1", IngesterConfig::default());
        assert_eq!(ingester.push("t", vec![series("a", &[(10, 1.0), (20, 2.0)])]), 2);
        assert_eq!(ingester.push("t", vec![series("a", &[(10, 9.0), (30, 3.0)])]), 1);

        let out = ingester
            .select("t", TimeRange::all(), &[Matcher::equal(METRIC_NAME, "a")])
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].samples,
            vec![Sample::new(10, 1.0), Sample::new(20, 2.0), Sample::new(30, 3.0)]
        );
    }

    #[test]
    fn test_colliding_fingerprints_stay_distinct() {
        let ingester =
            Ingester::new("ingester-1", IngesterConfig::default()).with_fingerprint_fn(Arc::new(|_| 42));
        ingester.push("t", vec![series("a", &[(10, 1.0)]), series("b", &[(10, 2.0)])]);

        let out = ingester.select("t", TimeRange::all(), &[]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].samples[0].value, 1.0);
        assert_eq!(out[1].samples[0].value, 2.0);
    }

    #[test]
    fn test_select_and_labels_scoped_to_range() {
        let ingester = Ingester::new("ingester-1", IngesterConfig::default());
        ingester.push("t", vec![series("old", &[(10, 1.0)]), series("new", &[(100, 1.0)])]);

        let names = ingester
            .label_values("t", METRIC_NAME, TimeRange::new(50, 150), &[])
            .unwrap();
        assert_eq!(names, vec!["new"]);
        assert!(ingester.select("other", TimeRange::all(), &[]).unwrap().is_empty());
    }

    #[test]
    fn test_delete_series() {
        let ingester = Ingester::new("ingester-1", IngesterConfig::default());
        ingester.push("t", vec![series("a", &[(10, 1.0)]), series("b", &[(10, 1.0)])]);
        let deleted = ingester
            .delete_series("t", &[Matcher::equal(METRIC_NAME, "a")])
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(ingester.num_series("t"), 1);
    }

    #[tokio::test]
    async fn test_cut_block_moves_old_samples() {
        let store = ObjectStoreBlockStore::new(Arc::new(InMemory::new()));
        let ingester = Ingester::new("ingester-1", IngesterConfig::default());
        ingester.push("t", vec![series("a", &[(10, 1.0), (20, 2.0), (30, 3.0)])]);

        let meta = ingester.cut_block("t", 25, &store).await.unwrap().unwrap();
        assert_eq!((meta.min_time, meta.max_time), (10, 20));
        assert_eq!(meta.num_samples, 2);

        let head = ingester.select("t", TimeRange::all(), &[]).unwrap();
        assert_eq!(head[0].samples, vec![Sample::new(30, 3.0)]);

        let blocks = store.list_blocks("t", TimeRange::all()).await.unwrap();
        assert_eq!(blocks.len(), 1);
        assert!(ingester.cut_block("t", 25, &store).await.unwrap().is_none());
    }

    #[test]
    fn test_cut_boundary_is_aligned() {
        let config = IngesterConfig {
            block_range: Duration::from_millis(100),
            retain_period: Duration::from_millis(250),
            compaction_interval: Duration::from_secs(1),
        };
        assert_eq!(config.cut_boundary(1_000), 700);
        assert_eq!(config.cut_boundary(1_049), 700);
        assert_eq!(config.cut_boundary(1_050), 800);
    }
}
