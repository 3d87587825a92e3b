//! Historical tier: serves queries from blocks in object storage
//!
//! Postings and series lookups go through the [`IndexCache`]; a block's
//! index is only opened when a lookup misses.

pub mod index_cache;
pub mod telemetry;

pub use index_cache::{
    CacheKey, DistributedIndexCache, IndexCache, IndexCacheBackend, IndexCacheStats,
    InMemoryIndexCache,
};

use crate::model::{Matcher, Series, SeriesFilter, TimeRange};
use crate::storage::{BlockIndex, BlockStore, SeriesRef};
use crate::transport::{Request, RequestHandler, Response};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// A block index opened on first use
struct LazyIndex<'a> {
    tenant: &'a str,
    block_id: &'a str,
    index: Option<BlockIndex>,
}

impl<'a> LazyIndex<'a> {
    fn new(tenant: &'a str, block_id: &'a str) -> Self {
        Self {
            tenant,
            block_id,
            index: None,
        }
    }

    async fn open(&mut self, store: &dyn BlockStore) -> Result<&BlockIndex> {
        if self.index.is_none() {
            debug!("Opening index of block {}", self.block_id);
            self.index = Some(store.open_index(self.tenant, self.block_id).await?);
        }
        self.index
            .as_ref()
            .ok_or_else(|| Error::Internal(format!("index of block {} not loaded", self.block_id)))
    }
}

/// One store-gateway instance
pub struct StoreGateway {
    id: String,
    store: Arc<dyn BlockStore>,
    cache: Arc<dyn IndexCache>,
}

impl std::fmt::Debug for StoreGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreGateway").field("id", &self.id).finish()
    }
}

impl StoreGateway {
    pub fn new(id: impl Into<String>, store: Arc<dyn BlockStore>, cache: Arc<dyn IndexCache>) -> Self {
        Self {
            id: id.into(),
            store,
            cache,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn index_cache(&self) -> &Arc<dyn IndexCache> {
        &self.cache
    }

    async fn cached<T, F>(
        &self,
        block: &mut LazyIndex<'_>,
        key: CacheKey,
        compute: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&BlockIndex) -> T,
    {
        if let Some(bytes) = self.cache.get(block.block_id, &key).await {
            match serde_json::from_slice(&bytes) {
                Ok(value) => return Ok(value),
                Err(e) => warn!("Discarding corrupt index cache entry for block {}: {}", block.block_id, e),
            }
        }
        let value = compute(block.open(self.store.as_ref()).await?);
        self.cache
            .set(block.block_id, &key, Bytes::from(serde_json::to_vec(&value)?))
            .await;
        Ok(value)
    }

    async fn postings(&self, block: &mut LazyIndex<'_>, matcher: &Matcher) -> Result<Vec<SeriesRef>> {
        self.cached(block, CacheKey::Postings(matcher.to_string()), |index| {
            index.postings(matcher)
        })
        .await
    }

    async fn series_ref(&self, block: &mut LazyIndex<'_>, r: SeriesRef) -> Result<Option<Series>> {
        self.cached(block, CacheKey::Series(r), |index| index.series(r).cloned())
            .await
    }

    /// Series of one block matching `filter`, clipped to `range`
    async fn select_block(
        &self,
        tenant: &str,
        block_id: &str,
        filter: &SeriesFilter,
        range: TimeRange,
    ) -> Result<Vec<Series>> {
        let mut block = LazyIndex::new(tenant, block_id);
        let mut refs: Option<Vec<SeriesRef>> = None;
        for matcher in &filter.matchers {
            let postings = self.postings(&mut block, matcher).await?;
            refs = Some(match refs {
                None => postings,
                Some(prev) => crate::storage::index::intersect(&prev, &postings),
            });
        }
        let refs = match refs {
            Some(refs) => refs,
            None => {
                let index = block.open(self.store.as_ref()).await?;
                index.select(&[])
            }
        };

        let mut out = Vec::new();
        for r in refs {
            let Some(mut series) = self.series_ref(&mut block, r).await? else {
                continue;
            };
            if !filter.shard.map_or(true, |s| s.contains(&series.labels)) {
                continue;
            }
            series.samples.retain(|s| range.contains(s.timestamp_ms));
            if !series.samples.is_empty() {
                out.push(series);
            }
        }
        Ok(out)
    }

    async fn block_ids(
        &self,
        tenant: &str,
        range: TimeRange,
        block_ids: Option<Vec<String>>,
    ) -> Result<Vec<String>> {
        match block_ids {
            Some(ids) => Ok(ids),
            None => Ok(self
                .store
                .list_blocks(tenant, range)
                .await?
                .into_iter()
                .map(|b| b.id)
                .collect()),
        }
    }

    async fn select(
        &self,
        tenant: &str,
        range: TimeRange,
        matchers: &[Matcher],
        block_ids: Option<Vec<String>>,
    ) -> Result<Response> {
        let filter = SeriesFilter::new(matchers)?;
        let mut series = Vec::new();
        let mut queried_blocks = Vec::new();
        for block_id in self.block_ids(tenant, range, block_ids).await? {
            match self.select_block(tenant, &block_id, &filter, range).await {
                Ok(found) => {
                    series.extend(found);
                    queried_blocks.push(block_id);
                }
                // Left out of queried_blocks so the querier retries elsewhere.
                Err(e) => warn!("Store-gateway {} failed to read block {}: {}", self.id, block_id, e),
            }
        }
        telemetry::record_blocks_queried("select", queried_blocks.len() as u64);
        Ok(Response::Series {
            series,
            queried_blocks,
        })
    }

    async fn label_strings(
        &self,
        tenant: &str,
        range: TimeRange,
        matchers: &[Matcher],
        block_ids: Option<Vec<String>>,
        name: Option<&str>,
    ) -> Result<Response> {
        let filter = SeriesFilter::new(matchers)?;
        let mut values = BTreeSet::new();
        let mut queried_blocks = Vec::new();
        for block_id in self.block_ids(tenant, range, block_ids).await? {
            let result = if filter.matchers.is_empty() && filter.shard.is_none() {
                let mut block = LazyIndex::new(tenant, &block_id);
                block.open(self.store.as_ref()).await.map(|index| match name {
                    Some(name) => index.label_values(name),
                    None => index.label_names(),
                })
            } else {
                self.select_block(tenant, &block_id, &filter, range)
                    .await
                    .map(|series| label_strings_of(&series, name))
            };
            match result {
                Ok(found) => {
                    values.extend(found);
                    queried_blocks.push(block_id);
                }
                Err(e) => warn!("Store-gateway {} failed to read block {}: {}", self.id, block_id, e),
            }
        }
        telemetry::record_blocks_queried(
            if name.is_some() { "label_values" } else { "label_names" },
            queried_blocks.len() as u64,
        );
        Ok(Response::Strings {
            values: values.into_iter().collect(),
            queried_blocks,
        })
    }
}

/// Label names of `series`, or the values of `name` when given
pub(crate) fn label_strings_of(series: &[Series], name: Option<&str>) -> Vec<String> {
    let mut out = BTreeSet::new();
    for s in series {
        match name {
            Some(name) => {
                if let Some(value) = s.labels.get(name) {
                    out.insert(value.to_string());
                }
            }
            None => out.extend(s.labels.iter().map(|l| l.name.clone())),
        }
    }
    out.into_iter().collect()
}

#[async_trait]
impl RequestHandler for StoreGateway {
    async fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::Push { .. } => Err(Error::Internal(format!(
                "store-gateway {} does not accept writes",
                self.id
            ))),
            Request::Select {
                tenant,
                range,
                matchers,
                block_ids,
            } => self.select(&tenant, range, &matchers, block_ids).await,
            Request::LabelNames {
                tenant,
                range,
                matchers,
                block_ids,
            } => {
                self.label_strings(&tenant, range, &matchers, block_ids, None)
                    .await
            }
            Request::LabelValues {
                tenant,
                name,
                range,
                matchers,
                block_ids,
            } => {
                self.label_strings(&tenant, range, &matchers, block_ids, Some(&name))
                    .await
            }
        }
    }
}
