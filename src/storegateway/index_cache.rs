//! Index cache for postings and series lookups
//!
//! Entries are keyed by block ID and lookup key. All entries of a block are
//! invalidated when the block leaves the bucket index.

use super::telemetry;
use crate::storage::SeriesRef;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use moka::future::Cache;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use twox_hash::XxHash64;

/// Configured cache backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexCacheBackend {
    #[default]
    InMemory,
    Distributed,
}

impl IndexCacheBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InMemory => "in-memory",
            Self::Distributed => "distributed",
        }
    }
}

impl FromStr for IndexCacheBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in-memory" | "inmemory" => Ok(Self::InMemory),
            "distributed" => Ok(Self::Distributed),
            other => Err(Error::Config(format!(
                "unknown index cache backend {:?} (expected \"in-memory\" or \"distributed\")",
                other
            ))),
        }
    }
}

impl fmt::Display for IndexCacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lookup key within one block
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Postings for a matcher, keyed by its string form
    Postings(String),
    /// A series by reference
    Series(SeriesRef),
}

impl CacheKey {
    pub fn item_type(&self) -> &'static str {
        match self {
            CacheKey::Postings(_) => "postings",
            CacheKey::Series(_) => "series",
        }
    }

    fn encode(&self) -> String {
        match self {
            CacheKey::Postings(m) => format!("P:{}", m),
            CacheKey::Series(r) => format!("S:{}", r),
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexCacheStats {
    pub requests: u64,
    pub hits: u64,
    pub items_added: u64,
    pub invalidated_blocks: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    requests: AtomicU64,
    hits: AtomicU64,
    items_added: AtomicU64,
    invalidated_blocks: AtomicU64,
}

impl StatsCounters {
    fn lookup(&self, backend: IndexCacheBackend, key: &CacheKey, hit: bool) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        telemetry::record_cache_lookup(backend.as_str(), key.item_type(), hit);
    }

    fn added(&self, backend: IndexCacheBackend, key: &CacheKey) {
        self.items_added.fetch_add(1, Ordering::Relaxed);
        telemetry::record_cache_set(backend.as_str(), key.item_type());
    }

    fn invalidated(&self, backend: IndexCacheBackend) {
        self.invalidated_blocks.fetch_add(1, Ordering::Relaxed);
        telemetry::record_cache_invalidation(backend.as_str());
    }

    fn snapshot(&self) -> IndexCacheStats {
        IndexCacheStats {
            requests: self.requests.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            items_added: self.items_added.load(Ordering::Relaxed),
            invalidated_blocks: self.invalidated_blocks.load(Ordering::Relaxed),
        }
    }
}

/// Memoizes block index lookups
#[async_trait]
pub trait IndexCache: Send + Sync + fmt::Debug {
    async fn get(&self, block_id: &str, key: &CacheKey) -> Option<Bytes>;

    async fn set(&self, block_id: &str, key: &CacheKey, value: Bytes);

    /// Drop every entry of `block_id`
    async fn invalidate_block(&self, block_id: &str);

    fn stats(&self) -> IndexCacheStats;

    fn backend(&self) -> IndexCacheBackend;
}

/// Size-bounded in-process cache
pub struct InMemoryIndexCache {
    cache: Cache<(String, CacheKey), Bytes>,
    stats: StatsCounters,
}

impl fmt::Debug for InMemoryIndexCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryIndexCache")
            .field("entries", &self.cache.entry_count())
            .field("weighted_size", &self.cache.weighted_size())
            .finish()
    }
}

impl InMemoryIndexCache {
    /// Create a cache holding at most `max_bytes` of values
    pub fn new(max_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|key: &(String, CacheKey), value: &Bytes| {
                (key.0.len() + value.len()).try_into().unwrap_or(u32::MAX)
            })
            .support_invalidation_closures()
            .build();
        Self {
            cache,
            stats: StatsCounters::default(),
        }
    }
}

#[async_trait]
impl IndexCache for InMemoryIndexCache {
    async fn get(&self, block_id: &str, key: &CacheKey) -> Option<Bytes> {
        let value = self.cache.get(&(block_id.to_string(), key.clone())).await;
        self.stats.lookup(self.backend(), key, value.is_some());
        value
    }

    async fn set(&self, block_id: &str, key: &CacheKey, value: Bytes) {
        self.cache
            .insert((block_id.to_string(), key.clone()), value)
            .await;
        self.stats.added(self.backend(), key);
    }

    async fn invalidate_block(&self, block_id: &str) {
        let block_id = block_id.to_string();
        let predicate = move |key: &(String, CacheKey), _: &Bytes| key.0 == block_id;
        if let Err(e) = self.cache.invalidate_entries_if(predicate) {
            warn!("Failed to invalidate index cache entries: {}", e);
            return;
        }
        self.stats.invalidated(self.backend());
    }

    fn stats(&self) -> IndexCacheStats {
        self.stats.snapshot()
    }

    fn backend(&self) -> IndexCacheBackend {
        IndexCacheBackend::InMemory
    }
}

#[derive(Serialize, Deserialize)]
struct EntryHeader {
    key: String,
    expires_at_ms: i64,
}

/// Cache shared by several store-gateways through an object store.
///
/// Best effort: errors are logged and treated as misses. Entries expire after
/// the TTL; expired entries are read as misses and overwritten on the next set.
pub struct DistributedIndexCache {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    ttl: Duration,
    stats: StatsCounters,
}

impl fmt::Debug for DistributedIndexCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedIndexCache")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl DistributedIndexCache {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            ttl,
            stats: StatsCounters::default(),
        }
    }

    fn block_prefix(&self, block_id: &str) -> Path {
        Path::from_iter([self.prefix.as_str(), block_id])
    }

    fn entry_path(&self, block_id: &str, encoded: &str) -> Path {
        let name = format!("{:016x}", XxHash64::oneshot(0, encoded.as_bytes()));
        Path::from_iter([self.prefix.as_str(), block_id, name.as_str()])
    }

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    async fn read(&self, block_id: &str, key: &CacheKey) -> Result<Option<Bytes>> {
        let encoded = key.encode();
        let bytes = match self.store.get(&self.entry_path(block_id, &encoded)).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let split = bytes
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| Error::Serialization("index cache entry without header".to_string()))?;
        let header: EntryHeader = serde_json::from_slice(&bytes[..split])?;
        // Hashed names can collide; the header carries the full key.
        if header.key != encoded || header.expires_at_ms < Self::now_ms() {
            return Ok(None);
        }
        Ok(Some(bytes.slice(split + 1..)))
    }

    async fn write(&self, block_id: &str, key: &CacheKey, value: Bytes) -> Result<()> {
        let encoded = key.encode();
        let header = EntryHeader {
            key: encoded.clone(),
            expires_at_ms: Self::now_ms() + self.ttl.as_millis() as i64,
        };
        let mut payload = serde_json::to_vec(&header)?;
        payload.push(b'\n');
        payload.extend_from_slice(&value);
        self.store
            .put(&self.entry_path(block_id, &encoded), PutPayload::from(payload))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl IndexCache for DistributedIndexCache {
    async fn get(&self, block_id: &str, key: &CacheKey) -> Option<Bytes> {
        let value = match self.read(block_id, key).await {
            Ok(value) => value,
            Err(e) => {
                warn!("Distributed index cache read failed for block {}: {}", block_id, e);
                None
            }
        };
        self.stats.lookup(self.backend(), key, value.is_some());
        value
    }

    async fn set(&self, block_id: &str, key: &CacheKey, value: Bytes) {
        match self.write(block_id, key, value).await {
            Ok(()) => self.stats.added(self.backend(), key),
            Err(e) => warn!("Distributed index cache write failed for block {}: {}", block_id, e),
        }
    }

    async fn invalidate_block(&self, block_id: &str) {
        let prefix = self.block_prefix(block_id);
        let objects: Vec<_> = match self.store.list(Some(&prefix)).try_collect().await {
            Ok(objects) => objects,
            Err(e) => {
                warn!("Failed to list index cache entries of block {}: {}", block_id, e);
                return;
            }
        };
        for object in &objects {
            if let Err(e) = self.store.delete(&object.location).await {
                warn!("Failed to delete index cache entry {}: {}", object.location, e);
            }
        }
        debug!("Invalidated {} index cache entries of block {}", objects.len(), block_id);
        self.stats.invalidated(self.backend());
    }

    fn stats(&self) -> IndexCacheStats {
        self.stats.snapshot()
    }

    fn backend(&self) -> IndexCacheBackend {
        IndexCacheBackend::Distributed
    }
}
