//! Block storage
//!
//! Blocks are immutable, time-bounded sets of series for one tenant, written
//! once by an ingester and read by store-gateways. Object layout:
//!
//! ```text
//! <tenant>/<block>/index.json
//! <tenant>/<block>/meta.json                      written last
//! <tenant>/markers/<block>-deletion-mark.json
//! <tenant>/bucket-index.json
//! ```

pub mod index;

pub use index::{BlockIndex, SeriesRef};

use crate::bucket_index::BucketIndexManifest;
use crate::model::{Series, TimeRange};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const META_FILE: &str = "meta.json";
const INDEX_FILE: &str = "index.json";
const MARKERS_DIR: &str = "markers";
const BUCKET_INDEX_FILE: &str = "bucket-index.json";
const DELETION_MARK_SUFFIX: &str = "-deletion-mark.json";

/// Block metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Block ID (unique within the bucket)
    pub id: String,
    /// Owning tenant
    pub tenant: String,
    /// Earliest sample timestamp (ms, inclusive)
    pub min_time: i64,
    /// Latest sample timestamp (ms, inclusive)
    pub max_time: i64,
    pub num_series: usize,
    pub num_samples: usize,
}

impl BlockMeta {
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.min_time, self.max_time)
    }
}

/// A block ready to upload
#[derive(Debug, Clone)]
pub struct Block {
    pub meta: BlockMeta,
    pub index: BlockIndex,
}

impl Block {
    /// Build a block from series; returns `None` when there are no samples.
    pub fn from_series(tenant: &str, series: Vec<Series>) -> Option<Block> {
        let series: Vec<Series> = series.into_iter().filter(|s| !s.samples.is_empty()).collect();
        let min_time = series.iter().filter_map(|s| s.samples.first()).map(|s| s.timestamp_ms).min()?;
        let max_time = series.iter().filter_map(|s| s.samples.last()).map(|s| s.timestamp_ms).max()?;
        let index = BlockIndex::build(series);
        Some(Block {
            meta: BlockMeta {
                id: uuid::Uuid::new_v4().simple().to_string(),
                tenant: tenant.to_string(),
                min_time,
                max_time,
                num_series: index.num_series(),
                num_samples: index.num_samples(),
            },
            index,
        })
    }
}

/// Marks a block for deletion; the block stays readable until removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    pub block_id: String,
    pub deletion_time_ms: i64,
}

/// Access to a tenant's blocks
#[async_trait]
pub trait BlockStore: Send + Sync + std::fmt::Debug {
    async fn upload(&self, block: &Block) -> Result<()>;

    /// Blocks of `tenant` overlapping `range`, ordered by (min time, id)
    async fn list_blocks(&self, tenant: &str, range: TimeRange) -> Result<Vec<BlockMeta>>;

    /// Load a block's index for postings and series lookups
    async fn open_index(&self, tenant: &str, block_id: &str) -> Result<BlockIndex>;

    async fn delete_block(&self, tenant: &str, block_id: &str) -> Result<()>;

    async fn mark_for_deletion(&self, tenant: &str, block_id: &str, now_ms: i64) -> Result<()>;

    async fn list_deletion_marks(&self, tenant: &str) -> Result<Vec<DeletionMark>>;

    async fn list_tenants(&self) -> Result<Vec<String>>;

    async fn write_bucket_index(&self, manifest: &BucketIndexManifest) -> Result<()>;

    async fn read_bucket_index(&self, tenant: &str) -> Result<Option<BucketIndexManifest>>;

    /// Number of block indexes opened so far
    fn index_reads(&self) -> u64;
}

/// [`BlockStore`] over any [`ObjectStore`]
#[derive(Debug)]
pub struct ObjectStoreBlockStore {
    store: Arc<dyn ObjectStore>,
    index_reads: AtomicU64,
}

impl ObjectStoreBlockStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            index_reads: AtomicU64::new(0),
        }
    }

    fn block_path(tenant: &str, block_id: &str, file: &str) -> Path {
        Path::from_iter([tenant, block_id, file])
    }

    fn deletion_mark_path(tenant: &str, block_id: &str) -> Path {
        Path::from_iter([
            tenant,
            MARKERS_DIR,
            format!("{}{}", block_id, DELETION_MARK_SUFFIX).as_str(),
        ])
    }

    async fn put_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.put(path, PutPayload::from(bytes)).await?;
        Ok(())
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &Path) -> Result<Option<T>> {
        match self.store.get(path).await {
            Ok(result) => {
                let bytes = result.bytes().await?;
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| Error::Storage(format!("corrupt object {}: {}", path, e)))?;
                Ok(Some(value))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_if_exists(&self, path: &Path) -> Result<()> {
        match self.store.delete(path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Last segment of each common prefix under `prefix`
    async fn list_dirs(&self, prefix: Option<&Path>) -> Result<Vec<String>> {
        let listing = self.store.list_with_delimiter(prefix).await?;
        Ok(listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.parts().last().map(|part| part.as_ref().to_string()))
            .collect())
    }
}

#[async_trait]
impl BlockStore for ObjectStoreBlockStore {
    async fn upload(&self, block: &Block) -> Result<()> {
        let meta = &block.meta;
        self.put_json(&Self::block_path(&meta.tenant, &meta.id, INDEX_FILE), &block.index)
            .await?;
        self.put_json(&Self::block_path(&meta.tenant, &meta.id, META_FILE), meta)
            .await?;
        info!(
            "Uploaded block {} for tenant {} ({} series, {} samples, {}..{})",
            meta.id, meta.tenant, meta.num_series, meta.num_samples, meta.min_time, meta.max_time
        );
        Ok(())
    }

    async fn list_blocks(&self, tenant: &str, range: TimeRange) -> Result<Vec<BlockMeta>> {
        let mut blocks = Vec::new();
        for dir in self.list_dirs(Some(&Path::from(tenant))).await? {
            if dir == MARKERS_DIR {
                continue;
            }
            // Blocks without meta.json are still uploading.
            if let Some(meta) = self
                .get_json::<BlockMeta>(&Self::block_path(tenant, &dir, META_FILE))
                .await?
            {
                if meta.range().overlaps(&range) {
                    blocks.push(meta);
                }
            }
        }
        blocks.sort_by(|a, b| (a.min_time, &a.id).cmp(&(b.min_time, &b.id)));
        debug!("Listed {} blocks for tenant {}", blocks.len(), tenant);
        Ok(blocks)
    }

    async fn open_index(&self, tenant: &str, block_id: &str) -> Result<BlockIndex> {
        self.index_reads.fetch_add(1, Ordering::Relaxed);
        self.get_json(&Self::block_path(tenant, block_id, INDEX_FILE))
            .await?
            .ok_or_else(|| {
                Error::Storage(format!("block {} of tenant {} not found", block_id, tenant))
            })
    }

    async fn delete_block(&self, tenant: &str, block_id: &str) -> Result<()> {
        // meta.json first so a half-deleted block is no longer listed.
        self.delete_if_exists(&Self::block_path(tenant, block_id, META_FILE))
            .await?;
        self.delete_if_exists(&Self::block_path(tenant, block_id, INDEX_FILE))
            .await?;
        self.delete_if_exists(&Self::deletion_mark_path(tenant, block_id))
            .await?;
        info!("Deleted block {} of tenant {}", block_id, tenant);
        Ok(())
    }

    async fn mark_for_deletion(&self, tenant: &str, block_id: &str, now_ms: i64) -> Result<()> {
        let mark = DeletionMark {
            block_id: block_id.to_string(),
            deletion_time_ms: now_ms,
        };
        self.put_json(&Self::deletion_mark_path(tenant, block_id), &mark)
            .await
    }

    async fn list_deletion_marks(&self, tenant: &str) -> Result<Vec<DeletionMark>> {
        let prefix = Path::from_iter([tenant, MARKERS_DIR]);
        let objects: Vec<_> = self.store.list(Some(&prefix)).try_collect().await?;
        let mut marks = Vec::with_capacity(objects.len());
        for object in objects {
            let is_mark = object
                .location
                .filename()
                .is_some_and(|f| f.ends_with(DELETION_MARK_SUFFIX));
            if !is_mark {
                continue;
            }
            if let Some(mark) = self.get_json::<DeletionMark>(&object.location).await? {
                marks.push(mark);
            }
        }
        marks.sort_by(|a, b| a.block_id.cmp(&b.block_id));
        Ok(marks)
    }

    async fn list_tenants(&self) -> Result<Vec<String>> {
        self.list_dirs(None).await
    }

    async fn write_bucket_index(&self, manifest: &BucketIndexManifest) -> Result<()> {
        self.put_json(&Path::from_iter([manifest.tenant.as_str(), BUCKET_INDEX_FILE]), manifest)
            .await
    }

    async fn read_bucket_index(&self, tenant: &str) -> Result<Option<BucketIndexManifest>> {
        self.get_json(&Path::from_iter([tenant, BUCKET_INDEX_FILE]))
            .await
    }

    fn index_reads(&self) -> u64 {
        self.index_reads.load(Ordering::Relaxed)
    }
}
