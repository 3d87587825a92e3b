//! Block storage on the local filesystem backend

use object_store::local::LocalFileSystem;
use std::sync::Arc;
use strata::bucket_index::BucketIndex;
use strata::clock::ManualClock;
use strata::ingester::{Ingester, IngesterConfig};
use strata::model::{Labels, Matcher, Sample, Series, TimeRange};
use strata::storage::{BlockStore, ObjectStoreBlockStore};
use strata::storegateway::{InMemoryIndexCache, StoreGateway};
use strata::transport::{Request, RequestHandler, Response};
use tempfile::TempDir;

const NOW: i64 = 50 * 3_600_000;

fn local_store(dir: &TempDir) -> Arc<ObjectStoreBlockStore> {
    let fs = LocalFileSystem::new_with_prefix(dir.path()).unwrap();
    Arc::new(ObjectStoreBlockStore::new(Arc::new(fs)))
}

#[tokio::test]
async fn test_blocks_and_manifest_survive_restart() {
    let dir = TempDir::new().unwrap();
    let store = local_store(&dir);

    let ingester = Ingester::new("ingester-0", IngesterConfig::default());
    ingester.push(
        "t1",
        vec![Series::new(
            Labels::from_pairs(&[("__name__", "up"), ("job", "api")]),
            vec![Sample::new(NOW - 1_000, 1.0), Sample::new(NOW, 2.0)],
        )],
    );
    let meta = ingester
        .cut_block("t1", NOW + 1, store.as_ref())
        .await
        .unwrap()
        .expect("block should be cut");
    assert_eq!((meta.min_time, meta.max_time), (NOW - 1_000, NOW));

    let clock = Arc::new(ManualClock::new(NOW));
    let index = BucketIndex::new(store.clone(), clock.clone());
    index.refresh("t1").await.unwrap();

    // A fresh process over the same directory
    let reopened = local_store(&dir);
    assert_eq!(reopened.list_tenants().await.unwrap(), vec!["t1".to_string()]);
    let index = BucketIndex::new(reopened.clone(), clock);
    assert!(index.current("t1").is_none());
    let manifest = index.manifest_for("t1").await.unwrap();
    assert_eq!(manifest.blocks, vec![meta.clone()]);
    assert_eq!(manifest.updated_at_ms, NOW);

    let gateway = StoreGateway::new(
        "store-gateway-0",
        reopened.clone(),
        Arc::new(InMemoryIndexCache::new(1024 * 1024)),
    );
    let response = gateway
        .handle(Request::Select {
            tenant: "t1".to_string(),
            range: TimeRange::new(NOW - 500, NOW),
            matchers: vec![Matcher::equal("job", "api")],
            block_ids: Some(vec![meta.id.clone()]),
        })
        .await
        .unwrap();
    match response {
        Response::Series {
            series,
            queried_blocks,
        } => {
            assert_eq!(queried_blocks, vec![meta.id.clone()]);
            assert_eq!(series.len(), 1);
            assert_eq!(series[0].samples, vec![Sample::new(NOW, 2.0)]);
        }
        other => panic!("Expected series, got {:?}", other),
    }
    assert_eq!(reopened.index_reads(), 1);
}

#[tokio::test]
async fn test_deletion_marks_listed_until_block_removed() {
    let dir = TempDir::new().unwrap();
    let store = local_store(&dir);
    let ingester = Ingester::new("ingester-0", IngesterConfig::default());
    ingester.push(
        "t1",
        vec![Series::new(
            Labels::from_pairs(&[("__name__", "up")]),
            vec![Sample::new(NOW, 1.0)],
        )],
    );
    let meta = ingester
        .cut_block("t1", NOW + 1, store.as_ref())
        .await
        .unwrap()
        .expect("block should be cut");

    store.mark_for_deletion("t1", &meta.id, NOW).await.unwrap();
    let marks = store.list_deletion_marks("t1").await.unwrap();
    assert_eq!(marks.len(), 1);
    assert_eq!(marks[0].block_id, meta.id);
    assert_eq!(store.list_blocks("t1", TimeRange::all()).await.unwrap().len(), 1);

    store.delete_block("t1", &meta.id).await.unwrap();
    assert!(store.list_blocks("t1", TimeRange::all()).await.unwrap().is_empty());
    assert!(store.list_deletion_marks("t1").await.unwrap().is_empty());
    assert!(store.open_index("t1", &meta.id).await.is_err());
}
