//! Integration tests for the federated read path

mod common;

use common::{series, ClusterOptions, TestCluster, HOUR, NOW, TENANT};
use strata::limits::Limits;
use strata::model::{Matcher, TimeRange};
use strata::querier::{SeriesLimiter, Value};
use strata::storage::BlockStore;
use strata::Error;
use tokio_util::sync::CancellationToken;

fn vector(value: Value) -> Vec<(String, f64)> {
    match value {
        Value::Vector(samples) => samples
            .into_iter()
            .map(|s| (s.labels.get("instance").unwrap_or_default().to_string(), s.value))
            .collect(),
        other => panic!("Expected a vector, got {:?}", other),
    }
}

#[tokio::test]
async fn test_colliding_fingerprints_round_trip() {
    let cluster = TestCluster::start(ClusterOptions {
        collide_fingerprints: true,
        ..ClusterOptions::default()
    });
    cluster
        .distributor
        .write(
            TENANT,
            vec![
                series(&[("__name__", "up"), ("instance", "a")], &[(NOW, 1.0)]),
                series(&[("__name__", "up"), ("instance", "b")], &[(NOW, 2.0)]),
            ],
        )
        .await
        .unwrap();

    let response = cluster.querier.instant_query(TENANT, "up", NOW).await.unwrap();
    let mut got = vector(response.data);
    got.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        got,
        vec![("a".to_string(), 1.0), ("b".to_string(), 2.0)],
        "Both series should survive a fingerprint collision"
    );
}

#[tokio::test]
async fn test_head_and_block_overlap_returns_each_sample_once() {
    let cluster = TestCluster::start(ClusterOptions::default());
    let samples: Vec<(i64, f64)> = (0..7).map(|i| (NOW - 3 * HOUR + i * HOUR / 2, i as f64)).collect();
    cluster
        .distributor
        .write(TENANT, vec![series(&[("__name__", "up"), ("job", "api")], &samples)])
        .await
        .unwrap();

    // Only one replica ships its old samples; the others still hold them in the head
    cluster.ingesters[0]
        .cut_block(TENANT, NOW - HOUR, cluster.block_store.as_ref())
        .await
        .unwrap()
        .expect("block should be cut");
    cluster.bucket_index.refresh(TENANT).await.unwrap();

    let response = cluster
        .querier
        .engine()
        .select(
            TENANT,
            TimeRange::new(NOW - 4 * HOUR, NOW),
            &[Matcher::equal("__name__", "up")],
            &SeriesLimiter::new(0),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(response.data.len(), 1);
    let got: Vec<(i64, f64)> = response.data[0]
        .samples
        .iter()
        .map(|s| (s.timestamp_ms, s.value))
        .collect();
    assert_eq!(got, samples, "Overlapping tiers should be deduplicated");
}

async fn query_survives_move_to_blocks(query_sharding: bool) {
    let cluster = TestCluster::start(ClusterOptions {
        query_sharding,
        ..ClusterOptions::default()
    });
    let at = NOW - HOUR;
    cluster
        .distributor
        .write(
            TENANT,
            vec![
                series(&[("__name__", "series_1"), ("instance", "a")], &[(at, 42.0)]),
                series(&[("__name__", "series_1"), ("instance", "b")], &[(at, 7.0)]),
                series(&[("__name__", "series_2"), ("instance", "a")], &[(at, 1.0)]),
            ],
        )
        .await
        .unwrap();

    let from_head = cluster.querier.instant_query(TENANT, "series_1", at).await.unwrap();
    assert!(!from_head.degraded);
    let mut expected = vector(from_head.data);
    expected.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(expected, vec![("a".to_string(), 42.0), ("b".to_string(), 7.0)]);

    cluster.flush_heads(TENANT, at + 1).await;
    for ingester in &cluster.ingesters {
        ingester
            .delete_series(TENANT, &[Matcher::equal("__name__", "series_1")])
            .unwrap();
        assert!(ingester
            .select(TENANT, TimeRange::all(), &[Matcher::equal("__name__", "series_1")])
            .unwrap()
            .is_empty());
    }

    let from_blocks = cluster.querier.instant_query(TENANT, "series_1", at).await.unwrap();
    let mut got = vector(from_blocks.data);
    got.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(got, expected, "Answer should not change once data moved to blocks");

    let total = cluster.querier.instant_query(TENANT, "sum(series_1)", at).await.unwrap();
    assert_eq!(vector(total.data)[0].1, 49.0);
}

#[tokio::test]
async fn test_query_survives_move_to_blocks() {
    query_survives_move_to_blocks(false).await;
}

#[tokio::test]
async fn test_sharded_query_survives_move_to_blocks() {
    query_survives_move_to_blocks(true).await;
}

#[tokio::test]
async fn test_series_limit_across_tiers() {
    let cluster = TestCluster::start(ClusterOptions::default());
    cluster.overrides.set_tenant_limits(
        TENANT,
        Limits {
            max_fetched_series_per_query: 3,
            ..Limits::default()
        },
    );
    let at = NOW - HOUR;
    let batch = ["a", "b", "c", "d"]
        .iter()
        .map(|i| series(&[("__name__", "up"), ("instance", *i)], &[(at, 1.0)]))
        .collect();
    cluster.distributor.write(TENANT, batch).await.unwrap();

    // Half of the series only live in blocks
    cluster.flush_heads(TENANT, at + 1).await;
    cluster
        .distributor
        .write(
            TENANT,
            vec![series(&[("__name__", "up"), ("instance", "a")], &[(at + 1, 1.0)])],
        )
        .await
        .unwrap();

    let err = cluster.querier.instant_query(TENANT, "up", at + 1).await.unwrap_err();
    assert!(matches!(err, Error::LimitExceeded { limit: 3 }), "got {:?}", err);
    assert!(err.is_user_error());

    let ok = cluster
        .querier
        .instant_query(TENANT, r#"up{instance=~"a|b|c"}"#, at + 1)
        .await
        .unwrap();
    assert_eq!(vector(ok.data).len(), 3);
}

#[tokio::test]
async fn test_missing_block_fails_query() {
    let cluster = TestCluster::start(ClusterOptions::default());
    let at = NOW - HOUR;
    cluster
        .distributor
        .write(TENANT, vec![series(&[("__name__", "up")], &[(at, 1.0)])])
        .await
        .unwrap();
    cluster.flush_heads(TENANT, at + 1).await;

    // The manifest still lists the blocks but nobody can read them
    let manifest = cluster.bucket_index.current(TENANT).unwrap();
    assert_eq!(manifest.blocks.len(), 3);
    for block in &manifest.blocks {
        cluster.block_store.delete_block(TENANT, &block.id).await.unwrap();
    }

    let err = cluster.querier.instant_query(TENANT, "up", at).await.unwrap_err();
    match err {
        Error::ReadFailure(msg) => assert!(msg.contains("not queried"), "got {}", msg),
        other => panic!("Expected a read failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_blocks_retried_on_other_store_gateway() {
    let cluster = TestCluster::start(ClusterOptions::default());
    let at = NOW - HOUR;
    cluster
        .distributor
        .write(TENANT, vec![series(&[("__name__", "up")], &[(at, 5.0)])])
        .await
        .unwrap();
    cluster.flush_heads(TENANT, at + 1).await;

    cluster.transport.set_unreachable("store-gateway-0", true);
    let response = cluster.querier.instant_query(TENANT, "up", at).await.unwrap();
    assert_eq!(vector(response.data), vec![(String::new(), 5.0)]);
    // Block owners are random, so the failed gateway may not have been asked
    assert_eq!(
        response.degraded,
        cluster.transport.requests_sent("store-gateway-0") > 0,
        "A failed store-gateway should mark the read degraded"
    );
    assert!(cluster.transport.requests_sent("store-gateway-1") > 0);
}

#[tokio::test]
async fn test_metadata_queries_span_tiers() {
    let cluster = TestCluster::start(ClusterOptions::default());
    let at = NOW - HOUR;
    cluster
        .distributor
        .write(
            TENANT,
            vec![series(&[("__name__", "up"), ("job", "old")], &[(at, 1.0)])],
        )
        .await
        .unwrap();
    cluster.flush_heads(TENANT, at + 1).await;
    cluster
        .distributor
        .write(
            TENANT,
            vec![series(&[("__name__", "up"), ("job", "new")], &[(NOW, 1.0)])],
        )
        .await
        .unwrap();

    let values = cluster
        .querier
        .label_values(TENANT, "job", NOW - 2 * HOUR, NOW, &[])
        .await
        .unwrap();
    assert_eq!(values.data, vec!["new".to_string(), "old".to_string()]);

    let names = cluster
        .querier
        .label_names(TENANT, NOW - 2 * HOUR, NOW, &[])
        .await
        .unwrap();
    assert_eq!(names.data, vec!["__name__".to_string(), "job".to_string()]);

    let series = cluster
        .querier
        .series(
            TENANT,
            &[vec![Matcher::equal("job", "old")]],
            NOW - 2 * HOUR,
            NOW,
        )
        .await
        .unwrap();
    assert_eq!(series.data.len(), 1);
    assert_eq!(series.data[0].get("job"), Some("old"));
}
