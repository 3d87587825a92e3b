//! Query-path telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct QueryInstruments {
    query_requests: Counter<u64>,
    query_duration_seconds: Histogram<f64>,
    fetched_series: Histogram<u64>,
    tier_requests: Counter<u64>,
    blocks_retried: Counter<u64>,
    sharded_queries: Counter<u64>,
}

fn instruments() -> &'static QueryInstruments {
    static INSTRUMENTS: OnceLock<QueryInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("strata.querier");
        QueryInstruments {
            query_requests: meter
                .u64_counter("strata.querier.requests")
                .with_description("Total query requests by kind and outcome")
                .init(),
            query_duration_seconds: meter
                .f64_histogram("strata.querier.duration")
                .with_description("Query end-to-end latency")
                .with_unit("s")
                .init(),
            fetched_series: meter
                .u64_histogram("strata.querier.fetched_series")
                .with_description("Distinct series fetched per query")
                .init(),
            tier_requests: meter
                .u64_counter("strata.querier.tier.requests")
                .with_description("Fan-outs per tier by outcome")
                .init(),
            blocks_retried: meter
                .u64_counter("strata.querier.blocks.retried")
                .with_description("Blocks re-requested from another store-gateway replica")
                .init(),
            sharded_queries: meter
                .u64_counter("strata.querier.sharded_queries")
                .with_description("Queries split into shard sub-queries")
                .init(),
        }
    })
}

pub fn record_query(kind: &'static str, outcome: &'static str, duration_seconds: f64) {
    let i = instruments();
    let attrs = [KeyValue::new("kind", kind), KeyValue::new("outcome", outcome)];
    i.query_requests.add(1, &attrs);
    i.query_duration_seconds.record(duration_seconds, &attrs);
}

pub fn record_fetched_series(series: u64) {
    instruments().fetched_series.record(series, &[]);
}

pub fn record_tier_request(tier: &'static str, outcome: &'static str) {
    instruments().tier_requests.add(
        1,
        &[KeyValue::new("tier", tier), KeyValue::new("outcome", outcome)],
    );
}

pub fn record_blocks_retried(blocks: u64) {
    instruments().blocks_retried.add(blocks, &[]);
}

pub fn record_sharded_query(shards: u64) {
    instruments()
        .sharded_queries
        .add(1, &[KeyValue::new("shards", shards as i64)]);
}
