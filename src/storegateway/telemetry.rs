//! Store-gateway telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::Counter;
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct StoreGatewayInstruments {
    index_cache_requests: Counter<u64>,
    index_cache_hits: Counter<u64>,
    index_cache_items_added: Counter<u64>,
    index_cache_invalidations: Counter<u64>,
    blocks_queried: Counter<u64>,
}

fn instruments() -> &'static StoreGatewayInstruments {
    static INSTRUMENTS: OnceLock<StoreGatewayInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("strata.storegateway");
        StoreGatewayInstruments {
            index_cache_requests: meter
                .u64_counter("strata.storegateway.index_cache.requests")
                .with_description("Index cache lookups by backend and item type")
                .init(),
            index_cache_hits: meter
                .u64_counter("strata.storegateway.index_cache.hits")
                .with_description("Index cache hits by backend and item type")
                .init(),
            index_cache_items_added: meter
                .u64_counter("strata.storegateway.index_cache.items_added")
                .with_description("Index cache entries written")
                .init(),
            index_cache_invalidations: meter
                .u64_counter("strata.storegateway.index_cache.invalidations")
                .with_description("Blocks whose cache entries were invalidated")
                .init(),
            blocks_queried: meter
                .u64_counter("strata.storegateway.blocks_queried")
                .with_description("Blocks read per request kind")
                .init(),
        }
    })
}

pub fn record_cache_lookup(backend: &'static str, item: &'static str, hit: bool) {
    let i = instruments();
    let attrs = [KeyValue::new("backend", backend), KeyValue::new("item", item)];
    i.index_cache_requests.add(1, &attrs);
    if hit {
        i.index_cache_hits.add(1, &attrs);
    }
}

pub fn record_cache_set(backend: &'static str, item: &'static str) {
    instruments().index_cache_items_added.add(
        1,
        &[KeyValue::new("backend", backend), KeyValue::new("item", item)],
    );
}

pub fn record_cache_invalidation(backend: &'static str) {
    instruments()
        .index_cache_invalidations
        .add(1, &[KeyValue::new("backend", backend)]);
}

pub fn record_blocks_queried(kind: &'static str, blocks: u64) {
    instruments()
        .blocks_queried
        .add(blocks, &[KeyValue::new("kind", kind)]);
}
