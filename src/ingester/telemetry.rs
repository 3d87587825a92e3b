//! Ingester telemetry instruments and recording helpers.

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;

struct IngesterInstruments {
    push_requests: Counter<u64>,
    push_samples: Counter<u64>,
    duplicate_samples: Counter<u64>,
    push_duration_seconds: Histogram<f64>,
    blocks_cut: Counter<u64>,
    block_series: Histogram<u64>,
    block_upload_outcomes: Counter<u64>,
}

fn instruments() -> &'static IngesterInstruments {
    static INSTRUMENTS: OnceLock<IngesterInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("strata.ingester");
        IngesterInstruments {
            push_requests: meter
                .u64_counter("strata.ingester.push.requests")
                .with_description("Push requests handled by the ingester")
                .init(),
            push_samples: meter
                .u64_counter("strata.ingester.push.samples")
                .with_description("Samples appended to the head")
                .init(),
            duplicate_samples: meter
                .u64_counter("strata.ingester.push.duplicate_samples")
                .with_description("Samples dropped because the timestamp was already present")
                .init(),
            push_duration_seconds: meter
                .f64_histogram("strata.ingester.push.duration")
                .with_description("Ingester push duration")
                .with_unit("s")
                .init(),
            blocks_cut: meter
                .u64_counter("strata.ingester.blocks.cut")
                .with_description("Blocks cut from the head and uploaded")
                .init(),
            block_series: meter
                .u64_histogram("strata.ingester.blocks.series")
                .with_description("Series per uploaded block")
                .init(),
            block_upload_outcomes: meter
                .u64_counter("strata.ingester.blocks.upload.outcomes")
                .with_description("Block upload outcomes")
                .init(),
        }
    })
}

pub fn record_push(duration_seconds: f64, appended: u64, duplicates: u64) {
    let i = instruments();
    i.push_requests.add(1, &[]);
    i.push_samples.add(appended, &[]);
    if duplicates > 0 {
        i.duplicate_samples.add(duplicates, &[]);
    }
    i.push_duration_seconds.record(duration_seconds, &[]);
}

pub fn record_block_cut(series: u64) {
    let i = instruments();
    i.blocks_cut.add(1, &[]);
    i.block_series.record(series, &[]);
}

pub fn record_block_upload_outcome(outcome: &'static str) {
    instruments()
        .block_upload_outcomes
        .add(1, &[KeyValue::new("outcome", outcome)]);
}
