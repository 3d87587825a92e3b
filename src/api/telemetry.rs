//! Request metrics and spans for the HTTP API.

use super::prometheus::TENANT_HEADER;
use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::{debug, info_span, Instrument};

struct ApiInstruments {
    requests: Counter<u64>,
    duration_seconds: Histogram<f64>,
    failures: Counter<u64>,
    in_flight: UpDownCounter<i64>,
}

fn instruments() -> &'static ApiInstruments {
    static INSTRUMENTS: OnceLock<ApiInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("strata.api.http");
        ApiInstruments {
            requests: meter
                .u64_counter("http.server.request.count")
                .with_description("Requests served by the Prometheus-compatible API")
                .init(),
            duration_seconds: meter
                .f64_histogram("http.server.request.duration")
                .with_unit("s")
                .init(),
            failures: meter
                .u64_counter("strata.api.failed_requests")
                .with_description("Requests answered with an error envelope, by status class")
                .init(),
            in_flight: meter
                .i64_up_down_counter("http.server.active_requests")
                .init(),
        }
    })
}

fn route_attributes(method: &str, route: &str) -> Vec<KeyValue> {
    vec![
        KeyValue::new("http.request.method", method.to_string()),
        KeyValue::new("http.route", route.to_string()),
    ]
}

/// "4xx" / "5xx", or None for non-error statuses
fn failure_class(status: u16) -> Option<&'static str> {
    match status {
        400..=499 => Some("4xx"),
        500..=599 => Some("5xx"),
        _ => None,
    }
}

/// Counts and times every request and runs it inside an `http.request` span
/// carrying the tenant. Tenants are never metric attributes.
pub async fn http_observability_middleware(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let tenant = req
        .headers()
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let instruments = instruments();
    let route_attrs = route_attributes(&method, &route);
    instruments.in_flight.add(1, &route_attrs);

    let span = info_span!(
        "http.request",
        otel.kind = "server",
        http.request.method = %method,
        http.route = %route,
        tenant = %tenant
    );
    let response = next.run(req).instrument(span).await;
    instruments.in_flight.add(-1, &route_attrs);

    let status = response.status().as_u16();
    let mut attrs = route_attrs;
    attrs.push(KeyValue::new("http.response.status_code", status as i64));
    instruments.requests.add(1, &attrs);
    instruments
        .duration_seconds
        .record(start.elapsed().as_secs_f64(), &attrs);
    if let Some(class) = failure_class(status) {
        debug!("{} {} for tenant {:?} returned {}", method, route, tenant, status);
        attrs.push(KeyValue::new("error.type", class));
        instruments.failures.add(1, &attrs);
    }

    response
}
