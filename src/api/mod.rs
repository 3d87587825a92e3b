//! Prometheus-compatible HTTP API
//!
//! - `POST /api/v1/push`: JSON series batch for the tenant in `X-Scope-OrgID`
//! - `GET|POST /api/v1/query`, `/api/v1/query_range`
//! - `GET|POST /api/v1/series`, `/api/v1/labels`, `GET /api/v1/label/:name/values`

pub mod prometheus;
mod telemetry;

pub use prometheus::{ApiResponse, PromSample, PromSeries, QueryData, TENANT_HEADER};

use crate::distributor::Distributor;
use crate::querier::Querier;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::Router;
use std::sync::Arc;

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// HTTP API port
    pub http_port: u16,
    /// Maximum request body size
    pub max_body_size: usize,
    /// Enable CORS
    pub enable_cors: bool,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            max_body_size: 16 * 1024 * 1024, // 16MB
            enable_cors: true,
        }
    }
}

/// Shared API state
#[derive(Clone)]
pub struct ApiState {
    pub distributor: Arc<Distributor>,
    pub querier: Arc<Querier>,
}

/// Build the HTTP API router
pub fn build_http_router(state: ApiState, config: &ApiServerConfig) -> Router {
    use axum::middleware;
    use axum::routing::{get, post};
    use tower_http::cors::{Any, CorsLayer};

    let router = Router::new()
        // Health check
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))

        // Write path
        .route("/api/v1/push", post(prometheus::push))

        // Prometheus API
        .route("/api/v1/query", get(prometheus::instant_query).post(prometheus::instant_query))
        .route("/api/v1/query_range", get(prometheus::range_query).post(prometheus::range_query))
        .route("/api/v1/series", get(prometheus::series).post(prometheus::series))
        .route("/api/v1/labels", get(prometheus::label_names).post(prometheus::label_names))
        .route("/api/v1/label/:name/values", get(prometheus::label_values))

        .with_state(state)
        .layer(DefaultBodyLimit::max(config.max_body_size))
        .layer(middleware::from_fn(telemetry::http_observability_middleware));

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        router.layer(cors)
    } else {
        router
    }
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Readiness check endpoint
async fn ready_check(State(state): State<ApiState>) -> (StatusCode, &'static str) {
    if state.distributor.ring().snapshot().healthy_count() == 0 {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    } else {
        (StatusCode::OK, "READY")
    }
}
