//! JSON-over-HTTP transport

use super::{Request, RequestHandler, Response, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Path every instance serves internal requests on
pub const RPC_PATH: &str = "/internal/rpc";

/// Posts requests to `http://<addr>/internal/rpc`
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, addr: &str, request: Request, timeout: Duration) -> Result<Response> {
        let url = format!("http://{}{}", addr, RPC_PATH);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Transport(format!(
                "{} returned {}: {}",
                addr, status, body
            )));
        }
        Ok(response.json::<Response>().await?)
    }
}

/// Router serving internal requests with `handler`
pub fn rpc_router(handler: Arc<dyn RequestHandler>) -> Router {
    Router::new()
        .route(RPC_PATH, post(handle_rpc))
        .with_state(handler)
}

async fn handle_rpc(
    State(handler): State<Arc<dyn RequestHandler>>,
    Json(request): Json<Request>,
) -> impl IntoResponse {
    let kind = request.kind();
    match handler.handle(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            warn!("Internal {} request failed: {}", kind, e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
