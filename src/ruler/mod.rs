//! Rule evaluation against a remote queryable
//!
//! The ruler does not read data itself. It sends instant queries to a
//! querier, either over HTTP ([`HttpRemoteQuerier`]) or in-process
//! ([`LocalRemoteQuerier`]), and [`RuleQueryFunc`] shifts every evaluation
//! back by the tenant's evaluation delay.

use crate::api::{ApiResponse, QueryData, TENANT_HEADER};
use crate::limits::Overrides;
use crate::model::Labels;
use crate::querier::{Querier, Value, VectorSample};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Path of the instant query endpoint under the Prometheus HTTP prefix
pub const QUERY_ENDPOINT_PATH: &str = "/api/v1/query";

/// Evaluates instant queries for a tenant
#[async_trait]
pub trait RemoteQuerier: Send + Sync + std::fmt::Debug {
    async fn query(&self, tenant: &str, query: &str, ts_ms: i64) -> Result<Value>;
}

/// Posts form-encoded instant queries to a querier's HTTP API
#[derive(Debug, Clone)]
pub struct HttpRemoteQuerier {
    client: reqwest::Client,
    address: String,
    prefix: String,
    timeout: Duration,
}

impl HttpRemoteQuerier {
    /// `address` is `host:port` or a full base URL; `prefix` is the
    /// Prometheus HTTP prefix (often empty or `/prometheus`).
    pub fn new(address: impl Into<String>, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            address: address.into(),
            prefix: prefix.into(),
            timeout,
        }
    }

    fn url(&self) -> String {
        let base = if self.address.starts_with("http://") || self.address.starts_with("https://") {
            self.address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", self.address.trim_end_matches('/'))
        };
        format!("{}{}{}", base, self.prefix.trim_end_matches('/'), QUERY_ENDPOINT_PATH)
    }
}

/// Seconds with a fractional part, as the query API expects
fn format_query_time(ts_ms: i64) -> String {
    (ts_ms as f64 / 1000.0).to_string()
}

#[async_trait]
impl RemoteQuerier for HttpRemoteQuerier {
    async fn query(&self, tenant: &str, query: &str, ts_ms: i64) -> Result<Value> {
        let time = format_query_time(ts_ms);
        let response = self
            .client
            .post(self.url())
            .timeout(self.timeout)
            .header(TENANT_HEADER, tenant)
            .form(&[("query", query), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| {
                warn!("Failed to remotely evaluate rule expression: {}", e);
                Error::from(e)
            })?;

        let status = response.status();
        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "unexpected {} response status code: {}",
                status.as_u16(),
                String::from_utf8_lossy(&body)
            )));
        }

        let envelope: ApiResponse<QueryData> = serde_json::from_slice(&body)?;
        if !envelope.is_success() {
            return Err(Error::Transport(format!(
                "unexpected response status '{}'",
                envelope.status
            )));
        }
        let data = envelope
            .data
            .ok_or_else(|| Error::Serialization("query response has no data".to_string()))?;
        match data.result_type.as_str() {
            "vector" | "scalar" => data.into_value(),
            other => Err(Error::Serialization(format!("unexpected value type {:?}", other))),
        }
    }
}

/// Evaluates rule queries in-process
#[derive(Debug, Clone)]
pub struct LocalRemoteQuerier {
    querier: Arc<Querier>,
}

impl LocalRemoteQuerier {
    pub fn new(querier: Arc<Querier>) -> Self {
        Self { querier }
    }
}

#[async_trait]
impl RemoteQuerier for LocalRemoteQuerier {
    async fn query(&self, tenant: &str, query: &str, ts_ms: i64) -> Result<Value> {
        let response = self.querier.instant_query(tenant, query, ts_ms).await?;
        if response.degraded {
            warn!("Rule query for tenant {} ran on partial data", tenant);
        }
        Ok(response.data)
    }
}

/// Instant query function handed to rule groups of one tenant
#[derive(Debug, Clone)]
pub struct RuleQueryFunc {
    querier: Arc<dyn RemoteQuerier>,
    overrides: Arc<Overrides>,
    tenant: String,
}

impl RuleQueryFunc {
    pub fn new(querier: Arc<dyn RemoteQuerier>, overrides: Arc<Overrides>, tenant: impl Into<String>) -> Self {
        Self {
            querier,
            overrides,
            tenant: tenant.into(),
        }
    }

    /// Evaluate `query` at `ts_ms` minus the tenant's evaluation delay.
    pub async fn query(&self, query: &str, ts_ms: i64) -> Result<Vec<VectorSample>> {
        let delay = self.overrides.evaluation_delay(&self.tenant).as_millis() as i64;
        match self.querier.query(&self.tenant, query, ts_ms - delay).await? {
            Value::Vector(samples) => Ok(samples),
            Value::Scalar {
                timestamp_ms,
                value,
            } => Ok(vec![VectorSample {
                labels: Labels::empty(),
                timestamp_ms,
                value,
            }]),
            Value::Matrix(_) => Err(Error::Query("rule result is not a vector or scalar".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Limits;
    use parking_lot::Mutex;

    #[derive(Debug, Default)]
    struct RecordingQuerier {
        calls: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl RemoteQuerier for RecordingQuerier {
        async fn query(&self, tenant: &str, query: &str, ts_ms: i64) -> Result<Value> {
            self.calls.lock().push((tenant.to_string(), ts_ms));
            match query {
                "scalar" => Ok(Value::Scalar {
                    timestamp_ms: ts_ms,
                    value: 1.0,
                }),
                "matrix" => Ok(Value::Matrix(vec![])),
                _ => Ok(Value::Vector(vec![])),
            }
        }
    }

    #[tokio::test]
    async fn test_evaluation_delay_applied() {
        let remote = Arc::new(RecordingQuerier::default());
        let overrides = Arc::new(Overrides::default());
        overrides.set_tenant_limits(
            "t",
            Limits {
                evaluation_delay: Duration::from_secs(60),
                ..Limits::default()
            },
        );

        let func = RuleQueryFunc::new(remote.clone(), overrides, "t");
        func.query("up", 100_000).await.unwrap();
        assert_eq!(remote.calls.lock().as_slice(), &[("t".to_string(), 40_000)]);
    }

    #[tokio::test]
    async fn test_scalar_becomes_vector() {
        let func = RuleQueryFunc::new(
            Arc::new(RecordingQuerier::default()),
            Arc::new(Overrides::default()),
            "t",
        );
        let samples = func.query("scalar", 5_000).await.unwrap();
        assert_eq!(
            samples,
            vec![VectorSample {
                labels: Labels::empty(),
                timestamp_ms: 5_000,
                value: 1.0
            }]
        );
        assert!(func.query("matrix", 5_000).await.is_err());
    }

    async fn serve_envelope(body: serde_json::Value) -> String {
        use axum::http::HeaderMap;
        use axum::routing::post;

        let app = axum::Router::new().route(
            "/prometheus/api/v1/query",
            post(move |headers: HeaderMap| {
                let mut body = body.clone();
                let tenant = headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok());
                if let (Some(metric), Some(tenant)) = (body.pointer_mut("/data/result/0/metric"), tenant) {
                    metric["tenant"] = tenant.into();
                }
                async move { axum::Json(body) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn test_http_querier_decodes_vector_response() {
        let addr = serve_envelope(serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [{"metric": {"__name__": "up"}, "value": [1.5, "2"]}]
            }
        }))
        .await;
        let remote = HttpRemoteQuerier::new(addr, "/prometheus", Duration::from_secs(5));
        match remote.query("t1", "up", 1_500).await.unwrap() {
            Value::Vector(samples) => {
                assert_eq!(samples.len(), 1);
                assert_eq!(
                    samples[0].labels,
                    Labels::from_pairs(&[("__name__", "up"), ("tenant", "t1")])
                );
                assert_eq!(samples[0].timestamp_ms, 1_500);
                assert_eq!(samples[0].value, 2.0);
            }
            other => panic!("Expected a vector, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_querier_rejects_error_envelope() {
        let addr = serve_envelope(serde_json::json!({
            "status": "error",
            "errorType": "execution",
            "error": "boom"
        }))
        .await;
        let remote = HttpRemoteQuerier::new(addr, "/prometheus", Duration::from_secs(5));
        let err = remote.query("t1", "up", 1_500).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)), "got {:?}", err);
    }

    #[test]
    fn test_url_building() {
        let q = HttpRemoteQuerier::new("querier:8080", "/prometheus/", Duration::from_secs(1));
        assert_eq!(q.url(), "http://querier:8080/prometheus/api/v1/query");
        let q = HttpRemoteQuerier::new("https://q.example/", "", Duration::from_secs(1));
        assert_eq!(q.url(), "https://q.example/api/v1/query");
        assert_eq!(format_query_time(1_500), "1.5");
    }
}
