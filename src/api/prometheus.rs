//! Prometheus HTTP API compatibility layer
//!
//! Response envelope `{status, data, errorType, error, warnings}` shared by
//! the HTTP handlers and the ruler's remote querier.

use super::ApiState;
use crate::model::{Label, Labels, Matcher, Sample, Series};
use crate::querier::{parse_selector, Value, VectorSample, MAX_QUERY_TIME_MS};
use crate::Error;
use axum::extract::{Form, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Header carrying the tenant id
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

const STATUS_SUCCESS: &str = "success";
const STATUS_ERROR: &str = "error";
const DEGRADED_WARNING: &str = "some sources failed; results may be partial";

/// Prometheus response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(rename = "errorType", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T, degraded: bool) -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            data: Some(data),
            error_type: None,
            error: None,
            warnings: degraded.then(|| vec![DEGRADED_WARNING.to_string()]),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// `data` of query responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    pub result: serde_json::Value,
}

/// One element of a vector result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromSample {
    pub metric: BTreeMap<String, String>,
    pub value: (f64, String),
}

/// One element of a matrix result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromSeries {
    pub metric: BTreeMap<String, String>,
    pub values: Vec<(f64, String)>,
}

pub fn labels_to_map(labels: &Labels) -> BTreeMap<String, String> {
    labels
        .iter()
        .map(|l| (l.name.clone(), l.value.clone()))
        .collect()
}

pub fn map_to_labels(map: BTreeMap<String, String>) -> Labels {
    Labels::new(map.into_iter().map(|(name, value)| Label { name, value }))
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn parse_value(value: &str) -> crate::Result<f64> {
    match value {
        "NaN" => Ok(f64::NAN),
        "+Inf" | "Inf" => Ok(f64::INFINITY),
        "-Inf" => Ok(f64::NEG_INFINITY),
        other => other
            .parse()
            .map_err(|_| Error::Serialization(format!("invalid sample value {:?}", other))),
    }
}

fn to_point(timestamp_ms: i64, value: f64) -> (f64, String) {
    (timestamp_ms as f64 / 1000.0, format_value(value))
}

fn from_point((ts, value): &(f64, String)) -> crate::Result<(i64, f64)> {
    Ok(((ts * 1000.0).round() as i64, parse_value(value)?))
}

impl QueryData {
    pub fn from_value(value: &Value) -> Self {
        let result = match value {
            Value::Scalar {
                timestamp_ms,
                value,
            } => serde_json::json!(to_point(*timestamp_ms, *value)),
            Value::Vector(samples) => serde_json::json!(samples
                .iter()
                .map(|s| PromSample {
                    metric: labels_to_map(&s.labels),
                    value: to_point(s.timestamp_ms, s.value),
                })
                .collect::<Vec<_>>()),
            Value::Matrix(series) => serde_json::json!(series
                .iter()
                .map(|s| PromSeries {
                    metric: labels_to_map(&s.labels),
                    values: s
                        .samples
                        .iter()
                        .map(|p| to_point(p.timestamp_ms, p.value))
                        .collect(),
                })
                .collect::<Vec<_>>()),
        };
        Self {
            result_type: value.type_name().to_string(),
            result,
        }
    }

    /// Decode back into a [`Value`].
    pub fn into_value(self) -> crate::Result<Value> {
        match self.result_type.as_str() {
            "scalar" => {
                let point: (f64, String) = serde_json::from_value(self.result)?;
                let (timestamp_ms, value) = from_point(&point)?;
                Ok(Value::Scalar {
                    timestamp_ms,
                    value,
                })
            }
            "vector" => {
                let samples: Vec<PromSample> = serde_json::from_value(self.result)?;
                let mut out = Vec::with_capacity(samples.len());
                for s in samples {
                    let (timestamp_ms, value) = from_point(&s.value)?;
                    out.push(VectorSample {
                        labels: map_to_labels(s.metric),
                        timestamp_ms,
                        value,
                    });
                }
                Ok(Value::Vector(out))
            }
            "matrix" => {
                let series: Vec<PromSeries> = serde_json::from_value(self.result)?;
                let mut out = Vec::with_capacity(series.len());
                for s in series {
                    let samples = s
                        .values
                        .iter()
                        .map(|p| from_point(p).map(|(t, v)| Sample::new(t, v)))
                        .collect::<crate::Result<Vec<_>>>()?;
                    out.push(Series::new(map_to_labels(s.metric), samples));
                }
                Ok(Value::Matrix(out))
            }
            other => Err(Error::Serialization(format!("unexpected value type {:?}", other))),
        }
    }
}

/// Error rendered as a Prometheus error envelope
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_type: &'static str,
    message: String,
}

impl ApiError {
    fn bad_data(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error_type: "bad_data",
            message: message.into(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        if e.is_user_error() {
            return Self::bad_data(e.to_string());
        }
        let status = match e {
            Error::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            Error::QuorumFailure { .. } | Error::Membership(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNPROCESSABLE_ENTITY,
        };
        warn!("Request failed: {}", e);
        Self {
            status,
            error_type: "execution",
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body: ApiResponse<()> = ApiResponse {
            status: STATUS_ERROR.to_string(),
            data: None,
            error_type: Some(self.error_type.to_string()),
            error: Some(self.message),
            warnings: None,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

fn tenant(headers: &HeaderMap) -> std::result::Result<String, ApiError> {
    match headers.get(TENANT_HEADER).and_then(|v| v.to_str().ok()) {
        Some(t) if !t.trim().is_empty() => Ok(t.trim().to_string()),
        _ => Err(ApiError {
            status: StatusCode::UNAUTHORIZED,
            error_type: "bad_data",
            message: "no org id".to_string(),
        }),
    }
}

/// Seconds (float) or RFC 3339, to milliseconds
fn parse_time(value: &str) -> std::result::Result<i64, ApiError> {
    if let Ok(secs) = value.parse::<f64>() {
        return seconds_to_millis(secs)
            .ok_or_else(|| ApiError::bad_data(format!("timestamp {:?} is out of range", value)));
    }
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|t| t.timestamp_millis())
        .map_err(|_| ApiError::bad_data(format!("cannot parse {:?} to a valid timestamp", value)))
}

/// Seconds (float) or a duration like `15s`, to milliseconds
fn parse_step(value: &str) -> std::result::Result<i64, ApiError> {
    if let Ok(secs) = value.parse::<f64>() {
        return seconds_to_millis(secs)
            .ok_or_else(|| ApiError::bad_data(format!("step {:?} is out of range", value)));
    }
    let duration = humantime::parse_duration(value)
        .map_err(|_| ApiError::bad_data(format!("cannot parse {:?} to a valid duration", value)))?;
    i64::try_from(duration.as_millis())
        .ok()
        .filter(|ms| *ms <= MAX_QUERY_TIME_MS)
        .ok_or_else(|| ApiError::bad_data(format!("step {:?} is out of range", value)))
}

/// None for NaN, infinities and anything past the accepted query times.
fn seconds_to_millis(secs: f64) -> Option<i64> {
    let ms = (secs * 1000.0).round();
    (ms.is_finite() && ms.abs() <= MAX_QUERY_TIME_MS as f64).then_some(ms as i64)
}

fn time_or(value: Option<&str>, default: i64) -> std::result::Result<i64, ApiError> {
    value.map(parse_time).transpose().map(|t| t.unwrap_or(default))
}

/// Push request body
#[derive(Debug, Serialize, Deserialize)]
pub struct PushRequest {
    pub series: Vec<Series>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushData {
    pub samples: usize,
}

/// POST /api/v1/push
pub async fn push(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(body): Json<PushRequest>,
) -> ApiResult<PushData> {
    let tenant = tenant(&headers)?;
    let samples = state.distributor.write(&tenant, body.series).await?;
    Ok(Json(ApiResponse::success(PushData { samples }, false)))
}

#[derive(Debug, Deserialize)]
pub struct InstantQueryParams {
    pub query: String,
    #[serde(default)]
    pub time: Option<String>,
}

/// GET/POST /api/v1/query
pub async fn instant_query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Form(params): Form<InstantQueryParams>,
) -> ApiResult<QueryData> {
    let tenant = tenant(&headers)?;
    let now = state.querier.engine().clock().now_millis();
    let ts = time_or(params.time.as_deref(), now)?;
    let result = state.querier.instant_query(&tenant, &params.query, ts).await?;
    Ok(Json(ApiResponse::success(
        QueryData::from_value(&result.data),
        result.degraded,
    )))
}

#[derive(Debug, Deserialize)]
pub struct RangeQueryParams {
    pub query: String,
    pub start: String,
    pub end: String,
    pub step: String,
}

/// GET/POST /api/v1/query_range
pub async fn range_query(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Form(params): Form<RangeQueryParams>,
) -> ApiResult<QueryData> {
    let tenant = tenant(&headers)?;
    let start = parse_time(&params.start)?;
    let end = parse_time(&params.end)?;
    let step = parse_step(&params.step)?;
    let result = state
        .querier
        .range_query(&tenant, &params.query, start, end, step)
        .await?;
    Ok(Json(ApiResponse::success(
        QueryData::from_value(&result.data),
        result.degraded,
    )))
}

/// `match[]`, `start` and `end` from a parameter list with repeated keys
struct MetadataParams {
    matchers: Vec<Vec<Matcher>>,
    start: i64,
    end: i64,
}

impl MetadataParams {
    fn parse(pairs: &[(String, String)]) -> std::result::Result<Self, ApiError> {
        let mut matchers = Vec::new();
        let mut start = None;
        let mut end = None;
        for (key, value) in pairs {
            match key.as_str() {
                "match[]" => matchers.push(parse_selector(value)?),
                "start" => start = Some(value.as_str()),
                "end" => end = Some(value.as_str()),
                _ => {}
            }
        }
        Ok(Self {
            matchers,
            start: time_or(start, i64::MIN)?,
            end: time_or(end, i64::MAX)?,
        })
    }

    /// Matchers of the single selector metadata endpoints accept
    fn single(&self) -> std::result::Result<&[Matcher], ApiError> {
        match self.matchers.as_slice() {
            [] => Ok(&[]),
            [one] => Ok(one),
            _ => Err(ApiError::bad_data("only one match[] selector is supported")),
        }
    }
}

/// GET/POST /api/v1/series
pub async fn series(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Form(pairs): Form<Vec<(String, String)>>,
) -> ApiResult<Vec<BTreeMap<String, String>>> {
    let tenant = tenant(&headers)?;
    let params = MetadataParams::parse(&pairs)?;
    let result = state
        .querier
        .series(&tenant, &params.matchers, params.start, params.end)
        .await?;
    Ok(Json(ApiResponse::success(
        result.data.iter().map(labels_to_map).collect(),
        result.degraded,
    )))
}

/// GET/POST /api/v1/labels
pub async fn label_names(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Form(pairs): Form<Vec<(String, String)>>,
) -> ApiResult<Vec<String>> {
    let tenant = tenant(&headers)?;
    let params = MetadataParams::parse(&pairs)?;
    let result = state
        .querier
        .label_names(&tenant, params.start, params.end, params.single()?)
        .await?;
    Ok(Json(ApiResponse::success(result.data, result.degraded)))
}

/// GET /api/v1/label/{name}/values
pub async fn label_values(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(name): Path<String>,
    Form(pairs): Form<Vec<(String, String)>>,
) -> ApiResult<Vec<String>> {
    let tenant = tenant(&headers)?;
    let params = MetadataParams::parse(&pairs)?;
    let result = state
        .querier
        .label_values(&tenant, &name, params.start, params.end, params.single()?)
        .await?;
    Ok(Json(ApiResponse::success(result.data, result.degraded)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::METRIC_NAME;

    #[test]
    fn test_vector_envelope_decodes() {
        let value = Value::Vector(vec![VectorSample {
            labels: Labels::from_pairs(&[(METRIC_NAME, "up"), ("job", "a")]),
            timestamp_ms: 1_500,
            value: f64::INFINITY,
        }]);
        let body = serde_json::to_string(&ApiResponse::success(QueryData::from_value(&value), false)).unwrap();
        assert!(body.contains(r#""resultType":"vector""#));
        assert!(body.contains(r#"[1.5,"+Inf"]"#));
        assert!(!body.contains("warnings"));

        let decoded: ApiResponse<QueryData> = serde_json::from_str(&body).unwrap();
        assert!(decoded.is_success());
        assert_eq!(decoded.data.unwrap().into_value().unwrap(), value);
    }

    #[test]
    fn test_unknown_result_type_rejected() {
        let data = QueryData {
            result_type: "string".to_string(),
            result: serde_json::json!([1, "x"]),
        };
        assert!(data.into_value().is_err());
    }

    #[test]
    fn test_parse_time_formats() {
        assert_eq!(parse_time("1.5").unwrap(), 1_500);
        assert_eq!(parse_time("1970-01-01T00:00:02Z").unwrap(), 2_000);
        assert!(parse_time("yesterday").is_err());
        assert_eq!(parse_step("15s").unwrap(), 15_000);
        assert_eq!(parse_step("0.5").unwrap(), 500);
    }

    #[test]
    fn test_parse_time_rejects_unrepresentable_values() {
        for raw in ["1e30", "-1e30", "NaN", "inf", "-Inf"] {
            let err = parse_time(raw).unwrap_err();
            assert_eq!(err.status, StatusCode::BAD_REQUEST, "time {}", raw);
            assert_eq!(err.error_type, "bad_data");
        }
        assert!(parse_step("1e30").is_err());
        assert!(parse_step("NaN").is_err());
        assert_eq!(parse_time("-1.5").unwrap(), -1_500);
    }

    #[test]
    fn test_error_types() {
        let e = ApiError::from(Error::LimitExceeded { limit: 1 });
        assert_eq!(e.error_type, "bad_data");
        assert_eq!(e.status, StatusCode::BAD_REQUEST);
        let e = ApiError::from(Error::ReadFailure("x".to_string()));
        assert_eq!(e.error_type, "execution");
    }
}
