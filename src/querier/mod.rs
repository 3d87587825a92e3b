//! Read path
//!
//! The [`Querier`] parses an expression, optionally splits it into shard
//! sub-queries, fetches series for every selector through the
//! [`FederationEngine`] and evaluates the result.

pub mod engine;
pub mod eval;
pub mod expr;
pub mod limiter;
pub mod merge;
pub mod selector;
pub mod sharding;
pub mod telemetry;
pub mod tiers;

pub use engine::{FederationEngine, QueryResponse};
pub use eval::{Evaluator, Value, VectorSample, DEFAULT_LOOKBACK_DELTA};
pub use expr::{parse, parse_selector, AggregateOp, Expr};
pub use limiter::SeriesLimiter;
pub use merge::{merge_strings, SeriesMerger};
pub use selector::{QueryPlan, SourceSelector};
pub use sharding::{combine, shard_query, Combiner, ShardedQuery};
pub use tiers::{BlockSource, BlockTier, HeadTier, QueryableTier, TierResult};

use crate::limits::Overrides;
use crate::model::{Labels, Matcher, TimeRange};
use crate::{Error, Result};
use eval::Fetched;
use futures::future::try_join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

/// Upper bound on steps of a range query
pub const MAX_POINTS_PER_SERIES: i64 = 11_000;

/// Latest accepted evaluation timestamp. The earliest is its negation.
pub const MAX_QUERY_TIME_MS: i64 = i64::MAX / 4;
pub const MIN_QUERY_TIME_MS: i64 = -MAX_QUERY_TIME_MS;

fn check_query_time(param: &str, ts_ms: i64) -> Result<()> {
    if !(MIN_QUERY_TIME_MS..=MAX_QUERY_TIME_MS).contains(&ts_ms) {
        return Err(Error::Query(format!(
            "{} timestamp {} is out of range",
            param, ts_ms
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct QuerierConfig {
    pub query_sharding_enabled: bool,
    /// Number of sub-queries a shardable query is split into
    pub query_shards: usize,
    pub lookback_delta: Duration,
    /// Deadline for one user query, including all sub-queries
    pub timeout: Duration,
}

impl Default for QuerierConfig {
    fn default() -> Self {
        Self {
            query_sharding_enabled: false,
            query_shards: 16,
            lookback_delta: DEFAULT_LOOKBACK_DELTA,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Evaluation window of one query: an instant, or a stepped range
#[derive(Debug, Clone, Copy)]
enum Window {
    Instant(i64),
    Range { start: i64, end: i64, step_ms: i64 },
}

impl Window {
    fn bounds(&self) -> (i64, i64) {
        match *self {
            Window::Instant(ts) => (ts, ts),
            Window::Range { start, end, .. } => (start, end),
        }
    }
}

#[derive(Debug)]
pub struct Querier {
    engine: Arc<FederationEngine>,
    overrides: Arc<Overrides>,
    evaluator: Evaluator,
    config: QuerierConfig,
}

impl Querier {
    pub fn new(engine: Arc<FederationEngine>, overrides: Arc<Overrides>, config: QuerierConfig) -> Self {
        Self {
            engine,
            overrides,
            evaluator: Evaluator::new(config.lookback_delta),
            config,
        }
    }

    pub fn config(&self) -> &QuerierConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<FederationEngine> {
        &self.engine
    }

    /// Evaluate `query` at `ts_ms`. Selector queries yield a vector, number
    /// literals a scalar.
    pub async fn instant_query(&self, tenant: &str, query: &str, ts_ms: i64) -> Result<QueryResponse<Value>> {
        check_query_time("time", ts_ms)?;
        let expr = parse(query)?;
        self.run("instant_query", tenant, |cancel| async move {
            self.execute(tenant, &expr, Window::Instant(ts_ms), &cancel).await
        })
        .await
    }

    /// Evaluate `query` at every step in `[start_ms, end_ms]`; always a matrix.
    pub async fn range_query(
        &self,
        tenant: &str,
        query: &str,
        start_ms: i64,
        end_ms: i64,
        step_ms: i64,
    ) -> Result<QueryResponse<Value>> {
        check_query_time("start", start_ms)?;
        check_query_time("end", end_ms)?;
        if step_ms <= 0 {
            return Err(Error::Query(
                "zero or negative query resolution step widths are not accepted".to_string(),
            ));
        }
        if end_ms < start_ms {
            return Err(Error::Query("end timestamp must not be before start time".to_string()));
        }
        if (end_ms - start_ms) / step_ms >= MAX_POINTS_PER_SERIES {
            return Err(Error::Query(format!(
                "exceeded maximum resolution of {} points per timeseries",
                MAX_POINTS_PER_SERIES
            )));
        }
        let expr = parse(query)?;
        let window = Window::Range {
            start: start_ms,
            end: end_ms,
            step_ms,
        };
        self.run("range_query", tenant, |cancel| async move {
            self.execute(tenant, &expr, window, &cancel).await
        })
        .await
    }

    /// Label sets of series matching any of `matcher_sets`.
    pub async fn series(
        &self,
        tenant: &str,
        matcher_sets: &[Vec<Matcher>],
        start_ms: i64,
        end_ms: i64,
    ) -> Result<QueryResponse<Vec<Labels>>> {
        if matcher_sets.is_empty() {
            return Err(Error::Query("no match[] parameter provided".to_string()));
        }
        self.run("series", tenant, |cancel| async move {
            let limiter = self.limiter(tenant);
            self.engine
                .series(tenant, TimeRange::new(start_ms, end_ms), matcher_sets, &limiter, &cancel)
                .await
        })
        .await
    }

    pub async fn label_names(
        &self,
        tenant: &str,
        start_ms: i64,
        end_ms: i64,
        matchers: &[Matcher],
    ) -> Result<QueryResponse<Vec<String>>> {
        self.run("label_names", tenant, |cancel| async move {
            self.engine
                .label_names(tenant, TimeRange::new(start_ms, end_ms), matchers, &cancel)
                .await
        })
        .await
    }

    pub async fn label_values(
        &self,
        tenant: &str,
        name: &str,
        start_ms: i64,
        end_ms: i64,
        matchers: &[Matcher],
    ) -> Result<QueryResponse<Vec<String>>> {
        self.run("label_values", tenant, |cancel| async move {
            self.engine
                .label_values(tenant, name, TimeRange::new(start_ms, end_ms), matchers, &cancel)
                .await
        })
        .await
    }

    fn limiter(&self, tenant: &str) -> SeriesLimiter {
        SeriesLimiter::new(self.overrides.max_fetched_series_per_query(tenant))
    }

    /// Run one user query under its span, deadline and cancellation token.
    /// Dropping the returned future (client gone) cancels all sub-requests.
    async fn run<T, F, Fut>(&self, kind: &'static str, tenant: &str, query: F) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if tenant.is_empty() {
            return Err(Error::Query("no tenant specified".to_string()));
        }
        let started = Instant::now();
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        let span = info_span!("querier.query", tenant, kind);
        let result = match tokio::time::timeout(self.config.timeout, query(cancel.clone()))
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(Error::Timeout)
            }
        };

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.class(),
        };
        telemetry::record_query(kind, outcome, started.elapsed().as_secs_f64());
        result
    }

    async fn execute(
        &self,
        tenant: &str,
        expr: &Expr,
        window: Window,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse<Value>> {
        let limiter = self.limiter(tenant);
        if self.config.query_sharding_enabled {
            if let Some(sharded) = shard_query(expr, self.config.query_shards) {
                debug!(
                    "Splitting query {} into {} shards for tenant {}",
                    expr,
                    sharded.parts.len(),
                    tenant
                );
                telemetry::record_sharded_query(sharded.parts.len() as u64);
                let parts = try_join_all(
                    sharded
                        .parts
                        .iter()
                        .map(|part| self.evaluate(tenant, part, window, &limiter, cancel)),
                )
                .await?;
                let degraded = parts.iter().any(|p| p.degraded);
                let values = parts.into_iter().map(|p| p.data).collect();
                return Ok(QueryResponse {
                    data: combine(sharded.combiner, values),
                    degraded,
                });
            }
        }
        self.evaluate(tenant, expr, window, &limiter, cancel).await
    }

    async fn evaluate(
        &self,
        tenant: &str,
        expr: &Expr,
        window: Window,
        limiter: &SeriesLimiter,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse<Value>> {
        let (start, end) = window.bounds();
        let range = self.evaluator.fetch_range(start, end);

        let mut fetched = Fetched::default();
        let mut degraded = false;
        for matchers in expr.selectors() {
            let result = self.engine.select(tenant, range, matchers, limiter, cancel).await?;
            degraded |= result.degraded;
            fetched.insert(matchers, result.data);
        }

        let data = match window {
            Window::Instant(ts) => self.evaluator.instant(expr, ts, &fetched),
            Window::Range { start, end, step_ms } => {
                self.evaluator.range(expr, start, end, step_ms, &fetched)
            }
        };
        Ok(QueryResponse { data, degraded })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::limits::Limits;
    use crate::model::{Sample, Series, METRIC_NAME};
    use crate::transport::{Request, Response};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct MemoryTier(Vec<Series>);

    #[async_trait]
    impl QueryableTier for MemoryTier {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn query(
            &self,
            _tenant: &str,
            range: TimeRange,
            request: Request,
            _cancel: &CancellationToken,
        ) -> Result<TierResult> {
            let Request::Select { matchers, .. } = request else {
                return Ok(TierResult::default());
            };
            let filter = crate::model::SeriesFilter::new(&matchers)?;
            let series = self
                .0
                .iter()
                .filter(|s| filter.matches(&s.labels))
                .map(|s| {
                    let samples = s
                        .samples
                        .iter()
                        .filter(|p| range.contains(p.timestamp_ms))
                        .cloned()
                        .collect();
                    Series::new(s.labels.clone(), samples)
                })
                .collect();
            Ok(TierResult {
                responses: vec![Response::Series {
                    series,
                    queried_blocks: vec![],
                }],
                degraded: false,
            })
        }
    }

    fn querier(sharding: bool, max_series: usize) -> Querier {
        let data = (0..8)
            .map(|i| {
                Series::new(
                    Labels::from_pairs(&[
                        (METRIC_NAME, "up"),
                        ("job", if i % 2 == 0 { "a" } else { "b" }),
                        ("instance", &i.to_string()),
                    ]),
                    vec![Sample::new(1_000, i as f64), Sample::new(61_000, i as f64)],
                )
            })
            .collect();
        let engine = FederationEngine::new(
            SourceSelector::new(Duration::ZERO, Duration::ZERO),
            Arc::new(ManualClock::new(100_000)),
        )
        .with_head_tier(Arc::new(MemoryTier(data)));
        let overrides = Overrides::new(Limits {
            max_fetched_series_per_query: max_series,
            ..Limits::default()
        });
        Querier::new(
            Arc::new(engine),
            Arc::new(overrides),
            QuerierConfig {
                query_sharding_enabled: sharding,
                query_shards: 3,
                ..QuerierConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_sharded_matches_unsharded() {
        for query in ["up", "sum by (job) (up)", "count(up)", "max(up)", "avg by (job) (up)"] {
            let plain = querier(false, 0).instant_query("t", query, 61_000).await.unwrap();
            let sharded = querier(true, 0).instant_query("t", query, 61_000).await.unwrap();
            assert_eq!(plain.data, sharded.data, "query {}", query);
        }
    }

    #[tokio::test]
    async fn test_range_query_steps() {
        let result = querier(false, 0)
            .range_query("t", "sum(up)", 1_000, 61_000, 30_000)
            .await
            .unwrap();
        let Value::Matrix(series) = result.data else {
            panic!("expected matrix");
        };
        assert_eq!(series.len(), 1);
        let values: Vec<f64> = series[0].samples.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![28.0, 28.0, 28.0]);
    }

    #[tokio::test]
    async fn test_range_query_validation() {
        let q = querier(false, 0);
        assert!(matches!(q.range_query("t", "up", 0, 10, 0).await, Err(Error::Query(_))));
        assert!(matches!(q.range_query("t", "up", 10, 0, 1).await, Err(Error::Query(_))));
        assert!(matches!(
            q.range_query("t", "up", 0, 20_000, 1).await,
            Err(Error::Query(_))
        ));
    }

    #[tokio::test]
    async fn test_out_of_range_times_rejected() {
        let q = querier(false, 0);
        for ts in [i64::MIN, i64::MAX, MAX_QUERY_TIME_MS + 1] {
            let err = q.instant_query("t", "up", ts).await.unwrap_err();
            assert!(matches!(err, Error::Query(_)), "time {}: {:?}", ts, err);
            assert!(err.is_user_error());
        }
        assert!(matches!(
            q.range_query("t", "up", i64::MAX, i64::MAX, 1).await,
            Err(Error::Query(_))
        ));
        assert!(matches!(
            q.range_query("t", "up", i64::MIN / 2 - 10, i64::MAX / 2 + 10, i64::MAX).await,
            Err(Error::Query(_))
        ));
        assert!(matches!(
            q.range_query("t", "up", 0, 10, -5).await,
            Err(Error::Query(_))
        ));
    }

    #[tokio::test]
    async fn test_queries_at_time_bounds_terminate() {
        let q = querier(false, 0);
        let result = q.instant_query("t", "up", MIN_QUERY_TIME_MS).await.unwrap();
        assert_eq!(result.data, Value::Vector(vec![]));

        let result = q
            .range_query("t", "1", MAX_QUERY_TIME_MS - 10, MAX_QUERY_TIME_MS, i64::MAX)
            .await
            .unwrap();
        let Value::Matrix(series) = result.data else {
            panic!("expected matrix");
        };
        assert_eq!(series[0].samples, vec![Sample::new(MAX_QUERY_TIME_MS - 10, 1.0)]);
    }

    #[test]
    fn test_range_steps_stop_at_i64_max() {
        let evaluator = Evaluator::default();
        let Value::Matrix(series) =
            evaluator.range(&Expr::Number(2.0), i64::MAX - 3, i64::MAX, 2, &Fetched::default())
        else {
            panic!("expected matrix");
        };
        assert_eq!(series[0].samples.len(), 2);
        assert_eq!(
            evaluator.fetch_range(i64::MIN, 0),
            TimeRange::new(i64::MIN, 0)
        );
    }

    #[tokio::test]
    async fn test_series_limit_applies_across_shards() {
        let err = querier(true, 7).instant_query("t", "up", 61_000).await.unwrap_err();
        assert!(matches!(err, Error::LimitExceeded { limit: 7 }));
        assert!(querier(true, 8).instant_query("t", "up", 61_000).await.is_ok());
    }

    #[tokio::test]
    async fn test_scalar_query() {
        let result = querier(false, 0).instant_query("t", "42", 5).await.unwrap();
        assert_eq!(
            result.data,
            Value::Scalar {
                timestamp_ms: 5,
                value: 42.0
            }
        );
    }

    #[tokio::test]
    async fn test_empty_tenant_rejected() {
        let err = querier(false, 0).instant_query("", "up", 0).await.unwrap_err();
        assert!(err.is_user_error());
    }
}
