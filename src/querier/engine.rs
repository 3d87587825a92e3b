//! Query federation across tiers
//!
//! Splits the query range with the [`SourceSelector`], fans out to every
//! tier concurrently, enforces the series limit as partial results arrive
//! and merges everything into one answer.

use super::limiter::SeriesLimiter;
use super::merge::{merge_strings, SeriesMerger};
use super::selector::SourceSelector;
use super::telemetry;
use super::tiers::{QueryableTier, TierResult};
use crate::clock::Clock;
use crate::model::{Labels, Matcher, Series, TimeRange};
use crate::transport::{Request, Response};
use crate::{Error, Result};
use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A query result and whether some sources failed along the way
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse<T> {
    pub data: T,
    pub degraded: bool,
}

async fn run_tier(
    slot: usize,
    tier: &dyn QueryableTier,
    tenant: &str,
    range: TimeRange,
    request: Request,
    cancel: &CancellationToken,
) -> (usize, Result<TierResult>) {
    let result = tier.query(tenant, range, request, cancel).await;
    telemetry::record_tier_request(
        tier.name(),
        match &result {
            Ok(r) if r.degraded => "degraded",
            Ok(_) => "success",
            Err(e) => e.class(),
        },
    );
    (slot, result)
}

#[derive(Debug)]
pub struct FederationEngine {
    selector: SourceSelector,
    head: Option<Arc<dyn QueryableTier>>,
    store: Option<Arc<dyn QueryableTier>>,
    clock: Arc<dyn Clock>,
}

impl FederationEngine {
    pub fn new(selector: SourceSelector, clock: Arc<dyn Clock>) -> Self {
        Self {
            selector,
            head: None,
            store: None,
            clock,
        }
    }

    pub fn with_head_tier(mut self, tier: Arc<dyn QueryableTier>) -> Self {
        self.head = Some(tier);
        self
    }

    pub fn with_store_tier(mut self, tier: Arc<dyn QueryableTier>) -> Self {
        self.store = Some(tier);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Fan `build(sub_range)` out to every tier the plan selects.
    ///
    /// `inspect` sees each tier's responses as soon as they arrive; an error
    /// from it cancels the remaining tiers. Results come back in tier order
    /// (head first).
    async fn fan_out<B, I>(
        &self,
        tenant: &str,
        range: TimeRange,
        build: B,
        mut inspect: I,
        cancel: &CancellationToken,
    ) -> Result<(Vec<Response>, bool)>
    where
        B: Fn(TimeRange) -> Request,
        I: FnMut(&TierResult) -> Result<()>,
    {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let plan = self.selector.plan(range, self.clock.now_millis());
        debug!("Query plan for tenant {}: {:?}", tenant, plan);

        let child = cancel.child_token();
        let targets = [(&self.head, plan.head), (&self.store, plan.store)];
        let mut pending = FuturesUnordered::new();
        for (slot, (tier, sub_range)) in targets.into_iter().enumerate() {
            if let (Some(tier), Some(sub_range)) = (tier, sub_range) {
                pending.push(run_tier(
                    slot,
                    tier.as_ref(),
                    tenant,
                    sub_range,
                    build(sub_range),
                    &child,
                ));
            }
        }

        let mut slots: [Option<TierResult>; 2] = [None, None];
        while let Some((slot, result)) = pending.next().await {
            let result = match result {
                Ok(result) => result,
                Err(e) => {
                    child.cancel();
                    return Err(e);
                }
            };
            if let Err(e) = inspect(&result) {
                child.cancel();
                return Err(e);
            }
            slots[slot] = Some(result);
        }

        let mut degraded = false;
        let mut responses = Vec::new();
        for result in slots.into_iter().flatten() {
            degraded |= result.degraded;
            responses.extend(result.responses);
        }
        Ok((responses, degraded))
    }

    /// Series matching `matchers` in `range`, merged across tiers and replicas.
    pub async fn select(
        &self,
        tenant: &str,
        range: TimeRange,
        matchers: &[Matcher],
        limiter: &SeriesLimiter,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse<Vec<Series>>> {
        let (responses, degraded) = self
            .fan_out(
                tenant,
                range,
                |sub_range| Request::Select {
                    tenant: tenant.to_string(),
                    range: sub_range,
                    matchers: matchers.to_vec(),
                    block_ids: None,
                },
                |result| {
                    for response in &result.responses {
                        if let Response::Series { series, .. } = response {
                            for s in series {
                                limiter.add(&s.labels)?;
                            }
                        }
                    }
                    Ok(())
                },
                cancel,
            )
            .await?;

        let mut merger = SeriesMerger::new();
        for response in responses {
            if let Response::Series { series, .. } = response {
                merger.extend(series);
            }
        }
        telemetry::record_fetched_series(merger.len() as u64);
        Ok(QueryResponse {
            data: merger.finish(),
            degraded,
        })
    }

    /// Label sets of series matching any of `matcher_sets`
    pub async fn series(
        &self,
        tenant: &str,
        range: TimeRange,
        matcher_sets: &[Vec<Matcher>],
        limiter: &SeriesLimiter,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse<Vec<Labels>>> {
        let mut labels = std::collections::BTreeSet::new();
        let mut degraded = false;
        for matchers in matcher_sets {
            let result = self.select(tenant, range, matchers, limiter, cancel).await?;
            degraded |= result.degraded;
            labels.extend(result.data.into_iter().map(|s| s.labels));
        }
        Ok(QueryResponse {
            data: labels.into_iter().collect(),
            degraded,
        })
    }

    pub async fn label_names(
        &self,
        tenant: &str,
        range: TimeRange,
        matchers: &[Matcher],
        cancel: &CancellationToken,
    ) -> Result<QueryResponse<Vec<String>>> {
        self.strings(
            tenant,
            range,
            |sub_range| Request::LabelNames {
                tenant: tenant.to_string(),
                range: sub_range,
                matchers: matchers.to_vec(),
                block_ids: None,
            },
            cancel,
        )
        .await
    }

    pub async fn label_values(
        &self,
        tenant: &str,
        name: &str,
        range: TimeRange,
        matchers: &[Matcher],
        cancel: &CancellationToken,
    ) -> Result<QueryResponse<Vec<String>>> {
        self.strings(
            tenant,
            range,
            |sub_range| Request::LabelValues {
                tenant: tenant.to_string(),
                name: name.to_string(),
                range: sub_range,
                matchers: matchers.to_vec(),
                block_ids: None,
            },
            cancel,
        )
        .await
    }

    async fn strings<B>(
        &self,
        tenant: &str,
        range: TimeRange,
        build: B,
        cancel: &CancellationToken,
    ) -> Result<QueryResponse<Vec<String>>>
    where
        B: Fn(TimeRange) -> Request,
    {
        let (responses, degraded) = self
            .fan_out(tenant, range, build, |_| Ok(()), cancel)
            .await?;
        let sets = responses.into_iter().filter_map(|r| match r {
            Response::Strings { values, .. } => Some(values),
            _ => None,
        });
        Ok(QueryResponse {
            data: merge_strings(sets),
            degraded,
        })
    }
}
