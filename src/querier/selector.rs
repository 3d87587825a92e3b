//! Splits a query time range across the head and block tiers

use crate::model::TimeRange;
use std::time::Duration;

/// Sub-ranges each tier must answer. The two may overlap; results are
/// deduplicated on merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPlan {
    pub head: Option<TimeRange>,
    pub store: Option<TimeRange>,
}

#[derive(Debug, Clone, Copy)]
pub struct SourceSelector {
    /// Only query ingesters for data newer than this (zero: always)
    query_ingesters_within: Duration,
    /// Only query the block tier for data older than this (zero: always)
    query_store_after: Duration,
}

impl SourceSelector {
    pub fn new(query_ingesters_within: Duration, query_store_after: Duration) -> Self {
        Self {
            query_ingesters_within,
            query_store_after,
        }
    }

    pub fn plan(&self, range: TimeRange, now_ms: i64) -> QueryPlan {
        if range.start > range.end {
            return QueryPlan {
                head: None,
                store: None,
            };
        }

        let head = if self.query_ingesters_within.is_zero() {
            Some(range)
        } else {
            let min_t = now_ms - self.query_ingesters_within.as_millis() as i64;
            (range.end >= min_t).then(|| TimeRange::new(range.start.max(min_t), range.end))
        };

        let store = if self.query_store_after.is_zero() {
            Some(range)
        } else {
            let max_t = now_ms - self.query_store_after.as_millis() as i64;
            (range.start <= max_t).then(|| TimeRange::new(range.start, range.end.min(max_t)))
        };

        QueryPlan { head, store }
    }
}
