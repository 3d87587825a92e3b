//! Expression evaluation over fetched series

use super::expr::{AggregateOp, Expr};
use crate::model::{Labels, Matcher, Sample, Series, TimeRange};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Default staleness window for instant vector selectors
pub const DEFAULT_LOOKBACK_DELTA: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct VectorSample {
    pub labels: Labels,
    pub timestamp_ms: i64,
    pub value: f64,
}

/// Result of evaluating an expression
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar { timestamp_ms: i64, value: f64 },
    Vector(Vec<VectorSample>),
    Matrix(Vec<Series>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Scalar { .. } => "scalar",
            Value::Vector(_) => "vector",
            Value::Matrix(_) => "matrix",
        }
    }
}

/// Key identifying a selector's matcher list
pub fn selector_key(matchers: &[Matcher]) -> String {
    matchers
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Series fetched for each selector of an expression
#[derive(Debug, Default)]
pub struct Fetched {
    by_selector: HashMap<String, Vec<Series>>,
}

impl Fetched {
    pub fn insert(&mut self, matchers: &[Matcher], series: Vec<Series>) {
        self.by_selector.insert(selector_key(matchers), series);
    }

    fn get(&self, matchers: &[Matcher]) -> &[Series] {
        self.by_selector
            .get(&selector_key(matchers))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Evaluator {
    lookback_ms: i64,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKBACK_DELTA)
    }
}

impl Evaluator {
    pub fn new(lookback: Duration) -> Self {
        Self {
            lookback_ms: (lookback.as_millis() as i64).max(1),
        }
    }

    /// Data needed to evaluate at every step in `[start, end]`
    pub fn fetch_range(&self, start_ms: i64, end_ms: i64) -> TimeRange {
        TimeRange::new(start_ms.saturating_sub(self.lookback_ms - 1), end_ms)
    }

    pub fn instant(&self, expr: &Expr, ts: i64, data: &Fetched) -> Value {
        match expr {
            Expr::Number(n) => Value::Scalar {
                timestamp_ms: ts,
                value: *n,
            },
            _ => Value::Vector(self.vector_at(expr, ts, data)),
        }
    }

    pub fn range(&self, expr: &Expr, start: i64, end: i64, step_ms: i64, data: &Fetched) -> Value {
        let mut out: BTreeMap<Labels, Vec<Sample>> = BTreeMap::new();
        let mut ts = start;
        while ts <= end {
            match expr {
                Expr::Number(n) => out.entry(Labels::empty()).or_default().push(Sample::new(ts, *n)),
                _ => {
                    for s in self.vector_at(expr, ts, data) {
                        out.entry(s.labels)
                            .or_default()
                            .push(Sample::new(ts, s.value));
                    }
                }
            }
            match ts.checked_add(step_ms.max(1)) {
                Some(next) => ts = next,
                None => break,
            }
        }
        Value::Matrix(
            out.into_iter()
                .map(|(labels, samples)| Series::new(labels, samples))
                .collect(),
        )
    }

    fn vector_at(&self, expr: &Expr, ts: i64, data: &Fetched) -> Vec<VectorSample> {
        match expr {
            Expr::Number(n) => vec![VectorSample {
                labels: Labels::empty(),
                timestamp_ms: ts,
                value: *n,
            }],
            Expr::Selector(matchers) => {
                let window = TimeRange::new(ts.saturating_sub(self.lookback_ms - 1), ts);
                let mut out: Vec<VectorSample> = data
                    .get(matchers)
                    .iter()
                    .filter_map(|series| {
                        let last = series
                            .samples
                            .iter()
                            .rev()
                            .find(|s| window.contains(s.timestamp_ms))?;
                        Some(VectorSample {
                            labels: series.labels.clone(),
                            timestamp_ms: ts,
                            value: last.value,
                        })
                    })
                    .collect();
                out.sort_by(|a, b| a.labels.cmp(&b.labels));
                out
            }
            Expr::Aggregate { op, grouping, expr } => {
                aggregate(*op, grouping, self.vector_at(expr, ts, data), ts)
            }
        }
    }
}

struct Group {
    value: f64,
    count: usize,
}

fn aggregate(op: AggregateOp, grouping: &[String], input: Vec<VectorSample>, ts: i64) -> Vec<VectorSample> {
    let mut groups: BTreeMap<Labels, Group> = BTreeMap::new();
    for sample in input {
        let key = sample.labels.keep(grouping);
        match groups.get_mut(&key) {
            None => {
                groups.insert(
                    key,
                    Group {
                        value: sample.value,
                        count: 1,
                    },
                );
            }
            Some(group) => {
                group.count += 1;
                group.value = match op {
                    AggregateOp::Sum | AggregateOp::Avg => group.value + sample.value,
                    AggregateOp::Count => group.value,
                    AggregateOp::Min => group.value.min(sample.value),
                    AggregateOp::Max => group.value.max(sample.value),
                };
            }
        }
    }

    groups
        .into_iter()
        .map(|(labels, group)| VectorSample {
            labels,
            timestamp_ms: ts,
            value: match op {
                AggregateOp::Count => group.count as f64,
                AggregateOp::Avg => group.value / group.count as f64,
                _ => group.value,
            },
        })
        .collect()
}
