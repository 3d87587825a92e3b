//! Query sharding
//!
//! Rewrites a query into sub-queries over disjoint series shards, selected
//! with the `__query_shard__` matcher, and recombines their results. Only
//! shapes whose recombination is exact are split.

use super::eval::{Value, VectorSample};
use super::expr::{AggregateOp, Expr};
use crate::model::{Labels, Matcher, Sample, Series, ShardSelector, QUERY_SHARD_LABEL};
use std::collections::BTreeMap;

/// How partial results are recombined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combiner {
    /// Shards hold disjoint series; concatenate
    Concat,
    Sum,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardedQuery {
    pub parts: Vec<Expr>,
    pub combiner: Combiner,
}

/// Split `expr` into `shards` sub-queries, or `None` when it cannot be split.
pub fn shard_query(expr: &Expr, shards: usize) -> Option<ShardedQuery> {
    if shards <= 1 {
        return None;
    }
    let (combiner, matchers) = match expr {
        Expr::Selector(matchers) => (Combiner::Concat, matchers),
        Expr::Aggregate { op, expr: inner, .. } => {
            let Expr::Selector(matchers) = inner.as_ref() else {
                return None;
            };
            let combiner = match op {
                AggregateOp::Sum | AggregateOp::Count => Combiner::Sum,
                AggregateOp::Min => Combiner::Min,
                AggregateOp::Max => Combiner::Max,
                AggregateOp::Avg => return None,
            };
            (combiner, matchers)
        }
        Expr::Number(_) => return None,
    };
    if matchers.iter().any(|m| m.name == QUERY_SHARD_LABEL) {
        return None;
    }

    let parts = (0..shards as u64)
        .map(|index| {
            let mut sharded = matchers.clone();
            sharded.push(
                ShardSelector {
                    index,
                    count: shards as u64,
                }
                .matcher(),
            );
            with_selector(expr, sharded)
        })
        .collect();
    Some(ShardedQuery { parts, combiner })
}

fn with_selector(expr: &Expr, matchers: Vec<Matcher>) -> Expr {
    match expr {
        Expr::Aggregate { op, grouping, .. } => Expr::Aggregate {
            op: *op,
            grouping: grouping.clone(),
            expr: Box::new(Expr::Selector(matchers)),
        },
        _ => Expr::Selector(matchers),
    }
}

fn fold(combiner: Combiner, acc: f64, value: f64) -> f64 {
    match combiner {
        Combiner::Sum => acc + value,
        Combiner::Min => acc.min(value),
        Combiner::Max => acc.max(value),
        // disjoint shards never produce the same label set
        Combiner::Concat => acc,
    }
}

/// Recombine the values of every shard.
pub fn combine(combiner: Combiner, parts: Vec<Value>) -> Value {
    let mut vector: BTreeMap<Labels, (i64, f64)> = BTreeMap::new();
    let mut matrix: BTreeMap<Labels, BTreeMap<i64, f64>> = BTreeMap::new();
    let mut is_matrix = false;

    for part in parts {
        match part {
            Value::Vector(samples) => {
                for s in samples {
                    vector
                        .entry(s.labels)
                        .and_modify(|(_, v)| *v = fold(combiner, *v, s.value))
                        .or_insert((s.timestamp_ms, s.value));
                }
            }
            Value::Matrix(series) => {
                is_matrix = true;
                for s in series {
                    let points = matrix.entry(s.labels).or_default();
                    for sample in s.samples {
                        points
                            .entry(sample.timestamp_ms)
                            .and_modify(|v| *v = fold(combiner, *v, sample.value))
                            .or_insert(sample.value);
                    }
                }
            }
            scalar @ Value::Scalar { .. } => return scalar,
        }
    }

    if is_matrix {
        Value::Matrix(
            matrix
                .into_iter()
                .map(|(labels, points)| {
                    Series::new(
                        labels,
                        points.into_iter().map(|(t, v)| Sample::new(t, v)).collect(),
                    )
                })
                .collect(),
        )
    } else {
        Value::Vector(
            vector
                .into_iter()
                .map(|(labels, (timestamp_ms, value))| VectorSample {
                    labels,
                    timestamp_ms,
                    value,
                })
                .collect(),
        )
    }
}
