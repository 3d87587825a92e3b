//! Merging partial results from replicas and tiers
//!
//! Series are keyed by their full label set, never by fingerprint. Samples
//! of the same series are unioned; for a repeated timestamp the first value
//! seen is kept.

use crate::model::{Labels, Sample, Series};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Default)]
pub struct SeriesMerger {
    series: BTreeMap<Labels, BTreeMap<i64, f64>>,
}

impl SeriesMerger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, series: Series) {
        let points = self.series.entry(series.labels).or_default();
        for sample in series.samples {
            points.entry(sample.timestamp_ms).or_insert(sample.value);
        }
    }

    pub fn extend(&mut self, series: impl IntoIterator<Item = Series>) {
        for s in series {
            self.add(s);
        }
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Merged series ordered by labels, samples ordered by timestamp
    pub fn finish(self) -> Vec<Series> {
        self.series
            .into_iter()
            .map(|(labels, points)| {
                Series::new(
                    labels,
                    points.into_iter().map(|(t, v)| Sample::new(t, v)).collect(),
                )
            })
            .collect()
    }
}

/// Sorted union of string sets
pub fn merge_strings(sets: impl IntoIterator<Item = Vec<String>>) -> Vec<String> {
    sets.into_iter()
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
