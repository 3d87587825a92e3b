//! Per-block inverted index

use crate::model::{Matcher, Series};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Series reference within one block
pub type SeriesRef = u32;

/// Postings and series of one block.
///
/// Series are stored sorted by label set; a series' position is its
/// [`SeriesRef`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockIndex {
    /// label name -> label value -> sorted series refs
    postings: BTreeMap<String, BTreeMap<String, Vec<SeriesRef>>>,
    series: Vec<Series>,
}

impl BlockIndex {
    pub fn build(mut series: Vec<Series>) -> Self {
        series.sort_by(|a, b| a.labels.cmp(&b.labels));
        let mut postings: BTreeMap<String, BTreeMap<String, Vec<SeriesRef>>> = BTreeMap::new();
        for (r, s) in series.iter().enumerate() {
            for label in s.labels.iter() {
                postings
                    .entry(label.name.clone())
                    .or_default()
                    .entry(label.value.clone())
                    .or_default()
                    .push(r as SeriesRef);
            }
        }
        Self { postings, series }
    }

    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    pub fn num_samples(&self) -> usize {
        self.series.iter().map(|s| s.samples.len()).sum()
    }

    /// Refs of series whose value for the matcher's label matches.
    /// Series without the label match as if it were empty.
    pub fn postings(&self, matcher: &Matcher) -> Vec<SeriesRef> {
        let values = self.postings.get(&matcher.name);
        let mut refs: BTreeSet<SeriesRef> = BTreeSet::new();

        if let Some(values) = values {
            for (value, ids) in values {
                if matcher.matches(value) {
                    refs.extend(ids.iter().copied());
                }
            }
        }
        if matcher.matches("") {
            let with_label: BTreeSet<SeriesRef> = values
                .map(|v| v.values().flatten().copied().collect())
                .unwrap_or_default();
            refs.extend((0..self.series.len() as SeriesRef).filter(|r| !with_label.contains(r)));
        }
        refs.into_iter().collect()
    }

    /// Intersection of the postings of every matcher; all refs when empty.
    pub fn select(&self, matchers: &[Matcher]) -> Vec<SeriesRef> {
        let mut result: Option<Vec<SeriesRef>> = None;
        for matcher in matchers {
            let refs = self.postings(matcher);
            result = Some(match result {
                None => refs,
                Some(prev) => intersect(&prev, &refs),
            });
        }
        result.unwrap_or_else(|| (0..self.series.len() as SeriesRef).collect())
    }

    pub fn series(&self, r: SeriesRef) -> Option<&Series> {
        self.series.get(r as usize)
    }

    pub fn label_names(&self) -> Vec<String> {
        self.postings.keys().cloned().collect()
    }

    pub fn label_values(&self, name: &str) -> Vec<String> {
        self.postings
            .get(name)
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Intersection of two sorted ref lists
pub fn intersect(a: &[SeriesRef], b: &[SeriesRef]) -> Vec<SeriesRef> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Labels, MatchOp, Sample, METRIC_NAME};

    fn index() -> BlockIndex {
        let series = [
            &[(METRIC_NAME, "up"), ("job", "api")][..],
            &[(METRIC_NAME, "up"), ("job", "db")][..],
            &[(METRIC_NAME, "up")][..],
            &[(METRIC_NAME, "errors"), ("job", "api")][..],
        ]
        .iter()
        .map(|pairs| Series::new(Labels::from_pairs(pairs), vec![Sample::new(1, 1.0)]))
        .collect();
        BlockIndex::build(series)
    }

    fn names(index: &BlockIndex, refs: &[SeriesRef]) -> Vec<String> {
        refs.iter()
            .map(|r| index.series(*r).unwrap().labels.to_string())
            .collect()
    }

    #[test]
    fn test_equal_postings() {
        let index = index();
        let refs = index.select(&[Matcher::equal(METRIC_NAME, "up"), Matcher::equal("job", "api")]);
        assert_eq!(names(&index, &refs), vec![r#"{__name__="up", job="api"}"#]);
    }

    #[test]
    fn test_missing_label_matches_empty_value() {
        let index = index();
        let refs = index.select(&[Matcher::equal(METRIC_NAME, "up"), Matcher::equal("job", "")]);
        assert_eq!(names(&index, &refs), vec![r#"{__name__="up"}"#]);
    }

    #[test]
    fn test_regex_and_negative_postings() {
        let index = index();
        let refs = index.select(&[
            Matcher::new(MatchOp::Regex, "job", "a.*|d.*").unwrap(),
            Matcher::new(MatchOp::NotEqual, METRIC_NAME, "errors").unwrap(),
        ]);
        assert_eq!(refs.len(), 2);
        assert_eq!(index.label_values("job"), vec!["api", "db"]);
        assert_eq!(index.label_names(), vec![METRIC_NAME, "job"]);
        assert_eq!(index.num_samples(), 4);
    }
}
