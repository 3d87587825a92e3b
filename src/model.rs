//! Core data model: labels, series, samples, time ranges and matchers

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use twox_hash::{XxHash32, XxHash64};

use crate::{Error, Result};

/// Reserved label holding the metric name.
pub const METRIC_NAME: &str = "__name__";

/// Reserved label used to restrict a selector to one query shard.
pub const QUERY_SHARD_LABEL: &str = "__query_shard__";

const LABEL_SEP: u8 = 0xff;

/// A single label pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// A sorted set of labels with unique names.
///
/// Identity of a series is always the full label set; [`Labels::fingerprint`]
/// is only a routing hint and may collide.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Vec<Label>", into = "Vec<Label>")]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Build a label set; the last value wins for duplicated names, empty values are dropped.
    pub fn new(labels: impl IntoIterator<Item = Label>) -> Self {
        let mut labels: Vec<Label> = labels.into_iter().collect();
        labels.sort_by(|a, b| a.name.cmp(&b.name));
        let mut out: Vec<Label> = Vec::with_capacity(labels.len());
        for label in labels {
            match out.last_mut() {
                Some(last) if last.name == label.name => *last = label,
                _ => out.push(label),
            }
        }
        out.retain(|l| !l.value.is_empty());
        Self(out)
    }

    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self::new(pairs.iter().map(|(n, v)| Label {
            name: n.to_string(),
            value: v.to_string(),
        }))
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy without the named labels.
    pub fn without(&self, names: &[&str]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| !names.contains(&l.name.as_str()))
                .cloned()
                .collect(),
        )
    }

    /// Copy keeping only the named labels.
    pub fn keep(&self, names: &[String]) -> Labels {
        Labels(
            self.0
                .iter()
                .filter(|l| names.iter().any(|n| n == &l.name))
                .cloned()
                .collect(),
        )
    }

    /// 64-bit hash of the label set.
    pub fn fingerprint(&self) -> u64 {
        XxHash64::oneshot(0, &self.hash_bytes(None))
    }

    /// Ring token for this series within a tenant.
    pub fn shard_token(&self, tenant: &str) -> u32 {
        XxHash32::oneshot(0, &self.hash_bytes(Some(tenant)))
    }

    fn hash_bytes(&self, tenant: Option<&str>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(64);
        if let Some(tenant) = tenant {
            buf.extend_from_slice(tenant.as_bytes());
            buf.push(LABEL_SEP);
        }
        for label in &self.0 {
            buf.extend_from_slice(label.name.as_bytes());
            buf.push(LABEL_SEP);
            buf.extend_from_slice(label.value.as_bytes());
            buf.push(LABEL_SEP);
        }
        buf
    }
}

impl From<Vec<Label>> for Labels {
    fn from(labels: Vec<Label>) -> Self {
        Labels::new(labels)
    }
}

impl From<Labels> for Vec<Label> {
    fn from(labels: Labels) -> Self {
        labels.0
    }
}

impl fmt::Display for Labels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={:?}", label.name, label.value)?;
        }
        write!(f, "}}")
    }
}

/// A single sample point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp_ms: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp_ms: i64, value: f64) -> Self {
        Self {
            timestamp_ms,
            value,
        }
    }
}

/// A series with its samples sorted by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub labels: Labels,
    pub samples: Vec<Sample>,
}

impl Series {
    pub fn new(labels: Labels, samples: Vec<Sample>) -> Self {
        Self { labels, samples }
    }
}

/// Inclusive millisecond time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(TimeRange { start, end })
    }
}

/// Label matching operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl MatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regex => "=~",
            MatchOp::NotRegex => "!~",
        }
    }
}

/// A label matcher. Regular expressions are fully anchored and a missing
/// label matches as the empty string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
    #[serde(skip)]
    compiled: OnceLock<Option<Regex>>,
}

impl Matcher {
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let matcher = Self {
            name: name.into(),
            op,
            value: value.into(),
            compiled: OnceLock::new(),
        };
        if matches!(op, MatchOp::Regex | MatchOp::NotRegex) && matcher.regex().is_none() {
            return Err(Error::Query(format!(
                "invalid regular expression {:?} for label {}",
                matcher.value, matcher.name
            )));
        }
        Ok(matcher)
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op: MatchOp::Equal,
            value: value.into(),
            compiled: OnceLock::new(),
        }
    }

    fn regex(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| Regex::new(&format!("^(?:{})$", self.value)).ok())
            .as_ref()
    }

    pub fn matches(&self, value: &str) -> bool {
        match self.op {
            MatchOp::Equal => value == self.value,
            MatchOp::NotEqual => value != self.value,
            MatchOp::Regex => self.regex().is_some_and(|re| re.is_match(value)),
            MatchOp::NotRegex => !self.regex().is_some_and(|re| re.is_match(value)),
        }
    }

    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.get(&self.name).unwrap_or(""))
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.op == other.op && self.value == other.value
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.op.as_str(), self.value)
    }
}

/// Restricts a selection to series with `fingerprint % count == index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSelector {
    pub index: u64,
    pub count: u64,
}

impl ShardSelector {
    pub fn label_value(&self) -> String {
        format!("{}_of_{}", self.index, self.count)
    }

    pub fn matcher(&self) -> Matcher {
        Matcher::equal(QUERY_SHARD_LABEL, self.label_value())
    }

    pub fn contains(&self, labels: &Labels) -> bool {
        self.count <= 1 || labels.fingerprint() % self.count == self.index
    }

    fn parse(value: &str) -> Result<Self> {
        let parsed = value.split_once("_of_").and_then(|(i, n)| {
            let index = i.parse::<u64>().ok()?;
            let count = n.parse::<u64>().ok()?;
            (count > 0 && index < count).then_some(Self { index, count })
        });
        parsed.ok_or_else(|| Error::Query(format!("invalid query shard selector {:?}", value)))
    }
}

/// Label matchers with the query shard selector split out.
#[derive(Debug, Clone, Default)]
pub struct SeriesFilter {
    pub matchers: Vec<Matcher>,
    pub shard: Option<ShardSelector>,
}

impl SeriesFilter {
    pub fn new(matchers: &[Matcher]) -> Result<Self> {
        let mut filter = SeriesFilter::default();
        for matcher in matchers {
            if matcher.name == QUERY_SHARD_LABEL && matcher.op == MatchOp::Equal {
                filter.shard = Some(ShardSelector::parse(&matcher.value)?);
            } else {
                filter.matchers.push(matcher.clone());
            }
        }
        Ok(filter)
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.matchers.iter().all(|m| m.matches_labels(labels))
            && self.shard.map_or(true, |s| s.contains(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_deduplicated() {
        let labels = Labels::from_pairs(&[("job", "a"), (METRIC_NAME, "up"), ("job", "b"), ("x", "")]);
        let names: Vec<&str> = labels.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec![METRIC_NAME, "job"]);
        assert_eq!(labels.get("job"), Some("b"));
        assert_eq!(labels.metric_name(), Some("up"));
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = Labels::from_pairs(&[("a", "1"), ("b", "2")]);
        let b = Labels::from_pairs(&[("b", "2"), ("a", "1")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.shard_token("t"), b.shard_token("t"));
        assert_ne!(a.shard_token("t1"), a.shard_token("t2"));
    }

    #[test]
    fn test_regex_matcher_is_anchored() {
        let m = Matcher::new(MatchOp::Regex, METRIC_NAME, "series_.+").unwrap();
        assert!(m.matches("series_1"));
        assert!(!m.matches("my_series_1"));
        assert!(Matcher::new(MatchOp::Regex, "a", "(").is_err());
    }

    #[test]
    fn test_missing_label_matches_empty() {
        let labels = Labels::from_pairs(&[(METRIC_NAME, "up")]);
        assert!(Matcher::equal("job", "").matches_labels(&labels));
        assert!(Matcher::new(MatchOp::NotEqual, "job", "x").unwrap().matches_labels(&labels));
    }

    #[test]
    fn test_shard_filter_partitions_series() {
        let series: Vec<Labels> = (0..50)
            .map(|i| Labels::from_pairs(&[(METRIC_NAME, "m"), ("i", &i.to_string())]))
            .collect();
        let mut total = 0;
        for index in 0..4 {
            let selector = ShardSelector { index, count: 4 };
            let filter = SeriesFilter::new(&[selector.matcher()]).unwrap();
            total += series.iter().filter(|l| filter.matches(l)).count();
        }
        assert_eq!(total, series.len());
    }

    #[test]
    fn test_time_range_intersect() {
        let a = TimeRange::new(0, 10);
        assert_eq!(a.intersect(&TimeRange::new(5, 20)), Some(TimeRange::new(5, 10)));
        assert_eq!(a.intersect(&TimeRange::new(11, 20)), None);
    }
}
