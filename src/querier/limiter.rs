//! Cap on distinct series fetched by one query

use crate::model::Labels;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Counts distinct label sets across every source of one user query,
/// including all of its shard sub-queries.
#[derive(Debug, Default)]
pub struct SeriesLimiter {
    limit: usize,
    seen: Mutex<HashSet<Labels>>,
}

impl SeriesLimiter {
    /// `limit` 0 disables the cap
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Record a fetched series; fails once the limit is exceeded.
    pub fn add(&self, labels: &Labels) -> Result<()> {
        if self.limit == 0 {
            return Ok(());
        }
        let mut seen = self.seen.lock();
        if !seen.contains(labels) {
            seen.insert(labels.clone());
        }
        if seen.len() > self.limit {
            return Err(Error::LimitExceeded { limit: self.limit });
        }
        Ok(())
    }

    /// Distinct series recorded so far (always 0 when disabled)
    pub fn fetched(&self) -> usize {
        self.seen.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(i: usize) -> Labels {
        Labels::from_pairs(&[("i", &i.to_string())])
    }

    #[test]
    fn test_counts_distinct_series() {
        let limiter = SeriesLimiter::new(3);
        for i in 0..3 {
            limiter.add(&labels(i)).unwrap();
            limiter.add(&labels(i)).unwrap();
        }
        assert_eq!(limiter.fetched(), 3);
        assert!(matches!(
            limiter.add(&labels(3)),
            Err(Error::LimitExceeded { limit: 3 })
        ));
    }

    #[test]
    fn test_zero_is_unlimited() {
        let limiter = SeriesLimiter::new(0);
        for i in 0..100 {
            limiter.add(&labels(i)).unwrap();
        }
    }
}
