//! Immutable ring views
//!
//! A [`RingSnapshot`] never changes after it is built. Lookups against one
//! snapshot are deterministic: health is evaluated once, when the snapshot is
//! published, rather than on every lookup.

use super::instance::InstanceDesc;
use crate::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Sorted tokens with their owning instance IDs.
#[derive(Debug, Default)]
pub struct TokenTable {
    tokens: Vec<u32>,
    owners: Vec<Arc<str>>,
}

impl TokenTable {
    pub(crate) fn build<'a>(instances: impl IntoIterator<Item = &'a InstanceDesc>) -> Self {
        let mut entries: Vec<(u32, Arc<str>)> = Vec::new();
        for desc in instances {
            let owner: Arc<str> = Arc::from(desc.id.as_str());
            entries.extend(desc.tokens.iter().map(|t| (*t, owner.clone())));
        }
        entries.sort_unstable_by_key(|(t, _)| *t);
        let (tokens, owners) = entries.into_iter().unzip();
        Self { tokens, owners }
    }

    fn retain(&self, keep: &HashSet<String>) -> Self {
        let (tokens, owners) = self
            .tokens
            .iter()
            .zip(self.owners.iter())
            .filter(|(_, owner)| keep.contains::<str>(owner))
            .map(|(t, o)| (*t, o.clone()))
            .unzip();
        Self { tokens, owners }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Owners clockwise from the first token at or after `key`, wrapping once.
    fn walk(&self, key: u32) -> impl Iterator<Item = &str> + '_ {
        let len = self.tokens.len();
        let start = match self.tokens.partition_point(|t| *t < key) {
            i if i == len => 0,
            i => i,
        };
        (0..len).map(move |offset| &*self.owners[(start + offset) % len])
    }
}

/// Ordered, deduplicated instances selected for a key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSet {
    pub instances: Vec<InstanceDesc>,
    /// Number of instances allowed to fail before the operation fails
    pub max_errors: usize,
}

impl ReplicaSet {
    pub fn new(instances: Vec<InstanceDesc>) -> Self {
        Self {
            instances,
            max_errors: 0,
        }
    }

    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors;
        self
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn ids(&self) -> Vec<&str> {
        self.instances.iter().map(|i| i.id.as_str()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.iter().any(|i| i.id == id)
    }
}

/// An immutable, versioned view of ring membership.
#[derive(Debug)]
pub struct RingSnapshot {
    version: u64,
    instances: BTreeMap<String, InstanceDesc>,
    tokens: Arc<TokenTable>,
    eligible: HashSet<String>,
    /// Earliest time an eligible instance misses its heartbeat deadline
    expires_at_ms: Option<i64>,
}

impl RingSnapshot {
    pub(crate) fn build(
        version: u64,
        instances: BTreeMap<String, InstanceDesc>,
        tokens: Arc<TokenTable>,
        now_ms: i64,
        heartbeat_timeout_ms: i64,
    ) -> Self {
        let eligible: HashSet<String> = instances
            .values()
            .filter(|d| !d.tokens.is_empty() && d.is_eligible(now_ms, heartbeat_timeout_ms))
            .map(|d| d.id.clone())
            .collect();
        let expires_at_ms = eligible
            .iter()
            .filter_map(|id| instances.get(id))
            .map(|d| d.heartbeat_ms.saturating_add(heartbeat_timeout_ms))
            .min();
        Self {
            version,
            instances,
            tokens,
            eligible,
            expires_at_ms,
        }
    }

    /// Build a standalone snapshot, mostly useful in tests and simulations.
    pub fn from_instances(
        version: u64,
        instances: Vec<InstanceDesc>,
        now_ms: i64,
        heartbeat_timeout_ms: i64,
    ) -> Self {
        let instances: BTreeMap<String, InstanceDesc> =
            instances.into_iter().map(|d| (d.id.clone(), d)).collect();
        let tokens = Arc::new(TokenTable::build(instances.values()));
        Self::build(version, instances, tokens, now_ms, heartbeat_timeout_ms)
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn expires_at_ms(&self) -> Option<i64> {
        self.expires_at_ms
    }

    #[cfg(test)]
    pub(crate) fn token_table(&self) -> &Arc<TokenTable> {
        &self.tokens
    }

    pub(crate) fn eligible_ids(&self) -> &HashSet<String> {
        &self.eligible
    }

    /// Whether both snapshots share the same token table allocation.
    pub fn shares_tokens_with(&self, other: &RingSnapshot) -> bool {
        Arc::ptr_eq(&self.tokens, &other.tokens)
    }

    pub fn instance(&self, id: &str) -> Option<&InstanceDesc> {
        self.instances.get(id)
    }

    /// All registered instances, eligible or not, ordered by ID.
    pub fn instances(&self) -> impl Iterator<Item = &InstanceDesc> {
        self.instances.values()
    }

    pub fn is_healthy(&self, id: &str) -> bool {
        self.eligible.contains(id)
    }

    pub fn healthy_count(&self) -> usize {
        self.eligible.len()
    }

    /// Every eligible instance, ordered by ID.
    pub fn healthy_instances(&self) -> ReplicaSet {
        ReplicaSet::new(
            self.instances
                .values()
                .filter(|d| self.eligible.contains(&d.id))
                .cloned()
                .collect(),
        )
    }

    /// Resolve `key` to `min(n, healthy)` distinct eligible instances by
    /// walking clockwise from the first token at or after `key`.
    pub fn get(&self, key: u32, n: usize) -> Result<ReplicaSet> {
        if self.eligible.is_empty() {
            return Err(Error::Membership(
                "no healthy instances in the ring".to_string(),
            ));
        }
        let want = n.min(self.eligible.len());
        let mut ids: Vec<&str> = Vec::with_capacity(want);
        for owner in self.tokens.walk(key) {
            if ids.len() == want {
                break;
            }
            if self.eligible.contains(owner) && !ids.contains(&owner) {
                ids.push(owner);
            }
        }
        Ok(ReplicaSet::new(
            ids.into_iter()
                .filter_map(|id| self.instances.get(id).cloned())
                .collect(),
        ))
    }

    /// Registered instances holding tokens, healthy or not.
    pub fn member_count(&self) -> usize {
        self.instances.values().filter(|d| !d.tokens.is_empty()).count()
    }

    /// First token owner at or after `key` that `skip` does not reject.
    /// Health is ignored.
    pub(crate) fn first_member_after(&self, key: u32, skip: impl Fn(&str) -> bool) -> Option<&str> {
        self.tokens.walk(key).find(|owner| !skip(*owner))
    }

    /// A ring restricted to `ids`. Keeps this snapshot's version and health.
    pub fn subring(&self, ids: &HashSet<String>) -> RingSnapshot {
        let instances = self
            .instances
            .iter()
            .filter(|(id, _)| ids.contains(*id))
            .map(|(id, d)| (id.clone(), d.clone()))
            .collect();
        let eligible = self
            .eligible
            .iter()
            .filter(|id| ids.contains(*id))
            .cloned()
            .collect();
        RingSnapshot {
            version: self.version,
            instances,
            tokens: Arc::new(self.tokens.retain(ids)),
            eligible,
            expires_at_ms: self.expires_at_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::instance::InstanceState;

    fn desc(id: &str, tokens: Vec<u32>) -> InstanceDesc {
        InstanceDesc {
            id: id.to_string(),
            addr: format!("{}:9095", id),
            state: InstanceState::Active,
            heartbeat_ms: 0,
            tokens,
        }
    }

    fn snapshot() -> RingSnapshot {
        RingSnapshot::from_instances(
            1,
            vec![
                desc("a", vec![100, 400]),
                desc("b", vec![200, 500]),
                desc("c", vec![300, 600]),
            ],
            0,
            60_000,
        )
    }

    #[test]
    fn test_get_walks_clockwise_from_key() {
        let ring = snapshot();
        assert_eq!(ring.get(150, 2).unwrap().ids(), vec!["b", "c"]);
        assert_eq!(ring.get(300, 3).unwrap().ids(), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_get_wraps_around() {
        let ring = snapshot();
        assert_eq!(ring.get(601, 1).unwrap().ids(), vec!["a"]);
        assert_eq!(ring.get(u32::MAX, 2).unwrap().ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_get_caps_at_healthy_count() {
        let ring = snapshot();
        assert_eq!(ring.get(0, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_get_skips_ineligible_instances() {
        let mut leaving = desc("b", vec![200, 500]);
        leaving.state = InstanceState::Leaving;
        let ring = RingSnapshot::from_instances(
            1,
            vec![desc("a", vec![100, 400]), leaving, desc("c", vec![300, 600])],
            0,
            60_000,
        );
        assert_eq!(ring.get(150, 2).unwrap().ids(), vec!["c", "a"]);
    }

    #[test]
    fn test_get_on_empty_ring_fails() {
        let ring = RingSnapshot::from_instances(1, vec![], 0, 60_000);
        assert!(matches!(ring.get(1, 1), Err(Error::Membership(_))));
    }

    #[test]
    fn test_subring_only_resolves_members() {
        let ring = snapshot();
        let keep: HashSet<String> = ["a".to_string(), "c".to_string()].into_iter().collect();
        let sub = ring.subring(&keep);
        assert_eq!(sub.version(), ring.version());
        assert_eq!(sub.get(150, 2).unwrap().ids(), vec!["c", "a"]);
        assert!(sub.instance("b").is_none());
    }

    #[test]
    fn test_member_count_includes_unhealthy() {
        let mut stale = desc("b", vec![200, 500]);
        stale.heartbeat_ms = -120_000;
        let ring = RingSnapshot::from_instances(
            1,
            vec![desc("a", vec![100, 400]), stale, desc("c", vec![300, 600])],
            0,
            60_000,
        );
        assert_eq!(ring.healthy_count(), 2);
        assert_eq!(ring.member_count(), 3);
        assert_eq!(ring.first_member_after(150, |_| false), Some("b"));
    }

    #[test]
    fn test_expiry_tracks_earliest_heartbeat() {
        let mut early = desc("a", vec![1]);
        early.heartbeat_ms = 1_000;
        let mut late = desc("b", vec![2]);
        late.heartbeat_ms = 5_000;
        let ring = RingSnapshot::from_instances(1, vec![early, late], 5_000, 60_000);
        assert_eq!(ring.expires_at_ms(), Some(61_000));
    }
}
