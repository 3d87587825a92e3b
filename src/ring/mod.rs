//! Consistent-hash membership ring
//!
//! Tracks instances and their tokens and resolves keys to replica sets.
//! Every mutation publishes a new immutable [`RingSnapshot`]; readers keep
//! whatever snapshot they loaded for the duration of a lookup.

pub mod instance;
pub mod lifecycle;
pub mod shard;
pub mod snapshot;
pub mod tokens;

pub use instance::{InstanceDesc, InstanceState};
pub use lifecycle::RingLifecycler;
pub use shard::{DefaultShardStrategy, ShardStrategy, ShardingStrategy, ShuffleShardStrategy};
pub use snapshot::{ReplicaSet, RingSnapshot, TokenTable};
pub use tokens::{generate_tokens, hash_key};

use crate::clock::Clock;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default number of tokens claimed by each instance
pub const DEFAULT_TOKENS_PER_INSTANCE: usize = 512;

/// Ring configuration
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Instances without a heartbeat for this long are skipped by lookups
    pub heartbeat_timeout: Duration,
    /// Instances without a heartbeat for this long are removed
    pub forget_period: Duration,
    /// Tokens claimed per instance on first registration
    pub tokens_per_instance: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            forget_period: Duration::from_secs(600),
            tokens_per_instance: DEFAULT_TOKENS_PER_INSTANCE,
        }
    }
}

/// Mutable registry behind the published snapshots
struct Registry {
    instances: BTreeMap<String, InstanceDesc>,
    tokens: Arc<TokenTable>,
    version: u64,
}

impl Registry {
    fn tokens_owned_by_others(&self, id: &str) -> HashSet<u32> {
        self.instances
            .values()
            .filter(|d| d.id != id)
            .flat_map(|d| d.tokens.iter().copied())
            .collect()
    }
}

/// The membership ring for one tier (ingesters or store-gateways)
pub struct HashRing {
    /// Ring name, used in logs
    name: String,
    config: RingConfig,
    clock: Arc<dyn Clock>,
    registry: Mutex<Registry>,
    current: RwLock<Arc<RingSnapshot>>,
}

impl std::fmt::Debug for HashRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashRing")
            .field("name", &self.name)
            .field("version", &self.current.read().version())
            .finish()
    }
}

impl HashRing {
    /// Create an empty ring
    pub fn new(name: impl Into<String>, config: RingConfig, clock: Arc<dyn Clock>) -> Self {
        let tokens = Arc::new(TokenTable::default());
        let empty = RingSnapshot::build(0, BTreeMap::new(), tokens.clone(), 0, 0);
        Self {
            name: name.into(),
            config,
            clock,
            registry: Mutex::new(Registry {
                instances: BTreeMap::new(),
                tokens,
                version: 0,
            }),
            current: RwLock::new(Arc::new(empty)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    fn heartbeat_timeout_ms(&self) -> i64 {
        self.config.heartbeat_timeout.as_millis() as i64
    }

    /// Register an instance, or refresh an existing registration.
    ///
    /// An instance that already owns tokens keeps them, so a restarting
    /// instance comes back with the same key ranges. Otherwise the tokens in
    /// `desc` are used if present, or `token_count` fresh ones are generated.
    pub fn register(&self, mut desc: InstanceDesc, token_count: usize) -> Result<Arc<RingSnapshot>> {
        let mut registry = self.registry.lock();
        let existing = registry
            .instances
            .get(&desc.id)
            .filter(|d| !d.tokens.is_empty())
            .map(|d| d.tokens.clone());

        let tokens_changed = match existing {
            Some(tokens) => {
                debug!(
                    "Instance {} re-registered in ring {}, keeping {} tokens",
                    desc.id,
                    self.name,
                    tokens.len()
                );
                desc.tokens = tokens;
                false
            }
            None if !desc.tokens.is_empty() => {
                Self::check_token_conflicts(&registry, &mut desc)?;
                true
            }
            None => {
                let taken = registry.tokens_owned_by_others(&desc.id);
                desc.tokens = generate_tokens(token_count, &taken);
                true
            }
        };

        desc.heartbeat_ms = self.clock.now_millis();
        info!(
            "Registering instance {} at {} in ring {} ({})",
            desc.id,
            desc.addr,
            self.name,
            desc.state.as_str()
        );
        registry.instances.insert(desc.id.clone(), desc);
        Ok(self.publish(&mut registry, tokens_changed, true))
    }

    /// Register an instance with explicit tokens. Fails if any token is
    /// already owned by another instance.
    pub fn register_with_tokens(&self, mut desc: InstanceDesc) -> Result<Arc<RingSnapshot>> {
        let mut registry = self.registry.lock();
        Self::check_token_conflicts(&registry, &mut desc)?;
        desc.heartbeat_ms = self.clock.now_millis();
        info!(
            "Registering instance {} at {} in ring {} with {} explicit tokens",
            desc.id,
            desc.addr,
            self.name,
            desc.tokens.len()
        );
        registry.instances.insert(desc.id.clone(), desc);
        Ok(self.publish(&mut registry, true, true))
    }

    fn check_token_conflicts(registry: &Registry, desc: &mut InstanceDesc) -> Result<()> {
        desc.tokens.sort_unstable();
        desc.tokens.dedup();
        let taken = registry.tokens_owned_by_others(&desc.id);
        if let Some(token) = desc.tokens.iter().find(|t| taken.contains(t)) {
            return Err(Error::Membership(format!(
                "token {} requested by {} is already owned by another instance",
                token, desc.id
            )));
        }
        Ok(())
    }

    /// Record a heartbeat. Only republishes when the instance was not
    /// healthy in the current snapshot.
    pub fn heartbeat(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        let now = self.clock.now_millis();
        let desc = registry
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::Membership(format!("heartbeat from unknown instance {}", id)))?;
        desc.heartbeat_ms = now;
        let should_be_healthy = desc.state == InstanceState::Active && !desc.tokens.is_empty();

        if should_be_healthy && !self.current.read().is_healthy(id) {
            info!("Instance {} in ring {} is healthy again", id, self.name);
            self.publish(&mut registry, false, false);
        }
        Ok(())
    }

    /// Change an instance's lifecycle state.
    pub fn set_state(&self, id: &str, state: InstanceState) -> Result<()> {
        let mut registry = self.registry.lock();
        let now = self.clock.now_millis();
        let desc = registry
            .instances
            .get_mut(id)
            .ok_or_else(|| Error::Membership(format!("unknown instance {}", id)))?;
        if desc.state == state {
            return Ok(());
        }
        info!(
            "Instance {} in ring {}: {} -> {}",
            id,
            self.name,
            desc.state.as_str(),
            state.as_str()
        );
        desc.state = state;
        desc.heartbeat_ms = now;
        self.publish(&mut registry, false, true);
        Ok(())
    }

    /// Mark an instance as leaving. Its tokens stay claimed but lookups skip it.
    pub fn leave(&self, id: &str) -> Result<()> {
        self.set_state(id, InstanceState::Leaving)
    }

    /// Remove an instance and release its tokens to their ring successors.
    pub fn unregister(&self, id: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.instances.remove(id).is_none() {
            return Err(Error::Membership(format!("unknown instance {}", id)));
        }
        info!("Unregistered instance {} from ring {}", id, self.name);
        self.publish(&mut registry, true, true);
        Ok(())
    }

    /// The current snapshot. Republishes first if a heartbeat deadline
    /// captured by the current snapshot has passed.
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        let now = self.clock.now_millis();
        {
            let current = self.current.read();
            if current.expires_at_ms().map_or(true, |at| now <= at) {
                return current.clone();
            }
        }
        let mut registry = self.registry.lock();
        let current = self.current.read().clone();
        if current.expires_at_ms().map_or(true, |at| now <= at) {
            return current;
        }
        self.publish(&mut registry, false, false)
    }

    /// Resolve `key` against the current snapshot.
    pub fn get(&self, key: u32, n: usize) -> Result<ReplicaSet> {
        self.snapshot().get(key, n)
    }

    /// Forget instances past the forget period and republish health.
    /// Returns the number of forgotten instances.
    pub fn check_health(&self) -> usize {
        let mut registry = self.registry.lock();
        let now = self.clock.now_millis();
        let forget_ms = self.config.forget_period.as_millis() as i64;
        let stale: Vec<String> = registry
            .instances
            .values()
            .filter(|d| !d.is_heartbeating(now, forget_ms))
            .map(|d| d.id.clone())
            .collect();

        for id in &stale {
            warn!(
                "Instance {} in ring {} missed heartbeats for over {:?}, forgetting it",
                id, self.name, self.config.forget_period
            );
            registry.instances.remove(id);
        }
        self.publish(&mut registry, !stale.is_empty(), !stale.is_empty());
        stale.len()
    }

    /// Run periodic health checks until `cancel` fires
    pub async fn run_health_checks(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let forgotten = self.check_health();
                    if forgotten > 0 {
                        debug!("Ring {} forgot {} instances", self.name, forgotten);
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("Ring {} health checks shutting down", self.name);
                    break;
                }
            }
        }
    }

    /// Build and publish a snapshot from the registry. The version only moves
    /// when tokens, states or the set of healthy instances change.
    fn publish(
        &self,
        registry: &mut Registry,
        tokens_changed: bool,
        membership_changed: bool,
    ) -> Arc<RingSnapshot> {
        if tokens_changed {
            registry.tokens = Arc::new(TokenTable::build(registry.instances.values()));
        }
        let now = self.clock.now_millis();
        let mut current = self.current.write();
        let candidate = RingSnapshot::build(
            registry.version,
            registry.instances.clone(),
            registry.tokens.clone(),
            now,
            self.heartbeat_timeout_ms(),
        );

        let candidate = if tokens_changed
            || membership_changed
            || candidate.eligible_ids() != current.eligible_ids()
        {
            registry.version += 1;
            debug!(
                "Ring {} published version {} ({} healthy of {} instances)",
                self.name,
                registry.version,
                candidate.healthy_count(),
                registry.instances.len()
            );
            candidate.with_version(registry.version)
        } else {
            candidate
        };

        let snapshot = Arc::new(candidate);
        *current = snapshot.clone();
        snapshot
    }
}
