//! Per-tenant limits and overrides
//!
//! Every tenant starts from the default [`Limits`]; individual tenants can be
//! overridden at runtime.

use dashmap::DashMap;
use std::time::Duration;

/// Limits applied to one tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Distinct series a single query may fetch (0 = unlimited)
    pub max_fetched_series_per_query: usize,
    /// Ingesters in the tenant's shard (0 = full ring)
    pub ingestion_tenant_shard_size: usize,
    /// Store-gateways in the tenant's shard (0 = full ring)
    pub store_gateway_tenant_shard_size: usize,
    /// Rule evaluation runs this far in the past
    pub evaluation_delay: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_fetched_series_per_query: 0,
            ingestion_tenant_shard_size: 0,
            store_gateway_tenant_shard_size: 0,
            evaluation_delay: Duration::ZERO,
        }
    }
}

/// Limits service with per-tenant overrides
#[derive(Debug, Default)]
pub struct Overrides {
    defaults: Limits,
    tenants: DashMap<String, Limits>,
}

impl Overrides {
    pub fn new(defaults: Limits) -> Self {
        Self {
            defaults,
            tenants: DashMap::new(),
        }
    }

    pub fn defaults(&self) -> &Limits {
        &self.defaults
    }

    /// Set custom limits for a tenant
    pub fn set_tenant_limits(&self, tenant: &str, limits: Limits) {
        self.tenants.insert(tenant.to_string(), limits);
    }

    /// Drop a tenant's overrides, reverting it to the defaults
    pub fn clear_tenant_limits(&self, tenant: &str) {
        self.tenants.remove(tenant);
    }

    pub fn for_tenant(&self, tenant: &str) -> Limits {
        self.tenants
            .get(tenant)
            .map(|l| l.clone())
            .unwrap_or_else(|| self.defaults.clone())
    }

    pub fn max_fetched_series_per_query(&self, tenant: &str) -> usize {
        self.for_tenant(tenant).max_fetched_series_per_query
    }

    pub fn ingestion_tenant_shard_size(&self, tenant: &str) -> usize {
        self.for_tenant(tenant).ingestion_tenant_shard_size
    }

    pub fn store_gateway_tenant_shard_size(&self, tenant: &str) -> usize {
        self.for_tenant(tenant).store_gateway_tenant_shard_size
    }

    pub fn evaluation_delay(&self, tenant: &str) -> Duration {
        self.for_tenant(tenant).evaluation_delay
    }
}
