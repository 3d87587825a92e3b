//! Ring instance descriptors

use serde::{Deserialize, Serialize};

/// Lifecycle state of a ring member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    /// Registered, tokens claimed, not yet serving
    Joining,
    /// Serving reads and writes
    Active,
    /// Shutting down; skipped by lookups
    Leaving,
    /// Gone but not yet forgotten
    Left,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Joining => "joining",
            Self::Active => "active",
            Self::Leaving => "leaving",
            Self::Left => "left",
        }
    }
}

/// A member of the ring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDesc {
    /// Instance ID (unique identifier)
    pub id: String,
    /// Address requests are sent to
    pub addr: String,
    /// Lifecycle state
    pub state: InstanceState,
    /// Last heartbeat, milliseconds since the epoch
    pub heartbeat_ms: i64,
    /// Sorted tokens owned by this instance
    pub tokens: Vec<u32>,
}

impl InstanceDesc {
    /// Create a new descriptor in the `Joining` state with no tokens
    pub fn new(id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            addr: addr.into(),
            state: InstanceState::Joining,
            heartbeat_ms: 0,
            tokens: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: InstanceState) -> Self {
        self.state = state;
        self
    }

    /// Whether the instance was heartbeating at `now_ms`
    pub fn is_heartbeating(&self, now_ms: i64, timeout_ms: i64) -> bool {
        now_ms.saturating_sub(self.heartbeat_ms) <= timeout_ms
    }

    /// Whether lookups may return this instance at `now_ms`
    pub fn is_eligible(&self, now_ms: i64, timeout_ms: i64) -> bool {
        self.state == InstanceState::Active && self.is_heartbeating(now_ms, timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_active_heartbeating_instances_are_eligible() {
        let mut desc = InstanceDesc::new("ingester-1", "ingester-1:9095");
        desc.heartbeat_ms = 1_000;
        assert!(!desc.is_eligible(1_000, 60_000));

        desc.state = InstanceState::Active;
        assert!(desc.is_eligible(61_000, 60_000));
        assert!(!desc.is_eligible(61_001, 60_000));

        desc.state = InstanceState::Leaving;
        assert!(!desc.is_eligible(1_000, 60_000));
    }
}
