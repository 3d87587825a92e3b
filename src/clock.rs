//! Clock sources
//!
//! Ring heartbeats, source selection and manifest timestamps all read time
//! through [`Clock`] so that tests can drive time explicitly.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Millisecond wall clock.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// A clock source that guarantees monotonically increasing timestamps.
#[derive(Debug, Default)]
pub struct SystemClock {
    /// High-water mark: the largest timestamp we've ever returned (millis)
    high_water_ms: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    /// If the wall clock has gone backward (e.g. NTP adjustment), returns
    /// the previous high-water mark instead.
    fn now_millis(&self) -> i64 {
        let wall = Utc::now().timestamp_millis();
        loop {
            let prev = self.high_water_ms.load(Ordering::Acquire);
            let ts = wall.max(prev);
            match self.high_water_ms.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue,
            }
        }
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::Acquire)
    }
}
