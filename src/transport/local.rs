//! In-process transport

use super::{Request, RequestHandler, Response, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Dispatches requests to handlers registered under an address.
///
/// Addresses can be marked unreachable or slowed down to simulate
/// network failures.
#[derive(Default)]
pub struct LocalTransport {
    handlers: DashMap<String, Arc<dyn RequestHandler>>,
    unreachable: DashSet<String>,
    delays: DashMap<String, Duration>,
    sent: DashMap<String, AtomicUsize>,
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("handlers", &self.handlers.len())
            .field("unreachable", &self.unreachable.len())
            .finish()
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, addr: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.handlers.insert(addr.into(), handler);
    }

    pub fn deregister(&self, addr: &str) {
        self.handlers.remove(addr);
    }

    pub fn set_unreachable(&self, addr: &str, unreachable: bool) {
        if unreachable {
            self.unreachable.insert(addr.to_string());
        } else {
            self.unreachable.remove(addr);
        }
    }

    /// Delay every request to `addr` before it reaches the handler
    pub fn set_delay(&self, addr: &str, delay: Duration) {
        self.delays.insert(addr.to_string(), delay);
    }

    /// Number of requests dispatched to `addr`, including failed ones
    pub fn requests_sent(&self, addr: &str) -> usize {
        self.sent
            .get(addr)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, addr: &str, request: Request, timeout: Duration) -> Result<Response> {
        self.sent
            .entry(addr.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed);

        if self.unreachable.contains(addr) {
            return Err(Error::Transport(format!("instance {} is unreachable", addr)));
        }
        let handler = self
            .handlers
            .get(addr)
            .map(|h| h.value().clone())
            .ok_or_else(|| Error::Transport(format!("no instance listening at {}", addr)))?;
        let delay = self.delays.get(addr).map(|d| *d.value());

        debug!("Dispatching {} request to {}", request.kind(), addr);
        let call = async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            handler.handle(request).await
        };
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| Error::Timeout)?
    }
}
