//! Request transport between components
//!
//! Instances are reached only through [`Transport::send`]. Two
//! implementations exist: [`LocalTransport`] dispatches to in-process
//! handlers (single-process clusters and tests), [`HttpTransport`] posts JSON
//! to a remote instance's RPC router.

pub mod http;
pub mod local;

pub use http::{rpc_router, HttpTransport};
pub use local::LocalTransport;

use crate::model::{Matcher, Series, TimeRange};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A request sent to an ingester or store-gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Append series to the tenant's head
    Push { tenant: String, series: Vec<Series> },
    /// Select series matching all matchers within the range
    Select {
        tenant: String,
        range: TimeRange,
        matchers: Vec<Matcher>,
        /// Blocks to read; only meaningful for store-gateways
        block_ids: Option<Vec<String>>,
    },
    /// Label names of series matching the matchers within the range
    LabelNames {
        tenant: String,
        range: TimeRange,
        matchers: Vec<Matcher>,
        block_ids: Option<Vec<String>>,
    },
    /// Values of one label for series matching the matchers within the range
    LabelValues {
        tenant: String,
        name: String,
        range: TimeRange,
        matchers: Vec<Matcher>,
        block_ids: Option<Vec<String>>,
    },
}

impl Request {
    pub fn tenant(&self) -> &str {
        match self {
            Request::Push { tenant, .. }
            | Request::Select { tenant, .. }
            | Request::LabelNames { tenant, .. }
            | Request::LabelValues { tenant, .. } => tenant,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Push { .. } => "push",
            Request::Select { .. } => "select",
            Request::LabelNames { .. } => "label_names",
            Request::LabelValues { .. } => "label_values",
        }
    }

    /// Copy of a read request restricted to `block_ids`.
    pub fn for_blocks(&self, ids: Vec<String>) -> Request {
        let mut request = self.clone();
        match &mut request {
            Request::Select { block_ids, .. }
            | Request::LabelNames { block_ids, .. }
            | Request::LabelValues { block_ids, .. } => *block_ids = Some(ids),
            Request::Push { .. } => {}
        }
        request
    }
}

/// A response from an ingester or store-gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ack,
    Series {
        series: Vec<Series>,
        /// Blocks actually read by a store-gateway
        #[serde(default)]
        queried_blocks: Vec<String>,
    },
    Strings {
        values: Vec<String>,
        #[serde(default)]
        queried_blocks: Vec<String>,
    },
}

impl Response {
    pub fn queried_blocks(&self) -> &[String] {
        match self {
            Response::Ack => &[],
            Response::Series { queried_blocks, .. } | Response::Strings { queried_blocks, .. } => {
                queried_blocks
            }
        }
    }
}

/// Sends requests to instances by address
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    async fn send(&self, addr: &str, request: Request, timeout: Duration) -> Result<Response>;
}

/// Serves requests on an instance
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Response>;
}
