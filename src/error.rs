//! Error types for Strata

use std::fmt;

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Strata
#[derive(Debug)]
pub enum Error {
    /// Object store errors
    ObjectStore(object_store::Error),
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Instance unknown, unreachable, or ring unusable
    Membership(String),
    /// A write did not reach enough replicas
    QuorumFailure {
        succeeded: usize,
        required: usize,
        last_error: String,
    },
    /// Too many fan-out sources failed to answer a read
    ReadFailure(String),
    /// Fetched-series cap hit for a single query
    LimitExceeded { limit: usize },
    /// Requested shard size is below the replication factor
    InvalidShardSize {
        requested: usize,
        replication_factor: usize,
    },
    /// Bucket index rebuild failed; the previous manifest stays in effect
    StaleManifest { tenant: String, reason: String },
    /// Query parse or evaluation error
    Query(String),
    /// Transport-level failure talking to a remote instance
    Transport(String),
    /// Block storage error
    Storage(String),
    /// Timeout
    Timeout,
    /// Parent operation cancelled
    Cancelled,
    /// Internal error
    Internal(String),
}

impl Error {
    /// Short, stable label for metric attributes.
    pub fn class(&self) -> &'static str {
        match self {
            Error::ObjectStore(_) => "object_store",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Config(_) => "config",
            Error::Membership(_) => "membership",
            Error::QuorumFailure { .. } => "quorum_failure",
            Error::ReadFailure(_) => "read_failure",
            Error::LimitExceeded { .. } => "limit_exceeded",
            Error::InvalidShardSize { .. } => "invalid_shard_size",
            Error::StaleManifest { .. } => "stale_manifest",
            Error::Query(_) => "query",
            Error::Transport(_) => "transport",
            Error::Storage(_) => "storage",
            Error::Timeout => "timeout",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal",
        }
    }

    /// Errors caused by the request itself rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Error::Query(_) | Error::LimitExceeded { .. })
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::ObjectStore(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ObjectStore(e) => write!(f, "Object store error: {}", e),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Membership(msg) => write!(f, "Membership error: {}", msg),
            Error::QuorumFailure {
                succeeded,
                required,
                last_error,
            } => write!(
                f,
                "Quorum not reached: {} of {} required replicas acknowledged (last error: {})",
                succeeded, required, last_error
            ),
            Error::ReadFailure(msg) => write!(f, "Read failed: {}", msg),
            Error::LimitExceeded { limit } => write!(
                f,
                "the query hit the max number of series limit (limit: {})",
                limit
            ),
            Error::InvalidShardSize {
                requested,
                replication_factor,
            } => write!(
                f,
                "Invalid shard size {}: must be 0 or at least the replication factor {}",
                requested, replication_factor
            ),
            Error::StaleManifest { tenant, reason } => {
                write!(f, "Bucket index for tenant {} is stale: {}", tenant, reason)
            }
            Error::Query(msg) => write!(f, "Query error: {}", msg),
            Error::Transport(msg) => write!(f, "Transport error: {}", msg),
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<object_store::Error> for Error {
    fn from(e: object_store::Error) -> Self {
        Error::ObjectStore(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout
        } else {
            Error::Transport(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_message_mentions_series_limit() {
        let err = Error::LimitExceeded { limit: 3 };
        assert!(err.to_string().contains("max number of series limit"));
        assert!(err.is_user_error());
    }

    #[test]
    fn quorum_failure_is_not_user_error() {
        let err = Error::QuorumFailure {
            succeeded: 1,
            required: 2,
            last_error: "unreachable".to_string(),
        };
        assert_eq!(err.class(), "quorum_failure");
        assert!(!err.is_user_error());
    }
}
