use crate::node::NodeId;
use thiserror::Error;

/// Failure of a single node's delegate call.
///
/// These never reach the caller directly: the dispatcher absorbs them,
/// deactivates the offending node where appropriate, and translates them
/// into a [`ClusterError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Derivation replay failed: {0}")]
    Replay(String),

    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Backend call aborted")]
    Aborted,
}

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Cluster exhausted: no active nodes remain")]
    ClusterExhausted,

    #[error("Operation '{method}' failed on all {failed_nodes} targeted nodes: {cause}")]
    OperationFailed {
        method: String,
        failed_nodes: usize,
        cause: BackendError,
    },

    #[error("{0} proxy is already closed")]
    AlreadyClosed(String),

    #[error("Unknown method '{method}' on interface '{interface}'")]
    UnknownMethod { interface: String, method: String },

    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("Node {0} is not inactive")]
    NodeNotInactive(NodeId),

    #[error("Unexpected result from '{method}': {reason}")]
    UnexpectedResult { method: String, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Synchronization of node {node} failed: {cause}")]
    SyncFailed { node: NodeId, cause: BackendError },

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),
}

impl ClusterError {
    /// Number of nodes that failed identically, for total operation failures.
    pub fn failed_nodes(&self) -> Option<usize> {
        match self {
            ClusterError::OperationFailed { failed_nodes, .. } => Some(*failed_nodes),
            _ => None,
        }
    }

    /// Returns `true` if the cluster has no active node left.
    pub fn is_cluster_exhausted(&self) -> bool {
        matches!(self, ClusterError::ClusterExhausted)
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_failed_display_mentions_node_count() {
        let err = ClusterError::OperationFailed {
            method: "execute_update".to_string(),
            failed_nodes: 2,
            cause: BackendError::Backend("syntax error".to_string()),
        };
        let msg = err.to_string();
        assert!(msg.contains("execute_update"));
        assert!(msg.contains("all 2 targeted nodes"));
        assert!(msg.contains("syntax error"));
        assert_eq!(err.failed_nodes(), Some(2));
    }

    #[test]
    fn test_cluster_exhausted_predicate() {
        assert!(ClusterError::ClusterExhausted.is_cluster_exhausted());
        assert!(!ClusterError::AlreadyClosed("session".to_string()).is_cluster_exhausted());
        assert_eq!(ClusterError::ClusterExhausted.failed_nodes(), None);
    }

    #[test]
    fn test_backend_error_equality() {
        assert_eq!(BackendError::Timeout(100), BackendError::Timeout(100));
        assert_ne!(BackendError::Timeout(100), BackendError::Aborted);
    }

    #[test]
    fn test_json_error_conversion() {
        let err: ClusterError = serde_json::from_str::<u64>("nope").unwrap_err().into();
        assert!(matches!(err, ClusterError::JsonSerialization(_)));
    }
}
