use hasql_common::{BackendError, Node, NodeId};
use serde::Serialize;
use std::fmt;
use std::time::SystemTime;

/// Reason why a node is inactive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeactivationCause {
    /// A dispatched call failed on this node while others succeeded
    Failure(BackendError),
    /// The node could not be reached when the cluster was built or probed
    Unreachable(BackendError),
    /// Removed by an operator - never auto-reactivated
    Manual,
}

impl DeactivationCause {
    pub fn is_manual(&self) -> bool {
        matches!(self, DeactivationCause::Manual)
    }
}

impl fmt::Display for DeactivationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeactivationCause::Failure(err) => write!(f, "failure: {}", err),
            DeactivationCause::Unreachable(err) => write!(f, "unreachable: {}", err),
            DeactivationCause::Manual => f.write_str("manual"),
        }
    }
}

/// Record kept for every inactive node
#[derive(Debug, Clone, PartialEq)]
pub struct Deactivation {
    pub cause: DeactivationCause,
    pub at: SystemTime,
}

impl Deactivation {
    pub fn new(cause: DeactivationCause) -> Self {
        Self {
            cause,
            at: SystemTime::now(),
        }
    }

    fn at_ms(&self) -> u64 {
        self.at
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Point-in-time view of one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub url: String,
    pub weight: u32,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivated_at_ms: Option<u64>,
}

impl NodeStatus {
    pub fn active(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            url: node.params.url.clone(),
            weight: node.weight,
            active: true,
            cause: None,
            deactivated_at_ms: None,
        }
    }

    pub fn inactive(node: &Node, deactivation: &Deactivation) -> Self {
        Self {
            active: false,
            cause: Some(deactivation.cause.to_string()),
            deactivated_at_ms: Some(deactivation.at_ms()),
            ..Self::active(node)
        }
    }
}

/// Serializable snapshot of cluster membership
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    pub active: usize,
    pub inactive: usize,
    pub nodes: Vec<NodeStatus>,
}

impl ClusterStatus {
    pub fn is_exhausted(&self) -> bool {
        self.active == 0
    }
}
