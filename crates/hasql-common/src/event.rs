use crate::error::BackendError;
use crate::node::NodeId;
use serde::Serialize;

/// Structured event emitted by the cluster core.
///
/// Events are reported synchronously with the call that triggered them, even
/// when that call ultimately succeeds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClusterEvent {
    NodeDeactivated { node: NodeId, cause: String },
    NodeReactivated { node: NodeId },
    NodeUnreachable { node: NodeId, cause: String },
    ClusterExhausted,
    OperationFailedAllNodes {
        method: String,
        failed_nodes: usize,
        cause: String,
    },
}

impl ClusterEvent {
    pub fn node_deactivated(node: &NodeId, cause: impl ToString) -> Self {
        ClusterEvent::NodeDeactivated {
            node: node.clone(),
            cause: cause.to_string(),
        }
    }

    pub fn operation_failed(method: &str, failed_nodes: usize, cause: &BackendError) -> Self {
        ClusterEvent::OperationFailedAllNodes {
            method: method.to_string(),
            failed_nodes,
            cause: cause.to_string(),
        }
    }
}

/// External collector for cluster events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ClusterEvent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = ClusterEvent::node_deactivated(&NodeId::from("db2"), "Request timeout after 5ms");
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"event": "node_deactivated", "node": "db2", "cause": "Request timeout after 5ms"})
        );
    }

    #[test]
    fn test_operation_failed_event() {
        let event = ClusterEvent::operation_failed("commit", 2, &BackendError::Aborted);
        assert_eq!(
            event,
            ClusterEvent::OperationFailedAllNodes {
                method: "commit".to_string(),
                failed_nodes: 2,
                cause: "Backend call aborted".to_string(),
            }
        );
    }
}
