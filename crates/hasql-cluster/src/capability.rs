//! Boundary traits between the cluster core and a physical backend.

use async_trait::async_trait;
use hasql_common::{BackendError, Node};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// What one node returned for one call.
#[derive(Clone)]
pub enum Reply {
    /// A plain value (rows affected, a flag, a row...)
    Value(Value),
    /// A capability object, e.g. a session or a statement
    Object(Arc<dyn Capability>),
}

impl Reply {
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Value(_) => "value",
            Reply::Object(_) => "object",
        }
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Reply::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Value(value)
    }
}

/// A native handle on one backend: a data source, session, statement or
/// cursor, depending on where it was derived from.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn invoke(&self, method: &str, args: &Value) -> Result<Reply, BackendError>;

    /// Releases backend resources held by this handle.
    async fn release(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Opens the root handle for a node.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, node: &Node) -> Result<Arc<dyn Capability>, BackendError>;

    /// Checks that `node` is reachable.
    async fn probe(&self, node: &Node) -> Result<(), BackendError> {
        let root = self.connect(node).await?;
        root.release().await
    }
}

/// Brings a node's data up to date before it rejoins the active set.
#[async_trait]
pub trait SyncHook: Send + Sync {
    async fn synchronize(&self, node: &Node) -> Result<(), BackendError>;
}

/// Hook for nodes that need no synchronization (shared or empty storage).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSync;

#[async_trait]
impl SyncHook for NoSync {
    async fn synchronize(&self, _node: &Node) -> Result<(), BackendError> {
        Ok(())
    }
}
