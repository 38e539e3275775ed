use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque, totally ordered node identity.
///
/// Ordering is used wherever the cluster needs a deterministic choice
/// (iteration order, representative results, round-robin cursor).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Parameters handed to the connection factory for one backend.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub url: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ConnectionParams {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            properties: BTreeMap::new(),
        }
    }
}

/// One physical database backend participating in the cluster.
///
/// A `Node` is a passive value. Its liveness is owned by the cluster state,
/// not by the node itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub params: ConnectionParams,
    /// Relative weight used by weighted balancer policies
    pub weight: u32,
}

impl Node {
    /// Creates a node with weight 1.
    pub fn new(id: impl Into<NodeId>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            params: ConnectionParams::new(url),
            weight: 1,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.properties.insert(key.into(), value.into());
        self
    }
}
