// Copyright 2025 hasql Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metrics for one logical method (across all nodes it was dispatched to)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodMetrics {
    pub call_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_us: u64,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
}

/// Metrics for one node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    pub node: String,
    pub dispatch_count: u64,
    pub failure_count: u64,
    pub deactivations: u64,
    pub reactivations: u64,
    pub last_dispatch_ms: u64,
}

impl NodeMetrics {
    pub fn new(node: String) -> Self {
        Self {
            node,
            ..Default::default()
        }
    }
}

/// Complete metrics snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub cluster_exhausted: u64,
    pub total_failures: u64,
    pub uptime_ms: u64,
    pub methods: BTreeMap<String, MethodMetrics>,
    pub nodes: BTreeMap<String, NodeMetrics>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_metrics_new() {
        let metrics = NodeMetrics::new("db1".to_string());
        assert_eq!(metrics.node, "db1");
        assert_eq!(metrics.dispatch_count, 0);
        assert_eq!(metrics.deactivations, 0);
    }

    #[test]
    fn test_snapshot_serialization() {
        let mut snapshot = MetricsSnapshot {
            total_calls: 3,
            successful_calls: 2,
            failed_calls: 1,
            ..Default::default()
        };
        snapshot
            .nodes
            .insert("db1".to_string(), NodeMetrics::new("db1".to_string()));

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: MetricsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);
    }
}
