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

use crate::registry::MetricsRegistry;
use crate::snapshot::MetricsSnapshot;
use hasql_common::{ClusterEvent, EventSink, NodeId};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Metrics collector owned by a cluster.
///
/// The cluster records per-node dispatches and per-call outcomes directly.
/// Membership changes arrive through the [`EventSink`] implementation, which
/// the owning cluster feeds with every event it reports. Registering the same
/// collector as an extra sink would count each event twice.
///
/// # Example
///
/// ```rust
/// use hasql_common::{ClusterEvent, EventSink, NodeId};
/// use hasql_metrics::ClusterMetricsCollector;
///
/// let collector = ClusterMetricsCollector::new();
/// collector.emit(&ClusterEvent::node_deactivated(&NodeId::from("db2"), "timeout"));
///
/// let snapshot = collector.snapshot();
/// assert_eq!(snapshot.nodes["db2"].deactivations, 1);
/// ```
#[derive(Debug, Clone)]
pub struct ClusterMetricsCollector {
    registry: Arc<MetricsRegistry>,
}

impl ClusterMetricsCollector {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Creates a collector backed by a shared registry.
    pub fn with_registry(registry: Arc<MetricsRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// Records that one unit of work was sent to `node`.
    pub fn record_dispatch(&self, node: &NodeId) {
        self.registry.record_node_dispatch(node);
    }

    /// Records a failed unit of work on `node`.
    pub fn record_node_failure(&self, node: &NodeId) {
        self.registry.record_node_failure(node);
    }

    /// Records the outcome of one logical call.
    pub fn record_call(&self, method: &str, start_time: Instant, success: bool) {
        let latency_us = start_time.elapsed().as_micros() as u64;
        self.registry.record_method_call(method, latency_us, success);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.registry.snapshot()
    }
}

impl Default for ClusterMetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for ClusterMetricsCollector {
    fn emit(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::NodeDeactivated { node, .. } => self.registry.record_deactivation(node),
            ClusterEvent::NodeReactivated { node } => self.registry.record_reactivation(node),
            ClusterEvent::NodeUnreachable { node, .. } => self.registry.record_node_failure(node),
            ClusterEvent::ClusterExhausted => self.registry.record_cluster_exhausted(),
            ClusterEvent::OperationFailedAllNodes { .. } => self.registry.record_total_failure(),
        }
    }
}

/// Bounded in-memory event sink.
///
/// Keeps the most recent `capacity` events; older ones are dropped.
#[derive(Debug)]
pub struct EventLog {
    capacity: usize,
    events: Mutex<VecDeque<ClusterEvent>>,
}

impl EventLog {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns a copy of the retained events, oldest first.
    pub fn events(&self) -> Vec<ClusterEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventLog {
    fn emit(&self, event: &ClusterEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event.clone());
    }
}
