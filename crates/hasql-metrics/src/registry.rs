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

use crate::snapshot::{MethodMetrics, MetricsSnapshot, NodeMetrics};
use hasql_common::NodeId;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Instant, SystemTime};

const NUM_HISTOGRAM_BINS: usize = 64;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Power-of-two latency histogram.
///
/// Bin `i` holds samples whose bit length is `i`, i.e. latencies in
/// `[2^(i-1), 2^i)` microseconds. Percentiles report the bin's upper bound,
/// which is accurate to within a factor of two.
#[derive(Debug)]
struct LatencyHistogram {
    bins: [AtomicU64; NUM_HISTOGRAM_BINS],
    total_latency: AtomicU64,
    sample_count: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            bins: std::array::from_fn(|_| AtomicU64::new(0)),
            total_latency: AtomicU64::new(0),
            sample_count: AtomicU64::new(0),
        }
    }

    fn bin_for(latency_us: u64) -> usize {
        let bits = (u64::BITS - latency_us.leading_zeros()) as usize;
        bits.min(NUM_HISTOGRAM_BINS - 1)
    }

    fn record(&self, latency_us: u64) {
        self.bins[Self::bin_for(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.total_latency.fetch_add(latency_us, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(&self, percentile: u64) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }

        let target = (total * percentile).div_ceil(100).max(1);
        let mut cumulative = 0;
        for (bin, count) in self.bins.iter().enumerate() {
            cumulative += count.load(Ordering::Relaxed);
            if cumulative >= target {
                return if bin == 0 { 0 } else { 1u64 << bin.min(63) };
            }
        }
        u64::MAX
    }

    fn average(&self) -> u64 {
        let total = self.sample_count.load(Ordering::Relaxed);
        if total == 0 {
            0
        } else {
            self.total_latency.load(Ordering::Relaxed) / total
        }
    }
}

#[derive(Debug)]
struct MethodStats {
    call_count: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    latencies: LatencyHistogram,
}

impl MethodStats {
    fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            latencies: LatencyHistogram::new(),
        }
    }

    fn snapshot(&self) -> MethodMetrics {
        MethodMetrics {
            call_count: self.call_count.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            avg_latency_us: self.latencies.average(),
            p50_latency_us: self.latencies.percentile(50),
            p99_latency_us: self.latencies.percentile(99),
        }
    }
}

#[derive(Debug, Default)]
struct NodeStats {
    dispatch_count: AtomicU64,
    failure_count: AtomicU64,
    deactivations: AtomicU64,
    reactivations: AtomicU64,
    last_dispatch_ms: AtomicU64,
}

impl NodeStats {
    fn snapshot(&self, node: &NodeId) -> NodeMetrics {
        NodeMetrics {
            node: node.to_string(),
            dispatch_count: self.dispatch_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            deactivations: self.deactivations.load(Ordering::Relaxed),
            reactivations: self.reactivations.load(Ordering::Relaxed),
            last_dispatch_ms: self.last_dispatch_ms.load(Ordering::Relaxed),
        }
    }
}

/// Thread-safe metrics registry.
///
/// Counters are lock-free atomics with relaxed ordering; snapshots are
/// eventually consistent. The method and node tables are behind `RwLock`s
/// that are only written when an entry is first created. Both tables are
/// naturally bounded: nodes by the cluster configuration and methods by the
/// capability interface tables.
#[derive(Debug)]
pub struct MetricsRegistry {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    cluster_exhausted: AtomicU64,
    total_failures: AtomicU64,
    methods: StdRwLock<HashMap<String, Arc<MethodStats>>>,
    nodes: StdRwLock<BTreeMap<NodeId, Arc<NodeStats>>>,
    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            cluster_exhausted: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            methods: StdRwLock::new(HashMap::new()),
            nodes: StdRwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
        }
    }

    fn method(&self, method: &str) -> Arc<MethodStats> {
        if let Some(stats) = self
            .methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
        {
            return stats.clone();
        }
        self.methods
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(method.to_string())
            .or_insert_with(|| Arc::new(MethodStats::new()))
            .clone()
    }

    fn node(&self, node: &NodeId) -> Arc<NodeStats> {
        if let Some(stats) = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
        {
            return stats.clone();
        }
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(node.clone())
            .or_default()
            .clone()
    }

    /// Records one logical call with its overall outcome and latency.
    pub fn record_method_call(&self, method: &str, latency_us: u64, success: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let stats = self.method(method);
        stats.call_count.fetch_add(1, Ordering::Relaxed);
        stats.latencies.record(latency_us);
        if success {
            self.successful_calls.fetch_add(1, Ordering::Relaxed);
            stats.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
            stats.failure_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_node_dispatch(&self, node: &NodeId) {
        let stats = self.node(node);
        stats.dispatch_count.fetch_add(1, Ordering::Relaxed);
        stats.last_dispatch_ms.store(now_ms(), Ordering::Relaxed);
    }

    pub fn record_node_failure(&self, node: &NodeId) {
        self.node(node).failure_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deactivation(&self, node: &NodeId) {
        self.node(node).deactivations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reactivation(&self, node: &NodeId) {
        self.node(node).reactivations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cluster_exhausted(&self) {
        self.cluster_exhausted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_total_failure(&self) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let methods = self
            .methods
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, stats)| (name.clone(), stats.snapshot()))
            .collect();
        let nodes = self
            .nodes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(node, stats)| (node.to_string(), stats.snapshot(node)))
            .collect();

        MetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            cluster_exhausted: self.cluster_exhausted.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            uptime_ms: self.uptime_ms(),
            methods,
            nodes,
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_method_call_counts() {
        let registry = MetricsRegistry::new();
        registry.record_method_call("prepare", 120, true);
        registry.record_method_call("prepare", 80, true);
        registry.record_method_call("execute_update", 300, false);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_calls, 3);
        assert_eq!(snapshot.successful_calls, 2);
        assert_eq!(snapshot.failed_calls, 1);

        let prepare = &snapshot.methods["prepare"];
        assert_eq!(prepare.call_count, 2);
        assert_eq!(prepare.success_count, 2);
        assert_eq!(prepare.avg_latency_us, 100);

        let update = &snapshot.methods["execute_update"];
        assert_eq!(update.failure_count, 1);
    }

    #[test]
    fn test_node_counters() {
        let registry = MetricsRegistry::new();
        let db1 = NodeId::from("db1");
        registry.record_node_dispatch(&db1);
        registry.record_node_dispatch(&db1);
        registry.record_node_failure(&db1);
        registry.record_deactivation(&db1);
        registry.record_reactivation(&db1);

        let snapshot = registry.snapshot();
        let node = &snapshot.nodes["db1"];
        assert_eq!(node.dispatch_count, 2);
        assert_eq!(node.failure_count, 1);
        assert_eq!(node.deactivations, 1);
        assert_eq!(node.reactivations, 1);
        assert!(node.last_dispatch_ms > 0);
    }

    #[test]
    fn test_histogram_bins() {
        assert_eq!(LatencyHistogram::bin_for(0), 0);
        assert_eq!(LatencyHistogram::bin_for(1), 1);
        assert_eq!(LatencyHistogram::bin_for(3), 2);
        assert_eq!(LatencyHistogram::bin_for(1024), 11);
        assert_eq!(LatencyHistogram::bin_for(u64::MAX), NUM_HISTOGRAM_BINS - 1);
    }

    #[test]
    fn test_histogram_percentiles() {
        let histogram = LatencyHistogram::new();
        assert_eq!(histogram.percentile(50), 0);

        for _ in 0..99 {
            histogram.record(10);
        }
        histogram.record(5000);

        // 10us lives in [8, 16)
        assert_eq!(histogram.percentile(50), 16);
        // 5000us lives in [4096, 8192)
        assert_eq!(histogram.percentile(100), 8192);
    }

    #[test]
    fn test_concurrent_recording() {
        let registry = Arc::new(MetricsRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let node = NodeId::from(format!("db{}", i % 2));
                    for _ in 0..100 {
                        registry.record_node_dispatch(&node);
                        registry.record_method_call("query", 10, true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_calls, 800);
        assert_eq!(snapshot.nodes["db0"].dispatch_count, 400);
        assert_eq!(snapshot.nodes["db1"].dispatch_count, 400);
    }
}
