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

//! hasql Metrics Collection
//!
//! Thread-safe metrics for a hasql cluster: how many logical calls were made,
//! how they were spread across nodes, and how membership changed.
//!
//! # Architecture
//!
//! - [`MetricsRegistry`]: lock-free counters plus per-method and per-node tables
//! - [`ClusterMetricsCollector`]: the cluster-facing recorder; also an
//!   [`EventSink`](hasql_common::EventSink) so membership events are counted
//! - [`EventLog`]: bounded in-memory event sink, handy for tests and the CLI
//! - [`MetricsSnapshot`]: serializable point-in-time view
//!
//! # Usage Example
//!
//! ```rust
//! use hasql_common::NodeId;
//! use hasql_metrics::ClusterMetricsCollector;
//! use std::time::Instant;
//!
//! let collector = ClusterMetricsCollector::new();
//! let start = Instant::now();
//! collector.record_dispatch(&NodeId::from("db1"));
//! collector.record_call("execute_update", start, true);
//!
//! let snapshot = collector.snapshot();
//! assert_eq!(snapshot.total_calls, 1);
//! assert_eq!(snapshot.nodes["db1"].dispatch_count, 1);
//! ```

mod collector;
mod registry;
mod snapshot;

pub use collector::{ClusterMetricsCollector, EventLog};
pub use registry::MetricsRegistry;
pub use snapshot::{MethodMetrics, MetricsSnapshot, NodeMetrics};
