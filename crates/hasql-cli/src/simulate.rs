//! Simulated cluster workloads.

use anyhow::{anyhow, bail, Context, Result};
use hasql_cluster::{BalancerKind, ClusterConfig, ClusterState, ClusterStatus, MemoryCluster, Session};
use hasql_common::{ClusterError, ClusterEvent, Node, NodeId};
use hasql_metrics::{EventLog, MetricsSnapshot};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A node given as `id` or `id=weight`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSpec {
    pub id: String,
    pub weight: u32,
}

impl FromStr for NodeSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (id, weight) = match s.split_once('=') {
            Some((id, weight)) => {
                let weight = weight
                    .parse()
                    .map_err(|_| format!("invalid weight '{}' for node '{}'", weight, id))?;
                (id, weight)
            }
            None => (s, 1),
        };
        if id.is_empty() {
            return Err(format!("empty node id in '{}'", s));
        }
        Ok(NodeSpec {
            id: id.to_string(),
            weight,
        })
    }
}

/// An injected fault: `node:offline`, `node:method` (always fails) or
/// `node:method:times`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultSpec {
    Offline { node: String },
    Fail {
        node: String,
        method: String,
        times: Option<usize>,
    },
}

impl FaultSpec {
    pub fn node(&self) -> &str {
        match self {
            FaultSpec::Offline { node } | FaultSpec::Fail { node, .. } => node,
        }
    }

    fn apply(&self, backends: &MemoryCluster) {
        let backend = backends.node(&NodeId::from(self.node()));
        match self {
            FaultSpec::Offline { .. } => backend.set_offline(true),
            FaultSpec::Fail {
                method,
                times: Some(times),
                ..
            } => backend.fail_next(method, *times),
            FaultSpec::Fail { method, .. } => backend.fail_always(method),
        }
    }
}

impl FromStr for FaultSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [node, "offline"] if !node.is_empty() => Ok(FaultSpec::Offline {
                node: node.to_string(),
            }),
            [node, method] if !node.is_empty() && !method.is_empty() => Ok(FaultSpec::Fail {
                node: node.to_string(),
                method: method.to_string(),
                times: None,
            }),
            [node, method, times] if !node.is_empty() && !method.is_empty() => {
                let times = times
                    .parse()
                    .map_err(|_| format!("invalid repeat count '{}' in fault '{}'", times, s))?;
                Ok(FaultSpec::Fail {
                    node: node.to_string(),
                    method: method.to_string(),
                    times: Some(times),
                })
            }
            _ => Err(format!(
                "invalid fault '{}': expected node:offline, node:method or node:method:times",
                s
            )),
        }
    }
}

/// One simulated workload.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub nodes: Vec<NodeSpec>,
    pub balancer: BalancerKind,
    pub seed: Option<u64>,
    pub faults: Vec<FaultSpec>,
    pub writes: usize,
    pub reads: usize,
    pub operation_timeout: Duration,
    /// Wrap the writes in one transaction
    pub transactional: bool,
}

impl Default for Simulation {
    fn default() -> Self {
        Self {
            nodes: vec![
                NodeSpec {
                    id: "db1".to_string(),
                    weight: 1,
                },
                NodeSpec {
                    id: "db2".to_string(),
                    weight: 1,
                },
            ],
            balancer: BalancerKind::default(),
            seed: None,
            faults: Vec::new(),
            writes: 10,
            reads: 10,
            operation_timeout: Duration::from_secs(5),
            transactional: false,
        }
    }
}

/// Outcome counts for one kind of call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub ok: usize,
    pub failed: usize,
}

impl Outcome {
    fn record<T>(&mut self, result: &hasql_common::Result<T>, errors: &mut Vec<String>) {
        match result {
            Ok(_) => self.ok += 1,
            Err(e) => {
                self.failed += 1;
                errors.push(e.to_string());
            }
        }
    }
}

/// Everything a simulation observed
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub writes: Outcome,
    pub reads: Outcome,
    pub errors: Vec<String>,
    pub status: ClusterStatus,
    pub metrics: MetricsSnapshot,
    pub events: Vec<ClusterEvent>,
}

impl Simulation {
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("at least one --node is required");
        }
        let mut seen = std::collections::BTreeSet::new();
        for node in &self.nodes {
            if !seen.insert(node.id.as_str()) {
                bail!("duplicate node '{}'", node.id);
            }
        }
        for fault in &self.faults {
            if !seen.contains(fault.node()) {
                bail!("fault targets unknown node '{}'", fault.node());
            }
        }
        Ok(())
    }

    fn config(&self) -> ClusterConfig {
        let config = ClusterConfig::default()
            .with_balancer(self.balancer)
            .with_operation_timeout(self.operation_timeout);
        match self.seed {
            Some(seed) => config.with_seed(seed),
            None => config,
        }
    }

    /// Builds the cluster, runs the workload and collects the report.
    pub async fn run(&self) -> Result<Report> {
        self.validate()?;

        let backends = Arc::new(MemoryCluster::new());
        for fault in &self.faults {
            fault.apply(&backends);
        }

        let log = Arc::new(EventLog::new());
        let cluster = ClusterState::builder(backends)
            .nodes(
                self.nodes
                    .iter()
                    .map(|n| Node::new(n.id.as_str(), format!("memory://{}", n.id)).with_weight(n.weight)),
            )
            .config(self.config())
            .event_sink(log.clone())
            .build()
            .await
            .context("failed to start cluster")?;
        info!(
            "Simulating {} writes and {} reads on {} nodes",
            self.writes,
            self.reads,
            self.nodes.len()
        );

        let data_source = cluster.data_source();
        let mut errors = Vec::new();
        let (writes, reads) = match data_source.connect().await {
            Ok(session) => {
                let outcome = self.workload(&session, &mut errors).await;
                if let Err(e) = session.close().await {
                    warn!("Failed to close session: {}", e);
                }
                outcome
            }
            Err(e) => {
                errors.push(e.to_string());
                (Outcome::default(), Outcome::default())
            }
        };
        data_source
            .close()
            .await
            .map_err(|e| anyhow!("failed to close data source: {}", e))?;

        Ok(Report {
            writes,
            reads,
            errors,
            status: cluster.status(),
            metrics: cluster.metrics().snapshot(),
            events: log.events(),
        })
    }

    async fn workload(&self, session: &Session, errors: &mut Vec<String>) -> (Outcome, Outcome) {
        let mut writes = Outcome::default();
        let mut reads = Outcome::default();

        if self.transactional {
            if let Err(e) = session.begin().await {
                errors.push(e.to_string());
            }
        }
        for i in 0..self.writes {
            let result = session.execute(&format!("put key{} value{}", i, i)).await;
            let exhausted = matches!(result, Err(ClusterError::ClusterExhausted));
            writes.record(&result, errors);
            if exhausted {
                return (writes, reads);
            }
        }
        if self.transactional {
            if let Err(e) = session.commit().await {
                errors.push(e.to_string());
            }
        }

        for i in 0..self.reads {
            let result = session.query(&format!("get key{}", i % self.writes.max(1))).await;
            let exhausted = matches!(result, Err(ClusterError::ClusterExhausted));
            reads.record(&result, errors);
            if exhausted {
                break;
            }
        }
        (writes, reads)
    }
}
