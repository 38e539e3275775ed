use crate::balancer::Balancer;
use crate::capability::{Capability, ConnectionFactory, NoSync, SyncHook};
use crate::config::ClusterConfig;
use crate::executor::ExecutionContext;
use crate::factory::ProxyFactory;
use crate::health::HealthChecker;
use crate::node::{ClusterStatus, Deactivation, DeactivationCause, NodeStatus};
use crate::sql::DataSource;
use hasql_common::{BackendError, ClusterError, ClusterEvent, EventSink, Node, NodeId, Result};
use hasql_metrics::ClusterMetricsCollector;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Receives membership changes.
pub trait MembershipListener: Send + Sync {
    fn node_deactivated(&self, node: &NodeId);
}

#[derive(Debug, Default)]
struct Membership {
    active: BTreeSet<NodeId>,
    inactive: BTreeMap<NodeId, Deactivation>,
}

#[derive(Default)]
struct Listeners {
    entries: Vec<Weak<dyn MembershipListener>>,
    prune_at: usize,
}

/// The node registry of one cluster.
///
/// Owns the active/inactive partition of the configured nodes, the balancer,
/// the execution contexts and the connection factory. Membership is the only
/// shared mutable state; every mutation happens under one write lock, so a
/// reader never sees a node both active and inactive.
pub struct ClusterState {
    nodes: BTreeMap<NodeId, Node>,
    membership: RwLock<Membership>,
    balancer: Box<dyn Balancer>,
    factory: Arc<dyn ConnectionFactory>,
    shared_context: Arc<ExecutionContext>,
    tx_permits: Option<Arc<Semaphore>>,
    listeners: Mutex<Listeners>,
    sinks: Vec<Arc<dyn EventSink>>,
    metrics: ClusterMetricsCollector,
    config: ClusterConfig,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterState {
    pub fn builder(factory: Arc<dyn ConnectionFactory>) -> ClusterBuilder {
        ClusterBuilder::new(factory)
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn metrics(&self) -> &ClusterMetricsCollector {
        &self.metrics
    }

    pub fn balancer(&self) -> &dyn Balancer {
        self.balancer.as_ref()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Every configured node, in id order.
    pub fn all_nodes(&self) -> Vec<Node> {
        self.nodes.values().cloned().collect()
    }

    /// Active nodes, in id order.
    pub fn active_nodes(&self) -> Vec<Node> {
        let membership = self.membership.read().unwrap_or_else(|e| e.into_inner());
        membership
            .active
            .iter()
            .filter_map(|id| self.nodes.get(id).cloned())
            .collect()
    }

    pub fn active_ids(&self) -> BTreeSet<NodeId> {
        self.membership
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .clone()
    }

    /// Inactive nodes with their deactivation records, in id order.
    pub fn inactive_nodes(&self) -> Vec<(Node, Deactivation)> {
        let membership = self.membership.read().unwrap_or_else(|e| e.into_inner());
        membership
            .inactive
            .iter()
            .filter_map(|(id, d)| self.nodes.get(id).map(|n| (n.clone(), d.clone())))
            .collect()
    }

    pub fn deactivation(&self, id: &NodeId) -> Option<Deactivation> {
        self.membership
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .inactive
            .get(id)
            .cloned()
    }

    pub fn is_active(&self, id: &NodeId) -> bool {
        self.membership
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .active
            .contains(id)
    }

    pub fn status(&self) -> ClusterStatus {
        let membership = self.membership.read().unwrap_or_else(|e| e.into_inner());
        let nodes = self
            .nodes
            .values()
            .map(|node| match membership.inactive.get(&node.id) {
                Some(deactivation) => NodeStatus::inactive(node, deactivation),
                None => NodeStatus::active(node),
            })
            .collect();
        ClusterStatus {
            active: membership.active.len(),
            inactive: membership.inactive.len(),
            nodes,
        }
    }

    /// Moves `node` from active to inactive after a failure.
    ///
    /// Returns `Ok(false)` if the node was already inactive. If this empties
    /// the active set the node is still deactivated and the call fails with
    /// `ClusterExhausted`.
    pub fn deactivate(&self, node: &NodeId, cause: BackendError) -> Result<bool> {
        self.deactivate_with(node, DeactivationCause::Failure(cause))
    }

    /// Administrative removal. Manually removed nodes are never
    /// reactivated by the health checker.
    pub fn deactivate_manually(&self, node: &NodeId) -> Result<bool> {
        {
            let mut membership = self.membership.write().unwrap_or_else(|e| e.into_inner());
            if let Some(deactivation) = membership.inactive.get_mut(node) {
                deactivation.cause = DeactivationCause::Manual;
                return Ok(false);
            }
        }
        self.deactivate_with(node, DeactivationCause::Manual)
    }

    pub(crate) fn deactivate_with(&self, node: &NodeId, cause: DeactivationCause) -> Result<bool> {
        if !self.nodes.contains_key(node) {
            return Err(ClusterError::UnknownNode(node.clone()));
        }

        let remaining = {
            let mut membership = self.membership.write().unwrap_or_else(|e| e.into_inner());
            if !membership.active.remove(node) {
                return Ok(false);
            }
            membership
                .inactive
                .insert(node.clone(), Deactivation::new(cause.clone()));
            membership.active.len()
        };

        warn!("Node {} deactivated ({})", node, cause);
        self.notify_deactivated(node);
        self.report(&ClusterEvent::node_deactivated(node, &cause));

        if remaining == 0 {
            error!("Cluster exhausted: node {} was the last active node", node);
            self.report(&ClusterEvent::ClusterExhausted);
            return Err(ClusterError::ClusterExhausted);
        }
        Ok(true)
    }

    /// Moves an inactive node back to the active set.
    ///
    /// The caller is responsible for having synchronized the node first; see
    /// [`activate`](Self::activate).
    pub fn reactivate(&self, node: &NodeId) -> Result<()> {
        if !self.nodes.contains_key(node) {
            return Err(ClusterError::UnknownNode(node.clone()));
        }
        {
            let mut membership = self.membership.write().unwrap_or_else(|e| e.into_inner());
            if membership.inactive.remove(node).is_none() {
                return Err(ClusterError::NodeNotInactive(node.clone()));
            }
            membership.active.insert(node.clone());
        }

        info!("Node {} reactivated", node);
        self.report(&ClusterEvent::NodeReactivated { node: node.clone() });
        Ok(())
    }

    /// Runs `hook` against an inactive node, then reactivates it.
    pub async fn activate(&self, node: &NodeId, hook: &dyn SyncHook) -> Result<()> {
        let descriptor = self
            .nodes
            .get(node)
            .ok_or_else(|| ClusterError::UnknownNode(node.clone()))?;
        if self.is_active(node) {
            return Err(ClusterError::NodeNotInactive(node.clone()));
        }

        info!("Synchronizing node {} before reactivation", node);
        hook.synchronize(descriptor)
            .await
            .map_err(|cause| ClusterError::SyncFailed {
                node: node.clone(),
                cause,
            })?;
        self.reactivate(node)
    }

    /// Execution context for a dispatch.
    ///
    /// The non-transactional context is shared and unbounded. Every request
    /// for a transactional context yields a new one dedicated to a single
    /// transaction; all of them share the configured concurrency bound.
    pub fn executor_for(&self, transactional: bool) -> Arc<ExecutionContext> {
        if transactional {
            Arc::new(ExecutionContext::transactional(self.tx_permits.clone()))
        } else {
            self.shared_context.clone()
        }
    }

    /// Single-target pick among the active nodes.
    pub fn pick(&self) -> Result<NodeId> {
        self.balancer.pick(&self.active_nodes())
    }

    /// Root proxy over the cluster's data sources.
    pub fn data_source(self: &Arc<Self>) -> DataSource {
        ProxyFactory::root(self)
    }

    pub(crate) async fn connect(&self, node: &Node) -> std::result::Result<Arc<dyn Capability>, BackendError> {
        self.factory.connect(node).await
    }

    pub(crate) async fn probe(&self, node: &Node) -> std::result::Result<(), BackendError> {
        probe_with_timeout(self.factory.as_ref(), node, self.config.operation_timeout).await
    }

    /// Reports an event to the metrics collector and every sink.
    pub fn report(&self, event: &ClusterEvent) {
        self.metrics.emit(event);
        for sink in &self.sinks {
            sink.emit(event);
        }
    }

    pub(crate) fn register_listener(&self, listener: Weak<dyn MembershipListener>) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if listeners.entries.len() >= listeners.prune_at {
            listeners.entries.retain(|l| l.strong_count() > 0);
            listeners.prune_at = (listeners.entries.len() * 2).max(64);
        }
        listeners.entries.push(listener);
    }

    fn notify_deactivated(&self, node: &NodeId) {
        let live: Vec<Arc<dyn MembershipListener>> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for listener in live {
            listener.node_deactivated(node);
        }
    }
}

impl Drop for ClusterState {
    fn drop(&mut self) {
        let task = self.health_task.get_mut().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterState")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("active", &self.active_ids())
            .field("balancer", &self.balancer)
            .finish()
    }
}

async fn probe_with_timeout(
    factory: &dyn ConnectionFactory,
    node: &Node,
    timeout: std::time::Duration,
) -> std::result::Result<(), BackendError> {
    tokio::time::timeout(timeout, factory.probe(node))
        .await
        .map_err(|_| BackendError::Timeout(timeout.as_millis() as u64))?
}

/// Builds a [`ClusterState`], probing every node.
pub struct ClusterBuilder {
    factory: Arc<dyn ConnectionFactory>,
    nodes: Vec<Node>,
    config: ClusterConfig,
    sinks: Vec<Arc<dyn EventSink>>,
    metrics: Option<ClusterMetricsCollector>,
    sync_hook: Option<Arc<dyn SyncHook>>,
}

impl ClusterBuilder {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            factory,
            nodes: Vec::new(),
            config: ClusterConfig::default(),
            sinks: Vec::new(),
            metrics: None,
            sync_hook: None,
        }
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn nodes(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    pub fn config(mut self, config: ClusterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn metrics(mut self, metrics: ClusterMetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Hook the health checker runs before auto-activating a node.
    pub fn sync_hook(mut self, hook: Arc<dyn SyncHook>) -> Self {
        self.sync_hook = Some(hook);
        self
    }

    /// Validates the configuration and probes every node.
    ///
    /// Unreachable nodes start inactive. Fails with `ClusterExhausted` if no
    /// node is reachable.
    pub async fn build(self) -> Result<Arc<ClusterState>> {
        if self.nodes.is_empty() {
            return Err(ClusterError::InvalidConfig(
                "a cluster needs at least one node".to_string(),
            ));
        }
        self.config.validate().map_err(ClusterError::InvalidConfig)?;

        let mut nodes = BTreeMap::new();
        for node in self.nodes {
            if nodes.contains_key(&node.id) {
                return Err(ClusterError::InvalidConfig(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
            nodes.insert(node.id.clone(), node);
        }

        let timeout = self.config.operation_timeout;
        let factory = self.factory.as_ref();
        let probes = nodes.values().map(|node| async move {
            let result = probe_with_timeout(factory, node, timeout).await;
            (node.id.clone(), result)
        });
        let results = futures::future::join_all(probes).await;

        let mut membership = Membership::default();
        let mut unreachable = Vec::new();
        for (id, result) in results {
            match result {
                Ok(()) => {
                    membership.active.insert(id);
                }
                Err(err) => {
                    membership.inactive.insert(
                        id.clone(),
                        Deactivation::new(DeactivationCause::Unreachable(err.clone())),
                    );
                    unreachable.push((id, err));
                }
            }
        }
        let active = membership.active.len();

        let cluster = Arc::new(ClusterState {
            nodes,
            membership: RwLock::new(membership),
            balancer: self.config.balancer.build(self.config.seed),
            factory: self.factory,
            shared_context: Arc::new(ExecutionContext::non_transactional()),
            tx_permits: self
                .config
                .transactional_max_concurrency
                .map(|max| Arc::new(Semaphore::new(max))),
            listeners: Mutex::new(Listeners::default()),
            sinks: self.sinks,
            metrics: self.metrics.unwrap_or_default(),
            config: self.config,
            health_task: Mutex::new(None),
        });

        for (id, err) in unreachable {
            warn!("Node {} unreachable at startup: {}", id, err);
            cluster.report(&ClusterEvent::NodeUnreachable {
                node: id,
                cause: err.to_string(),
            });
        }

        if active == 0 {
            error!("Cluster exhausted: no node is reachable");
            cluster.report(&ClusterEvent::ClusterExhausted);
            return Err(ClusterError::ClusterExhausted);
        }

        if let Some(health) = cluster.config.health.clone() {
            let hook = self.sync_hook.unwrap_or_else(|| Arc::new(NoSync));
            let handle = HealthChecker::new(&cluster, health, hook).spawn();
            *cluster.health_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        }

        info!(
            "Cluster ready: {} active, {} inactive, {} balancer",
            active,
            cluster.nodes.len() - active,
            cluster.config.balancer
        );
        Ok(cluster)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use hasql_metrics::EventLog;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    async fn cluster_of(ids: &[&str]) -> (Arc<MemoryCluster>, Arc<ClusterState>) {
        let backends = Arc::new(MemoryCluster::new());
        let cluster = ClusterState::builder(backends.clone())
            .nodes(ids.iter().map(|i| Node::new(*i, format!("memory://{}", i))))
            .build()
            .await
            .unwrap();
        (backends, cluster)
    }

    #[tokio::test]
    async fn test_build_all_active() {
        let (_, cluster) = cluster_of(&["db1", "db2"]).await;
        assert_eq!(cluster.active_ids().len(), 2);
        assert!(cluster.inactive_nodes().is_empty());
        assert_eq!(cluster.all_nodes().len(), 2);
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_input() {
        let backends = Arc::new(MemoryCluster::new());
        let empty = ClusterState::builder(backends.clone()).build().await;
        assert!(matches!(empty, Err(ClusterError::InvalidConfig(_))));

        let duplicate = ClusterState::builder(backends.clone())
            .node(Node::new("db1", "memory://db1"))
            .node(Node::new("db1", "memory://other"))
            .build()
            .await;
        assert!(matches!(duplicate, Err(ClusterError::InvalidConfig(msg)) if msg.contains("db1")));

        let bad_config = ClusterState::builder(backends)
            .node(Node::new("db1", "memory://db1"))
            .config(ClusterConfig::new().with_transactional_max_concurrency(0))
            .build()
            .await;
        assert!(matches!(bad_config, Err(ClusterError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_unreachable_node_starts_inactive() {
        let backends = Arc::new(MemoryCluster::new());
        backends.node(&id("db2")).set_offline(true);
        let log = Arc::new(EventLog::new());

        let cluster = ClusterState::builder(backends)
            .node(Node::new("db1", "memory://db1"))
            .node(Node::new("db2", "memory://db2"))
            .event_sink(log.clone())
            .build()
            .await
            .unwrap();

        assert!(cluster.is_active(&id("db1")));
        assert!(!cluster.is_active(&id("db2")));
        let deactivation = cluster.deactivation(&id("db2")).unwrap();
        assert!(matches!(deactivation.cause, DeactivationCause::Unreachable(_)));
        assert!(matches!(log.events()[0], ClusterEvent::NodeUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_no_reachable_node_exhausts() {
        let backends = Arc::new(MemoryCluster::new());
        backends.node(&id("db1")).set_offline(true);
        let result = ClusterState::builder(backends)
            .node(Node::new("db1", "memory://db1"))
            .build()
            .await;
        assert!(result.unwrap_err().is_cluster_exhausted());
    }

    #[tokio::test]
    async fn test_deactivate_is_idempotent() {
        let (_, cluster) = cluster_of(&["db1", "db2"]).await;
        assert!(cluster.deactivate(&id("db2"), BackendError::Aborted).unwrap());
        assert!(!cluster.deactivate(&id("db2"), BackendError::Aborted).unwrap());
        assert_eq!(cluster.active_ids(), [id("db1")].into_iter().collect());
        assert_eq!(cluster.metrics().snapshot().nodes["db2"].deactivations, 1);
    }

    #[tokio::test]
    async fn test_deactivate_last_node_exhausts() {
        let (_, cluster) = cluster_of(&["db1"]).await;
        let err = cluster.deactivate(&id("db1"), BackendError::Aborted).unwrap_err();
        assert!(err.is_cluster_exhausted());
        assert!(cluster.active_nodes().is_empty());
        assert!(cluster.status().is_exhausted());
        assert!(cluster.pick().unwrap_err().is_cluster_exhausted());
    }

    #[tokio::test]
    async fn test_deactivate_unknown_node() {
        let (_, cluster) = cluster_of(&["db1"]).await;
        let err = cluster.deactivate(&id("db9"), BackendError::Aborted).unwrap_err();
        assert!(matches!(err, ClusterError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn test_reactivate_requires_inactive() {
        let (_, cluster) = cluster_of(&["db1", "db2"]).await;
        assert!(matches!(
            cluster.reactivate(&id("db1")),
            Err(ClusterError::NodeNotInactive(_))
        ));

        cluster.deactivate(&id("db2"), BackendError::Aborted).unwrap();
        cluster.reactivate(&id("db2")).unwrap();
        assert!(cluster.is_active(&id("db2")));
        assert!(cluster.deactivation(&id("db2")).is_none());
    }

    #[tokio::test]
    async fn test_activate_runs_sync_hook() {
        struct FailingSync;

        #[async_trait::async_trait]
        impl SyncHook for FailingSync {
            async fn synchronize(&self, _node: &Node) -> std::result::Result<(), BackendError> {
                Err(BackendError::Backend("diverged".to_string()))
            }
        }

        let (_, cluster) = cluster_of(&["db1", "db2"]).await;
        cluster.deactivate(&id("db2"), BackendError::Aborted).unwrap();

        let err = cluster.activate(&id("db2"), &FailingSync).await.unwrap_err();
        assert!(matches!(err, ClusterError::SyncFailed { .. }));
        assert!(!cluster.is_active(&id("db2")));

        cluster.activate(&id("db2"), &NoSync).await.unwrap();
        assert!(cluster.is_active(&id("db2")));
    }

    #[tokio::test]
    async fn test_manual_deactivation_overrides_cause() {
        let (_, cluster) = cluster_of(&["db1", "db2"]).await;
        cluster.deactivate(&id("db2"), BackendError::Aborted).unwrap();
        assert!(!cluster.deactivate_manually(&id("db2")).unwrap());
        assert!(cluster.deactivation(&id("db2")).unwrap().cause.is_manual());
    }

    #[tokio::test]
    async fn test_status_snapshot() {
        let (_, cluster) = cluster_of(&["db1", "db2"]).await;
        cluster.deactivate_manually(&id("db1")).unwrap();
        let status = cluster.status();
        assert_eq!(status.active, 1);
        assert_eq!(status.inactive, 1);
        assert_eq!(status.nodes[0].cause.as_deref(), Some("manual"));
        assert!(status.nodes[1].active);
    }

    #[tokio::test]
    async fn test_executor_contexts() {
        let (_, cluster) = cluster_of(&["db1"]).await;
        let shared = cluster.executor_for(false);
        assert!(Arc::ptr_eq(&shared, &cluster.executor_for(false)));
        assert!(!shared.is_transactional());

        let tx = cluster.executor_for(true);
        assert!(tx.is_transactional());
        assert!(!Arc::ptr_eq(&tx, &cluster.executor_for(true)));
    }

    #[tokio::test]
    async fn test_listeners_are_notified() {
        struct Recorder(Mutex<Vec<NodeId>>);

        impl MembershipListener for Recorder {
            fn node_deactivated(&self, node: &NodeId) {
                self.0.lock().unwrap().push(node.clone());
            }
        }

        let (_, cluster) = cluster_of(&["db1", "db2"]).await;
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let weak: Weak<dyn MembershipListener> = Arc::<Recorder>::downgrade(&recorder);
        cluster.register_listener(weak);

        cluster.deactivate(&id("db1"), BackendError::Aborted).unwrap();
        assert_eq!(*recorder.0.lock().unwrap(), vec![id("db1")]);
    }
}
