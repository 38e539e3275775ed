use crate::capability::SyncHook;
use crate::cluster::ClusterState;
use crate::node::DeactivationCause;
use hasql_common::{BackendError, Node, NodeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{info, warn};

/// Result of a health check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthCheckStatus {
    Healthy,
    Unhealthy(String),
}

/// Batched health check update to apply to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckUpdate {
    pub node: NodeId,
    pub status: HealthCheckStatus,
    pub should_activate: bool,
    pub should_deactivate: bool,
}

/// Health check configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive failed probes before an active node is deactivated
    pub failure_threshold: u32,
    /// Synchronize and reactivate inactive nodes that probe healthy
    pub auto_activate: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_millis(2000),
            failure_threshold: 3,
            auto_activate: true,
        }
    }
}

impl HealthCheckConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_auto_activate(mut self, auto_activate: bool) -> Self {
        self.auto_activate = auto_activate;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("health check interval must be greater than zero".to_string());
        }
        if self.timeout.is_zero() {
            return Err("health check timeout must be greater than zero".to_string());
        }
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Background prober for cluster nodes.
///
/// Holds only a weak reference to the cluster; the task ends once the
/// cluster is dropped.
pub struct HealthChecker {
    cluster: Weak<ClusterState>,
    config: HealthCheckConfig,
    sync: Arc<dyn SyncHook>,
    failures: Mutex<HashMap<NodeId, u32>>,
}

impl HealthChecker {
    pub fn new(cluster: &Arc<ClusterState>, config: HealthCheckConfig, sync: Arc<dyn SyncHook>) -> Self {
        Self {
            cluster: Arc::downgrade(cluster),
            config,
            sync,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the health checker task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Main health check loop
    async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);

        loop {
            interval.tick().await;
            let Some(cluster) = self.cluster.upgrade() else {
                break;
            };
            self.check_all_nodes(&cluster).await;
        }
    }

    /// Runs one round: probes every node in parallel, then applies the
    /// resulting updates in node order.
    pub async fn check_all_nodes(&self, cluster: &ClusterState) -> Vec<HealthCheckUpdate> {
        let checks: Vec<_> = cluster
            .all_nodes()
            .into_iter()
            .map(|node| async move {
                let result = self.check_node_health(cluster, &node).await;
                (node, result)
            })
            .collect();

        let results = futures::future::join_all(checks).await;

        let mut updates = Vec::with_capacity(results.len());
        for (node, result) in results {
            let update = self.process_health_result(cluster, &node, result);
            self.apply_health_update(cluster, &update).await;
            updates.push(update);
        }
        updates
    }

    async fn check_node_health(&self, cluster: &ClusterState, node: &Node) -> Result<(), BackendError> {
        tokio::time::timeout(self.config.timeout, cluster.probe(node))
            .await
            .map_err(|_| BackendError::Timeout(self.config.timeout.as_millis() as u64))?
    }

    /// Consecutive failed probes recorded for `node`.
    pub fn consecutive_failures(&self, node: &NodeId) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
            .copied()
            .unwrap_or(0)
    }

    fn process_health_result(
        &self,
        cluster: &ClusterState,
        node: &Node,
        result: Result<(), BackendError>,
    ) -> HealthCheckUpdate {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match result {
            Ok(()) => {
                failures.remove(&node.id);
                let should_activate = self.config.auto_activate
                    && cluster
                        .deactivation(&node.id)
                        .is_some_and(|d| !d.cause.is_manual());
                HealthCheckUpdate {
                    node: node.id.clone(),
                    status: HealthCheckStatus::Healthy,
                    should_activate,
                    should_deactivate: false,
                }
            }
            Err(e) => {
                let count = failures.entry(node.id.clone()).or_insert(0);
                *count += 1;
                let should_deactivate =
                    *count >= self.config.failure_threshold && cluster.is_active(&node.id);
                HealthCheckUpdate {
                    node: node.id.clone(),
                    status: HealthCheckStatus::Unhealthy(e.to_string()),
                    should_activate: false,
                    should_deactivate,
                }
            }
        }
    }

    async fn apply_health_update(&self, cluster: &ClusterState, update: &HealthCheckUpdate) {
        if update.should_activate {
            match cluster.activate(&update.node, self.sync.as_ref()).await {
                Ok(()) => info!("Node {} reactivated after health check recovery", update.node),
                Err(e) => warn!("Node {} probed healthy but could not be reactivated: {}", update.node, e),
            }
        }

        if update.should_deactivate {
            if cluster.active_ids().len() <= 1 {
                warn!(
                    "Node {} is failing health checks but is the last active node; keeping it",
                    update.node
                );
                return;
            }
            let reason = match &update.status {
                HealthCheckStatus::Unhealthy(msg) => msg.clone(),
                HealthCheckStatus::Healthy => "unknown error".to_string(),
            };
            let failures = self.consecutive_failures(&update.node);
            let cause = DeactivationCause::Unreachable(BackendError::Unreachable(reason.clone()));
            if let Ok(true) = cluster.deactivate_with(&update.node, cause) {
                warn!(
                    "Node {} deactivated after {} consecutive health check failures: {}",
                    update.node, failures, reason
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::NoSync;
    use crate::memory::{CopySync, MemoryCluster};

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    async fn setup(config: HealthCheckConfig) -> (Arc<MemoryCluster>, Arc<ClusterState>, HealthChecker) {
        let backends = Arc::new(MemoryCluster::new());
        let cluster = ClusterState::builder(backends.clone())
            .node(Node::new("db1", "memory://db1"))
            .node(Node::new("db2", "memory://db2"))
            .build()
            .await
            .unwrap();
        let checker = HealthChecker::new(&cluster, config, Arc::new(NoSync));
        (backends, cluster, checker)
    }

    #[test]
    fn test_health_check_config_default() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.timeout, Duration::from_millis(2000));
        assert_eq!(config.failure_threshold, 3);
        assert!(config.auto_activate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_health_check_config_custom() {
        let config = HealthCheckConfig::default()
            .with_interval(Duration::from_secs(10))
            .with_timeout(Duration::from_millis(5000))
            .with_failure_threshold(5)
            .with_auto_activate(false);
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.timeout, Duration::from_millis(5000));
        assert_eq!(config.failure_threshold, 5);
        assert!(!config.auto_activate);
        assert!(config.with_failure_threshold(0).validate().is_err());
    }

    #[tokio::test]
    async fn test_deactivates_after_threshold() {
        let config = HealthCheckConfig::default().with_failure_threshold(2);
        let (backends, cluster, checker) = setup(config).await;
        backends.node(&id("db2")).set_offline(true);

        let updates = checker.check_all_nodes(&cluster).await;
        assert_eq!(updates[0].status, HealthCheckStatus::Healthy);
        assert!(matches!(updates[1].status, HealthCheckStatus::Unhealthy(_)));
        assert!(!updates[1].should_deactivate);
        assert!(cluster.is_active(&id("db2")));

        let updates = checker.check_all_nodes(&cluster).await;
        assert!(updates[1].should_deactivate);
        assert!(!cluster.is_active(&id("db2")));
        assert_eq!(checker.consecutive_failures(&id("db2")), 2);
    }

    #[tokio::test]
    async fn test_never_deactivates_last_node() {
        let config = HealthCheckConfig::default().with_failure_threshold(1);
        let (backends, cluster, checker) = setup(config).await;
        cluster.deactivate_manually(&id("db2")).unwrap();
        backends.node(&id("db1")).set_offline(true);

        checker.check_all_nodes(&cluster).await;
        assert!(cluster.is_active(&id("db1")));
    }

    #[tokio::test]
    async fn test_auto_activation_after_recovery() {
        let (backends, cluster, _) = setup(HealthCheckConfig::default()).await;
        backends.node(&id("db1")).insert("a", "1");
        cluster
            .deactivate(&id("db2"), BackendError::Aborted)
            .unwrap();

        let sync = Arc::new(CopySync::new(backends.clone(), "db1"));
        let checker = HealthChecker::new(&cluster, HealthCheckConfig::default(), sync);
        let updates = checker.check_all_nodes(&cluster).await;
        assert!(updates[1].should_activate);
        assert!(cluster.is_active(&id("db2")));
        assert_eq!(backends.node(&id("db2")).get("a").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_manual_nodes_stay_inactive() {
        let (_, cluster, checker) = setup(HealthCheckConfig::default()).await;
        cluster.deactivate_manually(&id("db2")).unwrap();

        let updates = checker.check_all_nodes(&cluster).await;
        assert!(!updates[1].should_activate);
        assert!(!cluster.is_active(&id("db2")));
    }

    #[tokio::test]
    async fn test_auto_activate_disabled() {
        let config = HealthCheckConfig::default().with_auto_activate(false);
        let (_, cluster, checker) = setup(config).await;
        cluster.deactivate(&id("db2"), BackendError::Aborted).unwrap();

        checker.check_all_nodes(&cluster).await;
        assert!(!cluster.is_active(&id("db2")));
    }

    #[tokio::test]
    async fn test_spawned_task_ends_with_cluster() {
        let config = HealthCheckConfig::default().with_interval(Duration::from_millis(5));
        let (_, cluster, checker) = setup(config).await;
        let handle = checker.spawn();
        drop(cluster);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
