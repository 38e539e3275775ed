use crate::balancer::BalancerKind;
use crate::health::HealthCheckConfig;
use std::time::Duration;

/// Cluster configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Upper bound for one node's part of a call (queueing included)
    ///
    /// Default: 30s
    pub operation_timeout: Duration,
    /// Policy used for single-target dispatch
    pub balancer: BalancerKind,
    /// Seed for the random policy; `None` seeds from entropy
    pub seed: Option<u64>,
    /// Bound on in-flight per-node work across all open transactions
    ///
    /// Default: unbounded
    pub transactional_max_concurrency: Option<usize>,
    /// Background health checking; disabled when `None`
    pub health: Option<HealthCheckConfig>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            balancer: BalancerKind::RoundRobin,
            seed: None,
            transactional_max_concurrency: None,
            health: None,
        }
    }
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_balancer(mut self, balancer: BalancerKind) -> Self {
        self.balancer = balancer;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_transactional_max_concurrency(mut self, max: usize) -> Self {
        self.transactional_max_concurrency = Some(max);
        self
    }

    pub fn with_health_check(mut self, health: HealthCheckConfig) -> Self {
        self.health = Some(health);
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.operation_timeout.is_zero() {
            return Err("operation_timeout must be greater than zero".to_string());
        }
        if self.transactional_max_concurrency == Some(0) {
            return Err("transactional_max_concurrency must be at least 1".to_string());
        }
        if let Some(health) = &self.health {
            health.validate()?;
        }
        Ok(())
    }
}
