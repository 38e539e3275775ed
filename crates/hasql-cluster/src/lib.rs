//! hasql Cluster Coordination
//!
//! One logical database session over several physical backends. Writes fan
//! out to every active node, reads go to one node chosen by a [`Balancer`],
//! and a node that fails while the others succeed is deactivated without
//! the caller seeing an error.
//!
//! # Example
//!
//! ```
//! use hasql_cluster::{ClusterState, MemoryCluster};
//! use hasql_common::{Node, NodeId};
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> hasql_common::Result<()> {
//! let backends = Arc::new(MemoryCluster::new());
//! let cluster = ClusterState::builder(backends.clone())
//!     .node(Node::new("db1", "memory://db1"))
//!     .node(Node::new("db2", "memory://db2"))
//!     .build()
//!     .await?;
//!
//! let session = cluster.data_source().connect().await?;
//! session.execute("put greeting hello").await?;
//!
//! assert_eq!(backends.node(&NodeId::from("db2")).get("greeting").as_deref(), Some("hello"));
//! session.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod balancer;
pub mod capability;
pub mod cluster;
pub mod config;
mod dispatch;
pub mod executor;
pub mod factory;
pub mod health;
pub mod interface;
pub mod memory;
pub mod node;
pub mod proxy;
pub mod sql;

pub use balancer::{
    Balancer, BalancerKind, LoadBalancer, RandomBalancer, RoundRobinBalancer, WeightedBalancer,
};
pub use capability::{Capability, ConnectionFactory, NoSync, Reply, SyncHook};
pub use cluster::{ClusterBuilder, ClusterState, MembershipListener};
pub use config::ClusterConfig;
pub use executor::ExecutionContext;
pub use factory::{Facade, ProxyFactory};
pub use health::{HealthCheckConfig, HealthCheckStatus, HealthCheckUpdate, HealthChecker};
pub use interface::{Dispatch, Interface, MethodSpec, ProxyInfo, Returns, TxBoundary};
pub use memory::{CopySync, MemoryCluster, MemoryNode};
pub use node::{ClusterStatus, Deactivation, DeactivationCause, NodeStatus};
pub use proxy::{Invoked, SqlProxy};
pub use sql::{Cursor, DataSource, Session, Statement, CURSOR, DATA_SOURCE, SESSION, STATEMENT};
