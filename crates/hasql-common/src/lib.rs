//! hasql Common Types
//!
//! This crate provides the types shared by every hasql component:
//!
//! - **Nodes**: [`NodeId`] and [`Node`], the passive description of one
//!   physical database backend
//! - **Errors**: the per-node [`BackendError`] and the caller-facing
//!   [`ClusterError`] taxonomy
//! - **Events**: [`ClusterEvent`] and the [`EventSink`] trait used to report
//!   membership changes to an external collector
//!
//! # Overview
//!
//! hasql presents one logical session over a cluster of independent
//! database backends. Writes are replicated to every live backend, reads are
//! routed to one backend picked by a load-balancing policy, and a backend
//! that fails is demoted without the caller noticing.
//!
//! # Example
//!
//! ```
//! use hasql_common::{Node, NodeId};
//!
//! let node = Node::new("db1", "memory://db1").with_weight(2);
//! assert_eq!(node.id, NodeId::from("db1"));
//! assert_eq!(node.weight, 2);
//! ```

pub mod error;
pub mod event;
pub mod node;

pub use error::{BackendError, ClusterError, Result};
pub use event::{ClusterEvent, EventSink};
pub use node::{ConnectionParams, Node, NodeId};
