//! Hierarchical fan-out proxies.
//!
//! A [`SqlProxy`] multiplexes one logical handle into one native handle
//! (a *delegate*) per node. Calls that return a capability produce child
//! proxies which remember how they were derived, so a delegate missing for a
//! node can be rebuilt by replaying the chain against that node only.

use crate::capability::{Capability, Reply};
use crate::cluster::{ClusterState, MembershipListener};
use crate::dispatch;
use crate::executor::{DispatchScope, ExecutionContext, ScopeView};
use crate::interface::{Dispatch, Interface, ProxyInfo};
use futures::future::BoxFuture;
use futures::FutureExt;
use hasql_common::{BackendError, ClusterError, Node, NodeId, Result};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;
use tracing::{debug, warn};

/// Result of a proxied call
#[derive(Debug)]
pub enum Invoked {
    Value(Value),
    Proxy(SqlProxy),
}

impl Invoked {
    pub fn into_value(self, method: &str) -> Result<Value> {
        match self {
            Invoked::Value(value) => Ok(value),
            Invoked::Proxy(proxy) => Err(ClusterError::UnexpectedResult {
                method: method.to_string(),
                reason: format!("returned a {} proxy instead of a value", proxy.interface_name()),
            }),
        }
    }

    pub fn into_proxy(self, method: &str) -> Result<SqlProxy> {
        match self {
            Invoked::Proxy(proxy) => Ok(proxy),
            Invoked::Value(_) => Err(ClusterError::UnexpectedResult {
                method: method.to_string(),
                reason: "returned a value instead of a proxy".to_string(),
            }),
        }
    }
}

pub(crate) struct Derivation {
    parent: Arc<ProxyInner>,
    method: &'static str,
    args: Value,
}

#[derive(Default)]
struct ProxyState {
    closed: bool,
    children: Vec<Weak<ProxyInner>>,
    attributes: Map<String, Value>,
}

pub(crate) struct ProxyInner {
    pub(crate) interface: &'static Interface,
    pub(crate) cluster: Arc<ClusterState>,
    pub(crate) scope: Arc<DispatchScope>,
    derivation: Option<Derivation>,
    /// Nodes a single-target child is bound to
    pinned: Option<BTreeSet<NodeId>>,
    delegates: Mutex<BTreeMap<NodeId, Arc<dyn Capability>>>,
    state: Mutex<ProxyState>,
}

/// The invocation handler behind every facade.
#[derive(Clone)]
pub struct SqlProxy {
    inner: Arc<ProxyInner>,
}

impl SqlProxy {
    /// Root proxy over the cluster's connection factory.
    ///
    /// It starts with no delegates; each node's root handle is opened on
    /// first use.
    pub(crate) fn root(cluster: &Arc<ClusterState>, interface: &'static Interface) -> Self {
        let inner = Arc::new(ProxyInner {
            interface,
            cluster: cluster.clone(),
            scope: Arc::new(DispatchScope::new(cluster.executor_for(false))),
            derivation: None,
            pinned: None,
            delegates: Mutex::new(BTreeMap::new()),
            state: Mutex::new(ProxyState::default()),
        });
        cluster.register_listener(Arc::downgrade(&inner) as Weak<dyn MembershipListener>);
        Self { inner }
    }

    pub(crate) fn child(
        parent: &Arc<ProxyInner>,
        interface: &'static Interface,
        method: &'static str,
        args: Value,
        delegates: BTreeMap<NodeId, Arc<dyn Capability>>,
        pinned: Option<BTreeSet<NodeId>>,
    ) -> Self {
        let scope = if interface.scope_root {
            Arc::new(DispatchScope::new(Arc::new(
                ExecutionContext::non_transactional(),
            )))
        } else {
            parent.scope.clone()
        };
        let inner = Arc::new(ProxyInner {
            interface,
            cluster: parent.cluster.clone(),
            scope,
            derivation: Some(Derivation {
                parent: parent.clone(),
                method,
                args,
            }),
            pinned,
            delegates: Mutex::new(delegates),
            state: Mutex::new(ProxyState::default()),
        });

        let parent_closed = {
            let mut state = parent.state.lock().unwrap_or_else(|e| e.into_inner());
            state.children.retain(|c| c.strong_count() > 0);
            state.children.push(Arc::downgrade(&inner));
            state.closed
        };
        if parent_closed {
            // parent was closed while this call was in flight
            inner.mark_closed();
            for delegate in inner.take_delegates() {
                release_in_background(delegate);
            }
        }
        parent
            .cluster
            .register_listener(Arc::downgrade(&inner) as Weak<dyn MembershipListener>);
        Self { inner }
    }

    /// Calls `method` through the proxy.
    pub async fn invoke(&self, method: &str, args: Value) -> Result<Invoked> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(ClusterError::AlreadyClosed(inner.interface.name.to_string()));
        }
        let spec = *inner
            .interface
            .method(method)
            .ok_or_else(|| ClusterError::UnknownMethod {
                interface: inner.interface.name.to_string(),
                method: method.to_string(),
            })?;

        if let Dispatch::Local(body) = spec.dispatch {
            let view = inner.scope.view();
            let attributes = inner.attributes();
            let info = ProxyInfo {
                interface: inner.interface,
                live_nodes: inner.candidates(&view).len(),
                in_transaction: view.participants.is_some(),
                attributes: &attributes,
            };
            return body(&info, &args).map(Invoked::Value);
        }

        let start = Instant::now();
        let result = dispatch::execute(inner, &spec, args).await;
        inner
            .cluster
            .metrics()
            .record_call(spec.name, start, result.is_ok());
        result
    }

    /// Calls a value-returning method.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value> {
        self.invoke(method, args).await?.into_value(method)
    }

    /// Calls a capability-returning method.
    pub async fn derive(&self, method: &str, args: Value) -> Result<SqlProxy> {
        self.invoke(method, args).await?.into_proxy(method)
    }

    /// Releases this proxy, every proxy derived from it, and all their
    /// delegates. Each delegate is released exactly once; closing an already
    /// closed proxy is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut pending = vec![self.inner.clone()];
        let mut closing = Vec::new();
        while let Some(proxy) = pending.pop() {
            let children = {
                let mut state = proxy.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.closed {
                    continue;
                }
                state.closed = true;
                std::mem::take(&mut state.children)
            };
            pending.extend(children.iter().filter_map(Weak::upgrade));
            closing.push(proxy);
        }

        // descendants first
        for proxy in closing.iter().rev() {
            let delegates = proxy.take_delegates();
            let released = delegates.len();
            let results = futures::future::join_all(delegates.iter().map(|d| d.release())).await;
            for err in results.into_iter().filter_map(|r| r.err()) {
                warn!("Failed to release {} delegate: {}", proxy.interface.name, err);
            }
            debug!("Closed {} proxy, released {} delegates", proxy.interface.name, released);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn interface(&self) -> &'static Interface {
        self.inner.interface
    }

    pub fn interface_name(&self) -> &'static str {
        self.inner.interface.name
    }

    pub fn cluster(&self) -> &Arc<ClusterState> {
        &self.inner.cluster
    }

    /// Nodes this proxy currently holds a delegate for.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.inner
            .delegates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn delegate(&self, node: &NodeId) -> Option<Arc<dyn Capability>> {
        self.inner.delegate(node)
    }

    pub fn in_transaction(&self) -> bool {
        self.inner.scope.in_transaction()
    }

    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .attributes
            .get(key)
            .cloned()
    }

    /// Nodes a single-target child is bound to, if any.
    pub fn pinned(&self) -> Option<&BTreeSet<NodeId>> {
        self.inner.pinned.as_ref()
    }
}

impl fmt::Debug for SqlProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlProxy")
            .field("interface", &self.inner.interface.name)
            .field("nodes", &self.node_ids())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ProxyInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    fn mark_closed(&self) {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed = true;
    }

    fn attributes(&self) -> Map<String, Value> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .attributes
            .clone()
    }

    pub(crate) fn remember(&self, key: &str, args: Value) {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .attributes
            .insert(key.to_string(), args);
    }

    pub(crate) fn pinned(&self) -> Option<&BTreeSet<NodeId>> {
        self.pinned.as_ref()
    }

    fn delegate(&self, node: &NodeId) -> Option<Arc<dyn Capability>> {
        self.delegates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(node)
            .cloned()
    }

    fn take_delegates(&self) -> Vec<Arc<dyn Capability>> {
        let delegates = std::mem::take(&mut *self.delegates.lock().unwrap_or_else(|e| e.into_inner()));
        delegates.into_values().collect()
    }

    /// Drops and releases the delegate for `node`, if any, along with the
    /// delegates derived from it in the same scope.
    ///
    /// Inside a transaction the node also leaves the participant set: a
    /// replacement session would not be part of the transaction.
    pub(crate) fn discard_delegate(&self, node: &NodeId) {
        if self.interface.scope_root && self.scope.in_transaction() {
            debug!("Node {} leaves the open transaction", node);
            self.scope.remove_participant(node);
        }
        let removed = self
            .delegates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node);
        if let Some(delegate) = removed {
            release_in_background(delegate);
        }
        for child in self.scoped_children() {
            child.discard_delegate(node);
        }
    }

    /// Live children that share this proxy's dispatch scope.
    fn scoped_children(&self) -> Vec<Arc<ProxyInner>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .children
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.interface.scope_root)
            .collect()
    }

    /// Nodes a call on this proxy may target right now, in id order.
    pub(crate) fn candidates(&self, view: &ScopeView) -> Vec<Node> {
        self.cluster
            .active_nodes()
            .into_iter()
            .filter(|n| view.participants.as_ref().map_or(true, |p| p.contains(&n.id)))
            .filter(|n| self.pinned.as_ref().map_or(true, |p| p.contains(&n.id)))
            .collect()
    }

    /// The delegate for `node`, re-deriving it if it is missing.
    pub(crate) fn delegate_for(
        self: &Arc<Self>,
        node: Node,
    ) -> BoxFuture<'static, std::result::Result<Arc<dyn Capability>, BackendError>> {
        let this = self.clone();
        async move {
            if let Some(delegate) = this.delegate(&node.id) {
                return Ok(delegate);
            }
            if this.is_closed() {
                return Err(BackendError::Replay(format!(
                    "{} proxy is closed",
                    this.interface.name
                )));
            }
            if this.interface.scope_root && this.scope.in_transaction() {
                return Err(BackendError::Replay(format!(
                    "{} on {} cannot be reopened inside a transaction",
                    this.interface.name, node.id
                )));
            }

            let derived = match &this.derivation {
                None => this.cluster.connect(&node).await.map_err(|e| {
                    BackendError::Replay(format!("connect to {}: {}", node.id, e))
                })?,
                Some(derivation) => {
                    let parent = derivation.parent.delegate_for(node.clone()).await?;
                    let reply = parent
                        .invoke(derivation.method, &derivation.args)
                        .await
                        .map_err(|e| {
                            BackendError::Replay(format!(
                                "'{}' on {}: {}",
                                derivation.method, node.id, e
                            ))
                        })?;
                    match reply {
                        Reply::Object(object) => object,
                        Reply::Value(_) => {
                            return Err(BackendError::Replay(format!(
                                "'{}' on {} returned a value",
                                derivation.method, node.id
                            )))
                        }
                    }
                }
            };

            for (key, args) in this.attributes() {
                let Some(spec) = this.interface.remembering(&key) else {
                    continue;
                };
                if let Err(e) = derived.invoke(spec.name, &args).await {
                    let _ = derived.release().await;
                    return Err(BackendError::Replay(format!(
                        "'{}' on {}: {}",
                        spec.name, node.id, e
                    )));
                }
            }
            debug!("Re-derived {} delegate for node {}", this.interface.name, node.id);

            let existing = {
                let mut delegates = this.delegates.lock().unwrap_or_else(|e| e.into_inner());
                match delegates.get(&node.id) {
                    Some(existing) => Some(existing.clone()),
                    None if this.is_closed() => None,
                    None => {
                        delegates.insert(node.id.clone(), derived.clone());
                        return Ok(derived);
                    }
                }
            };
            let _ = derived.release().await;
            existing.ok_or_else(|| {
                BackendError::Replay(format!("{} proxy is closed", this.interface.name))
            })
        }
        .boxed()
    }
}

impl MembershipListener for ProxyInner {
    fn node_deactivated(&self, node: &NodeId) {
        // a rejoining node is never re-enlisted in an open transaction
        self.scope.remove_participant(node);
        self.discard_delegate(node);
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        let delegates = std::mem::take(self.delegates.get_mut().unwrap_or_else(|e| e.into_inner()));
        for delegate in delegates.into_values() {
            release_in_background(delegate);
        }
    }
}

pub(crate) fn release_in_background(delegate: Arc<dyn Capability>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = delegate.release().await {
                warn!("Failed to release delegate: {}", e);
            }
        });
    }
}
