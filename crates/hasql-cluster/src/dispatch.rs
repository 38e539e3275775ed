//! Fan-out execution and outcome reconciliation.
//!
//! Fan-out calls run on every target node and reconcile as follows:
//!
//! 1. every node succeeded: the result is built from all of them
//! 2. some failed: each failed node is deactivated, the result is built
//!    from the survivors and the caller sees success
//! 3. every node failed: membership is left alone and the caller gets one
//!    representative failure with the failed-node count
//!
//! Single-target and primary calls run on one node and retry once on a
//! fresh pick after deactivating the first.

use crate::capability::Reply;
use crate::executor::ScopeView;
use crate::interface::{Dispatch, MethodSpec, Returns, TxBoundary};
use crate::proxy::{release_in_background, Invoked, ProxyInner, SqlProxy};
use futures::future::BoxFuture;
use futures::FutureExt;
use hasql_common::{BackendError, ClusterError, ClusterEvent, Node, NodeId, Result};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type NodeResult = std::result::Result<Reply, BackendError>;

pub(crate) async fn execute(proxy: &Arc<ProxyInner>, spec: &MethodSpec, args: Value) -> Result<Invoked> {
    let view = proxy.scope.view();
    let candidates = proxy.candidates(&view);
    if candidates.is_empty() && spec.tx == TxBoundary::End && view.participants.is_some() {
        // every participant has left; their sessions are gone with the work
        warn!("'{}' found no transaction participants left; closing the transaction", spec.name);
        proxy.scope.end();
        return Err(ClusterError::ClusterExhausted);
    }
    if candidates.is_empty() {
        debug!("No target for '{}': cluster exhausted", spec.name);
        return Err(ClusterError::ClusterExhausted);
    }

    match spec.dispatch {
        Dispatch::FanOut => fan_out(proxy, spec, args, &view, candidates).await,
        Dispatch::SingleTarget => single_target(proxy, spec, args, &view, candidates, false).await,
        Dispatch::Primary => single_target(proxy, spec, args, &view, candidates, true).await,
        Dispatch::Local(_) => Err(ClusterError::UnexpectedResult {
            method: spec.name.to_string(),
            reason: "local methods are not dispatched".to_string(),
        }),
    }
}

/// One node's part of a call: resolve the delegate, then invoke it.
///
/// The timeout covers only this node's own work. It starts when the lane
/// runs the unit, after any wait for a queue slot or a concurrency permit.
fn unit(
    proxy: &Arc<ProxyInner>,
    node: Node,
    method: &'static str,
    args: Value,
    timeout: Duration,
) -> BoxFuture<'static, NodeResult> {
    let proxy = proxy.clone();
    async move {
        let work = async {
            let delegate = proxy.delegate_for(node).await?;
            delegate.invoke(method, &args).await
        };
        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout.as_millis() as u64)),
        }
    }
    .boxed()
}

/// Runs one unit per target on the scope's lanes. Results come back in
/// target order.
async fn run_units(
    proxy: &Arc<ProxyInner>,
    view: &ScopeView,
    spec: &MethodSpec,
    args: &Value,
    targets: Vec<Node>,
) -> Vec<(NodeId, NodeResult)> {
    let cluster = &proxy.cluster;
    let timeout = cluster.config().operation_timeout;

    let units = targets
        .into_iter()
        .map(|node| {
            cluster.metrics().record_dispatch(&node.id);
            (node.id.clone(), unit(proxy, node, spec.name, args.clone(), timeout))
        })
        .collect();
    let receivers = view.context.submit(units);

    let waits = receivers.into_iter().map(|(node, rx)| async move {
        // a closed channel means the lane was reset under the unit
        let result = rx.await.unwrap_or(Err(BackendError::Aborted));
        (node, result)
    });
    let outcomes = futures::future::join_all(waits).await;

    outcomes
        .into_iter()
        .map(|(node, result)| {
            let result = check_kind(spec, result);
            if matches!(result, Err(BackendError::Timeout(_))) {
                // in-flight work was cancelled; the delegate's state is unknown
                proxy.discard_delegate(&node);
            }
            (node, result)
        })
        .collect()
}

/// A reply of the wrong kind is a failure of that node.
fn check_kind(spec: &MethodSpec, result: NodeResult) -> NodeResult {
    match (spec.returns, result) {
        (Returns::Object(_), Ok(Reply::Value(_))) => Err(BackendError::Backend(format!(
            "'{}' returned a value where a capability was expected",
            spec.name
        ))),
        (Returns::Value, Ok(Reply::Object(object))) => {
            release_in_background(object);
            Err(BackendError::Backend(format!(
                "'{}' returned a capability where a value was expected",
                spec.name
            )))
        }
        (_, result) => result,
    }
}

/// Deactivates a node that failed while others succeeded.
fn demote(proxy: &Arc<ProxyInner>, view: &ScopeView, spec: &MethodSpec, node: &NodeId, cause: &BackendError) -> Result<()> {
    warn!("Node {} failed '{}': {}", node, spec.name, cause);
    proxy.cluster.metrics().record_node_failure(node);
    let outcome = proxy.cluster.deactivate(node, cause.clone());
    view.context.reset_lane(node);
    proxy.scope.remove_participant(node);
    outcome.map(|_| ())
}

async fn fan_out(
    proxy: &Arc<ProxyInner>,
    spec: &MethodSpec,
    args: Value,
    view: &ScopeView,
    targets: Vec<Node>,
) -> Result<Invoked> {
    let outcomes = run_units(proxy, view, spec, &args, targets).await;

    let mut successes = BTreeMap::new();
    let mut failures = BTreeMap::new();
    for (node, result) in outcomes {
        match result {
            Ok(reply) => {
                successes.insert(node, reply);
            }
            Err(err) => {
                failures.insert(node, err);
            }
        }
    }

    if successes.is_empty() {
        for node in failures.keys() {
            proxy.cluster.metrics().record_node_failure(node);
        }
        let failed_nodes = failures.len();
        let cause = failures
            .into_values()
            .next()
            .unwrap_or(BackendError::Aborted);
        return Err(total_failure(proxy, spec, failed_nodes, cause));
    }

    for (node, cause) in &failures {
        match demote(proxy, view, spec, node, cause) {
            Ok(()) => {}
            // survivors were deactivated concurrently; handled below
            Err(ClusterError::ClusterExhausted) => {}
            Err(err) => return Err(err),
        }
    }

    let survivors = retain_active(proxy, successes);
    if survivors.is_empty() {
        return Err(ClusterError::ClusterExhausted);
    }
    finish(proxy, spec, args, survivors, proxy.pinned().cloned())
}

async fn single_target(
    proxy: &Arc<ProxyInner>,
    spec: &MethodSpec,
    args: Value,
    view: &ScopeView,
    candidates: Vec<Node>,
    primary: bool,
) -> Result<Invoked> {
    let cluster = &proxy.cluster;
    let first = choose(proxy, &candidates, primary)?;
    let first_err = match run_one(proxy, view, spec, &args, &candidates, &first).await {
        Ok(reply) => return finish_single(proxy, spec, args, first, reply),
        Err(err) => err,
    };
    demote(proxy, view, spec, &first, &first_err)?;

    let remaining: Vec<Node> = proxy
        .candidates(view)
        .into_iter()
        .filter(|n| n.id != first)
        .collect();
    let second = choose(proxy, &remaining, primary)?;
    debug!("Retrying '{}' on node {} after {} failed", spec.name, second, first);

    match run_one(proxy, view, spec, &args, &remaining, &second).await {
        Ok(reply) => finish_single(proxy, spec, args, second, reply),
        Err(cause) => {
            // two consecutive failures point at the operation, not the node
            cluster.metrics().record_node_failure(&second);
            Err(total_failure(proxy, spec, 2, cause))
        }
    }
}

fn choose(proxy: &Arc<ProxyInner>, candidates: &[Node], primary: bool) -> Result<NodeId> {
    if primary {
        candidates
            .iter()
            .map(|n| n.id.clone())
            .min()
            .ok_or(ClusterError::ClusterExhausted)
    } else {
        proxy.cluster.balancer().pick(candidates)
    }
}

async fn run_one(
    proxy: &Arc<ProxyInner>,
    view: &ScopeView,
    spec: &MethodSpec,
    args: &Value,
    candidates: &[Node],
    target: &NodeId,
) -> NodeResult {
    let node = candidates
        .iter()
        .find(|n| &n.id == target)
        .cloned()
        .ok_or(BackendError::Aborted)?;

    let balancer = proxy.cluster.balancer();
    balancer.call_started(target);
    let mut outcomes = run_units(proxy, view, spec, args, vec![node]).await;
    balancer.call_finished(target);

    outcomes
        .pop()
        .map(|(_, result)| result)
        .unwrap_or(Err(BackendError::Aborted))
}

fn finish_single(proxy: &Arc<ProxyInner>, spec: &MethodSpec, args: Value, node: NodeId, reply: Reply) -> Result<Invoked> {
    let mut survivors = BTreeMap::new();
    survivors.insert(node, reply);
    let survivors = retain_active(proxy, survivors);
    if survivors.is_empty() {
        return Err(ClusterError::ClusterExhausted);
    }
    let pinned: BTreeSet<NodeId> = survivors.keys().cloned().collect();
    finish(proxy, spec, args, survivors, Some(pinned))
}

/// Builds the cluster-wide error for a call that failed on every target.
fn total_failure(proxy: &Arc<ProxyInner>, spec: &MethodSpec, failed_nodes: usize, cause: BackendError) -> ClusterError {
    warn!(
        "'{}' failed on all {} targeted nodes: {}",
        spec.name, failed_nodes, cause
    );
    proxy
        .cluster
        .report(&ClusterEvent::operation_failed(spec.name, failed_nodes, &cause));
    ClusterError::OperationFailed {
        method: spec.name.to_string(),
        failed_nodes,
        cause,
    }
}

/// Drops survivors that another call deactivated meanwhile.
fn retain_active(proxy: &Arc<ProxyInner>, successes: BTreeMap<NodeId, Reply>) -> BTreeMap<NodeId, Reply> {
    let active = proxy.cluster.active_ids();
    successes
        .into_iter()
        .filter_map(|(node, reply)| {
            if active.contains(&node) {
                return Some((node, reply));
            }
            debug!("Dropping result from node {}: no longer active", node);
            if let Reply::Object(object) = reply {
                release_in_background(object);
            }
            None
        })
        .collect()
}

/// Applies side effects of a successful call and builds its result.
fn finish(
    proxy: &Arc<ProxyInner>,
    spec: &MethodSpec,
    args: Value,
    survivors: BTreeMap<NodeId, Reply>,
    pinned: Option<BTreeSet<NodeId>>,
) -> Result<Invoked> {
    let cluster = &proxy.cluster;

    if let Some(key) = spec.remembers {
        proxy.remember(key, args.clone());
    }
    match spec.tx {
        TxBoundary::Begin => {
            let participants = survivors.keys().cloned().collect();
            if proxy.scope.begin(cluster.executor_for(true), participants) {
                debug!("Transaction started on {} nodes", survivors.len());
            }
        }
        TxBoundary::End => {
            if proxy.scope.end() {
                debug!("Transaction ended on {} nodes", survivors.len());
            }
        }
        TxBoundary::None => {}
    }

    match spec.returns {
        Returns::Value => {
            let nodes: Vec<Node> = survivors
                .keys()
                .filter_map(|id| cluster.node(id).cloned())
                .collect();
            let preferred = cluster.balancer().peek(&nodes);
            let mut survivors = survivors;
            let reply = match preferred.and_then(|id| survivors.remove(&id)) {
                Some(reply) => Some(reply),
                None => survivors.into_values().next(),
            };
            match reply {
                Some(Reply::Value(value)) => Ok(Invoked::Value(value)),
                _ => Err(ClusterError::UnexpectedResult {
                    method: spec.name.to_string(),
                    reason: "no value among survivors".to_string(),
                }),
            }
        }
        Returns::Object(interface) => {
            let delegates = survivors
                .into_iter()
                .filter_map(|(node, reply)| match reply {
                    Reply::Object(object) => Some((node, object)),
                    Reply::Value(_) => None,
                })
                .collect();
            Ok(Invoked::Proxy(SqlProxy::child(
                proxy, interface, spec.name, args, delegates, pinned,
            )))
        }
    }
}
