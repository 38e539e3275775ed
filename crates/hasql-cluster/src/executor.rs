//! Execution contexts: per-node serial lanes.
//!
//! A context owns one lane per node. A lane is a worker task that runs the
//! jobs sent to it one after the other, so two calls submitted to the same
//! context reach each node in submission order. A call is enqueued on all of
//! its lanes under a single lock, which keeps the relative order of two calls
//! identical on every node.

use futures::future::BoxFuture;
use futures::FutureExt;
use hasql_common::NodeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::debug;

type Job = BoxFuture<'static, ()>;

struct Lane {
    tx: mpsc::UnboundedSender<Job>,
    handle: JoinHandle<()>,
}

impl Lane {
    fn spawn(context: &str, node: &NodeId) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        debug!("Starting {} lane for node {}", context, node);
        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { tx, handle }
    }
}

/// One unit of work per target node
pub type Unit<T> = (NodeId, BoxFuture<'static, T>);

pub struct ExecutionContext {
    label: &'static str,
    transactional: bool,
    lanes: Mutex<HashMap<NodeId, Lane>>,
    permits: Option<Arc<Semaphore>>,
}

impl ExecutionContext {
    /// Unbounded context for non-transactional work.
    pub fn non_transactional() -> Self {
        Self {
            label: "non-transactional",
            transactional: false,
            lanes: Mutex::new(HashMap::new()),
            permits: None,
        }
    }

    /// Context for one transaction, optionally sharing a concurrency bound.
    pub fn transactional(permits: Option<Arc<Semaphore>>) -> Self {
        Self {
            label: "transactional",
            transactional: true,
            lanes: Mutex::new(HashMap::new()),
            permits,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    /// Enqueues one unit per node and returns the receivers in the same order.
    ///
    /// A receiver that errors means the unit was cancelled before it
    /// completed (its lane was reset).
    pub fn submit<T: Send + 'static>(&self, units: Vec<Unit<T>>) -> Vec<(NodeId, oneshot::Receiver<T>)> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let mut receivers = Vec::with_capacity(units.len());

        for (node, unit) in units {
            let (tx, rx) = oneshot::channel();
            let permits = self.permits.clone();
            let job: Job = async move {
                let _permit = match permits {
                    Some(permits) => permits.acquire_owned().await.ok(),
                    None => None,
                };
                let _ = tx.send(unit.await);
            }
            .boxed();

            let lane = lanes
                .entry(node.clone())
                .or_insert_with(|| Lane::spawn(self.label, &node));
            if let Err(mpsc::error::SendError(job)) = lane.tx.send(job) {
                // worker is gone; replace the lane and retry once
                let fresh = Lane::spawn(self.label, &node);
                let _ = fresh.tx.send(job);
                lanes.insert(node.clone(), fresh);
            }
            receivers.push((node, rx));
        }
        receivers
    }

    /// Aborts the lane for `node`, cancelling its running and queued jobs.
    pub fn reset_lane(&self, node: &NodeId) {
        let lane = self
            .lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(node);
        if let Some(lane) = lane {
            debug!("Resetting {} lane for node {}", self.label, node);
            lane.handle.abort();
        }
    }

    /// Nodes that currently have a lane.
    pub fn lane_nodes(&self) -> BTreeSet<NodeId> {
        self.lanes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("label", &self.label)
            .field("transactional", &self.transactional)
            .field("lanes", &self.lane_nodes())
            .finish()
    }
}

/// The dispatch scope shared by a session and everything derived from it.
///
/// Outside a transaction the scope dispatches through its own
/// non-transactional context. Between a `Begin` and a successful `End` it
/// dispatches through a dedicated transactional context and restricts targets
/// to the participants enlisted at begin time.
#[derive(Debug)]
pub struct DispatchScope {
    state: Mutex<ScopeState>,
}

#[derive(Debug)]
struct ScopeState {
    base: Arc<ExecutionContext>,
    transaction: Option<Transaction>,
}

#[derive(Debug)]
struct Transaction {
    context: Arc<ExecutionContext>,
    participants: BTreeSet<NodeId>,
}

/// What a call needs to know about its scope at submission time
#[derive(Debug, Clone)]
pub struct ScopeView {
    pub context: Arc<ExecutionContext>,
    /// Transaction participants, if a transaction is open
    pub participants: Option<BTreeSet<NodeId>>,
}

impl DispatchScope {
    pub fn new(base: Arc<ExecutionContext>) -> Self {
        Self {
            state: Mutex::new(ScopeState {
                base,
                transaction: None,
            }),
        }
    }

    pub fn view(&self) -> ScopeView {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &state.transaction {
            Some(tx) => ScopeView {
                context: tx.context.clone(),
                participants: Some(tx.participants.clone()),
            },
            None => ScopeView {
                context: state.base.clone(),
                participants: None,
            },
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transaction
            .is_some()
    }

    /// Opens a transaction unless one is already open.
    pub fn begin(&self, context: Arc<ExecutionContext>, participants: BTreeSet<NodeId>) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.transaction.is_some() {
            return false;
        }
        state.transaction = Some(Transaction {
            context,
            participants,
        });
        true
    }

    /// Closes the open transaction, returning to the base context.
    pub fn end(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transaction
            .take()
            .is_some()
    }

    /// Drops a node from the open transaction's participants.
    pub fn remove_participant(&self, node: &NodeId) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = state.transaction.as_mut() {
            tx.participants.remove(node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> NodeId {
        NodeId::from(s)
    }

    #[tokio::test]
    async fn test_submit_runs_each_unit() {
        let context = ExecutionContext::non_transactional();
        let receivers = context.submit(vec![
            (id("db1"), async { 1 }.boxed()),
            (id("db2"), async { 2 }.boxed()),
        ]);

        let mut results = Vec::new();
        for (node, rx) in receivers {
            results.push((node, rx.await.unwrap()));
        }
        assert_eq!(results, vec![(id("db1"), 1), (id("db2"), 2)]);
        assert_eq!(context.lane_nodes().len(), 2);
    }

    #[tokio::test]
    async fn test_lane_preserves_submission_order() {
        let context = ExecutionContext::non_transactional();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for i in 0..5u64 {
            let log = log.clone();
            let unit = async move {
                // later submissions finish their sleep first
                tokio::time::sleep(Duration::from_millis(10 - i * 2)).await;
                log.lock().unwrap().push(i);
            }
            .boxed();
            pending.extend(context.submit(vec![(id("db1"), unit)]));
        }
        for (_, rx) in pending {
            rx.await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_reset_lane_cancels_work() {
        let context = ExecutionContext::non_transactional();
        let mut receivers = context.submit(vec![(id("db1"), futures::future::pending::<u32>().boxed())]);
        let (_, rx) = receivers.remove(0);

        context.reset_lane(&id("db1"));
        assert!(rx.await.is_err());
        assert!(context.lane_nodes().is_empty());

        // lane is recreated on demand
        let (_, rx) = context.submit(vec![(id("db1"), async { 7u32 }.boxed())]).remove(0);
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_transactional_permits_bound_concurrency() {
        let permits = Arc::new(Semaphore::new(1));
        let context = ExecutionContext::transactional(Some(permits.clone()));
        assert!(context.is_transactional());

        let in_flight = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let units = ["db1", "db2", "db3"]
            .iter()
            .map(|node| {
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                let unit = async move {
                    use std::sync::atomic::Ordering;
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                .boxed();
                (id(node), unit)
            })
            .collect();

        for (_, rx) in context.submit(units) {
            rx.await.unwrap();
        }
        assert_eq!(peak.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_scope_transaction_lifecycle() {
        let base = Arc::new(ExecutionContext::non_transactional());
        let scope = DispatchScope::new(base.clone());
        assert!(!scope.in_transaction());
        assert!(scope.view().participants.is_none());

        let participants: BTreeSet<NodeId> = [id("db1"), id("db2")].into_iter().collect();
        let tx = Arc::new(ExecutionContext::transactional(None));
        assert!(scope.begin(tx.clone(), participants));
        assert!(!scope.begin(tx, BTreeSet::new()));

        let view = scope.view();
        assert!(view.context.is_transactional());
        assert_eq!(view.participants.as_ref().map(|p| p.len()), Some(2));

        scope.remove_participant(&id("db2"));
        assert_eq!(scope.view().participants.unwrap().len(), 1);

        assert!(scope.end());
        assert!(!scope.end());
        assert!(Arc::ptr_eq(&scope.view().context, &base));
    }
}
