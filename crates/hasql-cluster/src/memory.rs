//! In-memory backend.
//!
//! Every node is a small key/value store driven by a tiny command language:
//!
//! | command       | kind   | result                         |
//! |---------------|--------|--------------------------------|
//! | `put k v`     | write  | rows affected (always 1)       |
//! | `delete k`    | write  | rows affected (0 or 1)         |
//! | `get k`       | read   | the value, or null             |
//! | `scan`        | read   | `[[k, v], ...]` in key order   |
//! | `count`       | read   | number of keys                 |
//!
//! Sessions buffer writes between `begin` and `commit`. Nodes support fault
//! injection (fail a method N times, delay or hang a method, go offline) and count
//! every handle they open and release.

use crate::capability::{Capability, ConnectionFactory, Reply, SyncHook};
use async_trait::async_trait;
use hasql_common::{BackendError, Node, NodeId};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Method name used when the factory opens a node's root handle.
pub const OPEN: &str = "open";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Put(String, String),
    Delete(String),
    Get(String),
    Scan,
    Count,
}

impl Command {
    fn parse(sql: &str) -> Result<Self, BackendError> {
        let mut words = sql.split_whitespace();
        let verb = words.next().map(str::to_ascii_lowercase);
        let rest: Vec<&str> = words.collect();
        match (verb.as_deref(), rest.as_slice()) {
            (Some("put"), [key, value @ ..]) if !value.is_empty() => {
                Ok(Command::Put(key.to_string(), value.join(" ")))
            }
            (Some("delete"), [key]) => Ok(Command::Delete(key.to_string())),
            (Some("get"), [key]) => Ok(Command::Get(key.to_string())),
            (Some("scan"), []) => Ok(Command::Scan),
            (Some("count"), []) => Ok(Command::Count),
            _ => Err(BackendError::InvalidArguments(format!(
                "cannot parse command '{}'",
                sql
            ))),
        }
    }

    fn is_write(&self) -> bool {
        matches!(self, Command::Put(..) | Command::Delete(_))
    }
}

fn sql_arg(args: &Value) -> Result<&str, BackendError> {
    args.as_str()
        .ok_or_else(|| BackendError::InvalidArguments(format!("expected a command string, got {}", args)))
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    fail: HashMap<String, usize>,
    hang: HashSet<String>,
    delay: HashMap<String, Duration>,
}

/// One in-memory database.
#[derive(Debug)]
pub struct MemoryNode {
    id: NodeId,
    data: Mutex<BTreeMap<String, String>>,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<String, usize>>,
    login_timeout: AtomicU64,
    opened: AtomicUsize,
    released: AtomicUsize,
    duplicate_releases: AtomicUsize,
}

impl MemoryNode {
    pub fn new(id: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            data: Mutex::new(BTreeMap::new()),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(HashMap::new()),
            login_timeout: AtomicU64::new(0),
            opened: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            duplicate_releases: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Makes the next `times` calls of `method` fail.
    pub fn fail_next(&self, method: &str, times: usize) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .fail
            .insert(method.to_string(), times);
    }

    /// Makes every call of `method` fail until faults are cleared.
    pub fn fail_always(&self, method: &str) {
        self.fail_next(method, usize::MAX);
    }

    /// Makes every call of `method` hang forever.
    pub fn hang(&self, method: &str) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .hang
            .insert(method.to_string());
    }

    /// Makes every call of `method` take at least `latency`.
    pub fn delay(&self, method: &str, latency: Duration) {
        self.faults
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .delay
            .insert(method.to_string(), latency);
    }

    /// An offline node refuses connections and fails every call.
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().unwrap_or_else(|e| e.into_inner()).offline = offline;
    }

    pub fn clear_faults(&self) {
        *self.faults.lock().unwrap_or_else(|e| e.into_inner()) = Faults::default();
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn data(&self) -> BTreeMap<String, String> {
        self.data.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Writes directly, bypassing fault injection.
    pub fn insert(&self, key: &str, value: &str) {
        self.data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
    }

    /// Replaces this node's data with a copy of `source`'s.
    pub fn copy_from(&self, source: &MemoryNode) {
        let snapshot = source.data();
        *self.data.lock().unwrap_or_else(|e| e.into_inner()) = snapshot;
    }

    /// Number of calls of `method` that reached this node.
    pub fn calls(&self, method: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet released.
    pub fn live_handles(&self) -> usize {
        self.opened().saturating_sub(self.released())
    }

    /// Releases of handles that were already released.
    pub fn duplicate_releases(&self) -> usize {
        self.duplicate_releases.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn enter(&self, method: &str) -> Result<(), BackendError> {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(method.to_string())
            .or_insert(0) += 1;

        let (hang, delay) = {
            let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
            if faults.offline {
                return Err(BackendError::Unreachable(format!("{} is offline", self.id)));
            }
            if let Some(remaining) = faults.fail.get_mut(method) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(BackendError::Backend(format!(
                        "injected failure in '{}' on {}",
                        method, self.id
                    )));
                }
            }
            (faults.hang.contains(method), faults.delay.get(method).copied())
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        if let Some(latency) = delay {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }

    fn handle(self: &Arc<Self>) -> HandleGuard {
        self.opened.fetch_add(1, Ordering::SeqCst);
        HandleGuard {
            node: self.clone(),
            released: AtomicBool::new(false),
        }
    }

    fn view(&self, pending: Option<&[Command]>) -> BTreeMap<String, String> {
        let mut view = self.data();
        for command in pending.unwrap_or_default() {
            apply(&mut view, command);
        }
        view
    }
}

fn apply(data: &mut BTreeMap<String, String>, command: &Command) -> u64 {
    match command {
        Command::Put(key, value) => {
            data.insert(key.clone(), value.clone());
            1
        }
        Command::Delete(key) => data.remove(key).map_or(0, |_| 1),
        _ => 0,
    }
}

fn read(data: &BTreeMap<String, String>, command: &Command) -> Vec<Value> {
    match command {
        Command::Get(key) => data.get(key).map(|v| json!([key, v])).into_iter().collect(),
        Command::Scan => data.iter().map(|(k, v)| json!([k, v])).collect(),
        Command::Count => vec![json!([data.len()])],
        _ => Vec::new(),
    }
}

fn query_value(data: &BTreeMap<String, String>, command: &Command) -> Value {
    match command {
        Command::Get(key) => data.get(key).map_or(Value::Null, |v| json!(v)),
        Command::Scan => Value::Array(read(data, command)),
        Command::Count => json!(data.len()),
        _ => Value::Null,
    }
}

/// Counts one open handle; releases it at most once.
#[derive(Debug)]
struct HandleGuard {
    node: Arc<MemoryNode>,
    released: AtomicBool,
}

impl HandleGuard {
    async fn release(&self, kind: &str) -> Result<(), BackendError> {
        if self.released.swap(true, Ordering::SeqCst) {
            self.node.duplicate_releases.fetch_add(1, Ordering::SeqCst);
            return Err(BackendError::Backend(format!("{} released twice", kind)));
        }
        self.node.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Handles
// ============================================================================

#[derive(Debug)]
struct MemoryDataSource {
    node: Arc<MemoryNode>,
    guard: HandleGuard,
}

#[async_trait]
impl Capability for MemoryDataSource {
    async fn invoke(&self, method: &str, args: &Value) -> Result<Reply, BackendError> {
        self.node.enter(method).await?;
        match method {
            "connect" | "connect_as" => {
                let session = MemorySession {
                    state: Arc::new(SessionState {
                        node: self.node.clone(),
                        pending: Mutex::new(None),
                        read_only: AtomicBool::new(false),
                    }),
                    guard: self.node.handle(),
                };
                Ok(Reply::Object(Arc::new(session)))
            }
            "set_login_timeout" => {
                let seconds = args.as_u64().ok_or_else(|| {
                    BackendError::InvalidArguments(format!("expected seconds, got {}", args))
                })?;
                self.node.login_timeout.store(seconds, Ordering::SeqCst);
                Ok(Reply::Value(Value::Null))
            }
            "login_timeout" => Ok(Reply::Value(json!(self
                .node
                .login_timeout
                .load(Ordering::SeqCst)))),
            other => Err(BackendError::UnsupportedMethod(other.to_string())),
        }
    }

    async fn release(&self) -> Result<(), BackendError> {
        self.guard.release("data source").await
    }
}

#[derive(Debug)]
struct SessionState {
    node: Arc<MemoryNode>,
    pending: Mutex<Option<Vec<Command>>>,
    read_only: AtomicBool,
}

impl SessionState {
    fn write(&self, command: Command) -> Result<u64, BackendError> {
        if !command.is_write() {
            return Err(BackendError::InvalidArguments("not a write command".to_string()));
        }
        if self.read_only.load(Ordering::SeqCst) {
            return Err(BackendError::Backend("session is read-only".to_string()));
        }

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.as_mut() {
            Some(buffer) => {
                let mut view = self.node.view(Some(buffer.as_slice()));
                let affected = apply(&mut view, &command);
                buffer.push(command);
                Ok(affected)
            }
            None => {
                let mut data = self.node.data.lock().unwrap_or_else(|e| e.into_inner());
                Ok(apply(&mut data, &command))
            }
        }
    }

    fn snapshot(&self) -> BTreeMap<String, String> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        self.node.view(pending.as_deref())
    }

    fn read(&self, command: &Command) -> Result<Value, BackendError> {
        if command.is_write() {
            return Err(BackendError::InvalidArguments("not a read command".to_string()));
        }
        Ok(query_value(&self.snapshot(), command))
    }
}

#[derive(Debug)]
struct MemorySession {
    state: Arc<SessionState>,
    guard: HandleGuard,
}

#[async_trait]
impl Capability for MemorySession {
    async fn invoke(&self, method: &str, args: &Value) -> Result<Reply, BackendError> {
        let state = &self.state;
        state.node.enter(method).await?;
        match method {
            "prepare" => {
                let command = Command::parse(sql_arg(args)?)?;
                let statement = MemoryStatement {
                    session: state.clone(),
                    command,
                    fetch_size: AtomicU64::new(0),
                    guard: state.node.handle(),
                };
                Ok(Reply::Object(Arc::new(statement)))
            }
            "execute" => {
                let command = Command::parse(sql_arg(args)?)?;
                Ok(Reply::Value(json!(state.write(command)?)))
            }
            "query" => {
                let command = Command::parse(sql_arg(args)?)?;
                Ok(Reply::Value(state.read(&command)?))
            }
            "begin" => {
                let mut pending = state.pending.lock().unwrap_or_else(|e| e.into_inner());
                if pending.is_some() {
                    return Err(BackendError::Backend("transaction already open".to_string()));
                }
                *pending = Some(Vec::new());
                Ok(Reply::Value(Value::Null))
            }
            "commit" => {
                let buffer = state
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                    .unwrap_or_default();
                let mut data = state.node.data.lock().unwrap_or_else(|e| e.into_inner());
                for command in &buffer {
                    apply(&mut data, command);
                }
                Ok(Reply::Value(json!(buffer.len())))
            }
            "rollback" => {
                let buffer = state
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                    .unwrap_or_default();
                Ok(Reply::Value(json!(buffer.len())))
            }
            "set_read_only" => {
                let read_only = args.as_bool().ok_or_else(|| {
                    BackendError::InvalidArguments(format!("expected a boolean, got {}", args))
                })?;
                state.read_only.store(read_only, Ordering::SeqCst);
                Ok(Reply::Value(Value::Null))
            }
            other => Err(BackendError::UnsupportedMethod(other.to_string())),
        }
    }

    async fn release(&self) -> Result<(), BackendError> {
        // uncommitted work is discarded
        self.state
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.guard.release("session").await
    }
}

#[derive(Debug)]
struct MemoryStatement {
    session: Arc<SessionState>,
    command: Command,
    fetch_size: AtomicU64,
    guard: HandleGuard,
}

#[async_trait]
impl Capability for MemoryStatement {
    async fn invoke(&self, method: &str, args: &Value) -> Result<Reply, BackendError> {
        let node = &self.session.node;
        node.enter(method).await?;
        match method {
            "execute_update" => Ok(Reply::Value(json!(self.session.write(self.command.clone())?))),
            "execute_query" => {
                if self.command.is_write() {
                    return Err(BackendError::InvalidArguments("not a read command".to_string()));
                }
                let rows = read(&self.session.snapshot(), &self.command);
                let cursor = MemoryCursor {
                    node: node.clone(),
                    rows: Mutex::new(rows.into()),
                    guard: node.handle(),
                };
                Ok(Reply::Object(Arc::new(cursor)))
            }
            "set_fetch_size" => {
                let rows = args.as_u64().ok_or_else(|| {
                    BackendError::InvalidArguments(format!("expected a row count, got {}", args))
                })?;
                self.fetch_size.store(rows, Ordering::SeqCst);
                Ok(Reply::Value(Value::Null))
            }
            other => Err(BackendError::UnsupportedMethod(other.to_string())),
        }
    }

    async fn release(&self) -> Result<(), BackendError> {
        self.guard.release("statement").await
    }
}

#[derive(Debug)]
struct MemoryCursor {
    node: Arc<MemoryNode>,
    rows: Mutex<VecDeque<Value>>,
    guard: HandleGuard,
}

#[async_trait]
impl Capability for MemoryCursor {
    async fn invoke(&self, method: &str, _args: &Value) -> Result<Reply, BackendError> {
        self.node.enter(method).await?;
        match method {
            "next" => {
                let row = self
                    .rows
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_front()
                    .unwrap_or(Value::Null);
                Ok(Reply::Value(row))
            }
            other => Err(BackendError::UnsupportedMethod(other.to_string())),
        }
    }

    async fn release(&self) -> Result<(), BackendError> {
        self.guard.release("cursor").await
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Connection factory over a set of in-memory nodes.
///
/// Nodes are created on first use, so a cluster can be configured before or
/// after its backends are set up.
#[derive(Debug, Default)]
pub struct MemoryCluster {
    nodes: Mutex<BTreeMap<NodeId, Arc<MemoryNode>>>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// The backend for `id`, created if missing.
    pub fn node(&self, id: &NodeId) -> Arc<MemoryNode> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id.clone())
            .or_insert_with(|| Arc::new(MemoryNode::new(id.clone())))
            .clone()
    }

    pub fn nodes(&self) -> Vec<Arc<MemoryNode>> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ConnectionFactory for MemoryCluster {
    async fn connect(&self, node: &Node) -> Result<Arc<dyn Capability>, BackendError> {
        let backend = self.node(&node.id);
        backend.enter(OPEN).await?;
        Ok(Arc::new(MemoryDataSource {
            guard: backend.handle(),
            node: backend,
        }))
    }
}

/// Synchronizes a rejoining node by copying the data of a reference node.
#[derive(Debug, Clone)]
pub struct CopySync {
    backends: Arc<MemoryCluster>,
    source: NodeId,
}

impl CopySync {
    pub fn new(backends: Arc<MemoryCluster>, source: impl Into<NodeId>) -> Self {
        Self {
            backends,
            source: source.into(),
        }
    }
}

#[async_trait]
impl SyncHook for CopySync {
    async fn synchronize(&self, node: &Node) -> Result<(), BackendError> {
        let source = self.backends.node(&self.source);
        let target = self.backends.node(&node.id);
        source.enter("sync").await?;
        target.enter("sync").await?;
        target.copy_from(&source);
        Ok(())
    }
}
