//! Static capability interface tables.
//!
//! Each capability interface is described once by an [`Interface`]: the list
//! of its methods and, per method, how it is dispatched, what it returns and
//! whether it opens or closes a transaction.

use hasql_common::Result;
use serde_json::{Map, Value};
use std::fmt;

/// Proxy metadata visible to local methods.
#[derive(Debug)]
pub struct ProxyInfo<'a> {
    pub interface: &'static Interface,
    /// Nodes the proxy would currently dispatch to
    pub live_nodes: usize,
    pub in_transaction: bool,
    /// Remembered arguments, by key
    pub attributes: &'a Map<String, Value>,
}

/// Local method body: answered from proxy metadata, never touches a node.
pub type LocalFn = fn(&ProxyInfo<'_>, &Value) -> Result<Value>;

/// How a method reaches the backends
#[derive(Clone, Copy)]
pub enum Dispatch {
    /// Every target node, in parallel
    FanOut,
    /// One node chosen by the balancer
    SingleTarget,
    /// The lowest-id target node, bypassing the balancer
    Primary,
    /// No node at all
    Local(LocalFn),
}

impl Dispatch {
    pub fn is_local(&self) -> bool {
        matches!(self, Dispatch::Local(_))
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dispatch::FanOut => f.write_str("FanOut"),
            Dispatch::SingleTarget => f.write_str("SingleTarget"),
            Dispatch::Primary => f.write_str("Primary"),
            Dispatch::Local(_) => f.write_str("Local"),
        }
    }
}

/// What a method returns per node
#[derive(Clone, Copy)]
pub enum Returns {
    Value,
    /// A capability object, wrapped in a child proxy of this interface
    Object(&'static Interface),
}

impl fmt::Debug for Returns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Returns::Value => f.write_str("Value"),
            Returns::Object(interface) => write!(f, "Object({})", interface.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxBoundary {
    None,
    Begin,
    End,
}

#[derive(Debug, Clone, Copy)]
pub struct MethodSpec {
    pub name: &'static str,
    pub dispatch: Dispatch,
    pub returns: Returns,
    pub tx: TxBoundary,
    /// Attribute key the call's arguments are remembered under
    pub remembers: Option<&'static str>,
}

impl MethodSpec {
    const fn new(name: &'static str, dispatch: Dispatch) -> Self {
        Self {
            name,
            dispatch,
            returns: Returns::Value,
            tx: TxBoundary::None,
            remembers: None,
        }
    }

    pub const fn fan_out(name: &'static str) -> Self {
        Self::new(name, Dispatch::FanOut)
    }

    pub const fn single_target(name: &'static str) -> Self {
        Self::new(name, Dispatch::SingleTarget)
    }

    pub const fn primary(name: &'static str) -> Self {
        Self::new(name, Dispatch::Primary)
    }

    pub const fn local(name: &'static str, body: LocalFn) -> Self {
        Self::new(name, Dispatch::Local(body))
    }

    pub const fn returning(mut self, interface: &'static Interface) -> Self {
        self.returns = Returns::Object(interface);
        self
    }

    pub const fn begins(mut self) -> Self {
        self.tx = TxBoundary::Begin;
        self
    }

    pub const fn ends(mut self) -> Self {
        self.tx = TxBoundary::End;
        self
    }

    pub const fn remembering(mut self, key: &'static str) -> Self {
        self.remembers = Some(key);
        self
    }

    pub fn returns_object(&self) -> bool {
        matches!(self.returns, Returns::Object(_))
    }
}

/// A capability interface.
#[derive(Debug)]
pub struct Interface {
    pub name: &'static str,
    /// Whether proxies of this interface open their own dispatch scope
    pub scope_root: bool,
    pub methods: &'static [MethodSpec],
}

impl Interface {
    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// The method that remembers its arguments under `key`.
    pub fn remembering(&self, key: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.remembers == Some(key))
    }
}

impl PartialEq for Interface {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answer(_info: &ProxyInfo<'_>, _args: &Value) -> Result<Value> {
        Ok(json!(42))
    }

    static LEAF: Interface = Interface {
        name: "leaf",
        scope_root: false,
        methods: &[MethodSpec::fan_out("touch")],
    };

    static ROOT: Interface = Interface {
        name: "root",
        scope_root: true,
        methods: &[
            MethodSpec::fan_out("open").returning(&LEAF),
            MethodSpec::single_target("read"),
            MethodSpec::fan_out("start").begins(),
            MethodSpec::fan_out("finish").ends(),
            MethodSpec::fan_out("set_size").remembering("size"),
            MethodSpec::local("answer", answer),
        ],
    };

    #[test]
    fn test_method_lookup() {
        let open = ROOT.method("open").unwrap();
        assert!(open.returns_object());
        assert!(matches!(open.dispatch, Dispatch::FanOut));
        assert!(matches!(ROOT.method("read").unwrap().dispatch, Dispatch::SingleTarget));
        assert!(ROOT.method("missing").is_none());
    }

    #[test]
    fn test_transaction_flags() {
        assert_eq!(ROOT.method("start").unwrap().tx, TxBoundary::Begin);
        assert_eq!(ROOT.method("finish").unwrap().tx, TxBoundary::End);
        assert_eq!(ROOT.method("read").unwrap().tx, TxBoundary::None);
    }

    #[test]
    fn test_remembering_lookup() {
        assert_eq!(ROOT.remembering("size").unwrap().name, "set_size");
        assert!(ROOT.remembering("other").is_none());
    }

    #[test]
    fn test_local_body() {
        let spec = ROOT.method("answer").unwrap();
        let attributes = Map::new();
        let info = ProxyInfo {
            interface: &ROOT,
            live_nodes: 2,
            in_transaction: false,
            attributes: &attributes,
        };
        match spec.dispatch {
            Dispatch::Local(body) => assert_eq!(body(&info, &Value::Null).unwrap(), json!(42)),
            other => panic!("expected local, got {:?}", other),
        }
    }

    #[test]
    fn test_interface_identity() {
        assert_eq!(ROOT, ROOT);
        assert_ne!(ROOT, LEAF);
        assert_eq!(format!("{:?}", ROOT.method("open").unwrap().returns), "Object(leaf)");
    }
}
