//! The standard SQL capability interfaces and their typed facades.

use crate::factory::{Facade, ProxyFactory};
use crate::interface::{Interface, MethodSpec, ProxyInfo};
use crate::proxy::SqlProxy;
use hasql_common::{ClusterError, Result};
use serde_json::{json, Value};

// ============================================================================
// Interface Tables
// ============================================================================

pub static DATA_SOURCE: Interface = Interface {
    name: "data_source",
    scope_root: false,
    methods: &[
        MethodSpec::fan_out("connect").returning(&SESSION),
        MethodSpec::fan_out("connect_as").returning(&SESSION),
        MethodSpec::fan_out("set_login_timeout").remembering("login_timeout"),
        MethodSpec::primary("login_timeout"),
        MethodSpec::local("node_count", node_count),
    ],
};

pub static SESSION: Interface = Interface {
    name: "session",
    scope_root: true,
    methods: &[
        MethodSpec::fan_out("prepare").returning(&STATEMENT),
        MethodSpec::fan_out("execute"),
        MethodSpec::single_target("query"),
        MethodSpec::fan_out("begin").begins(),
        MethodSpec::fan_out("commit").ends(),
        MethodSpec::fan_out("rollback").ends(),
        MethodSpec::fan_out("set_read_only").remembering("read_only"),
        MethodSpec::local("is_read_only", is_read_only),
        MethodSpec::local("in_transaction", in_transaction),
        MethodSpec::local("node_count", node_count),
    ],
};

pub static STATEMENT: Interface = Interface {
    name: "statement",
    scope_root: false,
    methods: &[
        MethodSpec::fan_out("execute_update"),
        MethodSpec::single_target("execute_query").returning(&CURSOR),
        MethodSpec::fan_out("set_fetch_size").remembering("fetch_size"),
        MethodSpec::local("fetch_size", fetch_size),
    ],
};

pub static CURSOR: Interface = Interface {
    name: "cursor",
    scope_root: false,
    methods: &[MethodSpec::fan_out("next")],
};

fn node_count(info: &ProxyInfo<'_>, _args: &Value) -> Result<Value> {
    Ok(json!(info.live_nodes))
}

fn is_read_only(info: &ProxyInfo<'_>, _args: &Value) -> Result<Value> {
    Ok(info
        .attributes
        .get("read_only")
        .cloned()
        .unwrap_or(Value::Bool(false)))
}

fn in_transaction(info: &ProxyInfo<'_>, _args: &Value) -> Result<Value> {
    Ok(Value::Bool(info.in_transaction))
}

fn fetch_size(info: &ProxyInfo<'_>, _args: &Value) -> Result<Value> {
    Ok(info.attributes.get("fetch_size").cloned().unwrap_or(json!(0)))
}

fn expect_u64(method: &str, value: Value) -> Result<u64> {
    value.as_u64().ok_or_else(|| ClusterError::UnexpectedResult {
        method: method.to_string(),
        reason: format!("expected an unsigned integer, got {}", value),
    })
}

fn expect_bool(method: &str, value: Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| ClusterError::UnexpectedResult {
        method: method.to_string(),
        reason: format!("expected a boolean, got {}", value),
    })
}

macro_rules! facade {
    ($name:ident, $interface:expr) => {
        #[derive(Debug, Clone)]
        pub struct $name {
            proxy: SqlProxy,
        }

        impl Facade for $name {
            fn interface() -> &'static Interface {
                &$interface
            }

            fn from_proxy(proxy: SqlProxy) -> Self {
                Self { proxy }
            }

            fn proxy(&self) -> &SqlProxy {
                &self.proxy
            }
        }

        impl $name {
            /// Releases this handle and everything derived from it.
            pub async fn close(&self) -> Result<()> {
                self.proxy.close().await
            }

            pub fn is_closed(&self) -> bool {
                self.proxy.is_closed()
            }
        }
    };
}

facade!(DataSource, DATA_SOURCE);
facade!(Session, SESSION);
facade!(Statement, STATEMENT);
facade!(Cursor, CURSOR);

// ============================================================================
// Facades
// ============================================================================

impl DataSource {
    pub async fn connect(&self) -> Result<Session> {
        let proxy = self.proxy.derive("connect", Value::Null).await?;
        ProxyFactory::create(proxy)
    }

    pub async fn connect_as(&self, user: &str, password: &str) -> Result<Session> {
        let args = json!({ "user": user, "password": password });
        let proxy = self.proxy.derive("connect_as", args).await?;
        ProxyFactory::create(proxy)
    }

    pub async fn set_login_timeout(&self, seconds: u64) -> Result<()> {
        self.proxy.call("set_login_timeout", json!(seconds)).await?;
        Ok(())
    }

    /// Read from the lowest-id active node.
    pub async fn login_timeout(&self) -> Result<u64> {
        let value = self.proxy.call("login_timeout", Value::Null).await?;
        expect_u64("login_timeout", value)
    }

    pub async fn node_count(&self) -> Result<u64> {
        let value = self.proxy.call("node_count", Value::Null).await?;
        expect_u64("node_count", value)
    }
}

impl Session {
    pub async fn prepare(&self, sql: &str) -> Result<Statement> {
        let proxy = self.proxy.derive("prepare", json!(sql)).await?;
        ProxyFactory::create(proxy)
    }

    /// Runs a write on every node; returns rows affected.
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        let value = self.proxy.call("execute", json!(sql)).await?;
        expect_u64("execute", value)
    }

    /// Runs a read on one node.
    pub async fn query(&self, sql: &str) -> Result<Value> {
        self.proxy.call("query", json!(sql)).await
    }

    pub async fn begin(&self) -> Result<()> {
        self.proxy.call("begin", Value::Null).await?;
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        self.proxy.call("commit", Value::Null).await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.proxy.call("rollback", Value::Null).await?;
        Ok(())
    }

    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.proxy.call("set_read_only", json!(read_only)).await?;
        Ok(())
    }

    pub async fn is_read_only(&self) -> Result<bool> {
        let value = self.proxy.call("is_read_only", Value::Null).await?;
        expect_bool("is_read_only", value)
    }

    pub async fn in_transaction(&self) -> Result<bool> {
        let value = self.proxy.call("in_transaction", Value::Null).await?;
        expect_bool("in_transaction", value)
    }

    pub async fn node_count(&self) -> Result<u64> {
        let value = self.proxy.call("node_count", Value::Null).await?;
        expect_u64("node_count", value)
    }
}

impl Statement {
    pub async fn execute_update(&self) -> Result<u64> {
        let value = self.proxy.call("execute_update", Value::Null).await?;
        expect_u64("execute_update", value)
    }

    /// Runs the statement as a read on one node; the cursor is bound to it.
    pub async fn execute_query(&self) -> Result<Cursor> {
        let proxy = self.proxy.derive("execute_query", Value::Null).await?;
        ProxyFactory::create(proxy)
    }

    pub async fn set_fetch_size(&self, rows: u64) -> Result<()> {
        self.proxy.call("set_fetch_size", json!(rows)).await?;
        Ok(())
    }

    pub async fn fetch_size(&self) -> Result<u64> {
        let value = self.proxy.call("fetch_size", Value::Null).await?;
        expect_u64("fetch_size", value)
    }
}

impl Cursor {
    /// The next row, or `None` once exhausted.
    pub async fn next_row(&self) -> Result<Option<Value>> {
        match self.proxy.call("next", Value::Null).await? {
            Value::Null => Ok(None),
            row => Ok(Some(row)),
        }
    }

    /// Drains the remaining rows.
    pub async fn collect_rows(&self) -> Result<Vec<Value>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::{Dispatch, TxBoundary};

    #[test]
    fn test_interface_classification() {
        assert!(matches!(SESSION.method("execute").unwrap().dispatch, Dispatch::FanOut));
        assert!(matches!(SESSION.method("query").unwrap().dispatch, Dispatch::SingleTarget));
        assert!(matches!(DATA_SOURCE.method("login_timeout").unwrap().dispatch, Dispatch::Primary));
        assert!(SESSION.method("in_transaction").unwrap().dispatch.is_local());
        assert_eq!(SESSION.method("commit").unwrap().tx, TxBoundary::End);
        assert!(SESSION.scope_root);
        assert!(!STATEMENT.scope_root);
    }

    #[test]
    fn test_capability_returns() {
        assert!(DATA_SOURCE.method("connect").unwrap().returns_object());
        assert!(SESSION.method("prepare").unwrap().returns_object());
        assert!(STATEMENT.method("execute_query").unwrap().returns_object());
        assert!(!STATEMENT.method("execute_update").unwrap().returns_object());
    }

    #[test]
    fn test_local_defaults() {
        let attributes = serde_json::Map::new();
        let info = ProxyInfo {
            interface: &STATEMENT,
            live_nodes: 3,
            in_transaction: true,
            attributes: &attributes,
        };
        assert_eq!(fetch_size(&info, &Value::Null).unwrap(), json!(0));
        assert_eq!(is_read_only(&info, &Value::Null).unwrap(), json!(false));
        assert_eq!(in_transaction(&info, &Value::Null).unwrap(), json!(true));
        assert_eq!(node_count(&info, &Value::Null).unwrap(), json!(3));
    }

    #[test]
    fn test_expect_helpers() {
        assert_eq!(expect_u64("m", json!(4)).unwrap(), 4);
        assert!(matches!(
            expect_u64("m", json!("x")),
            Err(ClusterError::UnexpectedResult { .. })
        ));
        assert!(expect_bool("m", json!(true)).unwrap());
    }
}
