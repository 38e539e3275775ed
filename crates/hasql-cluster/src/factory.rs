use crate::cluster::ClusterState;
use crate::interface::Interface;
use crate::proxy::SqlProxy;
use hasql_common::{ClusterError, Result};
use std::sync::Arc;

/// A typed object satisfying one capability interface, backed by a proxy.
pub trait Facade: Sized {
    fn interface() -> &'static Interface;

    /// Wraps `proxy` without checking its interface.
    fn from_proxy(proxy: SqlProxy) -> Self;

    fn proxy(&self) -> &SqlProxy;
}

/// Builds facades over invocation handlers.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProxyFactory;

impl ProxyFactory {
    /// Wraps `proxy` as `F`, checking that it serves `F`'s interface.
    pub fn create<F: Facade>(proxy: SqlProxy) -> Result<F> {
        if proxy.interface() != F::interface() {
            return Err(ClusterError::UnexpectedResult {
                method: "create".to_string(),
                reason: format!(
                    "expected a {} proxy, got {}",
                    F::interface().name,
                    proxy.interface_name()
                ),
            });
        }
        Ok(F::from_proxy(proxy))
    }

    /// Root facade whose delegates come from the cluster's connection factory.
    pub fn root<F: Facade>(cluster: &Arc<ClusterState>) -> F {
        F::from_proxy(SqlProxy::root(cluster, F::interface()))
    }
}
