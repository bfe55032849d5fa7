//! Proxies: local handles standing in for an object bound on the peer, or
//! (via [`Proxy::local`]) a thin forwarding wrapper around an object bound
//! on this side.

use std::sync::{Arc, Weak};

use crate::{
    connection::Connection,
    dispatch::{BlockReply, CallOutcome, Dispatch, Yielder},
    error::BusError,
    name::Name,
    value::Value,
};

enum ProxyTarget {
    Remote(Weak<Connection>),
    Local(Arc<dyn Dispatch>, Weak<Connection>),
}

pub(crate) struct ProxyInner {
    name: Name,
    target: ProxyTarget,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        let connection = match &self.target {
            ProxyTarget::Remote(conn) | ProxyTarget::Local(_, conn) => conn,
        };
        if let Some(conn) = connection.upgrade() {
            conn.notify_proxy_dropped(&self.name);
        }
    }
}

/// A handle to an object bound on the other side of a connection, or (for
/// one resolved via [`Connection::resolve_proxy`] against this side's own
/// registry) to an object bound locally.
///
/// Cloning a `Proxy` is cheap and shares the same underlying binding; the
/// peer is only notified of release once the last clone is dropped.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub(crate) fn new(name: Name, connection: Weak<Connection>) -> Self {
        Self { inner: Arc::new(ProxyInner { name, target: ProxyTarget::Remote(connection) }) }
    }

    /// A proxy that dispatches directly to a locally-bound object rather
    /// than round-tripping over the wire, used by [`Connection::resolve_proxy`]
    /// to give a proxy handed back across the wire its original identity.
    pub(crate) fn local(name: Name, object: Arc<dyn Dispatch>, connection: Weak<Connection>) -> Self {
        Self { inner: Arc::new(ProxyInner { name, target: ProxyTarget::Local(object, connection) }) }
    }

    /// Wrap an already-constructed `Arc<ProxyInner>`, used by a connection's
    /// proxy cache to hand back the same identity for repeated references to
    /// the same name.
    pub(crate) fn from_arc(inner: Arc<ProxyInner>) -> Self { Self { inner } }

    /// A weak handle suitable for a connection's proxy cache.
    pub(crate) fn downgrade(&self) -> Weak<ProxyInner> { Arc::downgrade(&self.inner) }

    /// The name this proxy refers to (`__name__`).
    #[must_use]
    pub fn name(&self) -> &Name { &self.inner.name }

    /// The connection this proxy is attached to (`__connection__`).
    ///
    /// # Errors
    /// Returns [`BusError::ConnectionClosed`] if the owning connection has
    /// already been dropped.
    pub fn connection(&self) -> Result<Arc<Connection>, BusError> {
        match &self.inner.target {
            ProxyTarget::Remote(conn) | ProxyTarget::Local(_, conn) => {
                conn.upgrade().ok_or_else(|| BusError::ConnectionClosed(self.inner.name.to_string()))
            }
        }
    }

    /// Invoke `method` with no block callback, returning the terminal value.
    ///
    /// # Errors
    /// Returns [`BusError::ConnectionClosed`] if the owning connection has
    /// already been dropped, and whatever error the call itself produces.
    pub async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<Value, BusError> {
        self.call_with_block(method, args, kwargs, |_| BlockReply::Close).await
    }

    /// Invoke `method` with a block callback.
    ///
    /// `on_yield` is called once per `Yield` the acceptor produces, with the
    /// values it yielded, and decides how to resume, raise into, or close
    /// the exchange via its [`BlockReply`]. The call resolves to the
    /// method's own terminal return value.
    ///
    /// # Errors
    /// Returns [`BusError::ConnectionClosed`] if the owning connection has
    /// already been dropped, and whatever error the call itself produces.
    pub async fn call_with_block<F>(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        on_yield: F,
    ) -> Result<Value, BusError>
    where
        F: FnMut(Vec<Value>) -> BlockReply + Send + 'static,
    {
        match &self.inner.target {
            ProxyTarget::Remote(conn) => {
                let conn = conn.upgrade().ok_or_else(|| BusError::ConnectionClosed(self.inner.name.to_string()))?;
                conn.invoke(self.inner.name.clone(), method.to_owned(), args, kwargs, Some(Box::new(on_yield))).await
            }
            ProxyTarget::Local(object, conn) => {
                let conn = conn.upgrade().ok_or_else(|| BusError::ConnectionClosed(self.inner.name.to_string()))?;
                let mut yielder = Yielder::local(Some(Box::new(on_yield)));
                match object.call(&conn, method, args, kwargs, &mut yielder).await? {
                    CallOutcome::Return(value) => Ok(value),
                }
            }
        }
    }

    /// Ask the remote object whether it implements `method`, using the
    /// reserved `"__responds_to__"` method name. A reflective miss (the
    /// object doesn't implement the reserved query) resolves to `Ok(false)`
    /// rather than an error; connection failures still propagate.
    ///
    /// # Errors
    /// Returns whatever error a transport-level failure produces; never
    /// returns `Err` merely because the remote object lacks the method.
    pub async fn responds_to(&self, method: &str) -> Result<bool, BusError> {
        match self.call("__responds_to__", vec![Value::Str(method.to_owned())], vec![]).await {
            Ok(Value::Bool(b)) => Ok(b),
            Ok(_) | Err(BusError::Remote { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        let same_connection = match (&self.inner.target, &other.inner.target) {
            (ProxyTarget::Remote(a), ProxyTarget::Remote(b)) => Weak::ptr_eq(a, b),
            (ProxyTarget::Local(_, a), ProxyTarget::Local(_, b)) => Weak::ptr_eq(a, b),
            _ => false,
        };
        self.inner.name == other.inner.name && same_connection
    }
}

impl Eq for Proxy {}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").field("name", &self.inner.name).finish()
    }
}

impl std::fmt::Display for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "proxy {}", self.inner.name)
    }
}

/// Forwards calls to the proxied object, giving a `Proxy` received as a
/// decoded `Value::Proxy` and re-exported via [`Connection::export`] the
/// same call surface as any other bound object — the mechanism multi-hop
/// forwarding relies on.
///
/// Does not bridge an interactive `Yield` exchange through the forward: the
/// inner call always runs with a fresh, blockless `Yielder`, so a forwarded
/// method that yields sees no block and gets `NoBlockForYield`.
#[async_trait::async_trait]
impl Dispatch for Proxy {
    async fn call(
        &self,
        _conn: &Arc<Connection>,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        yielder: &mut Yielder,
    ) -> Result<CallOutcome, BusError> {
        if yielder.has_block() {
            tracing::debug!(proxy = %self, "forwarded call ignores the caller's yield block");
        }
        Ok(CallOutcome::Return(self.call(method, args, kwargs).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxies_with_a_dead_connection_compare_unequal_by_weak_identity() {
        let a = Proxy::new(Name::explicit("x"), Weak::new());
        let b = Proxy::new(Name::explicit("x"), Weak::new());
        assert_ne!(a, b, "distinct Weak::new() instances never point to the same allocation");
        assert_eq!(a.clone(), a);
    }

    #[tokio::test]
    async fn calling_through_a_dropped_connection_errors() {
        let proxy = Proxy::new(Name::explicit("x"), Weak::new());
        let err = proxy.call("ping", vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, BusError::ConnectionClosed(_)));
    }

    #[test]
    fn display_renders_proxy_and_name() {
        let proxy = Proxy::new(Name::explicit("root"), Weak::new());
        assert_eq!(proxy.to_string(), "proxy root");
    }
}
