//! The trait application objects implement to receive remote calls.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{codec::Message, connection::Connection, error::BusError, value::Value};

/// The result of servicing an `Invoke`.
///
/// A call terminates with a single value. Any `Yield`/`Next` exchange with
/// the caller's block happens inline during the call, through the
/// [`Yielder`] handed to [`Dispatch::call`] — not as data handed back
/// afterward, since the caller's reply to a `Yield` step (a value to resume
/// with, an error, or a close) must be able to feed back into the method
/// while it is still running.
#[derive(Debug)]
pub enum CallOutcome {
    /// A single terminal value.
    Return(Value),
}

/// What the caller sent back in response to one [`Yielder::yield_values`]
/// step.
#[derive(Debug)]
pub enum YieldReply {
    /// The block ran and produced this value; resume the method with it.
    Next(Value),
    /// The block raised; propagate the failure into the yielding method.
    Error(BusError),
    /// The caller closed the yield loop. The method decides how to finish
    /// from here — return a value, raise, or unwind any local state first.
    Closed,
}

/// What a block callback decides to send back in response to a `Yield`,
/// from the initiator's side of the exchange.
#[derive(Debug)]
pub enum BlockReply {
    /// Feed `value` back as `Next`, letting the remote method resume.
    Next(Value),
    /// Raise into the remote method via `Error`.
    Error(BusError),
    /// Send `Close`; the remote method decides how to finish.
    Close,
}

enum YielderBackend {
    Wire { id: u32, conn: Arc<Connection>, inbox: mpsc::UnboundedReceiver<Message> },
    Local { on_yield: Box<dyn FnMut(Vec<Value>) -> BlockReply + Send> },
}

/// Handed to [`Dispatch::call`] so a method can drive the interactive
/// `Yield`/`Next` exchange: each [`Yielder::yield_values`] call emits one
/// `Yield` step and suspends until the paired `Next`, `Error`, or `Close`
/// arrives — over the wire if the call came from the peer, or directly from
/// the caller's own block if the call was dispatched locally (see
/// [`crate::Connection::resolve_proxy`]).
pub struct Yielder {
    has_block: bool,
    backend: YielderBackend,
}

impl Yielder {
    pub(crate) fn wire(id: u32, has_block: bool, conn: Arc<Connection>, inbox: mpsc::UnboundedReceiver<Message>) -> Self {
        Self { has_block, backend: YielderBackend::Wire { id, conn, inbox } }
    }

    pub(crate) fn local(on_yield: Option<Box<dyn FnMut(Vec<Value>) -> BlockReply + Send>>) -> Self {
        let has_block = on_yield.is_some();
        let on_yield = on_yield.unwrap_or_else(|| Box::new(|_| BlockReply::Close));
        Self { has_block, backend: YielderBackend::Local { on_yield } }
    }

    /// `true` if the caller supplied a block. When `false`,
    /// [`Self::yield_values`] never touches the wire and immediately reports
    /// [`YieldReply::Error`].
    #[must_use]
    pub const fn has_block(&self) -> bool { self.has_block }

    /// Send `values` as one `Yield` step and await the paired reply.
    pub async fn yield_values(&mut self, values: Vec<Value>) -> YieldReply {
        if !self.has_block {
            return YieldReply::Error(BusError::NoBlockForYield);
        }
        match &mut self.backend {
            YielderBackend::Wire { id, conn, inbox } => {
                if conn.send_yield(*id, values).is_err() {
                    return YieldReply::Closed;
                }
                match inbox.recv().await {
                    Some(Message::Next { value, .. }) => YieldReply::Next(value),
                    Some(Message::Error { exception, .. }) => YieldReply::Error(Connection::exception_to_error(exception)),
                    _ => YieldReply::Closed,
                }
            }
            YielderBackend::Local { on_yield } => match on_yield(values) {
                BlockReply::Next(value) => YieldReply::Next(value),
                BlockReply::Error(err) => YieldReply::Error(err),
                BlockReply::Close => YieldReply::Closed,
            },
        }
    }
}

/// Implemented by application objects bound into an [`crate::registry::ObjectRegistry`].
///
/// Mirrors a dynamic-language object with reflective method dispatch: the
/// method name and arguments arrive already decoded, and implementations
/// are free to match on `method` however they like.
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync {
    /// Invoke `method` with positional and keyword arguments.
    ///
    /// `conn` is the connection the call arrived on, so an implementation
    /// can turn a `Value::Proxy` argument back into a callable
    /// [`crate::proxy::Proxy`] — via [`Connection::proxy_for`] for a name
    /// known to belong to the peer, or [`Connection::resolve_proxy`] for a
    /// name decoded out of a message, which also recognizes names this side
    /// bound itself — or export one of its own objects via
    /// [`Connection::export`].
    ///
    /// `yielder` drives the interactive `Yield`/`Next` exchange for methods
    /// that yield intermediate values to the caller's block; see
    /// [`Yielder::has_block`].
    ///
    /// Returning `Err` raises a remote exception; the connection translates
    /// it into an `Error` message carrying a `Value::Exception`.
    async fn call(
        &self,
        conn: &Arc<Connection>,
        method: &str,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        yielder: &mut Yielder,
    ) -> Result<CallOutcome, BusError>;
}
