//! The per-socket connection: dispatch loop, object registry, and proxy
//! cache for one end of the bus.

#![expect(
    clippy::let_underscore_must_use,
    reason = "outbound sends on a possibly-already-closed connection are fire-and-forget"
)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{split, AsyncRead, AsyncWrite},
    sync::mpsc,
};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::Instrument;

use crate::{
    codec::{BusCodec, Message},
    dispatch::{BlockReply, CallOutcome, Dispatch, Yielder},
    error::BusError,
    name::{ImplicitNameAllocator, Name},
    proxy::{Proxy, ProxyInner},
    registry::ObjectRegistry,
    transaction::{Role, TransactionIdAllocator},
    value::Value,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// One end of a bus connection: owns the object registry and proxy cache
/// for this side, and drives the read/write dispatch loop over the wire.
pub struct Connection {
    registry: Mutex<ObjectRegistry>,
    proxies: Mutex<HashMap<Name, Weak<ProxyInner>>>,
    names: ImplicitNameAllocator,
    ids: TransactionIdAllocator,
    outbound: mpsc::UnboundedSender<Message>,
    inflight: Mutex<HashMap<u32, mpsc::UnboundedSender<Message>>>,
    read_timeout: Option<Duration>,
}

impl Connection {
    /// Take ownership of `stream` and start the dispatch loop, returning a
    /// handle shared between the caller and the background tasks.
    ///
    /// `role` determines this side's half of the transaction id space (see
    /// [`crate::transaction`]). `reference_types` configures the codec's
    /// per-connection reference-type tag assignments. `read_timeout`, if
    /// set, bounds how long [`Self::invoke`] waits for the next message of
    /// an in-flight transaction before treating it as an implicit
    /// `Return(nil)`.
    #[must_use]
    pub fn spawn<S>(stream: S, role: Role, reference_types: Vec<String>, read_timeout: Option<Duration>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = split(stream);
        let mut framed_read = FramedRead::new(read_half, BusCodec::with_reference_types(reference_types.clone()));
        let mut framed_write = FramedWrite::new(write_half, BusCodec::with_reference_types(reference_types));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

        let conn = Arc::new(Self {
            registry: Mutex::new(ObjectRegistry::new()),
            proxies: Mutex::new(HashMap::new()),
            names: ImplicitNameAllocator::new(),
            ids: TransactionIdAllocator::new(role),
            outbound: outbound_tx,
            inflight: Mutex::new(HashMap::new()),
            read_timeout,
        });

        tokio::spawn(
            async move {
                while let Some(msg) = outbound_rx.recv().await {
                    if framed_write.send(msg).await.is_err() {
                        tracing::debug!("write half closed, stopping writer task");
                        break;
                    }
                }
            }
            .instrument(tracing::info_span!("bus_writer")),
        );

        let reader_conn = Arc::clone(&conn);
        tokio::spawn(
            async move {
                loop {
                    match framed_read.next().await {
                        Some(Ok(msg)) => Arc::clone(&reader_conn).handle_incoming(msg),
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "codec error, closing connection");
                            break;
                        }
                        None => break,
                    }
                }
            }
            .instrument(tracing::info_span!("bus_reader")),
        );

        conn
    }

    /// Explicitly bind `object` as this connection's root, reachable by the
    /// peer via [`Self::root`] on their side without any prior proxy.
    pub fn bind_root(&self, object: Arc<dyn Dispatch>) {
        lock(&self.registry).bind_explicit(Name::explicit("root"), object);
    }

    /// A proxy for the peer's root object.
    #[must_use]
    pub fn root(self: &Arc<Self>) -> Proxy { self.proxy_for(Name::explicit("root")) }

    /// Number of names currently bound in this connection's registry, for
    /// diagnostics and tests (e.g. observing implicit release).
    #[must_use]
    pub fn registry_len(&self) -> usize { lock(&self.registry).len() }

    /// Bind `object` under a freshly allocated implicit name and return a
    /// `Value::Proxy` referencing it, suitable for inclusion in a `Return`,
    /// `Yield`, or argument list.
    #[must_use]
    pub fn export(&self, object: Arc<dyn Dispatch>) -> Value {
        let name = self.names.allocate();
        lock(&self.registry).bind_implicit(name.clone(), object);
        Value::Proxy(name)
    }

    /// Get or create a [`Proxy`] for `name`, reusing the cached instance if
    /// one is still alive so repeated references to the same name compare
    /// equal.
    ///
    /// Always addresses the peer: this never consults the local registry,
    /// even if `name` happens to also be bound on this side. Use this for
    /// conventionally-known peer names (such as `"root"`); use
    /// [`Self::resolve_proxy`] for a name decoded out of a message, where a
    /// locally-bound object should dispatch in-process instead of round-
    /// tripping over the wire to itself.
    #[must_use]
    pub fn proxy_for(self: &Arc<Self>, name: Name) -> Proxy {
        let mut cache = lock(&self.proxies);
        if let Some(existing) = cache.get(&name).and_then(Weak::upgrade) {
            return Proxy::from_arc(existing);
        }
        let proxy = Proxy::new(name.clone(), Arc::downgrade(self));
        cache.insert(name, proxy.downgrade());
        proxy
    }

    /// Resolve a `Name` decoded from a `Value::Proxy` that arrived as data
    /// (an argument, a yielded value, or a return value).
    ///
    /// If `name` is bound in this connection's own registry, returns a
    /// proxy that dispatches directly to that binding in-process, without
    /// ever touching the wire — this is what gives a round-tripped proxy
    /// its same-object identity instead of looping back out over the
    /// socket to talk to itself. Otherwise falls back to the ordinary
    /// remote proxy, as if the peer owns `name`.
    #[must_use]
    pub fn resolve_proxy(self: &Arc<Self>, name: Name) -> Proxy {
        if let Some(object) = lock(&self.registry).lookup(&name) {
            return Proxy::local(name, object, Arc::downgrade(self));
        }
        self.proxy_for(name)
    }

    /// Invoke `method` on the object bound under `name`, optionally driving
    /// a sequence of `Yield`/`Next` exchanges through `on_yield`.
    ///
    /// If this connection was constructed with a read timeout, waiting
    /// longer than that for the next message of this transaction resolves
    /// to `Value::Nil` rather than raising an error, same as the peer
    /// closing the transaction outright.
    ///
    /// # Errors
    /// Returns [`BusError::Closed`] if the connection's writer has already
    /// stopped, [`BusError::Remote`] if the peer raised an exception, or
    /// [`BusError::RemoteThrow`] if the peer performed a non-local control
    /// transfer.
    pub async fn invoke(
        self: &Arc<Self>,
        name: Name,
        method: String,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        mut on_yield: Option<Box<dyn FnMut(Vec<Value>) -> BlockReply + Send>>,
    ) -> Result<Value, BusError> {
        let id = self.ids.allocate();
        let (tx, mut rx) = mpsc::unbounded_channel();
        lock(&self.inflight).insert(id, tx);
        let has_block = on_yield.is_some();
        if self.send(Message::Invoke { id, name, method, args, kwargs, has_block }).is_err() {
            lock(&self.inflight).remove(&id);
            return Err(BusError::Closed);
        }

        let result = loop {
            let received = match self.read_timeout {
                Some(d) => tokio::time::timeout(d, rx.recv()).await.unwrap_or(None),
                None => rx.recv().await,
            };
            let Some(msg) = received else { break Ok(Value::Nil) };
            match msg {
                Message::Return { result, .. } => break Ok(result),
                Message::Error { exception, .. } => break Err(Self::exception_to_error(exception)),
                Message::Throw { tag, value, .. } => break Err(BusError::RemoteThrow { tag, value }),
                Message::Close { .. } => break Ok(Value::Nil),
                Message::Yield { values, .. } => {
                    let reply = on_yield.as_mut().map_or(BlockReply::Close, |f| f(values));
                    let sent = match reply {
                        BlockReply::Next(value) => self.send(Message::Next { id, value }),
                        BlockReply::Error(err) => {
                            self.send(Message::Error { id, exception: Self::error_to_exception(&err) })
                        }
                        BlockReply::Close => self.send(Message::Close { id }),
                    };
                    if sent.is_err() {
                        break Ok(Value::Nil);
                    }
                }
                Message::Invoke { .. } | Message::Release { .. } | Message::Next { .. } => {}
            }
        };
        lock(&self.inflight).remove(&id);
        result
    }

    fn send(&self, msg: Message) -> Result<(), BusError> {
        self.outbound.send(msg).map_err(|_| BusError::Closed)
    }

    pub(crate) fn send_yield(&self, id: u32, values: Vec<Value>) -> Result<(), BusError> {
        self.send(Message::Yield { id, values })
    }

    pub(crate) fn notify_proxy_dropped(&self, name: &Name) {
        let _ = self.send(Message::Release { name: name.clone() });
    }

    fn handle_incoming(self: Arc<Self>, msg: Message) {
        match msg {
            Message::Release { name } => {
                lock(&self.registry).release_implicit(&name);
            }
            Message::Invoke { id, name, method, args, kwargs, has_block } => {
                if lock(&self.inflight).contains_key(&id) {
                    tracing::warn!(id, "invoke arrived for an id already in flight, ignoring");
                    return;
                }
                tokio::spawn(Arc::clone(&self).serve_invoke(id, name, method, args, kwargs, has_block));
            }
            other => {
                if let Some(id) = other.transaction_id() {
                    let sender = lock(&self.inflight).get(&id).cloned();
                    match sender {
                        Some(sender) => {
                            let _ = sender.send(other);
                        }
                        None => tracing::debug!(id, "reply for unknown or completed transaction, dropping"),
                    }
                }
            }
        }
    }

    async fn serve_invoke(
        self: Arc<Self>,
        id: u32,
        name: Name,
        method: String,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
        has_block: bool,
    ) {
        let object = { lock(&self.registry).lookup(&name) };
        let Some(object) = object else {
            let _ = self.send(Message::Error { id, exception: Self::not_found_exception(&name) });
            return;
        };

        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inflight).insert(id, tx);
        let mut yielder = Yielder::wire(id, has_block, Arc::clone(&self), rx);

        let outcome = object.call(&self, &method, args, kwargs, &mut yielder).await;
        lock(&self.inflight).remove(&id);

        match outcome {
            Ok(CallOutcome::Return(result)) => {
                let _ = self.send(Message::Return { id, result });
            }
            Err(err) => {
                let _ = self.send(Message::Error { id, exception: Self::error_to_exception(&err) });
            }
        }
    }

    pub(crate) fn exception_to_error(exception: Value) -> BusError {
        match exception {
            Value::Exception { class, message, backtrace } => BusError::Remote { class, message, backtrace },
            other => BusError::Remote { class: "Exception".to_owned(), message: format!("{other:?}"), backtrace: Vec::new() },
        }
    }

    pub(crate) fn error_to_exception(err: &BusError) -> Value {
        Value::Exception { class: "BusError".to_owned(), message: err.to_string(), backtrace: Vec::new() }
    }

    fn not_found_exception(name: &Name) -> Value {
        Value::Exception {
            class: "NameError".to_owned(),
            message: BusError::NotFound(name.to_string()).to_string(),
            backtrace: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::net::UnixStream;

    use super::*;
    use crate::dispatch::YieldReply;

    struct Counter {
        value: std::sync::atomic::AtomicI64,
    }

    #[async_trait]
    impl Dispatch for Counter {
        async fn call(
            &self,
            _conn: &Arc<Connection>,
            method: &str,
            args: Vec<Value>,
            _kwargs: Vec<(String, Value)>,
            yielder: &mut Yielder,
        ) -> Result<CallOutcome, BusError> {
            match method {
                "increment" => {
                    let by = match args.first() {
                        Some(Value::Int(n)) => *n,
                        _ => 1,
                    };
                    let new = self.value.fetch_add(by, std::sync::atomic::Ordering::SeqCst) + by;
                    Ok(CallOutcome::Return(Value::Int(new)))
                }
                "count_to" => {
                    let n = match args.first() {
                        Some(Value::Int(n)) => *n,
                        _ => 0,
                    };
                    for i in 1..=n {
                        match yielder.yield_values(vec![Value::Int(i)]).await {
                            YieldReply::Next(_) => {}
                            YieldReply::Error(err) => return Err(err),
                            YieldReply::Closed => return Ok(CallOutcome::Return(Value::Int(i))),
                        }
                    }
                    Ok(CallOutcome::Return(Value::Int(n)))
                }
                other => Err(BusError::NotFound(other.to_owned())),
            }
        }
    }

    #[tokio::test]
    async fn invoke_round_trips_a_return_value() {
        let (client_sock, server_sock) = UnixStream::pair().expect("paired sockets");
        let server = Connection::spawn(server_sock, Role::Acceptor, Vec::new(), None);
        server.bind_root(Arc::new(Counter { value: std::sync::atomic::AtomicI64::new(0) }));
        let client = Connection::spawn(client_sock, Role::Initiator, Vec::new(), None);

        let root = client.root();
        let result = root.call("increment", vec![Value::Int(5)], vec![]).await.expect("call succeeds");
        assert_eq!(result, Value::Int(5));
    }

    #[tokio::test]
    async fn invoke_drives_a_yield_sequence() {
        let (client_sock, server_sock) = UnixStream::pair().expect("paired sockets");
        let server = Connection::spawn(server_sock, Role::Acceptor, Vec::new(), None);
        server.bind_root(Arc::new(Counter { value: std::sync::atomic::AtomicI64::new(0) }));
        let client = Connection::spawn(client_sock, Role::Initiator, Vec::new(), None);

        let root = client.root();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let collector = Arc::clone(&seen);
        let result = root
            .call_with_block("count_to", vec![Value::Int(3)], vec![], move |values| {
                lock(&collector).push(values);
                BlockReply::Next(Value::Nil)
            })
            .await
            .expect("call succeeds");

        assert_eq!(result, Value::Int(3));
        assert_eq!(
            *lock(&seen),
            vec![vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(3)]]
        );
    }

    #[tokio::test]
    async fn unbound_name_raises_a_name_error() {
        let (client_sock, server_sock) = UnixStream::pair().expect("paired sockets");
        let server = Connection::spawn(server_sock, Role::Acceptor, Vec::new(), None);
        server.bind_root(Arc::new(Counter { value: std::sync::atomic::AtomicI64::new(0) }));
        let client = Connection::spawn(client_sock, Role::Initiator, Vec::new(), None);

        let stray = client.proxy_for(Name::explicit("does-not-exist"));
        let err = stray.call("anything", vec![], vec![]).await.unwrap_err();
        assert!(matches!(err, BusError::Remote { ref class, ref message, .. }
            if class == "NameError" && message == "Object not found: does-not-exist"));
    }

    struct Never;

    #[async_trait]
    impl Dispatch for Never {
        async fn call(
            &self,
            _conn: &Arc<Connection>,
            _method: &str,
            _args: Vec<Value>,
            _kwargs: Vec<(String, Value)>,
            _yielder: &mut Yielder,
        ) -> Result<CallOutcome, BusError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn invoke_times_out_to_nil_when_the_peer_never_responds() {
        let (client_sock, server_sock) = UnixStream::pair().expect("paired sockets");
        let server = Connection::spawn(server_sock, Role::Acceptor, Vec::new(), None);
        server.bind_root(Arc::new(Never));
        let client = Connection::spawn(client_sock, Role::Initiator, Vec::new(), Some(Duration::from_millis(50)));

        let root = client.root();
        let result = root.call("anything", vec![], vec![]).await.expect("timeout resolves to nil, not an error");
        assert_eq!(result, Value::Nil);
    }
}
