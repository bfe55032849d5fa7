//! End-to-end scenarios driving real connected sockets.
#![expect(clippy::unwrap_used, reason = "test assertions")]
#![expect(clippy::expect_used, reason = "test assertions")]
#![expect(clippy::panic_in_result_fn, reason = "test assertions")]

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use relaybus::{
    connection::Connection,
    dispatch::{BlockReply, CallOutcome, Dispatch, YieldReply, Yielder},
    error::BusError,
    proxy::Proxy,
    transaction::Role,
    value::Value,
};
use tokio::net::UnixStream;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn connected_pair() -> (Arc<Connection>, Arc<Connection>) {
    let (a, b) = UnixStream::pair().expect("paired unix sockets");
    let server = Connection::spawn(a, Role::Acceptor, Vec::new(), None);
    let client = Connection::spawn(b, Role::Initiator, Vec::new(), None);
    (server, client)
}

struct Counter {
    value: AtomicI64,
}

#[async_trait]
impl Dispatch for Counter {
    async fn call(
        &self,
        _conn: &Arc<Connection>,
        method: &str,
        args: Vec<Value>,
        _kwargs: Vec<(String, Value)>,
        _yielder: &mut Yielder,
    ) -> Result<CallOutcome, BusError> {
        match method {
            "increment" => {
                let new = self.value.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(CallOutcome::Return(Value::Int(new)))
            }
            "count" => Ok(CallOutcome::Return(Value::Int(self.value.load(Ordering::SeqCst)))),
            other => Err(BusError::NotFound(other.to_owned())),
        }
    }
}

#[tokio::test]
async fn scenario_a_counter() {
    let (server, client) = connected_pair().await;
    server.bind_root(Arc::new(Counter { value: AtomicI64::new(0) }));

    let root = client.root();
    for _ in 0..3 {
        root.call("increment", vec![], vec![]).await.expect("increment");
    }
    let count = root.call("count", vec![], vec![]).await.expect("count");
    assert_eq!(count, Value::Int(3));
}

struct YieldingService;

#[async_trait]
impl Dispatch for YieldingService {
    async fn call(
        &self,
        _conn: &Arc<Connection>,
        method: &str,
        _args: Vec<Value>,
        _kwargs: Vec<(String, Value)>,
        yielder: &mut Yielder,
    ) -> Result<CallOutcome, BusError> {
        match method {
            "yielding_method" => {
                for step in [Value::Int(1), Value::Int(2), Value::Int(3)] {
                    match yielder.yield_values(vec![step]).await {
                        YieldReply::Next(_) => {}
                        YieldReply::Error(err) => return Err(err),
                        YieldReply::Closed => return Ok(CallOutcome::Return(Value::Symbol("closed".to_owned()))),
                    }
                }
                Ok(CallOutcome::Return(Value::Symbol("done".to_owned())))
            }
            "failing_method" => Err(BusError::Remote {
                class: "RuntimeError".to_owned(),
                message: "Remote error".to_owned(),
                backtrace: Vec::new(),
            }),
            other => Err(BusError::NotFound(other.to_owned())),
        }
    }
}

#[tokio::test]
async fn scenario_b_yield_next() {
    let (server, client) = connected_pair().await;
    server.bind_root(Arc::new(YieldingService));

    let root = client.root();
    let collected = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&collected);
    let result = root
        .call_with_block("yielding_method", vec![], vec![], move |values| {
            lock(&sink).push(values);
            BlockReply::Next(Value::Symbol("ack".to_owned()))
        })
        .await
        .expect("yielding call succeeds");

    assert_eq!(result, Value::Symbol("done".to_owned()));
    assert_eq!(
        *lock(&collected),
        vec![vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(3)]]
    );
}

#[tokio::test]
async fn scenario_c_error_propagation() {
    let (server, client) = connected_pair().await;
    server.bind_root(Arc::new(YieldingService));

    let root = client.root();
    let err = root.call("failing_method", vec![], vec![]).await.unwrap_err();
    match err {
        BusError::Remote { class, message, .. } => {
            assert_eq!(class, "RuntimeError");
            assert_eq!(message, "Remote error");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_d_unknown_object() {
    let (server, client) = connected_pair().await;
    server.bind_root(Arc::new(Counter { value: AtomicI64::new(0) }));

    let stray = client.proxy_for(relaybus::name::Name::explicit("nonexistent"));
    let err = stray.call("anything", vec![], vec![]).await.unwrap_err();
    match err {
        BusError::Remote { class, message, .. } => {
            assert_eq!(class, "NameError");
            assert_eq!(message, "Object not found: nonexistent");
        }
        other => panic!("expected a name error, got {other:?}"),
    }
}

struct Temporary;

#[async_trait]
impl Dispatch for Temporary {
    async fn call(
        &self,
        _conn: &Arc<Connection>,
        _method: &str,
        _args: Vec<Value>,
        _kwargs: Vec<(String, Value)>,
        _yielder: &mut Yielder,
    ) -> Result<CallOutcome, BusError> {
        Ok(CallOutcome::Return(Value::Nil))
    }
}

struct Controller;

#[async_trait]
impl Dispatch for Controller {
    async fn call(
        &self,
        conn: &Arc<Connection>,
        method: &str,
        _args: Vec<Value>,
        _kwargs: Vec<(String, Value)>,
        _yielder: &mut Yielder,
    ) -> Result<CallOutcome, BusError> {
        match method {
            "get_temporary" => Ok(CallOutcome::Return(conn.export(Arc::new(Temporary)))),
            other => Err(BusError::NotFound(other.to_owned())),
        }
    }
}

#[tokio::test]
async fn scenario_e_implicit_release() {
    let (server, client) = connected_pair().await;
    server.bind_root(Arc::new(Controller));

    let root = client.root();
    let result = root.call("get_temporary", vec![], vec![]).await.expect("get_temporary");
    let Value::Proxy(name) = result else { panic!("expected a proxy value") };

    assert_eq!(server.registry_len(), 2, "root plus the freshly exported temporary");

    {
        let _temp_proxy = client.resolve_proxy(name);
        assert_eq!(server.registry_len(), 2);
    }

    for _ in 0..50 {
        if server.registry_len() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    assert_eq!(server.registry_len(), 1, "temporary should be released once its proxy is dropped");
}

struct Hub {
    workers: Mutex<std::collections::HashMap<String, Proxy>>,
}

#[async_trait]
impl Dispatch for Hub {
    async fn call(
        &self,
        conn: &Arc<Connection>,
        method: &str,
        args: Vec<Value>,
        _kwargs: Vec<(String, Value)>,
        _yielder: &mut Yielder,
    ) -> Result<CallOutcome, BusError> {
        match method {
            "register" => {
                let (Some(Value::Str(name)), Some(Value::Proxy(remote_name))) = (args.first(), args.get(1)) else {
                    return Err(BusError::NotFound("register requires (name, proxy)".to_owned()));
                };
                let proxy = conn.resolve_proxy(remote_name.clone());
                lock(&self.workers).insert(name.clone(), proxy);
                Ok(CallOutcome::Return(Value::Nil))
            }
            "get" => {
                let Some(Value::Str(name)) = args.first() else {
                    return Err(BusError::NotFound("get requires a name".to_owned()));
                };
                let target = lock(&self.workers).get(name).cloned();
                match target {
                    Some(target) => Ok(CallOutcome::Return(conn.export(Arc::new(target) as Arc<dyn Dispatch>))),
                    None => Err(BusError::NotFound(name.clone())),
                }
            }
            other => Err(BusError::NotFound(other.to_owned())),
        }
    }
}

struct Worker;

#[async_trait]
impl Dispatch for Worker {
    async fn call(
        &self,
        _conn: &Arc<Connection>,
        method: &str,
        _args: Vec<Value>,
        _kwargs: Vec<(String, Value)>,
        _yielder: &mut Yielder,
    ) -> Result<CallOutcome, BusError> {
        match method {
            "do_work" => Ok(CallOutcome::Return(Value::Str("work done by X".to_owned()))),
            other => Err(BusError::NotFound(other.to_owned())),
        }
    }
}

#[tokio::test]
async fn scenario_f_multi_hop_proxy() {
    let hub = Arc::new(Hub { workers: Mutex::new(std::collections::HashMap::new()) });

    let (server_side_x, x) = UnixStream::pair().expect("paired sockets");
    let server_x = Connection::spawn(server_side_x, Role::Acceptor, Vec::new(), None);
    server_x.bind_root(Arc::clone(&hub) as Arc<dyn Dispatch>);
    let x = Connection::spawn(x, Role::Initiator, Vec::new(), None);
    x.bind_root(Arc::new(Worker));

    let (server_side_y, y) = UnixStream::pair().expect("paired sockets");
    let server_y = Connection::spawn(server_side_y, Role::Acceptor, Vec::new(), None);
    server_y.bind_root(Arc::clone(&hub) as Arc<dyn Dispatch>);
    let y = Connection::spawn(y, Role::Initiator, Vec::new(), None);

    // X exports its controller and registers it with the hub under "worker-1".
    let x_root_on_hub = x.root();
    let controller_value = x.export(Arc::new(Worker));
    let Value::Proxy(controller_name) = controller_value else { panic!("expected a proxy value") };
    x_root_on_hub
        .call("register", vec![Value::Str("worker-1".to_owned()), Value::Proxy(controller_name)], vec![])
        .await
        .expect("register");

    // Y asks the hub for "worker-1" and invokes do_work through the forwarded proxy.
    let y_root_on_hub = y.root();
    let forwarded = y_root_on_hub.call("get", vec![Value::Str("worker-1".to_owned())], vec![]).await.expect("get");
    let Value::Proxy(forwarded_name) = forwarded else { panic!("expected a proxy value") };
    let forwarded_proxy = y.resolve_proxy(forwarded_name);

    let result = forwarded_proxy.call("do_work", vec![], vec![]).await.expect("do_work");
    assert_eq!(result, Value::Str("work done by X".to_owned()));
}
