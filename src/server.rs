//! Accept loop: binds a listener and spawns a [`Connection`] per inbound
//! socket, each bound to an application-supplied root object.

#![expect(
    clippy::let_underscore_must_use,
    reason = "shutdown signal send is fire-and-forget"
)]

use std::{io, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, UnixListener},
    sync::watch,
    task::JoinSet,
};

use crate::{config::Endpoint, connection::Connection, dispatch::Dispatch, transaction::Role};

/// Constructs the root object bound into each freshly accepted connection.
///
/// Called once per connection so every peer gets its own object instance;
/// implementations that want shared state should capture an `Arc` in their
/// closure.
pub trait RootFactory: Fn() -> Arc<dyn Dispatch> + Send + Sync + 'static {}
impl<T: Fn() -> Arc<dyn Dispatch> + Send + Sync + 'static> RootFactory for T {}

/// A stream usable as either half of a bus connection, boxed so the accept
/// loop can treat a TCP and a Unix-domain socket uniformly.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

#[async_trait::async_trait]
trait IncomingListener: Send + Sync {
    async fn accept_one(&self) -> io::Result<(Box<dyn DuplexStream>, String)>;
}

#[async_trait::async_trait]
impl IncomingListener for TcpListener {
    async fn accept_one(&self) -> io::Result<(Box<dyn DuplexStream>, String)> {
        let (socket, peer) = self.accept().await?;
        Ok((Box::new(socket), peer.to_string()))
    }
}

#[async_trait::async_trait]
impl IncomingListener for UnixListener {
    async fn accept_one(&self) -> io::Result<(Box<dyn DuplexStream>, String)> {
        let (socket, _addr) = self.accept().await?;
        Ok((Box::new(socket), "unix peer".to_owned()))
    }
}

/// Binds `endpoint` and spawns a bus [`Connection`] for each accepted peer,
/// binding a fresh root object built by `root_factory`.
///
/// Runs until a SIGTERM (Unix) or Ctrl-C is received, then waits for
/// already-accepted connections to finish their current work before
/// returning.
///
/// # Errors
/// Returns any I/O error encountered binding the listener.
pub async fn serve<F>(
    endpoint: &Endpoint,
    root_factory: F,
    reference_types: Vec<String>,
    read_timeout: Option<Duration>,
) -> io::Result<()>
where
    F: RootFactory,
{
    let listener: Arc<dyn IncomingListener> = match endpoint {
        Endpoint::Tcp(addr) => {
            let listener = TcpListener::bind(addr).await?;
            tracing::info!(%addr, "bus server listening");
            Arc::new(listener)
        }
        Endpoint::Unix(path) => {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            let listener = UnixListener::bind(path)?;
            tracing::info!(path = %path.display(), "bus server listening");
            Arc::new(listener)
        }
    };
    accept_connections(listener, Arc::new(root_factory), reference_types, read_timeout).await;
    Ok(())
}

async fn accept_connections<F>(
    listener: Arc<dyn IncomingListener>,
    root_factory: Arc<F>,
    reference_types: Vec<String>,
    read_timeout: Option<Duration>,
) where
    F: RootFactory,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut join_set = JoinSet::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break;
            }
            res = listener.accept_one() => {
                handle_accept_result(res, &root_factory, &reference_types, read_timeout, &shutdown_rx, &mut join_set);
            }
        }
    }

    let _ = shutdown_tx.send(true);
    await_spawned_tasks(&mut join_set).await;
}

fn handle_accept_result<F>(
    res: io::Result<(Box<dyn DuplexStream>, String)>,
    root_factory: &Arc<F>,
    reference_types: &[String],
    read_timeout: Option<Duration>,
    shutdown_rx: &watch::Receiver<bool>,
    join_set: &mut JoinSet<()>,
) where
    F: RootFactory,
{
    match res {
        Ok((socket, peer)) => {
            spawn_connection(
                socket,
                peer,
                Arc::clone(root_factory),
                reference_types.to_vec(),
                read_timeout,
                shutdown_rx.clone(),
                join_set,
            );
        }
        Err(err) => tracing::warn!(error = %err, "accept error"),
    }
}

fn spawn_connection<F>(
    socket: Box<dyn DuplexStream>,
    peer: String,
    root_factory: Arc<F>,
    reference_types: Vec<String>,
    read_timeout: Option<Duration>,
    mut shutdown_rx: watch::Receiver<bool>,
    join_set: &mut JoinSet<()>,
) where
    F: RootFactory,
{
    join_set.spawn(async move {
        let conn = Connection::spawn(socket, Role::Acceptor, reference_types, read_timeout);
        conn.bind_root(root_factory());
        tracing::info!(%peer, "accepted connection");
        let _ = shutdown_rx.changed().await;
    });
}

async fn await_spawned_tasks(join_set: &mut JoinSet<()>) {
    while let Some(res) = join_set.join_next().await {
        if let Err(err) = res {
            tracing::warn!(error = %err, "connection task panicked");
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    res = tokio::signal::ctrl_c() => {
                        if let Err(err) = res {
                            tracing::warn!(error = %err, "failed to listen for Ctrl-C");
                        }
                    },
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                wait_for_ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        wait_for_ctrl_c().await;
    }
}

async fn wait_for_ctrl_c() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for Ctrl-C");
    }
}
