//! Dialing the bus: connect once, or supervise a reconnecting background
//! connection with randomized backoff.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::net::{TcpStream, UnixStream};

use crate::{config::Endpoint, connection::Connection, dispatch::Dispatch, transaction::Role};

/// Dial `endpoint` once and return the resulting [`Connection`].
///
/// # Errors
/// Returns any I/O error encountered connecting the socket.
pub async fn connect(
    endpoint: &Endpoint,
    reference_types: Vec<String>,
    read_timeout: Option<Duration>,
) -> std::io::Result<Arc<Connection>> {
    match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = TcpStream::connect(addr).await?;
            Ok(Connection::spawn(stream, Role::Initiator, reference_types, read_timeout))
        }
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path).await?;
            Ok(Connection::spawn(stream, Role::Initiator, reference_types, read_timeout))
        }
    }
}

/// Backoff schedule for [`supervise`].
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Shortest delay before the first retry.
    pub min: Duration,
    /// Longest delay between retries, once the schedule has grown into it.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self { Self { min: Duration::from_millis(200), max: Duration::from_secs(30) } }
}

impl Backoff {
    fn next(&self, attempt: u32) -> Duration {
        let mut exp = self.min;
        for _ in 0..attempt.min(16) {
            exp = exp.saturating_mul(2);
        }
        let capped = exp.min(self.max);
        let jittered_millis = rand::thread_rng().gen_range(0..=capped.as_millis().max(1));
        Duration::from_millis(u64::try_from(jittered_millis).unwrap_or(u64::MAX))
    }
}

/// Dial `endpoint` in a loop, rebuilding the connection and rebinding a
/// fresh root object whenever it drops, with randomized exponential backoff
/// between attempts.
///
/// `on_connect` is called with each freshly spawned connection so the
/// caller can bind its root object and/or stash a clone for outbound calls;
/// it runs once per successful dial, not once overall.
///
/// This future never returns on its own; callers typically spawn it and
/// hold the `JoinHandle` to cancel it on shutdown.
pub async fn supervise<F>(
    endpoint: Endpoint,
    backoff: Backoff,
    reference_types: Vec<String>,
    read_timeout: Option<Duration>,
    on_connect: F,
) where
    F: Fn(&Arc<Connection>) + Send + Sync + 'static,
{
    let mut attempt = 0_u32;
    loop {
        match connect(&endpoint, reference_types.clone(), read_timeout).await {
            Ok(conn) => {
                attempt = 0;
                on_connect(&conn);
                tracing::info!("connected");
                wait_for_disconnect(&conn).await;
                tracing::warn!("connection lost, reconnecting");
            }
            Err(err) => {
                tracing::warn!(error = %err, "connect failed");
            }
        }
        let delay = backoff.next(attempt);
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}

async fn wait_for_disconnect(conn: &Arc<Connection>) {
    let weak = Arc::downgrade(conn);
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if weak.strong_count() <= 1 {
            return;
        }
    }
}

/// Bind `object` as the root of `conn`, for use as an `on_connect` callback
/// with [`supervise`] when the root is a fixed, shareable object.
pub fn bind_shared_root(conn: &Arc<Connection>, object: &Arc<dyn Dispatch>) {
    conn.bind_root(Arc::clone(object));
}
