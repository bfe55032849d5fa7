//! Demo bus server: binds a listener and exports a small counter object as
//! the root of every accepted connection.

use std::sync::{atomic::AtomicI64, Arc};

use async_trait::async_trait;
use relaybus::{
    config::AppConfig,
    connection::Connection,
    dispatch::{CallOutcome, Dispatch, Yielder},
    error::BusError,
    server,
    value::Value,
};
use tracing_subscriber::filter::EnvFilter;

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
                let by = match args.first() {
                    Some(Value::Int(n)) => *n,
                    _ => 1,
                };
                let new = self.value.fetch_add(by, std::sync::atomic::Ordering::SeqCst) + by;
                Ok(CallOutcome::Return(Value::Int(new)))
            }
            "value" => Ok(CallOutcome::Return(Value::Int(self.value.load(std::sync::atomic::Ordering::SeqCst)))),
            other => Err(BusError::NotFound(other.to_owned())),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = AppConfig::load()?;
    let read_timeout = cfg.read_timeout();
    server::serve(
        &cfg.endpoint(),
        || Arc::new(Counter { value: AtomicI64::new(0) }) as Arc<dyn Dispatch>,
        cfg.reference_types,
        read_timeout,
    )
    .await?;
    Ok(())
}
