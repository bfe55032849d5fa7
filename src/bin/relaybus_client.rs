//! Demo bus client: dials the server and drives its counter object through a
//! handful of calls.

use relaybus::{client, config::AppConfig, value::Value};
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cfg = AppConfig::load()?;
    let read_timeout = cfg.read_timeout();
    let conn = client::connect(&cfg.endpoint(), cfg.reference_types, read_timeout).await?;
    let root = conn.root();

    let result = root.call("increment", vec![Value::Int(1)], vec![]).await?;
    tracing::info!(?result, "incremented");

    let result = root.call("increment", vec![Value::Int(4)], vec![]).await?;
    tracing::info!(?result, "incremented");

    let result = root.call("value", vec![], vec![]).await?;
    tracing::info!(?result, "current value");

    Ok(())
}
