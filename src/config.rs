//! Runtime configuration shared by the demo binaries.
//!
//! CLI flags take precedence over `RELAYBUS_`-prefixed environment
//! variables, merged the way the rest of the crate's ecosystem favours:
//! [`clap`] for the flag surface, [`figment`] to layer environment
//! overrides underneath it.

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use figment::{
    providers::{Env, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Where a connection is bound (server) or dialed (client).
///
/// `addr` is parsed with a `unix:`/`tcp:` prefix selecting the transport; a
/// bare value with neither prefix is treated as a TCP address, for
/// compatibility with plain `host:port` strings.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// A local domain socket at this path. The default transport per
    /// `SPEC_FULL.md` §6.
    Unix(PathBuf),
    /// A TCP address, primarily for platforms or tests without `AF_UNIX`.
    Tcp(String),
}

impl Endpoint {
    /// Parse `addr` into an [`Endpoint`], honouring a `unix:`/`tcp:` prefix.
    #[must_use]
    pub fn parse(addr: &str) -> Self {
        match addr.split_once(':') {
            Some(("unix", path)) => Self::Unix(PathBuf::from(path)),
            Some(("tcp", rest)) => Self::Tcp(rest.to_owned()),
            _ => Self::Tcp(addr.to_owned()),
        }
    }
}

/// Configuration shared by the server and client demo binaries.
#[derive(Parser, Serialize, Deserialize, Debug, Clone)]
pub struct AppConfig {
    /// Endpoint to bind (server) or dial (client): `unix:<path>` or
    /// `tcp:<host>:<port>`.
    #[arg(long, default_value_t = String::from("unix:bus.ipc"))]
    pub addr: String,

    /// Extension reference-type names, in wire tag order, shared by both
    /// peers of a connection.
    #[arg(long, value_delimiter = ',')]
    pub reference_types: Vec<String>,

    /// Per-read timeout for outstanding transactions, in milliseconds.
    /// Unset means invocations wait indefinitely for a response.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

impl AppConfig {
    /// Parse CLI flags, then fold in `RELAYBUS_`-prefixed environment
    /// overrides for any field left at its default.
    ///
    /// # Errors
    /// Returns an error if environment values cannot be deserialized into
    /// [`AppConfig`].
    pub fn load() -> figment::Result<Self> {
        let cli = Self::parse();
        Figment::from(Serialized::defaults(&cli))
            .merge(Env::prefixed("RELAYBUS_"))
            .extract()
    }

    /// The configured read timeout as a [`Duration`], if set.
    #[must_use]
    pub fn read_timeout(&self) -> Option<Duration> { self.timeout_ms.map(Duration::from_millis) }

    /// The parsed [`Endpoint`] to bind or dial.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint { Endpoint::parse(&self.addr) }
}
