//! Core library for the relay bus daemon.
//!
//! A transparent, bidirectional RPC bus over a single stream socket: either
//! peer can bind objects, export proxies to them, and invoke methods on the
//! other side's objects, with a shared wire codec and transaction id space.

#![cfg_attr(test, expect(clippy::unwrap_used, reason = "test code can panic"))]
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "test code with known bounds")
)]
#![cfg_attr(test, expect(clippy::str_to_string, reason = "test code"))]
#![cfg_attr(
    test,
    expect(clippy::let_underscore_must_use, reason = "test cleanup code")
)]

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod name;
pub mod proxy;
pub mod registry;
pub mod server;
pub mod transaction;
pub mod value;

pub use connection::Connection;
pub use dispatch::{BlockReply, CallOutcome, Dispatch, YieldReply, Yielder};
pub use error::BusError;
pub use name::Name;
pub use proxy::Proxy;
pub use transaction::Role;
pub use value::Value;
