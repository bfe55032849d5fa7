//! Error taxonomy for the bus protocol.
//!
//! Mirrors the shape of a typed, per-failure-mode `thiserror` enum: one
//! variant per distinguishable failure, `#[from]` for wrapped I/O, and
//! `#[error("...")]` messages suitable for surfacing to callers.

use std::io;

use crate::value::Value;

/// Errors surfaced by codec, transaction, connection, and proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The underlying stream returned an I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame could not be decoded: malformed payload or unknown tag.
    #[error("codec error: {0}")]
    Codec(String),

    /// An `Invoke` named an object with no binding in the registry.
    #[error("Object not found: {0}")]
    NotFound(String),

    /// The peer raised an exception while servicing an `Invoke`.
    #[error("{class}: {message}")]
    Remote {
        /// Remote exception class name (best-effort; may be unresolvable
        /// locally).
        class: String,
        /// Remote exception message.
        message: String,
        /// Textual backtrace, recorded for diagnostics only.
        backtrace: Vec<String>,
    },

    /// The acceptor performed a non-local control transfer (tagged throw)
    /// that this runtime cannot re-issue locally.
    #[error("remote throw: tag={tag:?}")]
    RemoteThrow {
        /// Opaque tag identifying the kind of control transfer.
        tag: Value,
        /// Value carried alongside the tag.
        value: Value,
    },

    /// The connection was closed or timed out while awaiting a response.
    #[error("transaction closed")]
    Closed,

    /// The connection has already terminated; no further operations are
    /// possible.
    #[error("connection terminated: {0}")]
    ConnectionClosed(String),

    /// A method attempted to yield but the caller invoked it without a
    /// block, so there is nothing to feed the yielded values to.
    #[error("method yielded but the caller supplied no block")]
    NoBlockForYield,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, BusError>;
