//! Crate-wide error types

use std::net::SocketAddr;

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from a socket or listener
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or truncated wire data
    #[error(transparent)]
    Codec(#[from] crate::packet::CodecError),

    /// Send attempted on an address with no live connection
    #[error("no connection established to {0}")]
    NotConnected(SocketAddr),

    /// A correlated response did not arrive in time
    #[error("timed out waiting for response from {0}")]
    ResponseTimeout(SocketAddr),

    /// The signal bus has shut down
    #[error("signal bus closed")]
    BusClosed,

    /// No relay port could be allocated for a new stream
    #[error("relay port limit reached")]
    RelayPortsExhausted,
}
