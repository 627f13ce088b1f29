//! Error taxonomy surfaced to callers.

use chirp_wire::WireError;
use thiserror::Error;

/// Errors reported by chirp operations.
///
/// `Timeout`, `Backpressure`, `Shutdown` and `CannotConnect` fail a single
/// send. `Protocol` and `Tls` close the connection they occurred on and fail
/// everything pending there. `OutOfMemory` stops the engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChirpError {
    /// Bad caller input
    #[error("value error: {0}")]
    Value(String),

    /// Malformed or unexpected data on the stream
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS handshake or certificate failure
    #[error("tls error: {0}")]
    Tls(String),

    /// TCP connect refused or timed out
    #[error("cannot connect: {0}")]
    CannotConnect(String),

    /// No acknowledgement after all retries
    #[error("timeout: {0}")]
    Timeout(String),

    /// The writer queue is above its high-water mark
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// The connection or engine is closing
    #[error("shutdown: {0}")]
    Shutdown(String),

    /// Buffer allocation failed
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

impl ChirpError {
    /// Whether this error closes the connection it occurred on
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ChirpError::Protocol(_) | ChirpError::Tls(_))
    }
}

impl From<WireError> for ChirpError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Segment { .. } => ChirpError::Value(err.to_string()),
            WireError::OutOfMemory(_) => ChirpError::OutOfMemory(err.to_string()),
            _ => ChirpError::Protocol(err.to_string()),
        }
    }
}

impl From<rustls::Error> for ChirpError {
    fn from(err: rustls::Error) -> Self {
        ChirpError::Tls(err.to_string())
    }
}
