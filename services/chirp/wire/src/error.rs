//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Unknown message type bits
    #[error("unknown type bits {0:#04x}")]
    Type(u8),

    /// Frame exceeds the configured maximum
    #[error("frame size {0} exceeds limit")]
    Size(usize),

    /// Declared segment lengths overrun the supplied buffer
    #[error("malformed frame")]
    Malformed,

    /// A segment is too long for its length field
    #[error("{segment} segment of {len} bytes exceeds {max}")]
    Segment {
        /// Segment name
        segment: &'static str,
        /// Actual length
        len: usize,
        /// Largest encodable length
        max: usize,
    },

    /// Handshake record is short or garbled
    #[error("malformed handshake record")]
    Handshake,

    /// The stream ended inside a frame
    #[error("stream ended with {0} bytes of a partial frame")]
    Truncated(usize),

    /// A pooled buffer could not be allocated
    #[error("buffer allocation of {0} bytes failed")]
    OutOfMemory(usize),
}
