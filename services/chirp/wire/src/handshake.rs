//! Identity handshake record.
//!
//! Exchanged once per connection, after TLS (if any) and before any frame.

use bytes::{Buf, BufMut};

use crate::error::WireError;
use crate::header::IDENTITY_SIZE;
use crate::message::Identity;

/// Handshake record size in bytes
pub const HANDSHAKE_SIZE: usize = 2 + 2 + IDENTITY_SIZE;

/// Handshake record data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Public port the sender listens on
    pub port: u16,
    /// Longest time in seconds the sender may keep retransmitting a message
    pub max_timeout: u16,
    /// Node identity of the sender
    pub identity: Identity,
}

impl Handshake {
    /// Encode the record (big-endian)
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.port);
        buf.put_u16(self.max_timeout);
        buf.put_slice(self.identity.as_bytes());
    }

    /// Encode into a fixed array
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut out = [0u8; HANDSHAKE_SIZE];
        let mut cursor = &mut out[..];
        self.encode(&mut cursor);
        out
    }

    /// Decode a record, or `Ok(None)` when fewer than [`HANDSHAKE_SIZE`]
    /// bytes are available.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Option<Self>, WireError> {
        if buf.remaining() < HANDSHAKE_SIZE {
            return Ok(None);
        }
        let port = buf.get_u16();
        let max_timeout = buf.get_u16();
        let mut identity = [0u8; IDENTITY_SIZE];
        buf.copy_to_slice(&mut identity);
        if port == 0 {
            return Err(WireError::Handshake);
        }
        Ok(Some(Self {
            port,
            max_timeout,
            identity: Identity(identity),
        }))
    }
}
