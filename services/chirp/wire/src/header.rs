//! Fixed-size frame header.
//!
//! Every frame starts with a 30-byte record carrying the version, the message
//! type flags, the identity token, the serial and the three segment lengths.
//! All integers are big-endian.

use bitflags::bitflags;
use bytes::{Buf, BufMut};

use crate::error::WireError;

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Size of the identity token in bytes
pub const IDENTITY_SIZE: usize = 16;

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 1 + 1 + IDENTITY_SIZE + 4 + 2 + 2 + 4;

/// Largest encodable header segment
pub const MAX_HEADER_LEN: usize = u16::MAX as usize;

/// Largest encodable actor segment
pub const MAX_ACTOR_LEN: usize = u16::MAX as usize;

/// Largest encodable data segment
pub const MAX_DATA_LEN: usize = u32::MAX as usize;

bitflags! {
    /// Message type flags. An empty set is a normal message that does not
    /// request acknowledgement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MsgType: u8 {
        /// Sender wants an ACK frame back
        const REQ_ACK = 1 << 0;
        /// This frame acknowledges the message with the same serial
        const ACK = 1 << 1;
        /// More parts of the same logical message follow
        const CONTINUATION = 1 << 2;
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version
    pub ver: u8,
    /// Message type flags
    pub typ: MsgType,
    /// Opaque identity token
    pub identity: [u8; IDENTITY_SIZE],
    /// Per-connection serial
    pub serial: u32,
    /// Header segment length
    pub header_len: u16,
    /// Actor segment length
    pub actor_len: u16,
    /// Data segment length
    pub data_len: u32,
}

impl FrameHeader {
    /// Length of the segments following the header
    pub fn body_len(&self) -> usize {
        self.header_len as usize + self.actor_len as usize + self.data_len as usize
    }

    /// Length of the whole frame including this header
    pub fn frame_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.body_len()
    }

    /// Encode the header (big-endian)
    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.ver);
        buf.put_u8(self.typ.bits());
        buf.put_slice(&self.identity);
        buf.put_u32(self.serial);
        buf.put_u16(self.header_len);
        buf.put_u16(self.actor_len);
        buf.put_u32(self.data_len);
    }

    /// Decode a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` when fewer than [`FRAME_HEADER_SIZE`] bytes are
    /// available. Nothing is consumed from `buf` in that case.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Option<Self>, WireError> {
        if buf.remaining() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let ver = buf.get_u8();
        if ver != WIRE_VERSION {
            return Err(WireError::Version(ver));
        }

        let raw_typ = buf.get_u8();
        let typ = MsgType::from_bits(raw_typ).ok_or(WireError::Type(raw_typ))?;

        let mut identity = [0u8; IDENTITY_SIZE];
        buf.copy_to_slice(&mut identity);
        let serial = buf.get_u32();
        let header_len = buf.get_u16();
        let actor_len = buf.get_u16();
        let data_len = buf.get_u32();

        Ok(Some(Self {
            ver,
            typ,
            identity,
            serial,
            header_len,
            actor_len,
            data_len,
        }))
    }

    /// Peek at a header without consuming anything
    pub fn peek(buf: &[u8]) -> Result<Option<Self>, WireError> {
        let mut cursor = buf;
        Self::decode(&mut cursor)
    }
}
