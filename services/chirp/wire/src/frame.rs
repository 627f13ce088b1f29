//! Message serialization.
//!
//! ```text
//! +---------+---------+--------------+----------+------------+-----------+----------+
//! | ver u8  | type u8 | identity 16B | serial   | header_len | actor_len | data_len |
//! |         |         |              | u32      | u16        | u16       | u32      |
//! +---------+---------+--------------+----------+------------+-----------+----------+
//! | header segment | actor segment | data segment                                   |
//! +----------------+---------------+------------------------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::header::{FrameHeader, FRAME_HEADER_SIZE, WIRE_VERSION};
use crate::message::{Identity, Message};

/// Default frame size cap (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of a frame once encoded
pub fn encoded_len(msg: &Message) -> usize {
    FRAME_HEADER_SIZE + msg.body_len()
}

/// Build the header record describing `msg`
pub fn header_for(msg: &Message) -> Result<FrameHeader, WireError> {
    msg.validate()?;
    Ok(FrameHeader {
        ver: WIRE_VERSION,
        typ: msg.typ,
        identity: msg.identity.0,
        serial: msg.serial,
        header_len: msg.header.len() as u16,
        actor_len: msg.actor.len() as u16,
        data_len: msg.data.len() as u32,
    })
}

/// Encode `msg` into `buf`: header record followed by header, actor and data
pub fn encode<B: BufMut>(msg: &Message, buf: &mut B) -> Result<usize, WireError> {
    let header = header_for(msg)?;
    header.encode(buf);
    buf.put_slice(&msg.header);
    buf.put_slice(&msg.actor);
    buf.put_slice(&msg.data);
    Ok(header.frame_len())
}

/// Encode `msg` into a fresh contiguous buffer
pub fn encode_to_bytes(msg: &Message) -> Result<Bytes, WireError> {
    let mut buf = BytesMut::with_capacity(encoded_len(msg));
    encode(msg, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode one frame from a self-contained buffer.
///
/// Returns the message and the number of bytes consumed. Segment lengths that
/// run past the end of `buf` are a malformed frame.
pub fn decode(buf: &Bytes) -> Result<(Message, usize), WireError> {
    let mut cursor = buf.clone();
    let header = FrameHeader::decode(&mut cursor)?.ok_or(WireError::Malformed)?;
    if cursor.remaining() < header.body_len() {
        return Err(WireError::Malformed);
    }
    let msg = split_segments(&header, &mut cursor);
    Ok((msg, header.frame_len()))
}

/// Split the three segments described by `header` off the front of `body`
pub(crate) fn split_segments(header: &FrameHeader, body: &mut Bytes) -> Message {
    let seg_header = body.split_to(header.header_len as usize);
    let actor = body.split_to(header.actor_len as usize);
    let data = body.split_to(header.data_len as usize);
    Message {
        identity: Identity(header.identity),
        serial: header.serial,
        typ: header.typ,
        header: seg_header,
        actor,
        data,
    }
}
