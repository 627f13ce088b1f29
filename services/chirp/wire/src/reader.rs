//! Incremental frame reader.
//!
//! The reader accumulates plaintext as it arrives and yields every complete
//! item it holds. The first item on a stream is always the peer's
//! [`Handshake`] record; every later item is a [`Message`].
//!
//! ```text
//! feed(chunk) ──► [ accumulated tail | chunk ] ──► Handshake? Message* ──► tail
//! ```
//!
//! Errors are terminal: once an item fails to decode the reader drops its
//! buffer and yields nothing further. Streams are never resynchronized.

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::error::WireError;
use crate::frame::split_segments;
use crate::handshake::{Handshake, HANDSHAKE_SIZE};
use crate::header::{FrameHeader, FRAME_HEADER_SIZE};
use crate::message::Message;

/// One item decoded from the stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The peer's handshake record
    Handshake(Handshake),
    /// An application or acknowledgement frame
    Message(Message),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    AwaitHandshake,
    Frames,
}

/// Resumable parser over a plaintext byte stream
#[derive(Debug)]
pub struct Reader {
    state: ReadState,
    buf: BytesMut,
    max_frame_size: usize,
    poisoned: bool,
}

impl Reader {
    /// Reader expecting a handshake record before the first frame
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: ReadState::AwaitHandshake,
            buf: BytesMut::with_capacity(HANDSHAKE_SIZE),
            max_frame_size,
            poisoned: false,
        }
    }

    /// Reader for a stream that carries frames only
    pub fn frames_only(max_frame_size: usize) -> Self {
        Self {
            state: ReadState::Frames,
            buf: BytesMut::with_capacity(FRAME_HEADER_SIZE),
            max_frame_size,
            poisoned: false,
        }
    }

    /// Append `chunk` and iterate over the items that are now complete.
    ///
    /// Items are decoded lazily as the iterator advances. Anything left
    /// unconsumed, including items the caller did not pull, stays buffered for
    /// the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Items<'_> {
        if !self.poisoned {
            self.buf.extend_from_slice(chunk);
        }
        Items { reader: self }
    }

    /// Signal end of stream. A partially received item is an error.
    pub fn finish(&mut self) -> Result<(), WireError> {
        if self.poisoned || self.buf.is_empty() {
            return Ok(());
        }
        let partial = self.buf.len();
        self.poison();
        Err(WireError::Truncated(partial))
    }

    /// Whether the handshake record has been consumed
    pub fn handshake_done(&self) -> bool {
        self.state == ReadState::Frames
    }

    /// Bytes held that do not yet form a complete item
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether a decode error has stopped this reader
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn poison(&mut self) {
        self.poisoned = true;
        self.buf = BytesMut::new();
    }

    fn next_item(&mut self) -> Option<Result<Inbound, WireError>> {
        if self.poisoned {
            return None;
        }
        let item = match self.state {
            ReadState::AwaitHandshake => self.decode_handshake()?,
            ReadState::Frames => self.decode_frame()?,
        };
        if item.is_err() {
            self.poison();
        }
        Some(item)
    }

    fn decode_handshake(&mut self) -> Option<Result<Inbound, WireError>> {
        match Handshake::decode(&mut &self.buf[..]) {
            Ok(None) => None,
            Ok(Some(handshake)) => {
                self.buf.advance(HANDSHAKE_SIZE);
                self.state = ReadState::Frames;
                Some(Ok(Inbound::Handshake(handshake)))
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn decode_frame(&mut self) -> Option<Result<Inbound, WireError>> {
        let header = match FrameHeader::peek(&self.buf) {
            Ok(Some(header)) => header,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };

        let frame_len = header.frame_len();
        if frame_len > self.max_frame_size {
            return Some(Err(WireError::Size(frame_len)));
        }
        if self.buf.len() < frame_len {
            // Grow once to hold exactly the rest of this frame
            self.buf.reserve(frame_len - self.buf.len());
            return None;
        }

        let mut body = self.buf.split_to(frame_len).freeze();
        body.advance(FRAME_HEADER_SIZE);
        trace!(
            "Decoded frame serial {} ({} bytes, type {:?})",
            header.serial,
            frame_len,
            header.typ
        );
        Some(Ok(Inbound::Message(split_segments(&header, &mut body))))
    }
}

/// Iterator over the items completed by one [`Reader::feed`] call
#[derive(Debug)]
pub struct Items<'a> {
    reader: &'a mut Reader,
}

impl Iterator for Items<'_> {
    type Item = Result<Inbound, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.reader.next_item()
    }
}
