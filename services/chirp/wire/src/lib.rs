//! Wire format, message model, buffer pooling and incremental reading for chirp.
//!
//! This crate holds everything about chirp that does not touch a socket:
//! the in-memory [`Message`], the fixed frame header, the serializer, the
//! handshake record each side sends after connecting, the tiered
//! [`BufferPool`] and the resumable [`Reader`].
//!
//! ## Wire Format
//!
//! ```text
//! connection:  [ handshake (20B) ] [ frame ] [ frame ] ...
//!
//! handshake:   +----------+-------------+--------------+
//!              | port u16 | timeout u16 | identity 16B |
//!              +----------+-------------+--------------+
//!
//! frame:       +----------------------+----------------------------+
//!              | frame header (30B)   | ver, type, identity,       |
//!              |                      | serial, segment lengths    |
//!              +----------------------+----------------------------+
//!              | header segment       | 0..=65535 bytes            |
//!              +----------------------+----------------------------+
//!              | actor segment        | 0..=65535 bytes            |
//!              +----------------------+----------------------------+
//!              | data segment         | 0..=u32::MAX bytes         |
//!              +----------------------+----------------------------+
//! ```
//!
//! All integers are big-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod handshake;
pub mod header;
pub mod message;
pub mod pool;
pub mod reader;

// Re-export main types
pub use error::WireError;
pub use frame::{decode, encode, encode_to_bytes, encoded_len, DEFAULT_MAX_FRAME_SIZE};
pub use handshake::{Handshake, HANDSHAKE_SIZE};
pub use header::{FrameHeader, MsgType, FRAME_HEADER_SIZE, IDENTITY_SIZE, WIRE_VERSION};
pub use message::{Identity, Message};
pub use pool::{BufferPool, PoolStats, PooledBuf, SizeClass};
pub use reader::{Inbound, Reader};
