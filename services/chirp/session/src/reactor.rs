//! Capabilities the engine needs from an event loop.
//!
//! The engine never touches sockets or clocks directly. It asks a [`Reactor`]
//! to connect, write and close, and the reactor reports back through
//! [`IoEvent`]s handed to `Engine::handle_io`. Timers are a periodic call to
//! `Engine::sweep`.

use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use bytes::Bytes;

/// Handle naming one socket for the lifetime of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Socket notifications delivered to the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoEvent {
    /// Outbound connect completed
    Connected,
    /// Outbound connect failed
    ConnectFailed(String),
    /// Bytes read from the socket
    Data(Bytes),
    /// The socket accepted this many bytes of the oldest outstanding write
    Written(usize),
    /// The peer closed its side
    Eof,
    /// Read or write failed
    Error(String),
    /// The socket is gone; no further events follow
    Closed,
}

/// Minimal event loop surface driven by the engine
pub trait Reactor {
    /// Current time
    fn now(&self) -> Instant;

    /// Start a non-blocking connect; completion arrives as
    /// [`IoEvent::Connected`] or [`IoEvent::ConnectFailed`]
    fn connect(&mut self, id: ConnId, addr: SocketAddr);

    /// Write `bytes`. The reactor reports how much the socket took with
    /// [`IoEvent::Written`]; the engine re-submits any unwritten tail.
    fn write(&mut self, id: ConnId, bytes: Bytes);

    /// Close the socket; completion arrives as [`IoEvent::Closed`]
    fn close(&mut self, id: ConnId);
}
