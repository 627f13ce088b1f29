//! Recording reactor and peer helpers for state machine tests.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use chirp_wire::{Handshake, Identity};

use crate::connection::{Connection, Outputs};
use crate::context::Context;
use crate::reactor::{ConnId, IoEvent, Reactor};

/// Reactor that records requests and lets the test decide what happens
pub struct FakeReactor {
    pub now: Instant,
    pub connects: Vec<(ConnId, SocketAddr)>,
    pub writes: Vec<(ConnId, Bytes)>,
    pub closes: Vec<ConnId>,
}

impl FakeReactor {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            connects: Vec::new(),
            writes: Vec::new(),
            closes: Vec::new(),
        }
    }

    pub fn advance(&mut self, by: Duration) {
        self.now += by;
    }

    /// Remove and return everything written to `id` so far
    pub fn take_writes(&mut self, id: ConnId) -> Vec<Bytes> {
        let (mine, rest): (Vec<_>, Vec<_>) = self.writes.drain(..).partition(|(w, _)| *w == id);
        self.writes = rest;
        mine.into_iter().map(|(_, bytes)| bytes).collect()
    }

    /// Let the socket accept every write of `conn` in full, including writes
    /// triggered by earlier completions. Returns the bytes in order.
    pub fn complete_writes(
        &mut self,
        conn: &mut Connection,
        ctx: &Context,
        out: &mut Outputs,
    ) -> Bytes {
        let mut all = BytesMut::new();
        while let Some(pos) = self.writes.iter().position(|(id, _)| *id == conn.id()) {
            let (_, bytes) = self.writes.remove(pos);
            all.extend_from_slice(&bytes);
            conn.handle(IoEvent::Written(bytes.len()), ctx, self, out);
        }
        all.freeze()
    }
}

impl Reactor for FakeReactor {
    fn now(&self) -> Instant {
        self.now
    }

    fn connect(&mut self, id: ConnId, addr: SocketAddr) {
        self.connects.push((id, addr));
    }

    fn write(&mut self, id: ConnId, bytes: Bytes) {
        self.writes.push((id, bytes));
    }

    fn close(&mut self, id: ConnId) {
        self.closes.push(id);
    }
}

pub fn peer_identity() -> Identity {
    Identity([2; 16])
}

/// Handshake record a peer listening on `port` would send
pub fn peer_handshake(port: u16) -> Bytes {
    let record = Handshake {
        port,
        max_timeout: 20,
        identity: peer_identity(),
    };
    Bytes::copy_from_slice(&record.to_bytes())
}
