//! Per-socket protocol state machine.
//!
//! ```text
//! CONNECTING ──► HANDSHAKING ──► ESTABLISHED ──► CLOSING ──► CLOSED
//!      │              │               │                        ▲
//!      └──────────────┴───────────────┴──── error ─────────────┘
//! ```
//!
//! HANDSHAKING drives TLS (when the shim encrypts) and then exchanges the
//! identity handshake records. Every transition is triggered by an
//! [`IoEvent`], a sweep, or an explicit close from the registry.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chirp_wire::{Handshake, Inbound, Message, Reader};
use tracing::{debug, info, trace, warn};

use crate::context::Context;
use crate::encryption::Shim;
use crate::error::ChirpError;
use crate::reactor::{ConnId, IoEvent, Reactor};
use crate::writer::{Backlog, Completion, Outgoing, Writer};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// TCP connect in progress
    Connecting,
    /// TLS and identity handshake in progress
    Handshaking,
    /// Messages flow both ways
    Established,
    /// Flushing the last write before closing the socket
    Closing,
    /// Terminal
    Closed,
}

/// Who opened the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// We dialed
    Outbound,
    /// The peer dialed
    Inbound,
}

/// Notifications for the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// The peer's handshake record arrived
    Established,
    /// An application message arrived
    Received(Message),
    /// The connection reached CLOSED. `reason` is set when the close was not
    /// requested locally.
    Closed {
        /// Why the connection failed
        reason: Option<ChirpError>,
    },
    /// The engine cannot continue
    Fatal(ChirpError),
}

/// Output of one connection step
#[derive(Debug, Default)]
pub struct Outputs {
    /// State notifications
    pub events: Vec<ConnEvent>,
    /// Finished sends
    pub completions: Vec<Completion>,
}

/// One TCP connection and its protocol state
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    peer: SocketAddr,
    direction: Direction,
    state: ConnState,
    shim: Shim,
    reader: Reader,
    writer: Writer,
    handshake_sent: bool,
    peer_handshake: Option<Handshake>,
    state_since: Instant,
    last_activity: Instant,
    idle_timeout: Duration,
    close_requested: bool,
}

impl Connection {
    /// Connection we are dialing. The caller asks the reactor to connect.
    pub fn outbound(
        id: ConnId,
        peer: SocketAddr,
        ctx: &Context,
        now: Instant,
    ) -> Result<Self, ChirpError> {
        let shim = match &ctx.tls {
            Some(tls) if tls.applies_to(peer.ip()) => Shim::client(tls, ctx.pool.clone())?,
            _ => Shim::Plain,
        };
        Ok(Self::new(id, peer, Direction::Outbound, shim, ctx, now))
    }

    /// Connection the listener just accepted
    pub fn inbound(
        id: ConnId,
        peer: SocketAddr,
        ctx: &Context,
        now: Instant,
    ) -> Result<Self, ChirpError> {
        let shim = match &ctx.tls {
            Some(tls) if tls.applies_to(peer.ip()) => Shim::server(tls, ctx.pool.clone())?,
            _ => Shim::Plain,
        };
        Ok(Self::new(id, peer, Direction::Inbound, shim, ctx, now))
    }

    fn new(
        id: ConnId,
        peer: SocketAddr,
        direction: Direction,
        shim: Shim,
        ctx: &Context,
        now: Instant,
    ) -> Self {
        Self {
            id,
            peer,
            direction,
            state: ConnState::Connecting,
            shim,
            reader: Reader::new(ctx.config.max_frame_size),
            writer: Writer::new(ctx.limits()),
            handshake_sent: false,
            peer_handshake: None,
            state_since: now,
            last_activity: now,
            idle_timeout: ctx.config.reuse_time(),
            close_requested: false,
        }
    }

    /// Socket handle
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Socket peer address
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Who dialed
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// The peer's handshake record, once received
    pub fn peer_handshake(&self) -> Option<&Handshake> {
        self.peer_handshake.as_ref()
    }

    /// Whether sends are still accepted
    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            ConnState::Connecting | ConnState::Handshaking | ConnState::Established
        )
    }

    /// Whether the socket is encrypted
    pub fn is_encrypted(&self) -> bool {
        self.shim.is_encrypted()
    }

    /// Outbound half
    pub fn writer(&self) -> &Writer {
        &self.writer
    }

    fn set_state(&mut self, state: ConnState, now: Instant) {
        trace!("{} {:?} -> {:?}", self.id, self.state, state);
        self.state = state;
        self.state_since = now;
    }

    /// Queue a message. Rejected while closing or above the high-water mark.
    pub fn send<R: Reactor>(
        &mut self,
        outgoing: Outgoing,
        ctx: &Context,
        reactor: &mut R,
        out: &mut Outputs,
    ) -> Result<(), ChirpError> {
        if !self.is_open() {
            return Err(ChirpError::Shutdown(format!(
                "{} to {} is closing",
                self.id, self.peer
            )));
        }
        self.writer.check_capacity()?;
        self.writer.enqueue(outgoing);
        self.pump(ctx, reactor, out);
        Ok(())
    }

    /// Single dispatch point for socket notifications
    pub fn handle<R: Reactor>(
        &mut self,
        event: IoEvent,
        ctx: &Context,
        reactor: &mut R,
        out: &mut Outputs,
    ) {
        if self.state == ConnState::Closed {
            return;
        }
        let result = match event {
            IoEvent::Connected => self.on_connected(ctx, reactor, out),
            IoEvent::ConnectFailed(reason) => Err(ChirpError::CannotConnect(format!(
                "{}: {}",
                self.peer, reason
            ))),
            IoEvent::Data(bytes) => self.on_data(bytes, ctx, reactor, out),
            IoEvent::Written(n) => self.on_written(n, ctx, reactor, out),
            IoEvent::Eof => self.on_eof(reactor, out),
            IoEvent::Error(reason) => Err(ChirpError::Shutdown(format!(
                "I/O error on {}: {}",
                self.peer, reason
            ))),
            IoEvent::Closed => {
                self.on_closed(reactor, out);
                Ok(())
            }
        };
        if let Err(err) = result {
            self.abort(err, reactor, out);
        }
    }

    /// Start the handshake once connect or accept completed
    fn on_connected<R: Reactor>(
        &mut self,
        ctx: &Context,
        reactor: &mut R,
        out: &mut Outputs,
    ) -> Result<(), ChirpError> {
        if self.state != ConnState::Connecting {
            return Ok(());
        }
        let now = reactor.now();
        self.last_activity = now;
        self.set_state(ConnState::Handshaking, now);
        debug!(
            "{} connected to {} ({:?}, {})",
            self.id,
            self.peer,
            self.direction,
            if self.shim.is_encrypted() { "tls" } else { "plain" }
        );

        if let Some(hello) = self.shim.pending_output()? {
            self.writer.enqueue_control(hello);
        }
        self.send_handshake_if_ready(ctx)?;
        self.pump(ctx, reactor, out);
        Ok(())
    }

    fn send_handshake_if_ready(&mut self, ctx: &Context) -> Result<(), ChirpError> {
        if self.handshake_sent || self.shim.is_handshaking() {
            return Ok(());
        }
        let record = ctx.handshake().to_bytes();
        let bytes = self.shim.wrap_plaintext(&record)?;
        self.writer.enqueue_control(bytes);
        self.handshake_sent = true;
        Ok(())
    }

    fn on_data<R: Reactor>(
        &mut self,
        bytes: Bytes,
        ctx: &Context,
        reactor: &mut R,
        out: &mut Outputs,
    ) -> Result<(), ChirpError> {
        let now = reactor.now();
        self.last_activity = now;

        let plaintext = self.shim.feed_ciphertext(bytes)?;
        if let Some(records) = self.shim.pending_output()? {
            self.writer.enqueue_control(records);
        }
        if self.state == ConnState::Handshaking {
            self.send_handshake_if_ready(ctx)?;
        }

        if matches!(self.state, ConnState::Handshaking | ConnState::Established) {
            let mut done = Vec::new();
            for item in self.reader.feed(&plaintext) {
                match item? {
                    Inbound::Handshake(handshake) => {
                        self.peer_handshake = Some(handshake);
                        // Stay open while the peer may still retransmit to us
                        let peer_window = Duration::from_secs(u64::from(handshake.max_timeout))
                            + Duration::from_secs(u64::from(ctx.config.max_timeout_secs()));
                        self.idle_timeout = ctx.config.reuse_time().max(peer_window);
                        self.state = ConnState::Established;
                        self.state_since = now;
                        info!(
                            "{} established with {} (identity {}, port {})",
                            self.id, self.peer, handshake.identity, handshake.port
                        );
                        out.events.push(ConnEvent::Established);
                    }
                    Inbound::Message(msg) if msg.is_ack() => {
                        self.writer.on_ack(&msg, &mut done)?;
                    }
                    Inbound::Message(msg) => {
                        trace!("{} received serial {}", self.id, msg.serial);
                        if msg.requires_ack() {
                            self.writer.enqueue_ack(&msg);
                        }
                        out.events.push(ConnEvent::Received(msg));
                    }
                }
            }
            out.completions.append(&mut done);
        }

        if self.shim.peer_closed() {
            return self.on_eof(reactor, out);
        }
        self.pump(ctx, reactor, out);
        Ok(())
    }

    fn on_written<R: Reactor>(
        &mut self,
        n: usize,
        ctx: &Context,
        reactor: &mut R,
        out: &mut Outputs,
    ) -> Result<(), ChirpError> {
        let now = reactor.now();
        self.last_activity = now;
        if let Some(tail) = self.writer.on_written(n, now, &mut out.completions) {
            reactor.write(self.id, tail);
            return Ok(());
        }
        self.pump(ctx, reactor, out);
        Ok(())
    }

    /// The peer finished sending. With nothing owed in either direction this
    /// is the peer reaping an idle connection, not a failure.
    fn on_eof<R: Reactor>(
        &mut self,
        reactor: &mut R,
        out: &mut Outputs,
    ) -> Result<(), ChirpError> {
        if self.state == ConnState::Closing {
            return Ok(());
        }
        self.reader.finish()?;
        if self.state != ConnState::Established || !self.writer.is_idle() {
            return Err(ChirpError::Shutdown(format!("{} closed the connection", self.peer)));
        }
        debug!("{} closed by idle peer {}", self.id, self.peer);
        self.set_state(ConnState::Closed, reactor.now());
        self.close_requested = true;
        reactor.close(self.id);
        out.events.push(ConnEvent::Closed { reason: None });
        Ok(())
    }

    fn on_closed<R: Reactor>(&mut self, reactor: &mut R, out: &mut Outputs) {
        let reason = if self.close_requested || self.state == ConnState::Closing {
            None
        } else {
            Some(ChirpError::Shutdown(format!("lost connection to {}", self.peer)))
        };
        let err = reason
            .clone()
            .unwrap_or_else(|| ChirpError::Shutdown("connection closed".to_string()));
        self.writer.fail_all(&err, &mut out.completions);
        self.set_state(ConnState::Closed, reactor.now());
        debug!("{} to {} closed", self.id, self.peer);
        out.events.push(ConnEvent::Closed { reason });
    }

    /// Submit the next write if none is outstanding
    fn pump<R: Reactor>(&mut self, ctx: &Context, reactor: &mut R, out: &mut Outputs) {
        if self.state == ConnState::Closed {
            return;
        }
        let established = self.state == ConnState::Established;
        match self.writer.next_write(established, &mut self.shim, &ctx.pool) {
            Ok(Some(bytes)) => reactor.write(self.id, bytes),
            Ok(None) => {
                if self.state == ConnState::Closing && !self.close_requested {
                    self.close_requested = true;
                    reactor.close(self.id);
                }
            }
            Err(err) => self.abort(err, reactor, out),
        }
    }

    /// Graceful close: fail what has not started, let the current write
    /// finish, send close_notify, then close the socket
    pub fn close<R: Reactor>(&mut self, ctx: &Context, reactor: &mut R, out: &mut Outputs) {
        if !self.is_open() {
            return;
        }
        let now = reactor.now();
        info!("{} closing connection to {}", self.id, self.peer);
        self.set_state(ConnState::Closing, now);

        let err = ChirpError::Shutdown(format!("connection to {} is closing", self.peer));
        self.writer.fail_queued(&err, &mut out.completions);
        self.writer.fail_pending(&err, &mut out.completions);
        match self.shim.close() {
            Ok(Some(notify)) => self.writer.enqueue_control(notify),
            Ok(None) => {}
            Err(e) => debug!("{} close_notify failed: {}", self.id, e),
        }
        if !self.writer.is_writing() {
            self.pump(ctx, reactor, out);
        }
    }

    /// Error path: fail everything and close the socket at once
    pub fn abort<R: Reactor>(&mut self, err: ChirpError, reactor: &mut R, out: &mut Outputs) {
        if self.state == ConnState::Closed {
            return;
        }
        match &err {
            ChirpError::Shutdown(_) => debug!("{} to {}: {}", self.id, self.peer, err),
            _ => warn!("{} to {} failed: {}", self.id, self.peer, err),
        }
        if let ChirpError::OutOfMemory(_) = err {
            out.events.push(ConnEvent::Fatal(err.clone()));
        }
        self.writer.fail_all(&err, &mut out.completions);
        self.set_state(ConnState::Closed, reactor.now());
        self.close_requested = true;
        reactor.close(self.id);
        out.events.push(ConnEvent::Closed { reason: Some(err) });
    }

    /// Deadlines: connect and handshake timeouts, ack retries, idle reaping
    pub fn sweep<R: Reactor>(&mut self, ctx: &Context, reactor: &mut R, out: &mut Outputs) {
        let now = reactor.now();
        let in_state = now.saturating_duration_since(self.state_since);
        match self.state {
            ConnState::Connecting if in_state >= ctx.io_timeout() => {
                let err = ChirpError::CannotConnect(format!("connect to {} timed out", self.peer));
                self.abort(err, reactor, out);
            }
            ConnState::Handshaking if in_state >= ctx.io_timeout() => {
                let err = ChirpError::Timeout(format!("handshake with {} timed out", self.peer));
                self.abort(err, reactor, out);
            }
            ConnState::Established => {
                if self.writer.sweep(now, &mut out.completions) {
                    self.pump(ctx, reactor, out);
                }
                let idle = now.saturating_duration_since(self.last_activity);
                if self.writer.is_idle() && idle >= self.idle_timeout {
                    debug!("{} idle for {:?}", self.id, idle);
                    self.close(ctx, reactor, out);
                }
            }
            ConnState::Closing if in_state >= ctx.io_timeout() => {
                let err = ChirpError::Shutdown(format!("close of {} timed out", self.peer));
                self.abort(err, reactor, out);
            }
            _ => {}
        }
    }

    /// Hand queued and pending work to the connection replacing this one
    pub fn take_backlog(&mut self) -> Backlog {
        self.writer.take_backlog()
    }

    /// Adopt work from a replaced connection
    pub fn absorb<R: Reactor>(
        &mut self,
        backlog: Backlog,
        ctx: &Context,
        reactor: &mut R,
        out: &mut Outputs,
    ) {
        self.writer.absorb(backlog);
        self.pump(ctx, reactor, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChirpConfig;
    use crate::testing::{peer_handshake, FakeReactor};
    use crate::writer::{Delivery, SendToken};
    use chirp_wire::{encode_to_bytes, Identity, MsgType, HANDSHAKE_SIZE};

    fn ctx() -> Context {
        let config = ChirpConfig {
            port: 4000,
            max_frame_size: 1024,
            ..Default::default()
        };
        Context::new(config, Identity([1; 16]), None)
    }

    fn established(ctx: &Context, reactor: &mut FakeReactor) -> Connection {
        let mut conn =
            Connection::outbound(ConnId(1), "10.0.0.2:4001".parse().unwrap(), ctx, reactor.now).unwrap();
        let mut out = Outputs::default();
        conn.handle(IoEvent::Connected, ctx, reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Handshaking);
        // Our handshake record goes out first
        let record = reactor.complete_writes(&mut conn, ctx, &mut out);
        assert_eq!(record.len(), HANDSHAKE_SIZE);

        conn.handle(IoEvent::Data(peer_handshake(4001)), ctx, reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Established);
        assert_eq!(out.events, vec![ConnEvent::Established]);
        conn
    }

    fn message(ctx: &mut Context, ack: bool) -> Outgoing {
        let mut msg = Message::new(Identity::from_slice(b"A").unwrap())
            .with_actor(vec![1u8])
            .with_data("ping");
        msg.serial = ctx.next_serial();
        if ack {
            msg.typ = MsgType::REQ_ACK;
        }
        Outgoing::new(msg, ctx.next_token())
    }

    #[test]
    fn test_handshake_and_ack_flow() {
        let mut ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn = established(&ctx, &mut reactor);
        let mut out = Outputs::default();

        let outgoing = message(&mut ctx, true);
        conn.send(outgoing.clone(), &ctx, &mut reactor, &mut out).unwrap();
        let frame = reactor.complete_writes(&mut conn, &ctx, &mut out);
        assert_eq!(chirp_wire::decode(&frame).unwrap().0, outgoing.msg);
        assert_eq!(conn.writer().pending(), 1);

        let ack = encode_to_bytes(&outgoing.msg.ack()).unwrap();
        conn.handle(IoEvent::Data(ack), &ctx, &mut reactor, &mut out);
        assert_eq!(
            out.completions,
            vec![Completion {
                token: SendToken(1),
                result: Ok(Delivery::Acked)
            }]
        );
    }

    #[test]
    fn test_received_message_is_acked() {
        let ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn = established(&ctx, &mut reactor);
        let mut out = Outputs::default();

        let mut incoming = Message::new(Identity::from_slice(b"B").unwrap()).with_data("hi");
        incoming.serial = 77;
        incoming.typ = MsgType::REQ_ACK;
        let bytes = encode_to_bytes(&incoming).unwrap();
        conn.handle(IoEvent::Data(bytes), &ctx, &mut reactor, &mut out);

        assert_eq!(out.events, vec![ConnEvent::Received(incoming.clone())]);
        let ack = reactor.complete_writes(&mut conn, &ctx, &mut out);
        assert_eq!(chirp_wire::decode(&ack).unwrap().0, incoming.ack());
    }

    #[test]
    fn test_queued_while_handshaking() {
        let mut ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn =
            Connection::outbound(ConnId(1), "10.0.0.2:4001".parse().unwrap(), &ctx, reactor.now).unwrap();
        let mut out = Outputs::default();

        conn.send(message(&mut ctx, false), &ctx, &mut reactor, &mut out).unwrap();
        assert!(reactor.writes.is_empty());

        conn.handle(IoEvent::Connected, &ctx, &mut reactor, &mut out);
        reactor.complete_writes(&mut conn, &ctx, &mut out);
        conn.handle(IoEvent::Data(peer_handshake(4001)), &ctx, &mut reactor, &mut out);
        reactor.complete_writes(&mut conn, &ctx, &mut out);
        assert_eq!(out.completions.len(), 1);
        assert_eq!(out.completions[0].result, Ok(Delivery::Sent));
    }

    #[test]
    fn test_oversized_frame_closes_connection() {
        let mut ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn = established(&ctx, &mut reactor);
        let mut out = Outputs::default();
        conn.send(message(&mut ctx, true), &ctx, &mut reactor, &mut out).unwrap();
        reactor.complete_writes(&mut conn, &ctx, &mut out);

        let mut forged = encode_to_bytes(&message(&mut ctx, false).msg).unwrap().to_vec();
        forged[26..30].copy_from_slice(&1_000_000u32.to_be_bytes());
        conn.handle(IoEvent::Data(Bytes::from(forged)), &ctx, &mut reactor, &mut out);

        assert_eq!(conn.state(), ConnState::Closed);
        assert!(reactor.closes.contains(&ConnId(1)));
        assert!(matches!(
            out.events.last(),
            Some(ConnEvent::Closed {
                reason: Some(ChirpError::Protocol(_))
            })
        ));
        assert!(matches!(
            out.completions[0].result,
            Err(ChirpError::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_frame_at_eof_is_protocol_error() {
        let mut ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn = established(&ctx, &mut reactor);
        let mut out = Outputs::default();

        let mut forged = encode_to_bytes(&message(&mut ctx, false).msg).unwrap().to_vec();
        // Declared data length runs past what the peer sent
        forged[26..30].copy_from_slice(&100u32.to_be_bytes());
        conn.handle(IoEvent::Data(Bytes::from(forged)), &ctx, &mut reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Established);
        conn.handle(IoEvent::Eof, &ctx, &mut reactor, &mut out);

        assert_eq!(conn.state(), ConnState::Closed);
        assert!(matches!(
            out.events.last(),
            Some(ConnEvent::Closed {
                reason: Some(ChirpError::Protocol(_))
            })
        ));
    }

    #[test]
    fn test_graceful_close() {
        let mut ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn = established(&ctx, &mut reactor);
        let mut out = Outputs::default();

        conn.send(message(&mut ctx, false), &ctx, &mut reactor, &mut out).unwrap();
        conn.send(message(&mut ctx, false), &ctx, &mut reactor, &mut out).unwrap();
        conn.close(&ctx, &mut reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Closing);
        // The second message never started and fails at once
        assert_eq!(out.completions.len(), 1);
        assert!(matches!(
            out.completions[0].result,
            Err(ChirpError::Shutdown(_))
        ));
        assert!(matches!(
            conn.send(message(&mut ctx, false), &ctx, &mut reactor, &mut out),
            Err(ChirpError::Shutdown(_))
        ));

        // The first finishes writing, then the socket closes
        reactor.complete_writes(&mut conn, &ctx, &mut out);
        assert_eq!(out.completions[1].result, Ok(Delivery::Sent));
        assert_eq!(reactor.closes, vec![ConnId(1)]);

        conn.handle(IoEvent::Closed, &ctx, &mut reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(out.events.last(), Some(&ConnEvent::Closed { reason: None }));
    }

    #[test]
    fn test_connect_failure() {
        let mut ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn =
            Connection::outbound(ConnId(1), "10.0.0.2:4001".parse().unwrap(), &ctx, reactor.now).unwrap();
        let mut out = Outputs::default();
        conn.send(message(&mut ctx, true), &ctx, &mut reactor, &mut out).unwrap();

        conn.handle(IoEvent::ConnectFailed("refused".into()), &ctx, &mut reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(matches!(
            out.completions[0].result,
            Err(ChirpError::CannotConnect(_))
        ));
    }

    #[test]
    fn test_handshake_timeout() {
        let mut ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn =
            Connection::outbound(ConnId(1), "10.0.0.2:4001".parse().unwrap(), &ctx, reactor.now).unwrap();
        let mut out = Outputs::default();
        conn.send(message(&mut ctx, true), &ctx, &mut reactor, &mut out).unwrap();
        conn.handle(IoEvent::Connected, &ctx, &mut reactor, &mut out);

        reactor.advance(Duration::from_secs(6));
        conn.sweep(&ctx, &mut reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Closed);
        assert!(matches!(
            out.completions[0].result,
            Err(ChirpError::Timeout(_))
        ));
    }

    #[test]
    fn test_idle_connection_is_closed() {
        let ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn = established(&ctx, &mut reactor);
        let mut out = Outputs::default();

        reactor.advance(Duration::from_secs(10));
        conn.sweep(&ctx, &mut reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Established);

        // reuse_time is 30s, but the peer may retransmit for 20s plus our own 15s
        reactor.advance(Duration::from_secs(25));
        conn.sweep(&ctx, &mut reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Closing);
        assert_eq!(reactor.closes, vec![ConnId(1)]);
    }

    #[test]
    fn test_writes_keep_connection_alive() {
        let mut ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn = established(&ctx, &mut reactor);
        let mut out = Outputs::default();

        // Idle timeout is 35s; a one-way sender must not be reaped mid-stream
        for _ in 0..8 {
            reactor.advance(Duration::from_secs(5));
            conn.send(message(&mut ctx, false), &ctx, &mut reactor, &mut out).unwrap();
            reactor.complete_writes(&mut conn, &ctx, &mut out);
            conn.sweep(&ctx, &mut reactor, &mut out);
            assert_eq!(conn.state(), ConnState::Established);
        }
        assert_eq!(out.completions.len(), 8);
        assert!(reactor.closes.is_empty());

        reactor.advance(Duration::from_secs(35));
        conn.sweep(&ctx, &mut reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Closing);
    }

    #[test]
    fn test_eof_on_idle_connection_is_clean() {
        let ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn = established(&ctx, &mut reactor);
        let mut out = Outputs::default();

        conn.handle(IoEvent::Eof, &ctx, &mut reactor, &mut out);
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(reactor.closes, vec![ConnId(1)]);
        assert_eq!(out.events.last(), Some(&ConnEvent::Closed { reason: None }));

        // The socket's own close notification changes nothing
        conn.handle(IoEvent::Closed, &ctx, &mut reactor, &mut out);
        assert_eq!(out.events.len(), 1);
    }

    #[test]
    fn test_unexpected_eof_fails_pending_with_shutdown() {
        let mut ctx = ctx();
        let mut reactor = FakeReactor::new();
        let mut conn = established(&ctx, &mut reactor);
        let mut out = Outputs::default();
        conn.send(message(&mut ctx, true), &ctx, &mut reactor, &mut out).unwrap();
        reactor.complete_writes(&mut conn, &ctx, &mut out);

        conn.handle(IoEvent::Eof, &ctx, &mut reactor, &mut out);
        assert!(matches!(
            out.completions[0].result,
            Err(ChirpError::Shutdown(_))
        ));
        assert!(matches!(
            out.events.last(),
            Some(ConnEvent::Closed { reason: Some(_) })
        ));
    }
}
