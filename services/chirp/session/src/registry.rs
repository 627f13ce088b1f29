//! Remote registry: address to connection routing, duplicate resolution and
//! reconnects.
//!
//! Remotes are keyed by the address a peer listens on. For connections we
//! dial that is the dialed address; for accepted connections it is the peer's
//! IP with the port from its handshake record, so both directions land on
//! the same key.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chirp_wire::Identity;
use tracing::{debug, info, warn};

use crate::connection::{ConnEvent, ConnState, Connection, Direction, Outputs};
use crate::context::Context;
use crate::engine::EngineEvent;
use crate::error::ChirpError;
use crate::reactor::{ConnId, IoEvent, Reactor};
use crate::writer::Outgoing;

/// A logical peer
#[derive(Debug, Clone)]
pub struct Remote {
    conn: Option<ConnId>,
    dialed: bool,
    backoff: Duration,
    reconnect_at: Option<Instant>,
}

impl Remote {
    fn new(dialed: bool, ctx: &Context) -> Self {
        Self {
            conn: None,
            dialed,
            backoff: ctx.config.reconnect.initial(),
            reconnect_at: None,
        }
    }

    /// Connection currently serving this remote
    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    /// Delay before the next reconnect attempt
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// When the next reconnect is due, if one is scheduled
    pub fn reconnect_at(&self) -> Option<Instant> {
        self.reconnect_at
    }
}

/// Owner of every connection, indexed by remote address
#[derive(Debug, Default)]
pub struct Registry {
    remotes: BTreeMap<SocketAddr, Remote>,
    connections: HashMap<ConnId, Connection>,
    keys: HashMap<ConnId, SocketAddr>,
    no_reconnect: bool,
    fatal: Option<ChirpError>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Remote state for `addr`
    pub fn remote(&self, addr: &SocketAddr) -> Option<&Remote> {
        self.remotes.get(addr)
    }

    /// Connection by handle
    pub fn connection(&self, id: ConnId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    /// Connection currently serving `addr`
    pub fn connection_for(&self, addr: &SocketAddr) -> Option<&Connection> {
        self.remotes
            .get(addr)
            .and_then(|remote| remote.conn)
            .and_then(|id| self.connections.get(&id))
    }

    /// Established connections registered under `addr`
    pub fn established_for(&self, addr: &SocketAddr) -> usize {
        self.keys
            .iter()
            .filter(|(id, key)| {
                *key == addr
                    && self
                        .connections
                        .get(*id)
                        .is_some_and(|c| c.state() == ConnState::Established)
            })
            .count()
    }

    /// Live connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is live
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Error that stopped the engine, if any
    pub fn fatal(&self) -> Option<&ChirpError> {
        self.fatal.as_ref()
    }

    /// Stop scheduling reconnects for good
    pub fn disable_reconnect(&mut self) {
        self.no_reconnect = true;
        for remote in self.remotes.values_mut() {
            remote.reconnect_at = None;
        }
    }

    /// Queue `outgoing` for `addr`, dialing if no open connection exists
    pub fn route<R: Reactor>(
        &mut self,
        addr: SocketAddr,
        outgoing: Outgoing,
        ctx: &mut Context,
        reactor: &mut R,
        events: &mut VecDeque<EngineEvent>,
    ) -> Result<(), ChirpError> {
        let live = self
            .connection_for(&addr)
            .filter(|conn| conn.is_open())
            .map(|conn| conn.id());
        let id = match live {
            Some(id) => id,
            None => self.dial(addr, ctx, reactor)?,
        };

        let mut out = Outputs::default();
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or_else(|| ChirpError::Shutdown(format!("{} vanished", id)))?;
        let result = conn.send(outgoing, ctx, reactor, &mut out);
        self.process(id, out, ctx, reactor, events);
        result
    }

    fn dial<R: Reactor>(
        &mut self,
        addr: SocketAddr,
        ctx: &mut Context,
        reactor: &mut R,
    ) -> Result<ConnId, ChirpError> {
        let id = ctx.next_conn_id();
        let conn = Connection::outbound(id, addr, ctx, reactor.now())?;
        info!("{} dialing {}", id, addr);

        let remote = self
            .remotes
            .entry(addr)
            .or_insert_with(|| Remote::new(true, ctx));
        remote.dialed = true;
        remote.conn = Some(id);
        remote.reconnect_at = None;

        self.connections.insert(id, conn);
        self.keys.insert(id, addr);
        reactor.connect(id, addr);
        Ok(id)
    }

    /// Take ownership of a socket the listener accepted
    pub fn accept<R: Reactor>(
        &mut self,
        id: ConnId,
        peer: SocketAddr,
        ctx: &mut Context,
        reactor: &mut R,
        events: &mut VecDeque<EngineEvent>,
    ) {
        let conn = match Connection::inbound(id, peer, ctx, reactor.now()) {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Rejecting {} from {}: {}", id, peer, e);
                reactor.close(id);
                return;
            }
        };
        debug!("{} accepted from {}", id, peer);
        self.connections.insert(id, conn);
        self.handle_io(id, IoEvent::Connected, ctx, reactor, events);
    }

    /// Route a socket notification to its connection
    pub fn handle_io<R: Reactor>(
        &mut self,
        id: ConnId,
        event: IoEvent,
        ctx: &mut Context,
        reactor: &mut R,
        events: &mut VecDeque<EngineEvent>,
    ) {
        let Some(conn) = self.connections.get_mut(&id) else {
            // Late notification for a connection already dropped
            return;
        };
        let mut out = Outputs::default();
        conn.handle(event, ctx, reactor, &mut out);
        self.process(id, out, ctx, reactor, events);
    }

    /// Run deadlines on every connection and start due reconnects
    pub fn sweep<R: Reactor>(
        &mut self,
        ctx: &mut Context,
        reactor: &mut R,
        events: &mut VecDeque<EngineEvent>,
    ) {
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            let mut out = Outputs::default();
            conn.sweep(ctx, reactor, &mut out);
            self.process(id, out, ctx, reactor, events);
        }

        let now = reactor.now();
        let due: Vec<SocketAddr> = self
            .remotes
            .iter()
            .filter(|(_, r)| r.conn.is_none() && r.reconnect_at.is_some_and(|at| at <= now))
            .map(|(addr, _)| *addr)
            .collect();
        for addr in due {
            info!("Reconnecting to {}", addr);
            if let Err(e) = self.dial(addr, ctx, reactor) {
                warn!("Reconnect to {} failed: {}", addr, e);
                if let Some(remote) = self.remotes.get_mut(&addr) {
                    remote.reconnect_at = None;
                }
            }
        }
    }

    /// Gracefully close the connection serving `addr` and cancel reconnects
    pub fn close<R: Reactor>(
        &mut self,
        addr: SocketAddr,
        ctx: &mut Context,
        reactor: &mut R,
        events: &mut VecDeque<EngineEvent>,
    ) {
        let ids: Vec<ConnId> = self
            .keys
            .iter()
            .filter(|(_, key)| **key == addr)
            .map(|(id, _)| *id)
            .collect();
        if let Some(remote) = self.remotes.get_mut(&addr) {
            remote.reconnect_at = None;
        }
        for id in ids {
            self.close_conn(id, ctx, reactor, events);
        }
    }

    /// Gracefully close every connection
    pub fn close_all<R: Reactor>(
        &mut self,
        ctx: &mut Context,
        reactor: &mut R,
        events: &mut VecDeque<EngineEvent>,
    ) {
        for remote in self.remotes.values_mut() {
            remote.reconnect_at = None;
        }
        let ids: Vec<ConnId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_conn(id, ctx, reactor, events);
        }
    }

    fn close_conn<R: Reactor>(
        &mut self,
        id: ConnId,
        ctx: &mut Context,
        reactor: &mut R,
        events: &mut VecDeque<EngineEvent>,
    ) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let mut out = Outputs::default();
        conn.close(ctx, reactor, &mut out);
        self.process(id, out, ctx, reactor, events);
    }

    fn process<R: Reactor>(
        &mut self,
        id: ConnId,
        out: Outputs,
        ctx: &mut Context,
        reactor: &mut R,
        events: &mut VecDeque<EngineEvent>,
    ) {
        for done in out.completions {
            events.push_back(EngineEvent::SendDone {
                token: done.token,
                result: done.result,
            });
        }
        for event in out.events {
            match event {
                ConnEvent::Established => self.on_established(id, ctx, reactor, events),
                ConnEvent::Received(message) => {
                    let remote = match self.keys.get(&id) {
                        Some(key) => *key,
                        None => match self.connections.get(&id) {
                            Some(conn) => conn.peer(),
                            None => continue,
                        },
                    };
                    events.push_back(EngineEvent::Received { remote, message });
                }
                ConnEvent::Closed { reason } => self.on_closed(id, reason, ctx, reactor.now()),
                ConnEvent::Fatal(err) => {
                    warn!("Fatal engine error: {}", err);
                    self.fatal = Some(err.clone());
                    events.push_back(EngineEvent::Fatal(err));
                }
            }
        }
    }

    fn dialer_identity(conn: &Connection, ctx: &Context) -> Identity {
        match conn.direction() {
            Direction::Outbound => ctx.identity,
            Direction::Inbound => conn
                .peer_handshake()
                .map(|hs| hs.identity)
                .unwrap_or_default(),
        }
    }

    fn on_established<R: Reactor>(
        &mut self,
        id: ConnId,
        ctx: &mut Context,
        reactor: &mut R,
        events: &mut VecDeque<EngineEvent>,
    ) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        let Some(handshake) = conn.peer_handshake().copied() else {
            return;
        };
        let key = match (conn.direction(), self.keys.get(&id)) {
            (Direction::Outbound, Some(key)) => *key,
            _ => SocketAddr::new(conn.peer().ip(), handshake.port),
        };
        self.keys.insert(id, key);

        let remote = self
            .remotes
            .entry(key)
            .or_insert_with(|| Remote::new(false, ctx));
        let existing = remote
            .conn
            .filter(|other| *other != id)
            .filter(|other| self.connections.get(other).is_some_and(|c| c.is_open()));

        let winner = match existing {
            None => id,
            Some(other) => {
                let ours = Self::dialer_identity(conn, ctx);
                let theirs = self
                    .connections
                    .get(&other)
                    .map(|c| Self::dialer_identity(c, ctx))
                    .unwrap_or_default();
                // Larger dialer identity wins; a tie keeps the existing one
                let (winner, loser) = if ours > theirs { (id, other) } else { (other, id) };
                info!(
                    "Duplicate connection to {}: keeping {}, dropping {}",
                    key, winner, loser
                );
                self.replace(loser, winner, ctx, reactor, events);
                winner
            }
        };

        if let Some(remote) = self.remotes.get_mut(&key) {
            remote.conn = Some(winner);
            remote.backoff = ctx.config.reconnect.initial();
            remote.reconnect_at = None;
        }
    }

    /// Move the loser's backlog to the winner and close the loser
    fn replace<R: Reactor>(
        &mut self,
        loser: ConnId,
        winner: ConnId,
        ctx: &mut Context,
        reactor: &mut R,
        events: &mut VecDeque<EngineEvent>,
    ) {
        let Some(mut losing) = self.connections.remove(&loser) else {
            return;
        };
        let backlog = losing.take_backlog();
        let mut loser_out = Outputs::default();
        losing.close(ctx, reactor, &mut loser_out);
        self.connections.insert(loser, losing);

        if let Some(winning) = self.connections.get_mut(&winner) {
            let mut winner_out = Outputs::default();
            winning.absorb(backlog, ctx, reactor, &mut winner_out);
            self.process(winner, winner_out, ctx, reactor, events);
        }
        self.process(loser, loser_out, ctx, reactor, events);
    }

    fn on_closed(&mut self, id: ConnId, reason: Option<ChirpError>, ctx: &Context, now: Instant) {
        self.connections.remove(&id);
        let Some(key) = self.keys.remove(&id) else {
            return;
        };
        let Some(remote) = self.remotes.get_mut(&key) else {
            return;
        };
        if remote.conn != Some(id) {
            return;
        }
        remote.conn = None;

        let policy = &ctx.config.reconnect;
        if reason.is_some() && remote.dialed && policy.enabled && !self.no_reconnect {
            remote.reconnect_at = Some(now + remote.backoff);
            info!("Reconnecting to {} in {:?}", key, remote.backoff);
            remote.backoff = policy.next(remote.backoff);
        } else if !remote.dialed {
            self.remotes.remove(&key);
        }
    }
}
