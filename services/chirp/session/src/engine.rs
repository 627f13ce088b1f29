//! Sans-I/O chirp engine.
//!
//! The engine owns the registry and the engine context. A driver feeds it
//! socket notifications and periodic sweeps, and drains [`EngineEvent`]s.
//! Nothing here blocks, spawns or reads a clock except through the
//! [`Reactor`].

use std::collections::VecDeque;
use std::net::SocketAddr;

use chirp_wire::{Identity, Message, MsgType};
use tracing::{debug, info};

use crate::config::ChirpConfig;
use crate::context::Context;
use crate::encryption::TlsContext;
use crate::error::ChirpError;
use crate::reactor::{ConnId, IoEvent, Reactor};
use crate::registry::Registry;
use crate::writer::{Delivery, Outgoing, SendToken};

/// What the engine reports to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A message arrived from `remote`
    Received {
        /// Listening address of the sender
        remote: SocketAddr,
        /// The message
        message: Message,
    },
    /// A send finished
    SendDone {
        /// Handle returned by [`Engine::send`]
        token: SendToken,
        /// Outcome
        result: Result<Delivery, ChirpError>,
    },
    /// The engine stopped and must be restarted
    Fatal(ChirpError),
}

/// Connection engine
#[derive(Debug)]
pub struct Engine {
    ctx: Context,
    registry: Registry,
    events: VecDeque<EngineEvent>,
    shutting_down: bool,
}

impl Engine {
    /// Validate `config`, load TLS material and pick an identity
    pub fn new(config: ChirpConfig) -> Result<Self, ChirpError> {
        config.validate()?;
        let tls = if config.tls.enabled {
            Some(TlsContext::load(&config.tls)?)
        } else {
            None
        };
        Self::with_tls(config, tls)
    }

    /// Build an engine around already loaded TLS material. A random
    /// identity is drawn only when none is configured.
    pub fn with_tls(config: ChirpConfig, tls: Option<TlsContext>) -> Result<Self, ChirpError> {
        config.validate()?;
        let identity = config
            .parsed_identity()?
            .unwrap_or_else(|| Identity(rand::random()));
        info!(
            "Engine identity {} (tls {})",
            identity,
            if tls.is_some() { "on" } else { "off" }
        );
        Ok(Self {
            ctx: Context::new(config, identity, tls),
            registry: Registry::new(),
            events: VecDeque::new(),
            shutting_down: false,
        })
    }

    /// This node's identity
    pub fn identity(&self) -> Identity {
        self.ctx.identity
    }

    /// Configuration in effect
    pub fn config(&self) -> &ChirpConfig {
        &self.ctx.config
    }

    /// Advertise `port` in handshake records. Used when the configured port
    /// was 0 and the listener picked one.
    pub fn set_public_port(&mut self, port: u16) {
        self.ctx.public_port = port;
    }

    /// Connection registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Whether shutdown has finished
    pub fn is_stopped(&self) -> bool {
        self.shutting_down && self.registry.is_empty()
    }

    /// Send `message` to the node listening on `addr`.
    ///
    /// Immediate rejections (bad input, backpressure, shutdown) come back as
    /// `Err`. Everything else completes later as [`EngineEvent::SendDone`]
    /// carrying the returned token.
    pub fn send<R: Reactor>(
        &mut self,
        addr: SocketAddr,
        mut message: Message,
        ack_required: bool,
        reactor: &mut R,
    ) -> Result<SendToken, ChirpError> {
        if let Some(err) = self.registry.fatal() {
            return Err(err.clone());
        }
        if self.shutting_down {
            return Err(ChirpError::Shutdown("engine is shutting down".to_string()));
        }
        if message.is_ack() {
            return Err(ChirpError::Value("ACK frames are sent by the engine".to_string()));
        }
        message.validate()?;
        let frame_len = chirp_wire::encoded_len(&message);
        if frame_len > self.ctx.config.max_frame_size {
            return Err(ChirpError::Value(format!(
                "frame of {} bytes exceeds the {} byte limit",
                frame_len, self.ctx.config.max_frame_size
            )));
        }

        message.typ.set(MsgType::REQ_ACK, ack_required);
        message.serial = self.ctx.next_serial();
        let token = self.ctx.next_token();
        debug!("Sending serial {} to {} ({:?})", message.serial, addr, token);

        self.registry.route(
            addr,
            Outgoing::new(message, token),
            &mut self.ctx,
            reactor,
            &mut self.events,
        )?;
        Ok(token)
    }

    /// Reserve a handle for a socket the driver is about to hand over
    pub fn allocate_id(&mut self) -> ConnId {
        self.ctx.next_conn_id()
    }

    /// Take over an accepted socket
    pub fn accept<R: Reactor>(&mut self, id: ConnId, peer: SocketAddr, reactor: &mut R) {
        if self.shutting_down {
            reactor.close(id);
            return;
        }
        self.registry
            .accept(id, peer, &mut self.ctx, reactor, &mut self.events);
    }

    /// Deliver a socket notification
    pub fn handle_io<R: Reactor>(&mut self, id: ConnId, event: IoEvent, reactor: &mut R) {
        self.registry
            .handle_io(id, event, &mut self.ctx, reactor, &mut self.events);
    }

    /// Run timers. Call every `sweep_interval`.
    pub fn sweep<R: Reactor>(&mut self, reactor: &mut R) {
        self.registry
            .sweep(&mut self.ctx, reactor, &mut self.events);
    }

    /// Gracefully close the connection to `addr`
    pub fn close<R: Reactor>(&mut self, addr: SocketAddr, reactor: &mut R) {
        self.registry
            .close(addr, &mut self.ctx, reactor, &mut self.events);
    }

    /// Gracefully close every connection
    pub fn close_all<R: Reactor>(&mut self, reactor: &mut R) {
        self.registry
            .close_all(&mut self.ctx, reactor, &mut self.events);
    }

    /// Refuse new work and close everything
    pub fn shutdown<R: Reactor>(&mut self, reactor: &mut R) {
        if self.shutting_down {
            return;
        }
        info!("Engine shutting down");
        self.shutting_down = true;
        self.registry.disable_reconnect();
        self.close_all(reactor);
    }

    /// Next event for the application
    pub fn poll_event(&mut self) -> Option<EngineEvent> {
        self.events.pop_front()
    }
}
