//! Engine-wide state shared by every connection.

use std::time::Duration;

use chirp_wire::{BufferPool, Handshake, Identity};

use crate::config::ChirpConfig;
use crate::encryption::TlsContext;
use crate::reactor::ConnId;
use crate::writer::{SendToken, WriterLimits};

/// Configuration, counters and shared resources of one engine
#[derive(Debug)]
pub struct Context {
    /// Validated configuration
    pub config: ChirpConfig,
    /// This node's identity
    pub identity: Identity,
    /// Port advertised in handshake records
    pub public_port: u16,
    /// Scratch buffers
    pub pool: BufferPool,
    /// TLS material, when encryption is enabled
    pub tls: Option<TlsContext>,
    next_serial: u32,
    next_token: u64,
    next_conn: u64,
}

impl Context {
    /// Fresh context
    pub fn new(config: ChirpConfig, identity: Identity, tls: Option<TlsContext>) -> Self {
        let public_port = config.port;
        Self {
            config,
            identity,
            public_port,
            pool: BufferPool::new(),
            tls,
            next_serial: 0,
            next_token: 0,
            next_conn: 0,
        }
    }

    /// Handshake record this node sends on every connection
    pub fn handshake(&self) -> Handshake {
        Handshake {
            port: self.public_port,
            max_timeout: self.config.max_timeout_secs(),
            identity: self.identity,
        }
    }

    /// Writer limits derived from the configuration
    pub fn limits(&self) -> WriterLimits {
        WriterLimits {
            max_queue: self.config.max_queue,
            max_queue_bytes: self.config.max_queue_bytes,
            timeout: self.config.timeout(),
            retries: self.config.retries,
        }
    }

    /// Connect, handshake and close deadline
    pub fn io_timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Next message serial. One counter serves every connection, so serials
    /// stay unique when queued messages move between connections.
    pub fn next_serial(&mut self) -> u32 {
        self.next_serial = self.next_serial.wrapping_add(1);
        self.next_serial
    }

    /// Next send handle
    pub fn next_token(&mut self) -> SendToken {
        self.next_token += 1;
        SendToken(self.next_token)
    }

    /// Next socket handle
    pub fn next_conn_id(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }
}
