//! Engine configuration.
//!
//! Durations are plain seconds (or milliseconds where noted) so the same
//! structure can be read from YAML without adapters.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use chirp_wire::{Identity, DEFAULT_MAX_FRAME_SIZE, IDENTITY_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::ChirpError;

/// Default public port
pub const DEFAULT_PORT: u16 = 2998;

/// Longest reconnect delay, in seconds
const MAX_BACKOFF_SECS: f64 = 3600.0;

/// Largest reconnect backoff multiplier
const MAX_BACKOFF_MULTIPLIER: f64 = 100.0;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChirpConfig {
    /// Public port; 0 picks an ephemeral port
    pub port: u16,
    /// Address to listen on
    pub bind: IpAddr,
    /// Node identity as 32 hex digits; random when unset
    pub identity: Option<String>,
    /// Ack timeout in seconds, also used for connect and handshake
    pub timeout: f64,
    /// Retransmissions before a send times out
    pub retries: u32,
    /// Idle connection lifetime in seconds
    pub reuse_time: f64,
    /// Queued messages per connection before sends are rejected
    pub max_queue: usize,
    /// Queued bytes per connection before sends are rejected
    pub max_queue_bytes: usize,
    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
    /// Timer sweep period in milliseconds
    pub sweep_interval_ms: u64,
    /// Reconnect policy
    pub reconnect: ReconnectConfig,
    /// TLS settings
    pub tls: TlsConfig,
}

/// Reconnect policy for remotes this node dialed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether to reconnect after an unexpected close
    pub enabled: bool,
    /// First backoff delay in seconds
    pub initial: f64,
    /// Backoff multiplier per consecutive failure
    pub multiplier: f64,
    /// Backoff cap in seconds
    pub max: f64,
}

/// TLS configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// PEM certificate chain presented to peers
    pub cert_chain: PathBuf,
    /// PEM PKCS#8 private key
    pub private_key: PathBuf,
    /// PEM CA bundle used to verify peers
    pub ca: PathBuf,
    /// Name checked against the server certificate
    pub server_name: String,
    /// Encrypt connections to loopback addresses too
    pub encrypt_loopback: bool,
}

impl Default for ChirpConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            identity: None,
            timeout: 5.0,
            retries: 1,
            reuse_time: 30.0,
            max_queue: 256,
            max_queue_bytes: 16 * 1024 * 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            sweep_interval_ms: 50,
            reconnect: ReconnectConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial: 1.0,
            multiplier: 2.0,
            max: 30.0,
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_chain: PathBuf::new(),
            private_key: PathBuf::new(),
            ca: PathBuf::new(),
            server_name: "localhost".to_string(),
            encrypt_loopback: false,
        }
    }
}

impl ChirpConfig {
    /// Check every value against its allowed range
    pub fn validate(&self) -> Result<(), ChirpError> {
        if self.port != 0 && self.port <= 1024 {
            return Err(value("port must be greater than 1024"));
        }
        if !(0.1..=60.0).contains(&self.timeout) {
            return Err(value("timeout must be between 0.1 and 60 seconds"));
        }
        if !(2.0..=3600.0).contains(&self.reuse_time) {
            return Err(value("reuse_time must be between 2 and 3600 seconds"));
        }
        if self.timeout > self.reuse_time {
            return Err(value("timeout must not exceed reuse_time"));
        }
        if self.max_queue == 0 || self.max_queue_bytes == 0 {
            return Err(value("queue limits must be positive"));
        }
        if self.max_frame_size < chirp_wire::FRAME_HEADER_SIZE {
            return Err(value("max_frame_size is smaller than a frame header"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(value("sweep_interval_ms must be positive"));
        }
        let policy = &self.reconnect;
        if !(policy.initial > 0.0
            && policy.initial <= policy.max
            && policy.max <= MAX_BACKOFF_SECS)
        {
            return Err(value(
                "reconnect initial and max must satisfy 0 < initial <= max <= 3600 seconds",
            ));
        }
        if !(1.0..=MAX_BACKOFF_MULTIPLIER).contains(&policy.multiplier) {
            return Err(value("reconnect multiplier must be between 1 and 100"));
        }
        if self.tls.enabled
            && (self.tls.cert_chain.as_os_str().is_empty()
                || self.tls.private_key.as_os_str().is_empty()
                || self.tls.ca.as_os_str().is_empty())
        {
            return Err(value("tls needs cert_chain, private_key and ca"));
        }
        self.parsed_identity()?;
        Ok(())
    }

    /// Configured identity, if any
    pub fn parsed_identity(&self) -> Result<Option<Identity>, ChirpError> {
        let Some(text) = &self.identity else {
            return Ok(None);
        };
        let raw = hex::decode(text.trim())
            .map_err(|e| value(&format!("identity is not hex: {}", e)))?;
        if raw.len() != IDENTITY_SIZE {
            return Err(value("identity must be 16 bytes"));
        }
        Ok(Some(Identity::from_slice(&raw)?))
    }

    /// Ack timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout)
    }

    /// Idle connection lifetime
    pub fn reuse_time(&self) -> Duration {
        Duration::from_secs_f64(self.reuse_time)
    }

    /// Timer sweep period
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Longest a message may be retransmitted, in whole seconds, as
    /// advertised in the handshake record
    pub fn max_timeout_secs(&self) -> u16 {
        let secs = (f64::from(self.retries) + 2.0) * self.timeout;
        secs.ceil().min(f64::from(u16::MAX)) as u16
    }
}

impl ReconnectConfig {
    /// First backoff delay
    pub fn initial(&self) -> Duration {
        Duration::from_secs_f64(self.initial)
    }

    /// Delay following `current`
    pub fn next(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(Duration::from_secs_f64(self.max))
    }
}

fn value(msg: &str) -> ChirpError {
    ChirpError::Value(msg.to_string())
}
