//! TCP/TLS connections, ack/retry writer, remote registry and reactor for chirp.
//!
//! The heart of this crate is a sans-I/O [`Engine`]: it owns every
//! [`Connection`] through the [`Registry`] and drives them from
//! [`IoEvent`]s and periodic sweeps, asking a [`Reactor`] to perform the
//! actual socket work. [`TokioReactor`] is the production reactor and
//! [`Chirp`] runs engine and reactor on a dedicated thread.
//!
//! ## Features
//!
//! - **Acknowledged sends**: per-message timeout and retry, explicit outcome
//! - **Backpressure**: sends past the queue high-water mark fail immediately
//! - **Mutual TLS**: rustls sessions driven in memory, loopback bypass
//! - **Reconnect**: exponential backoff for remotes this node dialed
//! - **One connection per remote**: deterministic tie-break on simultaneous dial
//!
//! ## Example
//!
//! ```rust,no_run
//! use chirp_session::{Chirp, ChirpConfig, Delivery};
//! use chirp_wire::{Identity, Message};
//!
//! # async fn example() -> Result<(), chirp_session::ChirpError> {
//! let node = Chirp::start(ChirpConfig::default()).await?;
//! node.on_message(|from, msg| {
//!     println!("{} sent {} bytes", from, msg.data.len());
//! })?;
//!
//! let msg = Message::new(Identity::from_slice(b"A")?)
//!     .with_actor(vec![1u8])
//!     .with_data("ping");
//! let outcome = node.send("10.0.0.2:2998".parse().unwrap(), msg, true).await?;
//! assert_eq!(outcome, Delivery::Acked);
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chirp;
pub mod config;
pub mod connection;
pub mod context;
pub mod encryption;
pub mod engine;
pub mod error;
pub mod reactor;
pub mod registry;
pub mod transport;
pub mod writer;

#[cfg(test)]
mod testing;

// Re-export main types
pub use chirp::{Chirp, MessageHandler};
pub use config::{ChirpConfig, ReconnectConfig, TlsConfig};
pub use connection::{ConnEvent, ConnState, Connection, Direction, Outputs};
pub use context::Context;
pub use encryption::{make_client_config, make_server_config, Shim, TlsContext, ALPN};
pub use engine::{Engine, EngineEvent};
pub use error::ChirpError;
pub use reactor::{ConnId, IoEvent, Reactor};
pub use registry::{Registry, Remote};
pub use transport::{listen_tcp, TokioReactor};
pub use writer::{Delivery, SendToken, Writer, WriterLimits};
