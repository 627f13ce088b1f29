//! Chirp node binary.
//!
//! Runs a chirp node that either listens and prints what it receives, or
//! sends a batch of messages to another node and reports each outcome.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Instant;

use anyhow::Context;
use bytes::Bytes;
use chirp_session::{Chirp, ChirpConfig, Delivery};
use chirp_wire::{Identity, Message};
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::NodeConfig;
use logging::ChirpLogFormatter;

/// Encrypted message transport node
#[derive(Parser, Debug)]
#[command(name = "chirp", version, about = "Encrypted message-oriented transport node")]
struct Args {
    /// Configuration file path
    #[arg(long, global = true, default_value = "chirp.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Public port to listen on (0 picks one)
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Address to bind the listener to
    #[arg(long, global = true)]
    bind: Option<IpAddr>,

    /// Node identity as 32 hex digits
    #[arg(long, global = true)]
    identity: Option<String>,

    /// Ack timeout, e.g. 5s or 500ms
    #[arg(long, global = true)]
    timeout: Option<humantime::Duration>,

    /// Retransmissions before a send times out
    #[arg(long, global = true)]
    retries: Option<u32>,

    /// Idle connection lifetime, e.g. 30s
    #[arg(long, global = true)]
    reuse_time: Option<humantime::Duration>,

    // TLS options
    /// Enable TLS (mTLS)
    #[arg(long, global = true)]
    tls: bool,

    /// Path to TLS certificate chain (PEM format)
    #[arg(long, global = true, requires = "tls")]
    tls_cert: Option<PathBuf>,

    /// Path to TLS private key (PEM PKCS#8)
    #[arg(long, global = true, requires = "tls")]
    tls_key: Option<PathBuf>,

    /// Path to CA certificate bundle (PEM format)
    #[arg(long, global = true, requires = "tls")]
    tls_ca: Option<PathBuf>,

    /// Server name checked against peer certificates
    #[arg(long, global = true)]
    tls_sni: Option<String>,

    /// Encrypt loopback connections too
    #[arg(long, global = true)]
    tls_loopback: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen and print received messages until interrupted
    Listen,
    /// Send messages to another node
    Send {
        /// Listening address of the target node
        #[arg(long)]
        to: SocketAddr,
        /// Payload of each message
        #[arg(long)]
        data: String,
        /// Actor segment
        #[arg(long, default_value = "")]
        actor: String,
        /// Message identity, at most 16 bytes
        #[arg(long, default_value = "chirp")]
        tag: String,
        /// Number of messages
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Do not request acknowledgements
        #[arg(long)]
        no_ack: bool,
    },
}

impl Args {
    /// Layer command line flags over the file and environment values
    fn apply(&self, config: &mut ChirpConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(identity) = &self.identity {
            config.identity = Some(identity.clone());
        }
        if let Some(timeout) = &self.timeout {
            config.timeout = timeout.as_secs_f64();
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let Some(reuse) = &self.reuse_time {
            config.reuse_time = reuse.as_secs_f64();
        }
        if self.tls {
            config.tls.enabled = true;
        }
        if let Some(path) = &self.tls_cert {
            config.tls.cert_chain = path.clone();
        }
        if let Some(path) = &self.tls_key {
            config.tls.private_key = path.clone();
        }
        if let Some(path) = &self.tls_ca {
            config.tls.ca = path.clone();
        }
        if let Some(name) = &self.tls_sni {
            config.tls.server_name = name.clone();
        }
        if self.tls_loopback {
            config.tls.encrypt_loopback = true;
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // The config file may name a log level, but it is read after logging starts
    let file_level = peek_log_level(&args.config);
    let level = args
        .log_level
        .clone()
        .or(file_level)
        .unwrap_or_else(|| "info".to_string());

    let env_filter = EnvFilter::new("warn")
        .add_directive(format!("chirp={}", level).parse()?)
        .add_directive(format!("chirp_session={}", level).parse()?)
        .add_directive(format!("chirp_wire={}", level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(ChirpLogFormatter::new("chirp"))
        .init();

    info!("Starting chirp v{}", env!("CARGO_PKG_VERSION"));

    let mut node_config = NodeConfig::load_from_file(&args.config)?;
    args.apply(&mut node_config.chirp);
    node_config
        .chirp
        .validate()
        .context("Invalid configuration")?;

    let node = Chirp::start(node_config.chirp)
        .await
        .context("Failed to start chirp node")?;
    info!("Node {} listening on {}", node.identity(), node.local_addr());

    let result = match args.command {
        Command::Listen => listen(&node).await,
        Command::Send {
            to,
            data,
            actor,
            tag,
            count,
            no_ack,
        } => {
            let template = Message::new(Identity::from_slice(tag.as_bytes())?)
                .with_actor(Bytes::from(actor))
                .with_data(Bytes::from(data));
            send(&node, to, template, count, !no_ack).await
        }
    };

    node.shutdown().await;
    info!("Chirp stopped");
    result
}

async fn listen(node: &Chirp) -> anyhow::Result<()> {
    node.on_message(|from, msg| {
        info!(
            "From {} serial {} actor {:?} data {:?}",
            from,
            msg.serial,
            String::from_utf8_lossy(&msg.actor),
            String::from_utf8_lossy(&msg.data)
        );
    })?;
    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for ctrl-c")?;
    info!("Interrupted, shutting down");
    Ok(())
}

async fn send(
    node: &Chirp,
    to: SocketAddr,
    template: Message,
    count: u32,
    ack_required: bool,
) -> anyhow::Result<()> {
    let mut failures = 0u32;
    for i in 0..count {
        let started = Instant::now();
        match node.send(to, template.clone(), ack_required).await {
            Ok(Delivery::Acked) => info!(
                "Message {} acked in {}",
                i + 1,
                humantime::format_duration(started.elapsed())
            ),
            Ok(Delivery::Sent) => info!("Message {} sent", i + 1),
            Err(e) => {
                failures += 1;
                error!("Message {} failed: {}", i + 1, e);
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{} of {} messages failed", failures, count);
    }
    Ok(())
}

/// Best effort read of `log_level` before the subscriber is installed.
/// Parse errors surface later from `NodeConfig::load_from_file`.
fn peek_log_level(path: &std::path::Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_yaml::from_str::<NodeConfig>(&content).ok()?.log_level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides() {
        let args = Args::try_parse_from([
            "chirp",
            "--port",
            "4100",
            "--timeout",
            "500ms",
            "--reuse-time",
            "1m",
            "--tls",
            "--tls-cert",
            "node.pem",
            "send",
            "--to",
            "127.0.0.1:4200",
            "--data",
            "ping",
        ])
        .unwrap();

        let mut config = ChirpConfig::default();
        args.apply(&mut config);
        assert_eq!(config.port, 4100);
        assert_eq!(config.timeout, 0.5);
        assert_eq!(config.reuse_time, 60.0);
        assert!(config.tls.enabled);
        assert_eq!(config.tls.cert_chain, PathBuf::from("node.pem"));
        assert!(matches!(args.command, Command::Send { count: 1, no_ack: false, .. }));
    }

    #[test]
    fn test_tls_paths_require_tls() {
        assert!(Args::try_parse_from(["chirp", "--tls-key", "k.pem", "listen"]).is_err());
    }
}
