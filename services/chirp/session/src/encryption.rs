//! Optional TLS layer between the socket and the frame reader/writer.
//!
//! The [`Shim`] is sans-I/O: ciphertext from the socket goes in through
//! [`Shim::feed_ciphertext`], plaintext to send goes in through
//! [`Shim::wrap_plaintext`], and whatever the TLS session wants on the wire
//! comes out of [`Shim::pending_output`]. In plain mode all of it is a
//! passthrough.

use std::io::{self, Read, Write};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chirp_wire::pool::DATA_TIER;
use chirp_wire::{BufferPool, SizeClass};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection};
use tracing::{debug, info};

use crate::config::TlsConfig;
use crate::error::ChirpError;

/// ALPN protocol id
pub const ALPN: &[u8] = b"chirp/1";

/// Loaded TLS material shared by every connection of an engine
#[derive(Clone)]
pub struct TlsContext {
    server: Arc<ServerConfig>,
    client: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    encrypt_loopback: bool,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .field("encrypt_loopback", &self.encrypt_loopback)
            .finish()
    }
}

impl TlsContext {
    /// Read the PEM files named in `config` and build both roles
    pub fn load(config: &TlsConfig) -> Result<Self, ChirpError> {
        let cert_chain = read_pem(&config.cert_chain)?;
        let private_key = read_pem(&config.private_key)?;
        let ca = read_pem(&config.ca)?;
        Self::from_pem(
            &cert_chain,
            &private_key,
            &ca,
            &config.server_name,
            config.encrypt_loopback,
        )
    }

    /// Build both roles from PEM text
    pub fn from_pem(
        cert_chain_pem: &str,
        private_key_pem: &str,
        ca_pem: &str,
        server_name: &str,
        encrypt_loopback: bool,
    ) -> Result<Self, ChirpError> {
        let server = make_server_config(cert_chain_pem, private_key_pem, ca_pem)?;
        let client = make_client_config(cert_chain_pem, private_key_pem, ca_pem)?;
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|_| ChirpError::Value(format!("invalid server name: {}", server_name)))?;
        Ok(Self {
            server: Arc::new(server),
            client: Arc::new(client),
            server_name,
            encrypt_loopback,
        })
    }

    /// Whether traffic with `peer` is encrypted. Both ends reach the same
    /// answer because loopback is symmetric.
    pub fn applies_to(&self, peer: IpAddr) -> bool {
        self.encrypt_loopback || !peer.is_loopback()
    }
}

fn read_pem(path: &Path) -> Result<String, ChirpError> {
    std::fs::read_to_string(path)
        .map_err(|e| ChirpError::Value(format!("cannot read {}: {}", path.display(), e)))
}

fn tls_err(context: &str) -> impl Fn(io::Error) -> ChirpError + '_ {
    move |e| ChirpError::Tls(format!("{}: {}", context, e))
}

fn parse_certs(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>, ChirpError> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(tls_err(what))?;
    if certs.is_empty() {
        return Err(ChirpError::Tls(format!("no certificates found in {}", what)));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> Result<PrivateKeyDer<'static>, ChirpError> {
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(tls_err("private key"))?;
    if keys.is_empty() {
        return Err(ChirpError::Tls("no private key found".to_string()));
    }
    Ok(PrivateKeyDer::from(keys.remove(0)))
}

fn parse_roots(ca_pem: &str) -> Result<RootCertStore, ChirpError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certs(ca_pem, "CA bundle")? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Server role: present our chain and require a client certificate signed by
/// the CA
pub fn make_server_config(
    cert_chain_pem: &str,
    private_key_pem: &str,
    ca_pem: &str,
) -> Result<ServerConfig, ChirpError> {
    info!("Creating TLS server configuration with mTLS");
    let _ = rustls::crypto::ring::default_provider().install_default();

    let certs = parse_certs(cert_chain_pem, "certificate chain")?;
    let key = parse_key(private_key_pem)?;
    let roots = parse_roots(ca_pem)?;

    let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .map_err(|e| ChirpError::Tls(format!("client verifier: {}", e)))?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// Client role: verify the server against the CA and present our chain
pub fn make_client_config(
    cert_chain_pem: &str,
    private_key_pem: &str,
    ca_pem: &str,
) -> Result<ClientConfig, ChirpError> {
    info!("Creating TLS client configuration with mTLS");
    let _ = rustls::crypto::ring::default_provider().install_default();

    let roots = parse_roots(ca_pem)?;
    let certs = parse_certs(cert_chain_pem, "certificate chain")?;
    let key = parse_key(private_key_pem)?;

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN.to_vec()];
    Ok(config)
}

/// Per-connection encryption state
pub enum Shim {
    /// No encryption
    Plain,
    /// TLS session driven in memory
    Tls {
        /// Session state
        session: Box<rustls::Connection>,
        /// Pool supplying the plaintext scratch buffer
        pool: BufferPool,
        /// Peer sent close_notify
        peer_closed: bool,
    },
}

impl std::fmt::Debug for Shim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Shim::Plain => write!(f, "Shim::Plain"),
            Shim::Tls { session, .. } => f
                .debug_struct("Shim::Tls")
                .field("handshaking", &session.is_handshaking())
                .finish(),
        }
    }
}

impl Shim {
    /// Client side of a session with the server named in `ctx`
    pub fn client(ctx: &TlsContext, pool: BufferPool) -> Result<Self, ChirpError> {
        let session = ClientConnection::new(ctx.client.clone(), ctx.server_name.clone())?;
        Ok(Self::with_session(session.into(), pool))
    }

    /// Server side of a session
    pub fn server(ctx: &TlsContext, pool: BufferPool) -> Result<Self, ChirpError> {
        let session = ServerConnection::new(ctx.server.clone())?;
        Ok(Self::with_session(session.into(), pool))
    }

    /// Wrap an existing rustls session
    pub fn with_session(mut session: rustls::Connection, pool: BufferPool) -> Self {
        // Plaintext is handed over whole; the writer applies its own limits.
        session.set_buffer_limit(None);
        Shim::Tls {
            session: Box::new(session),
            pool,
            peer_closed: false,
        }
    }

    /// Whether this shim encrypts
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Shim::Tls { .. })
    }

    /// Whether the TLS handshake is still running. Always false in plain mode.
    pub fn is_handshaking(&self) -> bool {
        match self {
            Shim::Plain => false,
            Shim::Tls { session, .. } => session.is_handshaking(),
        }
    }

    /// Whether the peer has ended the TLS session
    pub fn peer_closed(&self) -> bool {
        matches!(self, Shim::Tls { peer_closed: true, .. })
    }

    /// Accept bytes read from the socket and return the plaintext they
    /// complete. Partial TLS records stay buffered in the session.
    pub fn feed_ciphertext(&mut self, bytes: Bytes) -> Result<Bytes, ChirpError> {
        let Shim::Tls {
            session,
            pool,
            peer_closed,
        } = self
        else {
            return Ok(bytes);
        };

        let mut scratch = pool.acquire(SizeClass::Data)?;
        scratch.resize(DATA_TIER, 0);
        let mut plaintext = Vec::new();
        let mut input = &bytes[..];

        while !input.is_empty() {
            let read = session.read_tls(&mut input).map_err(tls_err("read_tls"))?;
            if read == 0 {
                break;
            }
            session.process_new_packets()?;

            loop {
                match session.reader().read(&mut scratch[..]) {
                    Ok(0) => {
                        *peer_closed = true;
                        break;
                    }
                    Ok(n) => plaintext.extend_from_slice(&scratch[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(ChirpError::Tls(format!("plaintext read: {}", e))),
                }
            }
        }

        Ok(Bytes::from(plaintext))
    }

    /// Turn plaintext into bytes for the socket
    pub fn wrap_plaintext(&mut self, plaintext: &[u8]) -> Result<Bytes, ChirpError> {
        let Shim::Tls { session, .. } = self else {
            return Ok(Bytes::copy_from_slice(plaintext));
        };
        session
            .writer()
            .write_all(plaintext)
            .map_err(tls_err("encrypt"))?;
        Ok(drain_tls(session)?.unwrap_or_default())
    }

    /// Records the TLS session wants sent (handshake messages, alerts)
    pub fn pending_output(&mut self) -> Result<Option<Bytes>, ChirpError> {
        match self {
            Shim::Plain => Ok(None),
            Shim::Tls { session, .. } => drain_tls(session),
        }
    }

    /// Queue a close_notify and return it for sending
    pub fn close(&mut self) -> Result<Option<Bytes>, ChirpError> {
        match self {
            Shim::Plain => Ok(None),
            Shim::Tls { session, .. } => {
                debug!("Sending TLS close_notify");
                session.send_close_notify();
                drain_tls(session)
            }
        }
    }
}

fn drain_tls(session: &mut rustls::Connection) -> Result<Option<Bytes>, ChirpError> {
    let mut out = Vec::new();
    while session.wants_write() {
        session.write_tls(&mut out).map_err(tls_err("write_tls"))?;
    }
    Ok((!out.is_empty()).then(|| Bytes::from(out)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_shim() -> Shim {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let config = ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth();
        let name = ServerName::try_from("localhost".to_string()).unwrap();
        let session = ClientConnection::new(Arc::new(config), name).unwrap();
        Shim::with_session(session.into(), BufferPool::new())
    }

    #[test]
    fn test_plain_is_passthrough() {
        let mut shim = Shim::Plain;
        let bytes = Bytes::from_static(b"frame bytes");
        assert_eq!(shim.feed_ciphertext(bytes.clone()).unwrap(), bytes);
        assert_eq!(shim.wrap_plaintext(&bytes).unwrap(), bytes);
        assert!(!shim.is_handshaking());
        assert_eq!(shim.pending_output().unwrap(), None);
        assert_eq!(shim.close().unwrap(), None);
    }

    #[test]
    fn test_client_starts_with_hello() {
        let mut shim = client_shim();
        assert!(shim.is_encrypted());
        assert!(shim.is_handshaking());
        let hello = shim.pending_output().unwrap().unwrap();
        // TLS handshake record header
        assert_eq!(hello[0], 0x16);
        assert_eq!(shim.pending_output().unwrap(), None);
    }

    #[test]
    fn test_garbage_is_tls_error() {
        let mut shim = client_shim();
        let _ = shim.pending_output().unwrap();
        let garbage = Bytes::from_static(b"definitely not a TLS record, just text");
        assert!(matches!(
            shim.feed_ciphertext(garbage),
            Err(ChirpError::Tls(_))
        ));
    }

    #[test]
    fn test_loopback_bypass() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let ctx = TlsContext {
            server: Arc::new(
                ServerConfig::builder()
                    .with_no_client_auth()
                    .with_cert_resolver(Arc::new(rustls::server::ResolvesServerCertUsingSni::new())),
            ),
            client: Arc::new(
                ClientConfig::builder()
                    .with_root_certificates(RootCertStore::empty())
                    .with_no_client_auth(),
            ),
            server_name: ServerName::try_from("localhost".to_string()).unwrap(),
            encrypt_loopback: false,
        };
        assert!(!ctx.applies_to("127.0.0.1".parse().unwrap()));
        assert!(!ctx.applies_to("::1".parse().unwrap()));
        assert!(ctx.applies_to("10.1.2.3".parse().unwrap()));
    }

    #[test]
    fn test_rejects_empty_pem() {
        assert!(matches!(
            make_server_config("", "", ""),
            Err(ChirpError::Tls(_))
        ));
    }
}
