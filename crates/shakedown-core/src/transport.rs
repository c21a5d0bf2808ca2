//! Transport negotiation.
//!
//! Builds the concrete byte channel from the `(network, address)` a peer
//! announced in its handshake line, wrapping it in mutual TLS when the
//! session requested it. TCP and unix sockets are handled uniformly behind
//! [`PluginIo`]; TLS failures surface as distinct error variants from plain
//! dial failures so callers can tell "peer unreachable" from "peer
//! reachable but untrusted".

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::cert::{Credentials, SESSION_SERVER_NAME};
use crate::handshake::Network;

/// Object-safe alias for anything a session can speak over.
pub trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

/// A ready byte channel: tcp or unix, plain or TLS.
pub type PluginIo = Box<dyn IoStream>;

static CRYPTO_INIT: Once = Once::new();

/// Installs the process-wide rustls crypto provider.
///
/// Idempotent; binaries call it once at startup, tests call it freely.
pub fn install_crypto_provider() {
    CRYPTO_INIT.call_once(|| {
        // A second install can only race another provider; either way a
        // default exists afterwards.
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Transport errors.
///
/// Dial-class and TLS-class failures are separate variants;
/// [`TransportError::is_tls`] gives the coarse split.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The handshake address could not be interpreted for its network kind.
    #[error("invalid {network} address {address:?}")]
    InvalidAddress {
        /// Announced network kind.
        network: Network,
        /// Announced address.
        address: String,
    },

    /// The dial did not complete within the remaining budget.
    #[error("timed out dialing {endpoint} after {timeout_ms} ms")]
    DialTimeout {
        /// Endpoint description.
        endpoint: String,
        /// Budget that elapsed.
        timeout_ms: u64,
    },

    /// The dial failed outright.
    #[error("failed to dial {endpoint}: {source}")]
    Dial {
        /// Endpoint description.
        endpoint: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Certificate material from the handshake could not be decoded.
    #[error("invalid peer certificate: {reason}")]
    InvalidCertificate {
        /// Description of the decode failure.
        reason: String,
    },

    /// Building the local TLS configuration failed.
    #[error("TLS configuration error: {reason}")]
    TlsConfig {
        /// Description of the failure.
        reason: String,
    },

    /// The TLS handshake did not complete within the remaining budget.
    #[error("TLS handshake timed out after {timeout_ms} ms")]
    TlsTimeout {
        /// Budget that elapsed.
        timeout_ms: u64,
    },

    /// The TLS handshake failed: the peer was reachable but untrusted or
    /// incompatible.
    #[error("TLS handshake failed: {reason}")]
    TlsHandshake {
        /// Description of the failure.
        reason: String,
    },
}

impl TransportError {
    /// Returns `true` for TLS-class failures (peer reachable but the
    /// secure channel could not be established).
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(
            self,
            Self::InvalidCertificate { .. }
                | Self::TlsConfig { .. }
                | Self::TlsTimeout { .. }
                | Self::TlsHandshake { .. }
        )
    }
}

/// A dialable endpoint derived from a handshake line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP socket address.
    Tcp(std::net::SocketAddr),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Interprets a handshake `(network, address)` pair.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if the address does not
    /// fit the announced network kind.
    pub fn from_handshake(network: Network, address: &str) -> Result<Self, TransportError> {
        match network {
            Network::Tcp => address
                .parse()
                .map(Self::Tcp)
                .map_err(|_| TransportError::InvalidAddress {
                    network,
                    address: address.to_string(),
                }),
            Network::Unix => {
                if address.is_empty() {
                    return Err(TransportError::InvalidAddress {
                        network,
                        address: address.to_string(),
                    });
                }
                Ok(Self::Unix(PathBuf::from(address)))
            }
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Client-side TLS context for one session.
///
/// Trusts exactly the certificate the peer announced in its handshake and
/// presents the session's own credentials for mutual authentication.
pub struct TlsClientContext {
    connector: TlsConnector,
}

impl TlsClientContext {
    /// Builds the context from our credentials and the peer's certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::TlsConfig`] if the certificate or key is
    /// unusable.
    pub fn new(
        own: &Credentials,
        peer_cert: CertificateDer<'static>,
    ) -> Result<Self, TransportError> {
        let mut roots = RootCertStore::empty();
        roots
            .add(peer_cert)
            .map_err(|e| TransportError::TlsConfig {
                reason: format!("failed to trust peer certificate: {e}"),
            })?;

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(vec![own.certificate_der().clone()], own.private_key())
            .map_err(|e| TransportError::TlsConfig {
                reason: format!("client config error: {e}"),
            })?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Wraps a dialed stream in a client TLS handshake.
    ///
    /// # Errors
    ///
    /// [`TransportError::TlsTimeout`] or [`TransportError::TlsHandshake`].
    pub async fn wrap<I>(&self, io: I, budget: Duration) -> Result<PluginIo, TransportError>
    where
        I: IoStream + 'static,
    {
        let server_name = ServerName::try_from(SESSION_SERVER_NAME.to_string()).map_err(|e| {
            TransportError::TlsConfig {
                reason: format!("invalid server name: {e}"),
            }
        })?;

        let stream = timeout(budget, self.connector.connect(server_name, io))
            .await
            .map_err(|_| TransportError::TlsTimeout {
                timeout_ms: budget.as_millis() as u64,
            })?
            .map_err(|e| TransportError::TlsHandshake {
                reason: e.to_string(),
            })?;

        Ok(Box::new(stream))
    }
}

/// Server-side TLS context for one session.
///
/// Presents the session's own credentials and requires the connecting
/// client to present exactly the certificate received out of band.
pub struct TlsServerContext {
    acceptor: TlsAcceptor,
}

impl TlsServerContext {
    /// Builds the context from our credentials and the client certificate.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::TlsConfig`] if the certificate or key is
    /// unusable.
    pub fn new(
        own: &Credentials,
        client_cert: CertificateDer<'static>,
    ) -> Result<Self, TransportError> {
        let mut roots = RootCertStore::empty();
        roots
            .add(client_cert)
            .map_err(|e| TransportError::TlsConfig {
                reason: format!("failed to trust client certificate: {e}"),
            })?;

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TransportError::TlsConfig {
                reason: format!("client verifier error: {e}"),
            })?;

        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![own.certificate_der().clone()], own.private_key())
            .map_err(|e| TransportError::TlsConfig {
                reason: format!("server config error: {e}"),
            })?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Accepts a server TLS handshake on an inbound stream.
    ///
    /// # Errors
    ///
    /// [`TransportError::TlsHandshake`] if the client is untrusted or the
    /// handshake fails.
    pub async fn accept<I>(&self, io: I) -> Result<PluginIo, TransportError>
    where
        I: IoStream + 'static,
    {
        let stream =
            self.acceptor
                .accept(io)
                .await
                .map_err(|e| TransportError::TlsHandshake {
                    reason: e.to_string(),
                })?;
        Ok(Box::new(stream))
    }
}

/// Decodes the base64 DER certificate field of a handshake line.
///
/// # Errors
///
/// Returns [`TransportError::InvalidCertificate`] on malformed input.
pub fn certificate_from_base64(encoded: &str) -> Result<CertificateDer<'static>, TransportError> {
    use base64::Engine as _;

    let der = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| TransportError::InvalidCertificate {
            reason: format!("base64 decode failed: {e}"),
        })?;
    if der.is_empty() {
        return Err(TransportError::InvalidCertificate {
            reason: "empty certificate".to_string(),
        });
    }
    Ok(CertificateDer::from(der))
}

/// Parses a single PEM certificate, as passed through the environment.
///
/// # Errors
///
/// Returns [`TransportError::InvalidCertificate`] on malformed input.
pub fn certificate_from_pem(pem: &str) -> Result<CertificateDer<'static>, TransportError> {
    use rustls_pki_types::pem::PemObject as _;

    CertificateDer::from_pem_slice(pem.as_bytes()).map_err(|e| {
        TransportError::InvalidCertificate {
            reason: format!("PEM decode failed: {e}"),
        }
    })
}

/// Dials an endpoint within a budget, optionally wrapping in client TLS.
///
/// The budget covers both the dial and the TLS handshake; whatever the
/// dial consumed is subtracted before the TLS wait starts.
///
/// # Errors
///
/// Dial-class variants if the peer is unreachable, TLS-class variants if
/// the peer is reachable but the secure channel fails.
pub async fn connect(
    endpoint: &Endpoint,
    tls: Option<&TlsClientContext>,
    budget: Duration,
) -> Result<PluginIo, TransportError> {
    let started = Instant::now();
    let timeout_ms = budget.as_millis() as u64;

    let plain: PluginIo = match endpoint {
        Endpoint::Tcp(addr) => {
            let stream = timeout(budget, TcpStream::connect(addr))
                .await
                .map_err(|_| TransportError::DialTimeout {
                    endpoint: endpoint.to_string(),
                    timeout_ms,
                })?
                .map_err(|e| TransportError::Dial {
                    endpoint: endpoint.to_string(),
                    source: e,
                })?;
            let _ = stream.set_nodelay(true);
            Box::new(stream)
        }
        Endpoint::Unix(path) => {
            let stream = timeout(budget, UnixStream::connect(path))
                .await
                .map_err(|_| TransportError::DialTimeout {
                    endpoint: endpoint.to_string(),
                    timeout_ms,
                })?
                .map_err(|e| TransportError::Dial {
                    endpoint: endpoint.to_string(),
                    source: e,
                })?;
            Box::new(stream)
        }
    };

    match tls {
        None => Ok(plain),
        Some(ctx) => {
            let remaining = budget.saturating_sub(started.elapsed());
            ctx.wrap(plain, remaining).await
        }
    }
}

/// Listening side of a plugin transport, used by peer implementations.
#[derive(Debug)]
pub enum Listener {
    /// TCP listener on loopback.
    Tcp(TcpListener),
    /// Unix domain socket listener.
    Unix(UnixListener),
}

impl Listener {
    /// Binds a TCP listener on an ephemeral loopback port.
    ///
    /// # Errors
    ///
    /// Propagates the bind failure.
    pub async fn bind_tcp() -> io::Result<Self> {
        TcpListener::bind(("127.0.0.1", 0)).await.map(Self::Tcp)
    }

    /// Binds a unix domain socket listener at the given path.
    ///
    /// # Errors
    ///
    /// Propagates the bind failure.
    pub fn bind_unix(path: &Path) -> io::Result<Self> {
        UnixListener::bind(path).map(Self::Unix)
    }

    /// The `(network, address)` pair to announce in the handshake line.
    ///
    /// # Errors
    ///
    /// Propagates local-address lookup failures.
    pub fn handshake_endpoint(&self) -> io::Result<(Network, String)> {
        match self {
            Self::Tcp(listener) => Ok((Network::Tcp, listener.local_addr()?.to_string())),
            Self::Unix(listener) => {
                let addr = listener.local_addr()?;
                let path = addr.as_pathname().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "unnamed unix socket")
                })?;
                Ok((Network::Unix, path.display().to_string()))
            }
        }
    }

    /// Accepts one inbound connection.
    ///
    /// # Errors
    ///
    /// Propagates the accept failure.
    pub async fn accept(&self) -> io::Result<PluginIo> {
        match self {
            Self::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::cert::provision;
    use crate::config::KeyType;

    #[test]
    fn endpoint_from_handshake_tcp() {
        let ep = Endpoint::from_handshake(Network::Tcp, "127.0.0.1:4000").unwrap();
        assert_eq!(ep, Endpoint::Tcp("127.0.0.1:4000".parse().unwrap()));
    }

    #[test]
    fn endpoint_from_handshake_rejects_garbage_tcp_address() {
        assert!(matches!(
            Endpoint::from_handshake(Network::Tcp, "not-an-addr"),
            Err(TransportError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn endpoint_from_handshake_unix() {
        let ep = Endpoint::from_handshake(Network::Unix, "/tmp/peer.sock").unwrap();
        assert_eq!(ep, Endpoint::Unix(PathBuf::from("/tmp/peer.sock")));
    }

    #[test]
    fn certificate_base64_roundtrip() {
        use base64::Engine as _;

        install_crypto_provider();
        let creds = provision(KeyType::Ec, "auto").unwrap();
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(creds.certificate_der().as_ref());

        let decoded = certificate_from_base64(&encoded).unwrap();
        assert_eq!(&decoded, creds.certificate_der());
    }

    #[test]
    fn certificate_base64_rejects_garbage() {
        assert!(matches!(
            certificate_from_base64("!!not base64!!"),
            Err(TransportError::InvalidCertificate { .. })
        ));
        assert!(matches!(
            certificate_from_base64(""),
            Err(TransportError::InvalidCertificate { .. })
        ));
    }

    #[test]
    fn certificate_pem_roundtrip() {
        install_crypto_provider();
        let creds = provision(KeyType::Ec, "auto").unwrap();
        let decoded = certificate_from_pem(creds.certificate_pem()).unwrap();
        assert_eq!(&decoded, creds.certificate_der());
    }

    #[tokio::test]
    async fn dial_refused_is_a_dial_error() {
        install_crypto_provider();
        // Bind then drop to get a port that refuses connections.
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = connect(&Endpoint::Tcp(addr), None, Duration::from_secs(1)).await;
        match result {
            Err(e @ TransportError::Dial { .. }) => assert!(!e.is_tls()),
            Err(other) => panic!("expected Dial error, got {other:?}"),
            Ok(_) => panic!("expected Dial error, got Ok(_)"),
        }
    }

    #[tokio::test]
    async fn mutual_tls_loopback_roundtrip() {
        install_crypto_provider();

        let client_creds = provision(KeyType::Ec, "auto").unwrap();
        let server_creds = provision(KeyType::Ec, "auto").unwrap();

        let server_ctx =
            TlsServerContext::new(&server_creds, client_creds.certificate_der().clone()).unwrap();
        let client_ctx =
            TlsClientContext::new(&client_creds, server_creds.certificate_der().clone()).unwrap();

        let listener = Listener::bind_tcp().await.unwrap();
        let (network, address) = listener.handshake_endpoint().unwrap();
        let endpoint = Endpoint::from_handshake(network, &address).unwrap();

        let server = tokio::spawn(async move {
            let io = listener.accept().await.unwrap();
            let mut tls = server_ctx.accept(io).await.unwrap();
            let mut buf = [0u8; 5];
            tls.read_exact(&mut buf).await.unwrap();
            tls.write_all(&buf).await.unwrap();
            tls.flush().await.unwrap();
        });

        let mut io = connect(&endpoint, Some(&client_ctx), Duration::from_secs(5))
            .await
            .unwrap();
        io.write_all(b"hello").await.unwrap();
        io.flush().await.unwrap();
        let mut echo = [0u8; 5];
        io.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo, b"hello");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn wrong_server_certificate_is_a_tls_error() {
        install_crypto_provider();

        let client_creds = provision(KeyType::Ec, "auto").unwrap();
        let server_creds = provision(KeyType::Ec, "auto").unwrap();
        // Client trusts a certificate the server will not present.
        let unrelated = provision(KeyType::Ec, "auto").unwrap();

        let server_ctx =
            TlsServerContext::new(&server_creds, client_creds.certificate_der().clone()).unwrap();
        let client_ctx =
            TlsClientContext::new(&client_creds, unrelated.certificate_der().clone()).unwrap();

        let listener = Listener::bind_tcp().await.unwrap();
        let (network, address) = listener.handshake_endpoint().unwrap();
        let endpoint = Endpoint::from_handshake(network, &address).unwrap();

        let server = tokio::spawn(async move {
            let io = listener.accept().await.unwrap();
            // Expected to fail; the client rejects our certificate.
            let _ = server_ctx.accept(io).await;
        });

        let result = connect(&endpoint, Some(&client_ctx), Duration::from_secs(5)).await;
        match result {
            Err(e) => assert!(e.is_tls(), "expected TLS-class error, got {e:?}"),
            Ok(_) => panic!("handshake against untrusted certificate must fail"),
        }

        server.await.unwrap();
    }
}
