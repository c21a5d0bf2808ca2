//! Plugin session lifecycle.
//!
//! [`Session::start`] drives the whole startup sequence: spawn the peer,
//! read its handshake line, negotiate security, dial the announced
//! endpoint, and hand back a ready channel. [`Session::close`] tears it
//! down in the reverse order, transport before process, so no socket is
//! left half-open and no process is left orphaned.
//!
//! # State machine
//!
//! ```text
//! Init -> Spawning -> AwaitingHandshake -> Negotiating -> Connecting
//!      -> Ready -> Closing -> Closed
//! ```
//!
//! with terminal failures `SpawnFailed`, `HandshakeTimeout` and
//! `ConnectFailed` reachable from any non-terminal state. The handshake
//! read and the dial share a single deadline derived from the configured
//! connection timeout, so no peer misbehavior can hold a caller past its
//! budget. Every failure path kills and reaps the peer before the error is
//! returned.
//!
//! A session exclusively owns its process and transport. Sessions are
//! independent of each other; there is no global registry.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::cert::{self, CertError, Credentials};
use crate::config::{CLIENT_CERT_ENV, PluginConfig, TlsMode};
use crate::handshake::{self, CORE_PROTOCOL_VERSION, HandshakeError, HandshakeMessage};
use crate::kv::{KV_PROTOCOL_ID, KvClient, KvError};
use crate::process::{self, PluginProcess, ProcessError, ProcessSpec};
use crate::transport::{self, Endpoint, TlsClientContext, TransportError};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing has happened yet.
    Init,
    /// Validating and spawning the peer executable.
    Spawning,
    /// Waiting for the handshake line on peer stdout.
    AwaitingHandshake,
    /// Interpreting the handshake and exchanging credentials.
    Negotiating,
    /// Dialing the announced endpoint.
    Connecting,
    /// Channel established; RPC calls may be issued.
    Ready,
    /// Teardown in progress.
    Closing,
    /// Teardown complete; the session must not be reused.
    Closed,
    /// Terminal: the peer never spawned or its handshake was malformed.
    SpawnFailed,
    /// Terminal: no valid handshake line within the budget.
    HandshakeTimeout,
    /// Terminal: negotiation or the dial failed after the handshake.
    ConnectFailed,
}

impl SessionState {
    /// Lowercase state name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Spawning => "spawning",
            Self::AwaitingHandshake => "awaiting_handshake",
            Self::Negotiating => "negotiating",
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::SpawnFailed => "spawn_failed",
            Self::HandshakeTimeout => "handshake_timeout",
            Self::ConnectFailed => "connect_failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-facing failure taxonomy for session operations.
///
/// Every kind is a distinct variant, so catching code can branch without
/// inspecting message text. Nothing here is retried internally; exposing
/// failures is the point of the harness.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Executable path missing or not executable; no process was created.
    #[error("peer binary not found or not executable: {path}")]
    BinaryNotFound {
        /// The rejected path.
        path: PathBuf,
    },

    /// The OS refused the spawn after the path validated.
    #[error("failed to spawn peer: {source}")]
    Spawn {
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// No valid handshake line arrived within the budget.
    #[error("no handshake line within {timeout_ms} ms")]
    HandshakeTimeout {
        /// The elapsed budget.
        timeout_ms: u64,
    },

    /// A handshake line arrived but was malformed or oversized.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The peer speaks a different core protocol version.
    #[error("peer speaks core protocol version {peer}, supported version is {supported}")]
    IncompatibleProtocolVersion {
        /// Version the peer announced.
        peer: u32,
        /// Version this harness speaks.
        supported: u32,
    },

    /// The peer announced an application protocol this harness cannot run.
    #[error("peer announced unsupported application protocol {protocol:?}")]
    UnsupportedProtocol {
        /// The announced protocol identifier.
        protocol: String,
    },

    /// Credential provisioning failed (including unsupported key/curve
    /// combinations).
    #[error(transparent)]
    Certificate(#[from] CertError),

    /// TLS was requested but the secure channel could not be established:
    /// certificate absent, undecodable, or untrusted.
    #[error("TLS negotiation failed: {source}")]
    TlsNegotiation {
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },

    /// The post-handshake dial failed: the announced endpoint was invalid
    /// or unreachable.
    #[error("failed to connect to peer: {source}")]
    ConnectFailed {
        /// Underlying transport error.
        #[source]
        source: TransportError,
    },

    /// A KV call failed after the session was ready.
    #[error(transparent)]
    Rpc(#[from] KvError),

    /// The peer died outside a requested close.
    #[error("peer process exited unexpectedly (exit code {code:?})")]
    ProcessExited {
        /// Exit code, if the peer exited normally enough to have one.
        code: Option<i32>,
    },

    /// The session was already closed.
    #[error("session is closed")]
    Closed,
}

impl From<ProcessError> for SessionError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::BinaryNotFound { path } => Self::BinaryNotFound { path },
            ProcessError::Spawn { source } => Self::Spawn { source },
            ProcessError::MissingStream { stream } => Self::Spawn {
                source: io::Error::other(format!("missing {stream} pipe")),
            },
        }
    }
}

impl SessionError {
    /// The terminal state this failure corresponds to.
    #[must_use]
    pub const fn terminal_state(&self) -> SessionState {
        match self {
            Self::HandshakeTimeout { .. } => SessionState::HandshakeTimeout,
            Self::TlsNegotiation { .. } | Self::ConnectFailed { .. } => SessionState::ConnectFailed,
            _ => SessionState::SpawnFailed,
        }
    }
}

/// Splits transport failures into the two caller-visible kinds.
fn classify_transport(err: TransportError) -> SessionError {
    if err.is_tls() {
        SessionError::TlsNegotiation { source: err }
    } else {
        SessionError::ConnectFailed { source: err }
    }
}

/// A live plugin session: the peer process, the negotiated channel, and
/// the credentials bound to both.
///
/// RPC calls take `&self` and may run concurrently; [`Session::close`]
/// consumes the channel and terminates the peer. Dropping an unclosed
/// session kills the peer as a backstop, including when a pending
/// [`Session::start`] future is cancelled mid-handshake.
pub struct Session {
    state: SessionState,
    process: PluginProcess,
    client: Option<KvClient>,
    handshake: HandshakeMessage,
    /// Held for the session's lifetime; dropped (and zeroized) at close.
    #[allow(dead_code)]
    credentials: Option<Credentials>,
    close_grace: Duration,
    exit_status: Option<ExitStatus>,
}

impl Session {
    /// Spawns the configured peer and drives the session to ready.
    ///
    /// The connection timeout in `config` bounds the whole sequence from
    /// handshake read through dial and TLS negotiation. On any failure the
    /// peer process is killed and reaped before the error returns.
    ///
    /// # Errors
    ///
    /// Each failure mode surfaces as its own [`SessionError`] variant; see
    /// the type's documentation.
    pub async fn start(config: &PluginConfig) -> Result<Self, SessionError> {
        // Credentials are provisioned before the spawn so the client
        // certificate can ride the peer's environment.
        let credentials = match config.tls_mode {
            TlsMode::Disabled => None,
            TlsMode::Auto => Some(cert::provision(config.key_type, &config.curve)?),
        };

        let mut spec = ProcessSpec::new(&config.command);
        spec.args = config.args.clone();
        spec.env = config.env.clone();
        spec.env
            .push((config.activation_key.clone(), config.activation_token.clone()));
        if let Some(creds) = &credentials {
            spec.env
                .push((CLIENT_CERT_ENV.to_string(), creds.certificate_pem().to_string()));
        }

        debug!(
            peer = %config.command.display(),
            state = %SessionState::Spawning,
            tls = ?config.tls_mode,
            "starting plugin session"
        );
        let mut process = process::spawn(&spec)?;
        let deadline = Instant::now() + config.connect_timeout;

        let Some(mut stdout) = process.take_stdout() else {
            process.terminate(Duration::ZERO).await;
            return Err(SessionError::Spawn {
                source: io::Error::other("peer stdout unavailable"),
            });
        };

        debug!(state = %SessionState::AwaitingHandshake, "awaiting handshake line");
        let message = match timeout_at(deadline, handshake::read_handshake_line(&mut stdout)).await
        {
            Err(_) => {
                process.terminate(Duration::ZERO).await;
                let timeout_ms = config.connect_timeout.as_millis() as u64;
                warn!(timeout_ms, state = %SessionState::HandshakeTimeout, "handshake timed out");
                return Err(SessionError::HandshakeTimeout { timeout_ms });
            }
            Ok(Err(HandshakeError::StreamClosed)) => {
                // The peer went away instead of handshaking.
                let status = process.terminate(Duration::ZERO).await;
                return Err(SessionError::ProcessExited {
                    code: status.and_then(|s| s.code()),
                });
            }
            Ok(Err(err)) => {
                process.terminate(Duration::ZERO).await;
                return Err(SessionError::Handshake(err));
            }
            Ok(Ok(message)) => message,
        };

        debug!(
            state = %SessionState::Negotiating,
            core_version = message.core_version,
            protocol = %message.protocol,
            network = %message.network,
            "handshake line accepted"
        );
        if message.core_version != CORE_PROTOCOL_VERSION {
            process.terminate(Duration::ZERO).await;
            return Err(SessionError::IncompatibleProtocolVersion {
                peer: message.core_version,
                supported: CORE_PROTOCOL_VERSION,
            });
        }
        if message.protocol != KV_PROTOCOL_ID {
            process.terminate(Duration::ZERO).await;
            return Err(SessionError::UnsupportedProtocol {
                protocol: message.protocol,
            });
        }

        let tls = match (&credentials, &message.server_cert) {
            (None, _) => None,
            (Some(own), Some(encoded)) => match negotiate_tls(own, encoded) {
                Ok(ctx) => Some(ctx),
                Err(err) => {
                    process.terminate(Duration::ZERO).await;
                    return Err(err);
                }
            },
            (Some(_), None) => {
                process.terminate(Duration::ZERO).await;
                return Err(SessionError::TlsNegotiation {
                    source: TransportError::InvalidCertificate {
                        reason: "TLS requested but the peer offered no certificate".to_string(),
                    },
                });
            }
        };

        let endpoint = match Endpoint::from_handshake(message.network, &message.address) {
            Ok(endpoint) => endpoint,
            Err(err) => {
                process.terminate(Duration::ZERO).await;
                return Err(classify_transport(err));
            }
        };

        let remaining = deadline.duration_since(Instant::now());
        debug!(
            state = %SessionState::Connecting,
            %endpoint,
            remaining_ms = remaining.as_millis() as u64,
            "dialing peer"
        );
        let io = match transport::connect(&endpoint, tls.as_ref(), remaining).await {
            Ok(io) => io,
            Err(err) => {
                process.terminate(Duration::ZERO).await;
                return Err(classify_transport(err));
            }
        };

        info!(
            %endpoint,
            tls = tls.is_some(),
            state = %SessionState::Ready,
            "plugin session ready"
        );
        Ok(Self {
            state: SessionState::Ready,
            process,
            client: Some(KvClient::new(io)),
            handshake: message,
            credentials,
            close_grace: config.close_grace,
            exit_status: None,
        })
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// The handshake message this session was negotiated from.
    #[must_use]
    pub const fn handshake(&self) -> &HandshakeMessage {
        &self.handshake
    }

    /// Stores `value` under `key` on the peer.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] after close, [`SessionError::Rpc`] if the
    /// call fails.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::Closed)?;
        Ok(client.put(key, value).await?)
    }

    /// Fetches the value under `key` from the peer, `None` when absent.
    ///
    /// # Errors
    ///
    /// [`SessionError::Closed`] after close, [`SessionError::Rpc`] if the
    /// call fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::Closed)?;
        Ok(client.get(key).await?)
    }

    /// Closes the session: transport first, then the peer process with the
    /// configured grace period.
    ///
    /// Idempotent and infallible; resources that are already gone are
    /// ignored. Returns the peer's exit status when one was collected.
    pub async fn close(&mut self) -> Option<ExitStatus> {
        if self.state == SessionState::Closed {
            return self.exit_status;
        }
        self.state = SessionState::Closing;

        if let Some(client) = self.client.take() {
            client.shutdown().await;
        }
        let status = self.process.terminate(self.close_grace).await;

        self.exit_status = status;
        self.state = SessionState::Closed;
        info!(?status, state = %SessionState::Closed, "plugin session closed");
        status
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            self.process.start_kill();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("process", &self.process)
            .field("protocol", &self.handshake.protocol)
            .finish_non_exhaustive()
    }
}

fn negotiate_tls(own: &Credentials, encoded: &str) -> Result<TlsClientContext, SessionError> {
    let peer_cert = transport::certificate_from_base64(encoded)
        .map_err(|source| SessionError::TlsNegotiation { source })?;
    TlsClientContext::new(own, peer_cert).map_err(|source| SessionError::TlsNegotiation { source })
}
