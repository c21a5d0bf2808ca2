//! shakedown-core - plugin session lifecycle for conformance testing.
//!
//! This crate implements the mechanics of talking to an independently
//! built plugin peer: spawn the binary, read its one-line handshake,
//! optionally establish mutual TLS with per-session certificates, dial the
//! announced endpoint, exercise the KV protocol over it, and tear
//! everything down without leaking a process or a socket.
//!
//! # Modules
//!
//! - [`config`]: per-session configuration ([`PluginConfig`])
//! - [`handshake`]: the pipe-delimited handshake line codec
//! - [`cert`]: ephemeral per-session certificate provisioning
//! - [`transport`]: endpoint dialing and TLS wrapping, tcp and unix
//! - [`process`]: spawn/validate/terminate primitives
//! - [`session`]: the lifecycle state machine ([`Session`])
//! - [`kv`]: the KV wire protocol, client, store and serve loop
//!
//! # Example
//!
//! ```rust,ignore
//! use shakedown_core::{PluginConfig, Session, TlsMode};
//!
//! let config = PluginConfig::builder("./my-peer")
//!     .tls_mode(TlsMode::Auto)
//!     .build()?;
//! let mut session = Session::start(&config).await?;
//! session.put("greeting", b"hello").await?;
//! assert_eq!(session.get("greeting").await?.as_deref(), Some(&b"hello"[..]));
//! session.close().await;
//! ```

pub mod cert;
pub mod config;
pub mod handshake;
pub mod kv;
pub mod process;
pub mod session;
pub mod transport;

pub use cert::{CertError, Credentials, provision};
pub use config::{ConfigError, KeyType, PluginConfig, TlsMode};
pub use handshake::{
    CORE_PROTOCOL_VERSION, HandshakeError, HandshakeMessage, HandshakeParseError, Network,
};
pub use kv::{KV_PROTOCOL_ID, KvClient, KvError, KvStore};
pub use process::ProcessError;
pub use session::{Session, SessionError, SessionState};
pub use transport::{Endpoint, TransportError, install_crypto_provider};
