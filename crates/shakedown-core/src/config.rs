//! Session configuration.
//!
//! [`PluginConfig`] is the immutable input to [`Session::start`]: which
//! binary to spawn, how to secure the channel, and how long to wait for the
//! peer to come up. Configuration is caller-supplied and read-only for the
//! lifetime of a session; there is no ambient or process-wide negotiation
//! state.
//!
//! [`Session::start`]: crate::session::Session::start

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable carrying the activation secret to the peer.
///
/// A conforming peer refuses to run unless this variable holds the expected
/// token, so that plugin binaries cannot be usefully executed by hand.
pub const DEFAULT_ACTIVATION_KEY: &str = "SHAKEDOWN_PLUGIN";

/// Default activation token paired with [`DEFAULT_ACTIVATION_KEY`].
pub const DEFAULT_ACTIVATION_TOKEN: &str = "c1e1d8f9a4b2";

/// Environment variable carrying the client certificate (PEM) to the peer
/// when mutual TLS is requested.
pub const CLIENT_CERT_ENV: &str = "SHAKEDOWN_CLIENT_CERT";

/// Default budget for the whole startup sequence (handshake read plus
/// transport dial plus TLS negotiation).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default grace period between SIGTERM and SIGKILL at close.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Transport security mode for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    /// Plaintext transport; the handshake certificate field stays empty.
    Disabled,
    /// Mutual TLS with certificate material generated fresh per session.
    Auto,
}

impl FromStr for TlsMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "auto" => Ok(Self::Auto),
            _ => Err(ConfigError::UnknownTlsMode {
                value: s.to_string(),
            }),
        }
    }
}

/// Key family used when provisioning session credentials.
///
/// The curve selection in [`PluginConfig::curve`] applies only to
/// [`KeyType::Ec`]; RSA sessions accept and ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// RSA 2048.
    Rsa,
    /// ECDSA on a NIST curve chosen via [`PluginConfig::curve`].
    Ec,
}

impl KeyType {
    /// Lowercase name as used in configuration and CLI flags.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Rsa => "rsa",
            Self::Ec => "ec",
        }
    }
}

impl FromStr for KeyType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rsa" => Ok(Self::Rsa),
            "ec" | "ecdsa" => Ok(Self::Ec),
            _ => Err(ConfigError::UnknownKeyType {
                value: s.to_string(),
            }),
        }
    }
}

/// Configuration errors surfaced at build or parse time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The builder was finished without a peer command.
    #[error("peer command is required")]
    MissingCommand,

    /// The connection timeout was zero.
    #[error("connection timeout must be non-zero")]
    ZeroTimeout,

    /// Unrecognized TLS mode string.
    #[error("unknown TLS mode {value:?}, expected \"disabled\" or \"auto\"")]
    UnknownTlsMode {
        /// The rejected input.
        value: String,
    },

    /// Unrecognized key type string.
    #[error("unknown key type {value:?}, expected \"rsa\" or \"ec\"")]
    UnknownKeyType {
        /// The rejected input.
        value: String,
    },
}

/// Immutable per-session configuration.
///
/// Construct via [`PluginConfig::builder`]. The curve field is a free-form
/// name so that the provisioner, not the configuration layer, decides which
/// curves are supported; with [`KeyType::Rsa`] any curve value (including an
/// invalid one) is accepted and ignored.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Path to the peer executable.
    pub command: PathBuf,
    /// Arguments passed to the peer.
    pub args: Vec<String>,
    /// Transport security mode.
    pub tls_mode: TlsMode,
    /// Key family for session credentials (mutual TLS only).
    pub key_type: KeyType,
    /// Curve name for EC credentials: `secp256r1`/`P-256`, `secp384r1`/
    /// `P-384`, `secp521r1`/`P-521`, or `auto` to let the provisioner pick.
    pub curve: String,
    /// Budget for the startup sequence (handshake read plus connect).
    pub connect_timeout: Duration,
    /// Grace period between SIGTERM and SIGKILL at close.
    pub close_grace: Duration,
    /// Extra environment entries for the peer, applied on top of the
    /// inherited environment.
    pub env: Vec<(String, String)>,
    /// Name of the activation environment variable.
    pub activation_key: String,
    /// Token the peer must find in the activation variable.
    pub activation_token: String,
}

impl PluginConfig {
    /// Creates a builder for the given peer executable.
    #[must_use]
    pub fn builder(command: impl Into<PathBuf>) -> PluginConfigBuilder {
        PluginConfigBuilder::new(command)
    }
}

/// Builder for [`PluginConfig`].
#[derive(Debug)]
pub struct PluginConfigBuilder {
    command: PathBuf,
    args: Vec<String>,
    tls_mode: TlsMode,
    key_type: KeyType,
    curve: String,
    connect_timeout: Duration,
    close_grace: Duration,
    env: Vec<(String, String)>,
    activation_key: String,
    activation_token: String,
}

impl PluginConfigBuilder {
    /// Creates a builder with defaults: TLS disabled, EC keys, `auto`
    /// curve, default timeout and grace period.
    #[must_use]
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            tls_mode: TlsMode::Disabled,
            key_type: KeyType::Ec,
            curve: "auto".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            close_grace: DEFAULT_CLOSE_GRACE,
            env: Vec::new(),
            activation_key: DEFAULT_ACTIVATION_KEY.to_string(),
            activation_token: DEFAULT_ACTIVATION_TOKEN.to_string(),
        }
    }

    /// Arguments passed to the peer executable.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the transport security mode.
    #[must_use]
    pub const fn tls_mode(mut self, mode: TlsMode) -> Self {
        self.tls_mode = mode;
        self
    }

    /// Sets the key family for session credentials.
    #[must_use]
    pub const fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    /// Sets the curve name used with [`KeyType::Ec`].
    #[must_use]
    pub fn curve(mut self, curve: impl Into<String>) -> Self {
        self.curve = curve.into();
        self
    }

    /// Sets the startup budget.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the close grace period.
    #[must_use]
    pub const fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Adds one environment entry for the peer.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Overrides the activation secret pair.
    #[must_use]
    pub fn activation(mut self, key: impl Into<String>, token: impl Into<String>) -> Self {
        self.activation_key = key.into();
        self.activation_token = token.into();
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingCommand`] for an empty command path and
    /// [`ConfigError::ZeroTimeout`] for a zero connection timeout.
    pub fn build(self) -> Result<PluginConfig, ConfigError> {
        if self.command.as_os_str().is_empty() {
            return Err(ConfigError::MissingCommand);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(PluginConfig {
            command: self.command,
            args: self.args,
            tls_mode: self.tls_mode,
            key_type: self.key_type,
            curve: self.curve,
            connect_timeout: self.connect_timeout,
            close_grace: self.close_grace,
            env: self.env,
            activation_key: self.activation_key,
            activation_token: self.activation_token,
        })
    }
}
