//! Handshake line codec.
//!
//! A peer's first (and only) bootstrap message is a single newline
//! terminated, pipe delimited ASCII line on its stdout:
//!
//! ```text
//! coreVersion|appVersion|network|address|appProtocol|tlsCert
//! ```
//!
//! This line is the byte-exact compatibility surface between independently
//! built peers and supervisors, so the codec is strict: exactly six fields,
//! recognized network kinds only, numeric versions. The codec validates
//! shape, never content; certificate bytes are opaque here and are
//! interpreted by the transport layer, and version compatibility is the
//! supervisor's concern.
//!
//! Parsing is a pure function: the same line always yields the same result,
//! and no input can make it hang or panic. The async reader in this module
//! enforces a hard line-length cap so a peer that streams garbage without a
//! newline cannot wedge the supervisor.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Core protocol version spoken by this supervisor.
///
/// A peer announcing a different core version is rejected during
/// negotiation, before any transport is dialed.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// Number of pipe-delimited fields in a handshake line.
pub const HANDSHAKE_FIELDS: usize = 6;

/// Hard cap on the handshake line length, newline included.
///
/// Checked while reading, before the line is buffered in full, so an
/// oversized line fails deterministically instead of growing the buffer.
pub const MAX_HANDSHAKE_LINE: usize = 64 * 1024;

/// Network kind announced in a handshake line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// TCP, address is `host:port`.
    Tcp,
    /// Unix domain socket, address is a filesystem path.
    Unix,
}

impl Network {
    /// Wire spelling of the network kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = HandshakeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "unix" => Ok(Self::Unix),
            _ => Err(HandshakeParseError::UnknownNetwork {
                value: s.to_string(),
            }),
        }
    }
}

/// Parse failure for a handshake line.
///
/// Every variant is matchable without inspecting message text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeParseError {
    /// The line did not have exactly [`HANDSHAKE_FIELDS`] fields.
    #[error("expected {HANDSHAKE_FIELDS} pipe-delimited fields, found {found}")]
    FieldCount {
        /// Number of fields found.
        found: usize,
    },

    /// A version field was not an unsigned integer.
    #[error("invalid {field} version {value:?}")]
    InvalidVersion {
        /// Which version field was malformed.
        field: &'static str,
        /// The rejected input.
        value: String,
    },

    /// The network field was neither `tcp` nor `unix`.
    #[error("unknown network kind {value:?}")]
    UnknownNetwork {
        /// The rejected input.
        value: String,
    },

    /// The address field was empty.
    #[error("empty address field")]
    EmptyAddress,

    /// The application protocol field was empty.
    #[error("empty application protocol field")]
    EmptyProtocol,
}

/// Failure while obtaining a handshake line from a peer's output stream.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The stream closed before a complete line arrived.
    #[error("peer output closed before a handshake line was emitted")]
    StreamClosed,

    /// More than [`MAX_HANDSHAKE_LINE`] bytes arrived without a newline.
    #[error("handshake line exceeds {max} bytes")]
    LineTooLong {
        /// The enforced cap.
        max: usize,
    },

    /// The line was not valid UTF-8.
    #[error("handshake line is not valid UTF-8")]
    NotUtf8,

    /// Reading the peer's output failed.
    #[error("failed to read peer output: {0}")]
    Io(#[from] std::io::Error),

    /// The line was read but is malformed.
    #[error(transparent)]
    Parse(#[from] HandshakeParseError),
}

/// A parsed handshake line.
///
/// Created once per session from the peer's first output line and immutable
/// thereafter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeMessage {
    /// Core (plugin ecosystem) protocol version.
    pub core_version: u32,
    /// Application protocol version.
    pub app_version: u32,
    /// Network kind to connect over.
    pub network: Network,
    /// Address to dial, `host:port` or a socket path.
    pub address: String,
    /// Application protocol identifier, e.g. `kv.1`.
    pub protocol: String,
    /// Base64 DER server certificate, present when the peer offers TLS.
    pub server_cert: Option<String>,
}

impl HandshakeMessage {
    /// Encodes the message as a newline-terminated handshake line.
    ///
    /// The certificate field is emitted empty when absent, so the line
    /// always carries exactly [`HANDSHAKE_FIELDS`] fields.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}\n",
            self.core_version,
            self.app_version,
            self.network,
            self.address,
            self.protocol,
            self.server_cert.as_deref().unwrap_or(""),
        )
    }

    /// Parses a handshake line.
    ///
    /// A trailing newline (or CRLF) is tolerated; everything else is
    /// strict. Parsing never inspects certificate bytes.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeParseError`] describing the first rule the line
    /// violates.
    pub fn parse(line: &str) -> Result<Self, HandshakeParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let fields: Vec<&str> = line.split('|').collect();
        if fields.len() != HANDSHAKE_FIELDS {
            return Err(HandshakeParseError::FieldCount {
                found: fields.len(),
            });
        }

        let core_version =
            fields[0]
                .parse::<u32>()
                .map_err(|_| HandshakeParseError::InvalidVersion {
                    field: "core",
                    value: fields[0].to_string(),
                })?;
        let app_version =
            fields[1]
                .parse::<u32>()
                .map_err(|_| HandshakeParseError::InvalidVersion {
                    field: "application",
                    value: fields[1].to_string(),
                })?;
        let network = fields[2].parse::<Network>()?;

        if fields[3].is_empty() {
            return Err(HandshakeParseError::EmptyAddress);
        }
        if fields[4].is_empty() {
            return Err(HandshakeParseError::EmptyProtocol);
        }

        let server_cert = if fields[5].is_empty() {
            None
        } else {
            Some(fields[5].to_string())
        };

        Ok(Self {
            core_version,
            app_version,
            network,
            address: fields[3].to_string(),
            protocol: fields[4].to_string(),
            server_cert,
        })
    }
}

/// Reads and parses one handshake line from a peer's output stream.
///
/// Reads up to the first newline, enforcing [`MAX_HANDSHAKE_LINE`] while
/// bytes arrive. The caller wraps this in its timeout budget; this function
/// itself only guards against unbounded input, not slow input.
///
/// # Errors
///
/// - [`HandshakeError::StreamClosed`] on EOF before a newline
/// - [`HandshakeError::LineTooLong`] once the cap is exceeded
/// - [`HandshakeError::NotUtf8`] / [`HandshakeError::Parse`] for bad lines
/// - [`HandshakeError::Io`] if the underlying read fails
pub async fn read_handshake_line<R>(reader: &mut R) -> Result<HandshakeMessage, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf: Vec<u8> = Vec::new();
    let mut limited = (&mut *reader).take(MAX_HANDSHAKE_LINE as u64 + 1);

    let n = limited.read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(HandshakeError::StreamClosed);
    }
    if buf.len() > MAX_HANDSHAKE_LINE {
        return Err(HandshakeError::LineTooLong {
            max: MAX_HANDSHAKE_LINE,
        });
    }
    if buf.last() != Some(&b'\n') {
        // `take` stopped exactly at the cap without seeing a newline, or
        // the stream ended mid-line.
        return Err(HandshakeError::StreamClosed);
    }

    let line = std::str::from_utf8(&buf).map_err(|_| HandshakeError::NotUtf8)?;
    Ok(HandshakeMessage::parse(line)?)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::BufReader;

    use super::*;

    fn sample() -> HandshakeMessage {
        HandshakeMessage {
            core_version: 1,
            app_version: 3,
            network: Network::Tcp,
            address: "127.0.0.1:9000".to_string(),
            protocol: "kv.1".to_string(),
            server_cert: None,
        }
    }

    #[test]
    fn encode_emits_six_fields_and_newline() {
        let line = sample().encode();
        assert!(line.ends_with('\n'));
        assert_eq!(line.trim_end().split('|').count(), HANDSHAKE_FIELDS);
        assert_eq!(line, "1|3|tcp|127.0.0.1:9000|kv.1|\n");
    }

    #[test]
    fn parse_roundtrips_encode() {
        let with_cert = HandshakeMessage {
            network: Network::Unix,
            address: "/tmp/shakedown.sock".to_string(),
            server_cert: Some("TUlJQmJq".to_string()),
            ..sample()
        };
        for msg in [sample(), with_cert] {
            let parsed = HandshakeMessage::parse(&msg.encode()).unwrap();
            assert_eq!(parsed, msg);
        }
    }

    #[test]
    fn parse_is_deterministic() {
        let line = "1|1|tcp|127.0.0.1:41820|kv.1|\n";
        let first = HandshakeMessage::parse(line).unwrap();
        for _ in 0..16 {
            assert_eq!(HandshakeMessage::parse(line).unwrap(), first);
        }
    }

    #[test]
    fn parse_rejects_wrong_field_counts() {
        for (line, found) in [
            ("", 1),
            ("1|1|tcp", 3),
            ("1|1|tcp|addr|kv.1", 5),
            ("1|1|tcp|addr|kv.1|cert|extra", 7),
        ] {
            match HandshakeMessage::parse(line) {
                Err(HandshakeParseError::FieldCount { found: f }) => assert_eq!(f, found),
                other => panic!("expected FieldCount for {line:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn parse_rejects_bad_versions() {
        assert!(matches!(
            HandshakeMessage::parse("x|1|tcp|addr|kv.1|"),
            Err(HandshakeParseError::InvalidVersion { field: "core", .. })
        ));
        assert!(matches!(
            HandshakeMessage::parse("1|-2|tcp|addr|kv.1|"),
            Err(HandshakeParseError::InvalidVersion {
                field: "application",
                ..
            })
        ));
    }

    #[test]
    fn parse_rejects_unknown_network() {
        assert!(matches!(
            HandshakeMessage::parse("1|1|udp|addr|kv.1|"),
            Err(HandshakeParseError::UnknownNetwork { .. })
        ));
    }

    #[test]
    fn parse_rejects_empty_address_and_protocol() {
        assert!(matches!(
            HandshakeMessage::parse("1|1|tcp||kv.1|"),
            Err(HandshakeParseError::EmptyAddress)
        ));
        assert!(matches!(
            HandshakeMessage::parse("1|1|tcp|addr||"),
            Err(HandshakeParseError::EmptyProtocol)
        ));
    }

    #[tokio::test]
    async fn read_line_parses_valid_input() {
        let mut reader = BufReader::new(Cursor::new(b"1|1|tcp|127.0.0.1:1|kv.1|\nrest".to_vec()));
        let msg = read_handshake_line(&mut reader).await.unwrap();
        assert_eq!(msg.address, "127.0.0.1:1");
    }

    #[tokio::test]
    async fn read_line_reports_eof() {
        let mut reader = BufReader::new(Cursor::new(Vec::new()));
        assert!(matches!(
            read_handshake_line(&mut reader).await,
            Err(HandshakeError::StreamClosed)
        ));
    }

    #[tokio::test]
    async fn read_line_rejects_oversized_input_without_hanging() {
        // No newline at all; the reader must give up at the cap.
        let big = vec![b'a'; MAX_HANDSHAKE_LINE + 512];
        let mut reader = BufReader::new(Cursor::new(big));
        assert!(matches!(
            read_handshake_line(&mut reader).await,
            Err(HandshakeError::LineTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn read_line_rejects_half_written_line() {
        let mut reader = BufReader::new(Cursor::new(b"1|1|tcp|127.0".to_vec()));
        assert!(matches!(
            read_handshake_line(&mut reader).await,
            Err(HandshakeError::StreamClosed)
        ));
    }
}
