//! KV application protocol.
//!
//! The minimal request/response protocol exercised over a session, and the
//! baseline interoperability contract of the harness: a `put` followed by a
//! `get` of the same key returns the exact bytes written, on any conforming
//! peer.
//!
//! # Wire format
//!
//! Length-prefixed JSON frames over the negotiated transport:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | JSON payload     |
//! +----------------------------+------------------+
//! ```
//!
//! Frame length is validated against [`MAX_FRAME_SIZE`] before any
//! allocation. Payloads are tagged request/response objects with base64
//! values, so the value bytes themselves are opaque: no structure or
//! encoding is imposed on them by this layer. The application protocol
//! identifier announced for this format is [`KV_PROTOCOL_ID`].

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::debug;

use crate::transport::PluginIo;

/// Application protocol identifier announced in the handshake line.
pub const KV_PROTOCOL_ID: &str = "kv.1";

/// Application protocol version announced in the handshake line.
pub const KV_PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size (4 MiB), checked before allocation.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Length prefix size in bytes.
const LENGTH_PREFIX: usize = 4;

/// KV protocol errors.
#[derive(Debug, Error)]
pub enum KvError {
    /// A frame length prefix exceeded [`MAX_FRAME_SIZE`].
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge {
        /// Size from the length prefix.
        size: usize,
        /// The enforced cap.
        max: usize,
    },

    /// The peer closed the connection mid-exchange.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Transport-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A payload could not be serialized or deserialized.
    #[error("codec error: {reason}")]
    Codec {
        /// Description of the failure.
        reason: String,
    },

    /// The peer answered with an error response.
    #[error("peer reported error: {message}")]
    Remote {
        /// Message from the peer.
        message: String,
    },

    /// The peer answered with a response that does not fit the request.
    #[error("unexpected response to {operation}")]
    UnexpectedResponse {
        /// The operation that was issued.
        operation: &'static str,
    },
}

/// Base64 (de)serialization for opaque value bytes.
mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

/// Request sent by the session holder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KvRequest {
    /// Store `value` under `key`.
    Put {
        /// Opaque key string.
        key: String,
        /// Opaque value bytes.
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    /// Fetch the value under `key`.
    Get {
        /// Opaque key string.
        key: String,
    },
}

/// Response sent by the peer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KvResponse {
    /// A put was applied.
    PutAck,
    /// The value under the requested key.
    Value {
        /// Opaque value bytes.
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
    },
    /// The requested key has no value.
    NotFound,
    /// The request failed on the peer side.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

/// Length-prefixed frame codec with pre-allocation size validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = KvError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX]);
        let len = u32::from_be_bytes(prefix) as usize;

        // Validated before reserving or splitting anything.
        if len > MAX_FRAME_SIZE {
            return Err(KvError::FrameTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        Ok(Some(src.split_to(len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = KvError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(KvError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Client half of the KV protocol, bound to one session transport.
///
/// Calls take `&self`; an internal mutex serializes frames on the single
/// transport, so concurrent calls on one session interleave at request
/// granularity and never corrupt each other's bytes.
pub struct KvClient {
    framed: Mutex<Framed<PluginIo, FrameCodec>>,
}

impl KvClient {
    /// Wraps a negotiated transport in the KV protocol.
    #[must_use]
    pub fn new(io: PluginIo) -> Self {
        Self {
            framed: Mutex::new(Framed::new(io, FrameCodec)),
        }
    }

    /// Stores `value` under `key`.
    ///
    /// # Errors
    ///
    /// [`KvError::Remote`] if the peer rejected the put, transport-class
    /// variants if the exchange failed.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let request = KvRequest::Put {
            key: key.to_string(),
            value: value.to_vec(),
        };
        match self.call(&request).await? {
            KvResponse::PutAck => Ok(()),
            KvResponse::Error { message } => Err(KvError::Remote { message }),
            _ => Err(KvError::UnexpectedResponse { operation: "put" }),
        }
    }

    /// Fetches the value under `key`, `None` when absent.
    ///
    /// # Errors
    ///
    /// [`KvError::Remote`] if the peer failed the get, transport-class
    /// variants if the exchange failed.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        let request = KvRequest::Get {
            key: key.to_string(),
        };
        match self.call(&request).await? {
            KvResponse::Value { value } => Ok(Some(value)),
            KvResponse::NotFound => Ok(None),
            KvResponse::Error { message } => Err(KvError::Remote { message }),
            KvResponse::PutAck => Err(KvError::UnexpectedResponse { operation: "get" }),
        }
    }

    /// Flushes and shuts down the underlying transport.
    ///
    /// Best-effort: errors are swallowed, the session is closing anyway.
    pub async fn shutdown(self) {
        let mut framed = self.framed.into_inner();
        let _ = framed.close().await;
    }

    async fn call(&self, request: &KvRequest) -> Result<KvResponse, KvError> {
        let payload = serde_json::to_vec(request).map_err(|e| KvError::Codec {
            reason: e.to_string(),
        })?;

        let mut framed = self.framed.lock().await;
        framed.send(Bytes::from(payload)).await?;

        match framed.next().await {
            None => Err(KvError::ConnectionClosed),
            Some(frame) => {
                let frame = frame?;
                serde_json::from_slice(&frame).map_err(|e| KvError::Codec {
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Peer-side value store.
///
/// In-memory by default; directory-backed when a storage location override
/// is configured, with one `kv_<key>` file per key.
#[derive(Debug)]
pub enum KvStore {
    /// Values held in process memory.
    Memory(RwLock<HashMap<String, Vec<u8>>>),
    /// Values persisted as files under a directory.
    Directory(PathBuf),
}

impl KvStore {
    /// Creates an in-memory store.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(RwLock::new(HashMap::new()))
    }

    /// Creates a directory-backed store.
    #[must_use]
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::Directory(path.into())
    }

    /// Stores `value` under `key`. Last put wins.
    ///
    /// # Errors
    ///
    /// Rejects keys unusable as file names for directory stores and
    /// propagates filesystem failures.
    pub async fn put(&self, key: &str, value: Vec<u8>) -> io::Result<()> {
        match self {
            Self::Memory(map) => {
                map.write().await.insert(key.to_string(), value);
                Ok(())
            }
            Self::Directory(dir) => {
                let path = dir.join(file_name(key)?);
                tokio::fs::write(path, value).await
            }
        }
    }

    /// Fetches the value under `key`.
    ///
    /// # Errors
    ///
    /// Rejects keys unusable as file names for directory stores and
    /// propagates filesystem failures other than absence.
    pub async fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        match self {
            Self::Memory(map) => Ok(map.read().await.get(key).cloned()),
            Self::Directory(dir) => {
                let path = dir.join(file_name(key)?);
                match tokio::fs::read(path).await {
                    Ok(value) => Ok(Some(value)),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(e),
                }
            }
        }
    }
}

/// Maps a key to its backing file name, refusing path traversal.
fn file_name(key: &str) -> io::Result<String> {
    if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("key {key:?} is not storable"),
        ));
    }
    Ok(format!("kv_{key}"))
}

/// Serves the KV protocol on one accepted connection until the client
/// closes it.
///
/// Malformed payloads get an error response; framing violations terminate
/// the connection.
///
/// # Errors
///
/// Returns transport-class [`KvError`] variants on framing or I/O failure.
pub async fn serve_connection(io: PluginIo, store: Arc<KvStore>) -> Result<(), KvError> {
    let mut framed = Framed::new(io, FrameCodec);

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let response = match serde_json::from_slice::<KvRequest>(&frame) {
            Ok(request) => {
                debug!(?request, "kv request");
                apply(request, &store).await
            }
            Err(e) => KvResponse::Error {
                message: format!("malformed request: {e}"),
            },
        };

        let payload = serde_json::to_vec(&response).map_err(|e| KvError::Codec {
            reason: e.to_string(),
        })?;
        framed.send(Bytes::from(payload)).await?;
    }

    Ok(())
}

async fn apply(request: KvRequest, store: &KvStore) -> KvResponse {
    match request {
        KvRequest::Put { key, value } => match store.put(&key, value).await {
            Ok(()) => KvResponse::PutAck,
            Err(e) => KvResponse::Error {
                message: e.to_string(),
            },
        },
        KvRequest::Get { key } => match store.get(&key).await {
            Ok(Some(value)) => KvResponse::Value { value },
            Ok(None) => KvResponse::NotFound,
            Err(e) => KvResponse::Error {
                message: e.to_string(),
            },
        },
    }
}
