//! The `Codec` seam.
//!
//! A codec turns a byte stream into `(Header, Body)` frames and back. Bodies are
//! carried as opaque bytes; callers decode them into their own typed slots via
//! `CodecType::decode` (or `CodecExt::read_body_as`).
//!
//! Contract:
//! - `read_header` and `read_body` are called as a pair, in that order, by a
//!   single reader. Any error leaves the connection unusable.
//! - `write_frame` is atomic with respect to other `write_frame` calls on the
//!   same codec: header, body and flush happen under one lock.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, RpcError};
use crate::protocol::binary::BinaryCodec;
use crate::protocol::header::Header;

/// Default upper bound for one header or body segment.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Codec selector carried in the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CodecType {
    /// Length-prefixed bincode.
    #[default]
    Bincode,
    /// Declared selector without an implementation; selecting it fails.
    Json,
}

impl CodecType {
    pub fn as_str(self) -> &'static str {
        match self {
            CodecType::Bincode => "application/bincode",
            CodecType::Json => "application/json",
        }
    }

    /// Fail fast on selectors without an implementation.
    pub fn ensure_supported(self) -> Result<()> {
        match self {
            CodecType::Bincode => Ok(()),
            CodecType::Json => Err(RpcError::UnsupportedCodec(format!(
                "{} is not implemented",
                self.as_str()
            ))),
        }
    }

    /// Serialize a value with this codec.
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Bytes> {
        match self {
            CodecType::Bincode => Ok(Bytes::from(bincode::serialize(value)?)),
            CodecType::Json => Err(RpcError::UnsupportedCodec(self.as_str().into())),
        }
    }

    /// Deserialize a value with this codec.
    pub fn decode<T: DeserializeOwned>(self, data: &[u8]) -> Result<T> {
        match self {
            CodecType::Bincode => Ok(bincode::deserialize(data)?),
            CodecType::Json => Err(RpcError::UnsupportedCodec(self.as_str().into())),
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CodecType {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "application/bincode" => Ok(CodecType::Bincode),
            "application/json" => Ok(CodecType::Json),
            other => Err(RpcError::UnsupportedCodec(other.to_string())),
        }
    }
}

impl TryFrom<String> for CodecType {
    type Error = RpcError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<CodecType> for String {
    fn from(c: CodecType) -> Self {
        c.as_str().to_string()
    }
}

/// Tunables shared by codec implementations.
#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub max_frame_bytes: usize,
    /// Bound on waiting for the next header (idle connection). `None` waits forever.
    pub read_timeout: Option<Duration>,
    /// Bound on one `write_frame` including lock acquisition.
    pub write_timeout: Option<Duration>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Frame-level codec over one connection.
#[async_trait]
pub trait Codec: Send + Sync {
    /// Serializer used for headers and bodies.
    fn codec_type(&self) -> CodecType;

    async fn read_header(&self) -> Result<Header>;

    /// Read the body that follows the last header, still encoded.
    async fn read_body(&self) -> Result<Bytes>;

    /// Write `header` followed by the already-encoded `body` as one unit.
    async fn write_frame(&self, header: &Header, body: &[u8]) -> Result<()>;

    /// Shut down the write side. The peer observes end-of-stream.
    async fn close(&self) -> Result<()>;
}

/// Typed helpers on top of `Codec`.
#[async_trait]
pub trait CodecExt: Codec {
    /// Read the next body and decode it into `T`.
    async fn read_body_as<T: DeserializeOwned + Send>(&self) -> Result<T> {
        let raw = self.read_body().await?;
        self.codec_type().decode(&raw)
    }

    /// Encode `body` and write it after `header`.
    async fn write_value<T: Serialize + Sync + ?Sized>(&self, header: &Header, body: &T) -> Result<()> {
        let raw = self.codec_type().encode(body)?;
        self.write_frame(header, &raw).await
    }
}

impl<C: Codec + ?Sized> CodecExt for C {}

/// Build the codec selected by the handshake.
pub fn new_codec<R, W>(
    reader: R,
    writer: W,
    codec_type: CodecType,
    cfg: CodecConfig,
) -> Result<Arc<dyn Codec>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    codec_type.ensure_supported()?;
    Ok(Arc::new(BinaryCodec::new(reader, writer, cfg)))
}
