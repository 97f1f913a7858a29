//! Connection handshake.
//!
//! Exactly one `Handshake` is written by the dialing side before any frame. The
//! accepting side rejects the connection on magic mismatch or on a codec it
//! cannot serve; no frame is exchanged in that case.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::error::{Result, RpcError};
use crate::protocol::codec::CodecType;
use crate::protocol::line::{read_json_line, write_json_line};

/// Identifies hasten peers.
pub const MAGIC_NUMBER: u32 = 0x3bef5c;

/// Upper bound for the handshake line.
pub const MAX_HANDSHAKE_BYTES: usize = 1024;

/// Handshake value, self-describing (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Handshake {
    pub magic_number: u32,
    /// Codec selector, e.g. `application/bincode`.
    pub codec_type: String,
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new(CodecType::default())
    }
}

impl Handshake {
    pub fn new(codec: CodecType) -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: codec.as_str().to_string(),
        }
    }

    /// Check the magic number and resolve the codec selector.
    pub fn validate(&self) -> Result<CodecType> {
        if self.magic_number != MAGIC_NUMBER {
            return Err(RpcError::Protocol(format!(
                "invalid magic number {:#x}",
                self.magic_number
            )));
        }
        self.codec_type.parse()
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        write_json_line(w, self).await
    }

    /// Read a handshake; does not validate it.
    pub async fn read_from<R: AsyncBufRead + Unpin>(r: &mut R) -> Result<Self> {
        match read_json_line(r, MAX_HANDSHAKE_BYTES).await {
            Err(RpcError::ConnectionClosed) => Err(RpcError::Protocol(
                "connection closed before handshake".into(),
            )),
            other => other,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn default_handshake_validates() {
        let hs = Handshake::default();
        assert_eq!(hs.validate().unwrap(), CodecType::Bincode);
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let hs = Handshake {
            magic_number: 42,
            codec_type: CodecType::Bincode.as_str().into(),
        };
        assert!(matches!(hs.validate(), Err(RpcError::Protocol(_))));
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let hs = Handshake {
            magic_number: MAGIC_NUMBER,
            codec_type: "application/xml".into(),
        };
        assert!(matches!(hs.validate(), Err(RpcError::UnsupportedCodec(_))));
    }
}
