//! Default codec: length-prefixed bincode segments.
//!
//! ## Frame Format
//!
//! ```text
//! +----------------+------------------+----------------+------------------+
//! | Length (4B BE) | Header (bincode) | Length (4B BE) | Body (N bytes)   |
//! +----------------+------------------+----------------+------------------+
//! ```
//!
//! Reads and writes use separate locks, so one reader and any number of
//! writers can share the codec. The write lock covers both segments and the
//! flush, which keeps frames from interleaving on the wire.
//!
//! A write that fails or is dropped part way leaves a partial frame on the
//! wire. The codec is marked broken at that point and every later write fails
//! with a framing error.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{Result, RpcError};
use crate::protocol::codec::{Codec, CodecConfig, CodecType};
use crate::protocol::header::Header;

/// Bincode framing over any async byte stream.
pub struct BinaryCodec<R, W> {
    reader: Mutex<R>,
    writer: Mutex<BufWriter<W>>,
    broken: AtomicBool,
    cfg: CodecConfig,
}

/// Marks the writer broken unless the write it guards ran to completion.
struct WriteGuard<'a> {
    broken: &'a AtomicBool,
    finished: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.broken.store(true, Ordering::Release);
        }
    }
}

impl<R, W> BinaryCodec<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, cfg: CodecConfig) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(BufWriter::new(writer)),
            broken: AtomicBool::new(false),
            cfg,
        }
    }

    /// True once a write stopped part way; the stream is out of step.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    async fn write_locked(&self, buf: &[u8]) -> Result<()> {
        let mut w = self.writer.lock().await;
        if self.is_broken() {
            return Err(RpcError::Framing("an earlier write did not complete".into()));
        }
        let mut guard = WriteGuard {
            broken: &self.broken,
            finished: false,
        };
        w.write_all(buf).await?;
        w.flush().await?;
        guard.finished = true;
        Ok(())
    }

    async fn shutdown_locked(&self) -> Result<()> {
        let mut w = self.writer.lock().await;
        w.flush().await?;
        w.shutdown().await?;
        Ok(())
    }
}

/// Read one length-prefixed segment.
///
/// End-of-stream before the first length byte is a clean close
/// (`ConnectionClosed`); anywhere later it is `UnexpectedEof`.
async fn read_segment<R: AsyncRead + Unpin>(r: &mut R, max: usize) -> Result<Bytes> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = r.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Err(RpcError::ConnectionClosed);
            }
            return Err(RpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside a length prefix",
            )));
        }
        filled += n;
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(RpcError::FrameTooLarge { size: len, max });
    }

    let mut buf = BytesMut::zeroed(len);
    r.read_exact(&mut buf).await?;
    Ok(buf.freeze())
}

fn put_segment(dst: &mut BytesMut, data: &[u8], max: usize) -> Result<()> {
    if data.len() > max {
        return Err(RpcError::FrameTooLarge {
            size: data.len(),
            max,
        });
    }
    let len = u32::try_from(data.len()).map_err(|_| RpcError::FrameTooLarge {
        size: data.len(),
        max,
    })?;
    dst.put_u32(len);
    dst.put_slice(data);
    Ok(())
}

#[async_trait]
impl<R, W> Codec for BinaryCodec<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn codec_type(&self) -> CodecType {
        CodecType::Bincode
    }

    async fn read_header(&self) -> Result<Header> {
        let mut r = self.reader.lock().await;
        let seg = match self.cfg.read_timeout {
            Some(d) => timeout(d, read_segment(&mut *r, self.cfg.max_frame_bytes))
                .await
                .map_err(|_| RpcError::Timeout)??,
            None => read_segment(&mut *r, self.cfg.max_frame_bytes).await?,
        };
        let header: Header = bincode::deserialize(&seg)?;
        tracing::debug!(method = %header.method, seq = header.seq, "read header");
        Ok(header)
    }

    async fn read_body(&self) -> Result<Bytes> {
        let mut r = self.reader.lock().await;
        let fut = read_segment(&mut *r, self.cfg.max_frame_bytes);
        let res = match self.cfg.read_timeout {
            Some(d) => timeout(d, fut).await.map_err(|_| RpcError::Timeout)?,
            None => fut.await,
        };
        match res {
            Err(RpcError::ConnectionClosed) => Err(RpcError::Framing(
                "stream ended between header and body".into(),
            )),
            other => other,
        }
    }

    async fn write_frame(&self, header: &Header, body: &[u8]) -> Result<()> {
        let max = self.cfg.max_frame_bytes;
        let head = bincode::serialize(header)?;

        let mut buf = BytesMut::with_capacity(8 + head.len() + body.len());
        put_segment(&mut buf, &head, max)?;
        put_segment(&mut buf, body, max)?;

        let res = match self.cfg.write_timeout {
            Some(d) => timeout(d, self.write_locked(&buf))
                .await
                .map_err(|_| RpcError::Timeout)?,
            None => self.write_locked(&buf).await,
        };
        if let Err(e) = &res {
            tracing::warn!(method = %header.method, seq = header.seq, error = %e, "write frame failed");
        } else {
            tracing::debug!(method = %header.method, seq = header.seq, body_len = body.len(), "wrote frame");
        }
        res
    }

    async fn close(&self) -> Result<()> {
        match self.cfg.write_timeout {
            Some(d) => timeout(d, self.shutdown_locked())
                .await
                .map_err(|_| RpcError::Timeout)?,
            None => self.shutdown_locked().await,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn pair() -> (BinaryCodec<tokio::io::DuplexStream, tokio::io::DuplexStream>, BinaryCodec<tokio::io::DuplexStream, tokio::io::DuplexStream>) {
        let (a_r, b_w) = duplex(4096);
        let (b_r, a_w) = duplex(4096);
        (
            BinaryCodec::new(a_r, a_w, CodecConfig::default()),
            BinaryCodec::new(b_r, b_w, CodecConfig::default()),
        )
    }

    #[tokio::test]
    async fn header_and_body_arrive_in_order() {
        let (a, b) = pair();
        let h = Header::request("ComputeS1.Add", 7);
        a.write_frame(&h, b"payload").await.unwrap();

        assert_eq!(b.read_header().await.unwrap(), h);
        assert_eq!(&b.read_body().await.unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn close_is_seen_as_clean_eof() {
        let (a, b) = pair();
        a.close().await.unwrap();
        let err = b.read_header().await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionClosed));
    }

    #[tokio::test]
    async fn oversized_segment_is_rejected_on_read() {
        let (mut raw, r) = duplex(64);
        let (_unused, w) = duplex(64);
        let codec = BinaryCodec::new(
            r,
            w,
            CodecConfig {
                max_frame_bytes: 4,
                ..CodecConfig::default()
            },
        );
        raw.write_all(&100u32.to_be_bytes()).await.unwrap();
        let err = codec.read_header().await.unwrap_err();
        assert!(matches!(err, RpcError::FrameTooLarge { size: 100, max: 4 }));
    }

    #[tokio::test]
    async fn stalled_write_breaks_the_writer() {
        let (_peer, r) = duplex(64);
        let (_unread, w) = duplex(64);
        let codec = BinaryCodec::new(
            r,
            w,
            CodecConfig {
                write_timeout: Some(std::time::Duration::from_millis(20)),
                ..CodecConfig::default()
            },
        );
        let big = vec![0u8; 16 * 1024];
        let err = codec.write_frame(&Header::request("S.Big", 1), &big).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
        assert!(codec.is_broken());

        let err = codec.write_frame(&Header::request("S.Small", 2), b"x").await.unwrap_err();
        assert!(matches!(err, RpcError::Framing(_)));
    }

    #[tokio::test]
    async fn idle_read_times_out() {
        let (_keep, r) = duplex(64);
        let (_unused, w) = duplex(64);
        let codec = BinaryCodec::new(
            r,
            w,
            CodecConfig {
                read_timeout: Some(std::time::Duration::from_millis(20)),
                ..CodecConfig::default()
            },
        );
        assert!(matches!(codec.read_header().await, Err(RpcError::Timeout)));
    }
}
