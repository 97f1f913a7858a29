//! Newline-delimited JSON messages.
//!
//! Used for the handshake and for the discovery protocol. Reads are bounded so
//! a peer cannot make us buffer an unterminated line forever.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, RpcError};

/// Write `value` as one JSON line and flush.
pub async fn write_json_line<W, T>(w: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    w.write_all(&buf).await?;
    w.flush().await?;
    Ok(())
}

/// Read one JSON line of at most `max_len` bytes.
///
/// A stream that ends before any byte is read yields `ConnectionClosed`.
pub async fn read_json_line<R, T>(r: &mut R, max_len: usize) -> Result<T>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max_len).unwrap_or(u64::MAX);
    let n = r.take(limit).read_until(b'\n', &mut buf).await?;
    if n == 0 {
        return Err(RpcError::ConnectionClosed);
    }
    if buf.last() != Some(&b'\n') {
        return Err(RpcError::Protocol(format!(
            "unterminated line ({n} bytes, max {max_len})"
        )));
    }
    Ok(serde_json::from_slice(&buf)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tokio::io::BufReader;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[tokio::test]
    async fn reads_consecutive_lines() {
        let (mut a, b) = tokio::io::duplex(256);
        write_json_line(&mut a, &Ping { n: 1 }).await.unwrap();
        write_json_line(&mut a, &Ping { n: 2 }).await.unwrap();
        drop(a);

        let mut r = BufReader::new(b);
        let first: Ping = read_json_line(&mut r, 64).await.unwrap();
        let second: Ping = read_json_line(&mut r, 64).await.unwrap();
        assert_eq!((first.n, second.n), (1, 2));
        let end = read_json_line::<_, Ping>(&mut r, 64).await;
        assert!(matches!(end, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn oversized_line_is_a_protocol_error() {
        let (mut a, b) = tokio::io::duplex(256);
        a.write_all(b"{\"n\": 111111111111111111}\n").await.unwrap();
        let mut r = BufReader::new(b);
        let res = read_json_line::<_, Ping>(&mut r, 8).await;
        assert!(matches!(res, Err(RpcError::Protocol(_))));
    }
}
