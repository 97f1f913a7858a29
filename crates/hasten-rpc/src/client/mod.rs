//! RPC client: many concurrent calls multiplexed over one connection.
//!
//! ```text
//! caller 1 ─┐                                                    ┌─► waiter 1
//! caller 2 ─┼─► send lock ─► outbox ─► writer task ─► wire ─► reader task ─┼─► waiter 2
//! caller N ─┘   (seq + table + enqueue)                          └─► waiter N
//! ```
//!
//! # Key invariants
//!
//! Only the reader task reads from the codec and only the writer task writes
//! frames. A waiter is parked under its sequence number before its request is
//! queued, so a fast response can never arrive for an unknown sequence. When
//! either task exits, every waiter still parked is failed with
//! `ConnectionClosed`.
//!
//! A queued frame is always written whole, even if the caller of
//! [`Client::go`] stops waiting. A write that fails closes the connection.

mod pending;

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use hasten_core::error::{Result, RpcError};
use hasten_core::protocol::codec::DEFAULT_MAX_FRAME_BYTES;
use hasten_core::protocol::{new_codec, Codec, CodecConfig, CodecType, Handshake, Header};

use crate::balancer::{new_balancer, BalanceStrategy, Balancer};
use crate::discovery::Discovery;

use pending::{PendingCalls, Reply, ReplyRx};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub codec: CodecType,
    /// Give up on a reply after this long. `None` waits as long as the connection lives.
    pub call_timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_frame_bytes: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            codec: CodecType::default(),
            call_timeout: None,
            connect_timeout: Some(Duration::from_secs(10)),
            write_timeout: Some(Duration::from_secs(10)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

const OUTBOX_CAPACITY: usize = 1024;

/// A request frame waiting for the writer task.
struct Outgoing {
    header: Header,
    body: Bytes,
    written: oneshot::Sender<Result<()>>,
}

struct ClientInner {
    codec: Arc<dyn Codec>,
    pending: PendingCalls,
    outbox: mpsc::Sender<Outgoing>,
    /// Serializes seq allocation + table insert + enqueue across senders,
    /// so frames reach the wire in sequence order.
    send_lock: Mutex<()>,
    call_timeout: Option<Duration>,
}

/// A connected client.
///
/// Dropping the client stops both connection tasks and fails any call still
/// waiting.
pub struct Client {
    inner: Arc<ClientInner>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Client {
    /// Dial `addr` directly.
    pub async fn dial(addr: &str, opts: ClientOptions) -> Result<Self> {
        opts.codec.ensure_supported()?;
        let connect = TcpStream::connect(addr);
        let stream = match opts.connect_timeout {
            Some(d) => timeout(d, connect).await.map_err(|_| RpcError::Timeout)??,
            None => connect.await?,
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%addr, error = %e, "set_nodelay failed");
        }
        tracing::debug!(%addr, "dialed rpc server");
        Self::new(stream, opts).await
    }

    /// Dial the address the balancer picks next.
    pub async fn dial_balanced(balancer: &dyn Balancer, opts: ClientOptions) -> Result<Self> {
        let addr = balancer.next();
        Self::dial(&addr, opts).await
    }

    /// Look `service` up through `discovery`, pick one endpoint, dial it.
    pub async fn dial_service(
        discovery: &dyn Discovery,
        service: &str,
        strategy: BalanceStrategy,
        opts: ClientOptions,
    ) -> Result<Self> {
        let addrs = discovery.discover(service).await?;
        let balancer = new_balancer(strategy, addrs)?;
        Self::dial_balanced(balancer.as_ref(), opts).await
    }

    /// Handshake over an established stream and start the connection tasks.
    pub async fn new<S>(stream: S, opts: ClientOptions) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        opts.codec.ensure_supported()?;
        let (r, mut w) = tokio::io::split(stream);
        Handshake::new(opts.codec).write_to(&mut w).await?;

        let cfg = CodecConfig {
            max_frame_bytes: opts.max_frame_bytes,
            read_timeout: None,
            write_timeout: opts.write_timeout,
        };
        let codec = new_codec(r, w, opts.codec, cfg)?;

        let (outbox, queued) = mpsc::channel(OUTBOX_CAPACITY);
        let inner = Arc::new(ClientInner {
            codec,
            pending: PendingCalls::default(),
            outbox,
            send_lock: Mutex::new(()),
            call_timeout: opts.call_timeout,
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&inner)));
        let writer = tokio::spawn(write_loop(Arc::clone(&inner), queued));
        Ok(Self { inner, reader, writer })
    }

    /// Send a request and return a handle to await its reply.
    ///
    /// Resolves once the request is on the wire. Dropping this future early
    /// never leaves a partial frame behind: a request already queued is still
    /// written in full and its late reply is discarded.
    pub async fn go<A>(&self, method: &str, args: &A) -> Result<Call>
    where
        A: Serialize + Sync + ?Sized,
    {
        let inner = &self.inner;
        let body = inner.codec.codec_type().encode(args)?;

        let (call, written) = {
            let _send = inner.send_lock.lock().await;
            let (seq, rx) = inner.pending.register(method)?;
            // From here on, dropping `call` unparks the waiter.
            let call = Call {
                seq,
                rx,
                inner: Arc::clone(inner),
                done: false,
            };
            let (tx, written) = oneshot::channel();
            let out = Outgoing {
                header: Header::request(method, seq),
                body,
                written: tx,
            };
            inner
                .outbox
                .send(out)
                .await
                .map_err(|_| RpcError::ConnectionClosed)?;
            (call, written)
        };

        match written.await {
            Ok(Ok(())) => Ok(call),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Call `method` and wait for its reply.
    pub async fn call<A, R>(&self, method: &str, args: &A) -> Result<R>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        self.go(method, args).await?.reply().await
    }

    /// False once the connection is gone or closed.
    pub fn is_available(&self) -> bool {
        !self.inner.pending.is_shutdown()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Fail pending calls, refuse new ones, and shut the connection down.
    ///
    /// A frame the writer task is in the middle of is finished first.
    pub async fn close(&self) -> Result<()> {
        self.inner.pending.terminate();
        self.reader.abort();
        let res = self.inner.codec.close().await;
        self.writer.abort();
        res
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.pending.terminate();
        self.reader.abort();
        self.writer.abort();
    }
}

/// An in-flight call.
pub struct Call {
    seq: u64,
    rx: ReplyRx,
    inner: Arc<ClientInner>,
    done: bool,
}

impl Call {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the reply and decode it into `R`.
    ///
    /// A non-empty `Header.error` becomes `RpcError::Remote`.
    pub async fn reply<R: DeserializeOwned>(mut self) -> Result<R> {
        let received = match self.inner.call_timeout {
            Some(d) => match timeout(d, &mut self.rx).await {
                Ok(r) => r,
                Err(_) => {
                    tracing::warn!(seq = self.seq, timeout_ms = d.as_millis() as u64, "call timed out");
                    return Err(RpcError::Timeout);
                }
            },
            None => (&mut self.rx).await,
        };
        self.done = true;

        let Reply { header, body } = received.map_err(|_| RpcError::ConnectionClosed)??;
        if header.is_error() {
            return Err(RpcError::Remote(header.error));
        }
        self.inner.codec.codec_type().decode(&body)
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        if !self.done && self.inner.pending.remove(self.seq) {
            tracing::debug!(seq = self.seq, "call dropped before reply; waiter removed");
        }
    }
}

async fn write_loop(inner: Arc<ClientInner>, mut queued: mpsc::Receiver<Outgoing>) {
    while let Some(out) = queued.recv().await {
        match inner.codec.write_frame(&out.header, &out.body).await {
            Ok(()) => {
                let _ = out.written.send(Ok(()));
            }
            Err(e) => {
                tracing::warn!(
                    seq = out.header.seq,
                    method = %out.header.method,
                    error = %e,
                    "write request failed; closing connection"
                );
                let _ = out.written.send(Err(e));
                // Part of a frame may be on the wire; nothing after it can be trusted.
                let failed = inner.pending.terminate();
                if failed > 0 {
                    tracing::warn!(failed, "connection closed with calls pending");
                }
                if let Err(e) = inner.codec.close().await {
                    tracing::debug!(error = %e, "close codec failed");
                }
                return;
            }
        }
    }
}

async fn read_loop(inner: Arc<ClientInner>) {
    let cause = loop {
        let header = match inner.codec.read_header().await {
            Ok(h) => h,
            Err(e) => break e,
        };
        // Always consume the body, matched or not, to stay on frame boundaries.
        let body = match inner.codec.read_body().await {
            Ok(b) => b,
            Err(e) => break e,
        };

        match inner.pending.take(header.seq) {
            Some(tx) => {
                let _ = tx.send(Ok(Reply { header, body }));
            }
            None => {
                tracing::warn!(
                    seq = header.seq,
                    method = %header.method,
                    body_len = body.len(),
                    "protocol error: response for unknown sequence, body discarded"
                );
            }
        }
    };

    if cause.is_eof() {
        tracing::debug!("rpc connection closed by peer");
    } else {
        tracing::warn!(error = %cause, kind = cause.kind().as_str(), "rpc connection failed");
    }
    let failed = inner.pending.terminate();
    if failed > 0 {
        tracing::warn!(failed, "connection lost with calls pending");
    }
}
