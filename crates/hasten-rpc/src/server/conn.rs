//! Per-connection request loop.
//!
//! Reads happen strictly in order on the connection task. Each decoded request
//! is invoked on its own task so slow methods do not hold up reading; replies
//! may therefore leave in a different order than requests arrived. The codec's
//! write lock keeps concurrent replies from interleaving.
//!
//! A reply that fails to write, deadline included, may leave half a frame on
//! the wire. Any such failure trips the connection's fault signal: reading
//! stops, outstanding handlers are aborted and the codec is closed, so the
//! peer sees EOF and fails its own pending calls.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;

use hasten_core::error::{Result, RpcError};
use hasten_core::protocol::{new_codec, Codec, CodecExt, Handshake, Header};

use crate::dispatch::{MethodType, Service, ServiceRegistry, Slot};

use super::ServerOptions;

/// A decoded request ready to run.
struct Request {
    header: Header,
    service: Arc<Service>,
    method: Arc<MethodType>,
    argv: Slot,
}

/// Handshake, then serve frames until the peer goes away.
pub(crate) async fn serve_conn<S>(registry: Arc<ServiceRegistry>, opts: ServerOptions, stream: S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (r, w) = tokio::io::split(stream);
    let mut r = BufReader::new(r);

    let hs = timeout(opts.handshake_timeout, Handshake::read_from(&mut r))
        .await
        .map_err(|_| RpcError::Timeout)??;
    let codec_type = hs.validate()?;
    tracing::debug!(codec = %codec_type, "handshake accepted");

    let codec = new_codec(r, w, codec_type, opts.codec_config())?;
    serve_codec(registry, codec).await;
    Ok(())
}

/// Frame loop over an established codec. Closes the codec on exit.
pub(crate) async fn serve_codec(registry: Arc<ServiceRegistry>, codec: Arc<dyn Codec>) {
    let mut in_flight = JoinSet::new();
    let (fault_tx, mut fault_rx) = watch::channel(false);
    let fault = Arc::new(fault_tx);

    loop {
        let next = tokio::select! {
            biased;
            _ = fault_rx.changed() => break,
            next = read_request(&registry, codec.as_ref()) => next,
        };
        let req = match next {
            Ok(Ok(req)) => req,
            Ok(Err((header, e))) => {
                tracing::debug!(method = %header.method, seq = header.seq, error = %e, "rejecting request");
                send_error(codec.as_ref(), header, &e.to_string(), &fault).await;
                continue;
            }
            Err(e) => {
                if e.is_eof() {
                    tracing::debug!("peer closed connection");
                } else {
                    tracing::warn!(error = %e, "read request failed; closing connection");
                }
                break;
            }
        };

        let codec = Arc::clone(&codec);
        let fault = Arc::clone(&fault);
        in_flight.spawn(async move { handle_request(codec.as_ref(), req, &fault).await });

        // Reap finished handlers so the set does not grow on long connections.
        while let Some(done) = in_flight.try_join_next() {
            log_join(done);
        }
    }

    if *fault_rx.borrow() {
        tracing::warn!(abandoned = in_flight.len(), "response write failed; closing connection");
        in_flight.abort_all();
    }
    while let Some(done) = in_flight.join_next().await {
        log_join(done);
    }
    if let Err(e) = codec.close().await {
        tracing::debug!(error = %e, "close codec failed");
    }
}

fn log_join(done: std::result::Result<(), tokio::task::JoinError>) {
    match done {
        Err(e) if e.is_panic() => tracing::error!(error = %e, "request handler panicked"),
        _ => {}
    }
}

/// Outer error: the connection is unusable. Inner error: this request failed
/// but its body was consumed and the stream is still aligned.
async fn read_request(
    registry: &ServiceRegistry,
    codec: &dyn Codec,
) -> Result<std::result::Result<Request, (Header, RpcError)>> {
    let header = codec.read_header().await?;

    let resolved = registry.find(&header);
    // The body is read even when resolution failed, to stay on frame boundaries.
    let raw = codec.read_body().await?;

    let (service, method) = match resolved {
        Ok(found) => found,
        Err(e) => return Ok(Err((header, e))),
    };

    let argv = match method.decode_argv(codec.codec_type(), &raw) {
        Ok(argv) => argv,
        Err(e) => {
            let e = RpcError::Remote(format!("rpc server: decode argument for {}: {e}", header.method));
            return Ok(Err((header, e)));
        }
    };

    Ok(Ok(Request {
        header,
        service,
        method,
        argv,
    }))
}

async fn handle_request(codec: &dyn Codec, req: Request, fault: &watch::Sender<bool>) {
    let Request {
        header,
        service,
        method,
        argv,
    } = req;

    let mut replyv = method.new_replyv();
    if let Err(msg) = service.call(&method, argv, &mut replyv) {
        send_error(codec, header, &msg, fault).await;
        return;
    }

    match method.encode_replyv(codec.codec_type(), replyv.as_ref()) {
        Ok(body) => {
            if let Err(e) = codec.write_frame(&header, &body).await {
                write_failed(&header, &e, fault);
            }
        }
        Err(e) => send_error(codec, header, &format!("rpc server: encode reply: {e}"), fault).await,
    }
}

/// Reply with `Header.error` set and the empty placeholder body.
async fn send_error(codec: &dyn Codec, mut header: Header, msg: &str, fault: &watch::Sender<bool>) {
    header.error = msg.to_string();
    if let Err(e) = codec.write_value(&header, &()).await {
        write_failed(&header, &e, fault);
    }
}

fn write_failed(header: &Header, e: &RpcError, fault: &watch::Sender<bool>) {
    tracing::warn!(method = %header.method, seq = header.seq, error = %e, "write response failed");
    fault.send_replace(true);
}
