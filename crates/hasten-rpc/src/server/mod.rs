//! RPC server: accept loop and per-connection handlers.
//!
//! Each accepted connection runs on its own task inside a span carrying the
//! peer address. Protocol errors (bad handshake, unsupported codec) close the
//! connection without a response.

mod conn;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::Instrument;

use hasten_core::error::Result;
use hasten_core::protocol::codec::DEFAULT_MAX_FRAME_BYTES;
use hasten_core::protocol::CodecConfig;

use crate::discovery::{DiscoveryClient, RegistrationHandle};
use crate::dispatch::{RpcService, Service, ServiceRegistry};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection-level tunables.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Close a connection after this long without a request. `None` never does.
    pub idle_timeout: Option<Duration>,
    /// Drop a connection that has not sent its handshake within this long.
    pub handshake_timeout: Duration,
    /// A reply that cannot be written within this long ends the connection.
    pub write_timeout: Option<Duration>,
    pub max_frame_bytes: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: None,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            write_timeout: Some(Duration::from_secs(10)),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl ServerOptions {
    fn codec_config(&self) -> CodecConfig {
        CodecConfig {
            max_frame_bytes: self.max_frame_bytes,
            read_timeout: self.idle_timeout,
            write_timeout: self.write_timeout,
        }
    }
}

/// RPC server. Cheap to clone; clones share the service registry.
#[derive(Clone)]
pub struct Server {
    registry: Arc<ServiceRegistry>,
    opts: ServerOptions,
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerOptions::default())
    }
}

impl Server {
    pub fn new(opts: ServerOptions) -> Self {
        Self {
            registry: Arc::new(ServiceRegistry::new()),
            opts,
        }
    }

    pub fn registry(&self) -> Arc<ServiceRegistry> {
        Arc::clone(&self.registry)
    }

    /// Register a service under its type name. Duplicates are rejected.
    pub fn register_service<S: RpcService>(&self, instance: S) -> Result<()> {
        self.registry.register_service(instance)
    }

    pub fn register(&self, svc: Service) -> Result<()> {
        self.registry.register(svc)
    }

    /// Accept connections until the listener fails for good.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections until `signal` resolves. In-flight connections keep
    /// running on their own tasks.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local = listener.local_addr()?;
        tracing::info!(%local, services = ?self.registry.registered_services(), "rpc server listening");

        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    tracing::info!(%local, "rpc server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!(%peer, error = %e, "set_nodelay failed");
                            }
                            self.spawn_conn(stream, peer);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                    }
                }
            }
        }
    }

    fn spawn_conn<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        let opts = self.opts.clone();
        let span = tracing::info_span!("rpc_conn", %peer);
        tokio::spawn(
            async move {
                tracing::debug!("connection accepted");
                if let Err(e) = conn::serve_conn(registry, opts, stream).await {
                    tracing::warn!(error = %e, kind = e.kind().as_str(), "connection rejected");
                }
            }
            .instrument(span),
        );
    }

    /// Serve one already-established stream (e.g. an in-memory duplex) to completion.
    pub async fn serve_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        conn::serve_conn(Arc::clone(&self.registry), self.opts.clone(), stream).await
    }

    /// Register `service_name` at `advertise_addr` with a discovery registry
    /// and keep it alive with heartbeats every `interval`.
    pub async fn register_with_registry(
        &self,
        registry_addr: &str,
        service_name: &str,
        advertise_addr: Option<String>,
        interval: Duration,
    ) -> Result<RegistrationHandle> {
        DiscoveryClient::new(registry_addr)
            .register(service_name, advertise_addr, interval)
            .await
    }
}
