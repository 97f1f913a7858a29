//! Discovery registry server.
//!
//! One task per connection. A `Register` connection stays open and must keep
//! sending `HeartBeat` lines; a read that does not complete within the
//! heartbeat timeout evicts the address. `Discovery` connections are answered
//! once and closed. The opening request is held to the same deadline.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::Instrument;

use hasten_core::error::{Result, RpcError};
use hasten_core::protocol::discovery::{
    OpType, RegistryRequest, RegistryResponse, MAX_REGISTRY_MESSAGE_BYTES, STATUS_BAD_REQUEST,
    STATUS_NOT_FOUND, STATUS_REGISTERED,
};
use hasten_core::protocol::line::{read_json_line, write_json_line};

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Longest silence tolerated on a registration connection.
    pub heartbeat_timeout: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

struct Inner {
    /// service name -> addresses, one entry per live registration.
    services: Mutex<HashMap<String, Vec<String>>>,
    opts: RegistryOptions,
}

/// Tracks which addresses currently serve which service. Clones share state.
#[derive(Clone)]
pub struct DiscoveryRegistry {
    inner: Arc<Inner>,
}

impl Default for DiscoveryRegistry {
    fn default() -> Self {
        Self::new(RegistryOptions::default())
    }
}

impl DiscoveryRegistry {
    pub fn new(opts: RegistryOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                services: Mutex::new(HashMap::new()),
                opts,
            }),
        }
    }

    fn services(&self) -> MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.inner.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live addresses for `service`, first-registered first, without duplicates.
    pub fn lookup(&self, service: &str) -> Vec<String> {
        let services = self.services();
        let mut out: Vec<String> = Vec::new();
        if let Some(addrs) = services.get(service) {
            for a in addrs {
                if !out.contains(a) {
                    out.push(a.clone());
                }
            }
        }
        out
    }

    fn add(&self, service: &str, addr: &str) {
        self.services()
            .entry(service.to_string())
            .or_default()
            .push(addr.to_string());
    }

    /// Remove one registration of `addr`. Other registrations of the same
    /// address (separate connections) stay.
    fn evict(&self, service: &str, addr: &str) -> bool {
        let mut services = self.services();
        let Some(addrs) = services.get_mut(service) else {
            return false;
        };
        let removed = match addrs.iter().position(|a| a == addr) {
            Some(i) => {
                addrs.remove(i);
                true
            }
            None => false,
        };
        if addrs.is_empty() {
            services.remove(service);
        }
        removed
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Accept connections until `signal` resolves. Registration connections
    /// already accepted keep running until their peer goes away.
    pub async fn serve_with_shutdown<F>(&self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let local = listener.local_addr()?;
        tracing::info!(
            %local,
            heartbeat_timeout_ms = self.inner.opts.heartbeat_timeout.as_millis() as u64,
            "discovery registry listening"
        );

        tokio::pin!(signal);
        loop {
            tokio::select! {
                _ = &mut signal => {
                    tracing::info!(%local, "discovery registry shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let this = self.clone();
                            let span = tracing::info_span!("registry_conn", %peer);
                            tokio::spawn(
                                async move {
                                    if let Err(e) = this.handle_conn(stream, peer.to_string()).await {
                                        tracing::debug!(error = %e, "registry connection ended with error");
                                    }
                                }
                                .instrument(span),
                            );
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

    /// Serve one registry connection. `peer` is recorded for registrations
    /// that do not advertise an address of their own.
    pub async fn handle_conn<S>(&self, stream: S, peer: String) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (r, mut w) = tokio::io::split(stream);
        let mut r = BufReader::new(r);

        let first = timeout(
            self.inner.opts.heartbeat_timeout,
            read_json_line(&mut r, MAX_REGISTRY_MESSAGE_BYTES),
        )
        .await
        .unwrap_or(Err(RpcError::Timeout));
        let req: RegistryRequest = match first {
            Ok(req) => req,
            Err(RpcError::ConnectionClosed) => return Ok(()),
            Err(RpcError::Timeout) => {
                tracing::debug!("no request before the deadline; closing");
                return Err(RpcError::Timeout);
            }
            Err(e) => {
                tracing::warn!(error = %e, "invalid registry request");
                let _ = write_json_line(&mut w, &RegistryResponse::status(STATUS_BAD_REQUEST)).await;
                if let Err(e) = w.shutdown().await {
                    tracing::debug!(error = %e, "registry connection shutdown failed");
                }
                return Err(e);
            }
        };

        match req.op_type {
            OpType::Discovery => {
                let res = self.discovery_response(&req.service_name);
                tracing::debug!(service = %req.service_name, status = %res.status, "discovery");
                write_json_line(&mut w, &res).await?;
                if let Err(e) = w.shutdown().await {
                    tracing::debug!(error = %e, "registry connection shutdown failed");
                }
                Ok(())
            }
            OpType::Register => {
                let addr = match req.addr {
                    Some(a) if !a.is_empty() => a,
                    _ => peer,
                };
                self.run_registration(&mut r, &mut w, &req.service_name, &addr).await
            }
            OpType::HeartBeat => {
                tracing::warn!(service = %req.service_name, "heartbeat without registration");
                write_json_line(&mut w, &RegistryResponse::status(STATUS_BAD_REQUEST)).await?;
                if let Err(e) = w.shutdown().await {
                    tracing::debug!(error = %e, "registry connection shutdown failed");
                }
                Ok(())
            }
        }
    }

    fn discovery_response(&self, service: &str) -> RegistryResponse {
        let addrs = self.lookup(service);
        if addrs.is_empty() {
            RegistryResponse::status(STATUS_NOT_FOUND)
        } else {
            RegistryResponse::found(addrs)
        }
    }

    async fn run_registration<R, W>(&self, r: &mut R, w: &mut W, service: &str, addr: &str) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if service.is_empty() {
            write_json_line(w, &RegistryResponse::status(STATUS_BAD_REQUEST)).await?;
            return Err(RpcError::InvalidServiceName(String::new()));
        }

        self.add(service, addr);
        tracing::info!(%service, %addr, "endpoint registered");

        let res = match write_json_line(w, &RegistryResponse::status(STATUS_REGISTERED)).await {
            Ok(()) => self.heartbeat_loop(r, w, service).await,
            Err(e) => Err(e),
        };

        if self.evict(service, addr) {
            match &res {
                Err(RpcError::Timeout) => tracing::warn!(%service, %addr, "heartbeat timed out; endpoint evicted"),
                Err(e) if !e.is_eof() => tracing::warn!(%service, %addr, error = %e, "registration failed; endpoint evicted"),
                _ => tracing::info!(%service, %addr, "registration closed; endpoint evicted"),
            }
        }
        match res {
            Err(RpcError::ConnectionClosed) => Ok(()),
            other => other,
        }
    }

    /// Runs until a read times out or fails. Never returns `Ok`.
    async fn heartbeat_loop<R, W>(&self, r: &mut R, w: &mut W, service: &str) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let deadline = self.inner.opts.heartbeat_timeout;
        loop {
            let req: RegistryRequest = timeout(deadline, read_json_line(r, MAX_REGISTRY_MESSAGE_BYTES))
                .await
                .map_err(|_| RpcError::Timeout)??;

            let res = match req.op_type {
                OpType::HeartBeat => {
                    tracing::trace!(%service, "heartbeat");
                    RegistryResponse::status(STATUS_REGISTERED)
                }
                OpType::Discovery => self.discovery_response(&req.service_name),
                // One registration per connection.
                OpType::Register => RegistryResponse::status(STATUS_BAD_REQUEST),
            };
            write_json_line(w, &res).await?;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn lookup_dedups_and_keeps_order() {
        let reg = DiscoveryRegistry::default();
        reg.add("S", "b:1");
        reg.add("S", "a:1");
        reg.add("S", "b:1");
        assert_eq!(reg.lookup("S"), vec!["b:1".to_string(), "a:1".to_string()]);
        assert!(reg.lookup("T").is_empty());
    }

    #[test]
    fn evict_removes_one_registration() {
        let reg = DiscoveryRegistry::default();
        reg.add("S", "a:1");
        reg.add("S", "a:1");
        assert!(reg.evict("S", "a:1"));
        assert_eq!(reg.lookup("S"), vec!["a:1".to_string()]);
        assert!(reg.evict("S", "a:1"));
        assert!(reg.lookup("S").is_empty());
        assert!(!reg.evict("S", "a:1"));
        assert!(reg.services().is_empty());
    }

    #[tokio::test]
    async fn unknown_op_gets_bad_request() {
        let reg = DiscoveryRegistry::default();
        let (client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(async move { reg.handle_conn(server, "peer:1".into()).await });

        let (r, mut w) = tokio::io::split(client);
        w.write_all(b"{\"service_name\":\"S\",\"op_type\":\"Delete\"}\n")
            .await
            .unwrap();
        let mut r = BufReader::new(r);
        let res: RegistryResponse = read_json_line(&mut r, 1024).await.unwrap();
        assert_eq!(res.status, STATUS_BAD_REQUEST);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_after_the_deadline() {
        let reg = DiscoveryRegistry::new(RegistryOptions {
            heartbeat_timeout: Duration::from_millis(100),
        });
        let (_client, server) = tokio::io::duplex(1024);
        let res = tokio::time::timeout(Duration::from_secs(2), reg.handle_conn(server, "peer:1".into()))
            .await
            .expect("registry must give up on a silent connection");
        assert!(matches!(res, Err(RpcError::Timeout)));
        assert!(reg.services().is_empty());
    }

    #[tokio::test]
    async fn registration_lives_while_connection_heartbeats() {
        let reg = DiscoveryRegistry::new(RegistryOptions {
            heartbeat_timeout: Duration::from_millis(200),
        });
        let (client, server) = tokio::io::duplex(1024);
        let handle = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.handle_conn(server, "10.0.0.1:5555".into()).await })
        };

        let (r, mut w) = tokio::io::split(client);
        let mut r = BufReader::new(r);
        write_json_line(&mut w, &RegistryRequest::register("S", None)).await.unwrap();
        let res: RegistryResponse = read_json_line(&mut r, 1024).await.unwrap();
        assert_eq!(res.status, STATUS_REGISTERED);
        assert_eq!(reg.lookup("S"), vec!["10.0.0.1:5555".to_string()]);

        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            write_json_line(&mut w, &RegistryRequest::heartbeat("S")).await.unwrap();
            let ack: RegistryResponse = read_json_line(&mut r, 1024).await.unwrap();
            assert_eq!(ack.status, STATUS_REGISTERED);
        }
        assert_eq!(reg.lookup("S").len(), 1);

        // Go quiet past the timeout.
        let res = handle.await.unwrap();
        assert!(matches!(res, Err(RpcError::Timeout)));
        assert!(reg.lookup("S").is_empty());
    }
}
