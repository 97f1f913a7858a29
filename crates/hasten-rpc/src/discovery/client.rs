use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};

use hasten_core::error::{Result, RpcError};
use hasten_core::protocol::discovery::{
    RegistryRequest, RegistryResponse, MAX_REGISTRY_MESSAGE_BYTES, STATUS_FOUND, STATUS_NOT_FOUND,
    STATUS_REGISTERED,
};
use hasten_core::protocol::line::{read_json_line, write_json_line};

use super::Discovery;

const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Talks to a discovery registry: one-shot lookups and long-lived registrations.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    registry_addr: String,
    io_timeout: Duration,
}

impl DiscoveryClient {
    pub fn new(registry_addr: impl Into<String>) -> Self {
        Self {
            registry_addr: registry_addr.into(),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    async fn exchange(&self, req: &RegistryRequest) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf, RegistryResponse)> {
        let stream = timeout(self.io_timeout, TcpStream::connect(&self.registry_addr))
            .await
            .map_err(|_| RpcError::Timeout)??;
        let (r, mut w) = stream.into_split();
        let mut r = BufReader::new(r);

        write_json_line(&mut w, req).await?;
        let res: RegistryResponse = timeout(self.io_timeout, read_json_line(&mut r, MAX_REGISTRY_MESSAGE_BYTES))
            .await
            .map_err(|_| RpcError::Timeout)??;
        Ok((r, w, res))
    }

    /// Live addresses of `service`. A `"404"` answer is `ServiceNotFound`.
    pub async fn discover(&self, service: &str) -> Result<Vec<String>> {
        let (_r, mut w, res) = self.exchange(&RegistryRequest::discovery(service)).await?;
        if let Err(e) = w.shutdown().await {
            tracing::debug!(error = %e, "registry connection shutdown failed");
        }

        match res.status.as_str() {
            STATUS_FOUND => match res.data {
                Some(addrs) if !addrs.is_empty() => {
                    tracing::debug!(%service, ?addrs, "discovered");
                    Ok(addrs)
                }
                _ => Err(RpcError::ServiceNotFound(service.to_string())),
            },
            STATUS_NOT_FOUND => Err(RpcError::ServiceNotFound(service.to_string())),
            other => Err(RpcError::Protocol(format!("unexpected discovery status {other:?}"))),
        }
    }

    /// Register `service` (at `advertise_addr`, or the address the registry
    /// observes) and keep it alive with a heartbeat every `interval`.
    pub async fn register(
        &self,
        service: &str,
        advertise_addr: Option<String>,
        interval: Duration,
    ) -> Result<RegistrationHandle> {
        if interval.is_zero() {
            return Err(RpcError::Config("heartbeat interval must be > 0".into()));
        }

        let req = RegistryRequest::register(service, advertise_addr.clone());
        let (r, w, res) = self.exchange(&req).await?;
        if res.status != STATUS_REGISTERED {
            return Err(RpcError::Protocol(format!(
                "registry refused registration of {service:?} (status {:?})",
                res.status
            )));
        }
        tracing::info!(
            %service,
            registry = %self.registry_addr,
            advertise = ?advertise_addr,
            interval_ms = interval.as_millis() as u64,
            "registered with discovery registry"
        );

        let task = tokio::spawn(heartbeat_loop(r, w, service.to_string(), interval, self.io_timeout));
        Ok(RegistrationHandle {
            service: service.to_string(),
            task,
        })
    }
}

#[async_trait]
impl Discovery for DiscoveryClient {
    async fn discover(&self, service: &str) -> Result<Vec<String>> {
        DiscoveryClient::discover(self, service).await
    }
}

async fn heartbeat_loop(
    mut r: BufReader<OwnedReadHalf>,
    mut w: OwnedWriteHalf,
    service: String,
    interval: Duration,
    io_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; registration just happened.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let beat = async {
            write_json_line(&mut w, &RegistryRequest::heartbeat(&service)).await?;
            let ack: RegistryResponse = timeout(io_timeout, read_json_line(&mut r, MAX_REGISTRY_MESSAGE_BYTES))
                .await
                .map_err(|_| RpcError::Timeout)??;
            if ack.status != STATUS_REGISTERED {
                return Err(RpcError::Protocol(format!("heartbeat rejected (status {:?})", ack.status)));
            }
            Ok(())
        };
        if let Err(e) = beat.await {
            tracing::warn!(%service, error = %e, "heartbeat failed; registration lost");
            return;
        }
        tracing::trace!(%service, "heartbeat acked");
    }
}

/// Keeps a registration alive. Dropping it stops the heartbeats, and the
/// registry evicts the endpoint once its timeout passes.
#[derive(Debug)]
pub struct RegistrationHandle {
    service: String,
    task: JoinHandle<()>,
}

impl RegistrationHandle {
    pub fn service(&self) -> &str {
        &self.service
    }

    /// True once heartbeats stopped on their own (registry gone or refused).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop heartbeating and close the registration connection.
    pub async fn stop(self) {
        self.task.abort();
        tracing::info!(service = %self.service, "registration stopped");
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Fixed service table, for tests and setups without a registry.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    services: HashMap<String, Vec<String>>,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>, addrs: Vec<String>) -> Self {
        self.services.insert(service.into(), addrs);
        self
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self, service: &str) -> Result<Vec<String>> {
        match self.services.get(service) {
            Some(addrs) if !addrs.is_empty() => Ok(addrs.clone()),
            _ => Err(RpcError::ServiceNotFound(service.to_string())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_discovery_reports_missing_services() {
        let d = StaticDiscovery::new()
            .with_service("A", vec!["127.0.0.1:1".into()])
            .with_service("Empty", vec![]);
        assert_eq!(d.discover("A").await.unwrap(), vec!["127.0.0.1:1".to_string()]);
        assert!(matches!(d.discover("Empty").await, Err(RpcError::ServiceNotFound(_))));
        assert!(matches!(d.discover("B").await, Err(RpcError::ServiceNotFound(_))));
    }

    #[tokio::test]
    async fn zero_interval_is_rejected_before_dialing() {
        let c = DiscoveryClient::new("127.0.0.1:1");
        let err = c.register("S", None, Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, RpcError::Config(_)));
    }
}
