use std::time::Duration;

use serde::Deserialize;

use hasten_core::error::{Result, RpcError};
use hasten_core::protocol::codec::DEFAULT_MAX_FRAME_BYTES;
use hasten_core::protocol::CodecType;

use crate::client::ClientOptions;
use crate::discovery::RegistryOptions;
use crate::server::ServerOptions;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HastenConfig {
    pub version: u32,

    /// RPC server. Absent: this process does not serve RPC.
    #[serde(default)]
    pub server: Option<ServerSection>,

    /// Discovery registry. Absent: this process does not host one.
    #[serde(default)]
    pub registry: Option<RegistrySection>,

    /// Self-registration of the RPC server with a registry.
    #[serde(default)]
    pub discovery: Option<DiscoverySection>,

    #[serde(default)]
    pub client: ClientSection,
}

impl HastenConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(RpcError::Config(format!("unsupported config version {}", self.version)));
        }
        if self.server.is_none() && self.registry.is_none() {
            return Err(RpcError::Config("at least one of server or registry must be set".into()));
        }

        if let Some(server) = &self.server {
            server.validate()?;
        }
        if let Some(registry) = &self.registry {
            registry.validate()?;
        }
        if let Some(discovery) = &self.discovery {
            if self.server.is_none() {
                return Err(RpcError::Config("discovery requires a server section".into()));
            }
            discovery.validate()?;
            if let Some(registry) = &self.registry {
                if discovery.heartbeat_interval_ms >= registry.heartbeat_timeout_ms {
                    return Err(RpcError::Config(
                        "discovery.heartbeat_interval_ms must be less than registry.heartbeat_timeout_ms".into(),
                    ));
                }
            }
        }
        self.client.validate()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_server_listen")]
    pub listen: String,

    #[serde(default)]
    pub codec: CodecType,

    /// 0 = wait forever for the next request.
    #[serde(default)]
    pub idle_timeout_ms: u64,

    /// A new connection must finish its handshake within this long.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_server_listen(),
            codec: CodecType::default(),
            idle_timeout_ms: 0,
            handshake_timeout_ms: default_handshake_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

impl ServerSection {
    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            return Err(RpcError::Config("server.listen must not be empty".into()));
        }
        self.codec
            .ensure_supported()
            .map_err(|e| RpcError::Config(format!("server.codec: {e}")))?;
        if self.handshake_timeout_ms == 0 {
            return Err(RpcError::Config("server.handshake_timeout_ms must be > 0".into()));
        }
        if self.max_frame_bytes < 1024 {
            return Err(RpcError::Config("server.max_frame_bytes must be at least 1024".into()));
        }
        Ok(())
    }

    pub fn options(&self) -> ServerOptions {
        ServerOptions {
            idle_timeout: millis(self.idle_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            write_timeout: millis(self.write_timeout_ms),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistrySection {
    #[serde(default = "default_registry_listen")]
    pub listen: String,

    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            listen: default_registry_listen(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
        }
    }
}

impl RegistrySection {
    pub fn validate(&self) -> Result<()> {
        if self.listen.trim().is_empty() {
            return Err(RpcError::Config("registry.listen must not be empty".into()));
        }
        if !(100..=600_000).contains(&self.heartbeat_timeout_ms) {
            return Err(RpcError::Config(
                "registry.heartbeat_timeout_ms must be between 100 and 600000".into(),
            ));
        }
        Ok(())
    }

    pub fn options(&self) -> RegistryOptions {
        RegistryOptions {
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoverySection {
    pub registry_addr: String,
    pub service_name: String,

    /// Address clients should dial. Defaults to `server.listen`.
    #[serde(default)]
    pub advertise_addr: Option<String>,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

impl DiscoverySection {
    pub fn validate(&self) -> Result<()> {
        if self.registry_addr.trim().is_empty() {
            return Err(RpcError::Config("discovery.registry_addr must not be empty".into()));
        }
        if self.service_name.trim().is_empty() {
            return Err(RpcError::Config("discovery.service_name must not be empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(RpcError::Config("discovery.heartbeat_interval_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientSection {
    /// 0 = wait as long as the connection lives.
    #[serde(default)]
    pub call_timeout_ms: u64,

    #[serde(default)]
    pub codec: CodecType,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            call_timeout_ms: 0,
            codec: CodecType::default(),
        }
    }
}

impl ClientSection {
    pub fn validate(&self) -> Result<()> {
        self.codec
            .ensure_supported()
            .map_err(|e| RpcError::Config(format!("client.codec: {e}")))
    }

    pub fn options(&self) -> ClientOptions {
        ClientOptions {
            codec: self.codec,
            call_timeout: millis(self.call_timeout_ms),
            ..ClientOptions::default()
        }
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn default_server_listen() -> String {
    "127.0.0.1:7070".into()
}
fn default_registry_listen() -> String {
    "127.0.0.1:7071".into()
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_write_timeout_ms() -> u64 {
    10_000
}
fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}
fn default_heartbeat_timeout_ms() -> u64 {
    5_000
}
fn default_heartbeat_interval_ms() -> u64 {
    3_000
}
