//! Service discovery: the registry server, its client, and the lookup seam
//! the RPC client dials through.

mod client;
mod registry;

use async_trait::async_trait;

use hasten_core::error::Result;

pub use client::{DiscoveryClient, RegistrationHandle, StaticDiscovery};
pub use registry::{DiscoveryRegistry, RegistryOptions, DEFAULT_HEARTBEAT_TIMEOUT};

/// Resolves a service name to the addresses currently serving it.
///
/// Implementations return `ServiceNotFound` rather than an empty list.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self, service: &str) -> Result<Vec<String>>;
}
