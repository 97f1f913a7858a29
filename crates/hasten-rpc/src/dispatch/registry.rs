use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use hasten_core::error::{Result, RpcError};
use hasten_core::protocol::Header;

use super::service::{MethodType, RpcService, Service, ServiceBuilder};

/// Per-process table of exported services, keyed by service name.
///
/// Registration normally happens before serving; lookups never block each
/// other, so handlers can resolve methods concurrently.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<Service>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: DashMap::new(),
        }
    }

    /// Register a service instance under its type name.
    pub fn register_service<S: RpcService>(&self, instance: S) -> Result<()> {
        let svc = S::register_methods(ServiceBuilder::new(instance)).build()?;
        self.register(svc)
    }

    /// Register a prepared service. An existing name is never replaced.
    pub fn register(&self, svc: Service) -> Result<()> {
        match self.services.entry(svc.name().to_string()) {
            Entry::Occupied(e) => Err(RpcError::DuplicateService(e.key().clone())),
            Entry::Vacant(e) => {
                tracing::info!(service = %svc.name(), methods = ?svc.method_names(), "registered service");
                e.insert(Arc::new(svc));
                Ok(())
            }
        }
    }

    pub fn registered_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Resolve `"Service.Method"` (split on the last `.`).
    pub fn find(&self, header: &Header) -> Result<(Arc<Service>, Arc<MethodType>)> {
        let (svc_name, method_name) = header.split_method()?;
        let svc = self
            .services
            .get(svc_name)
            .ok_or_else(|| RpcError::UnknownService(svc_name.to_string()))?
            .value()
            .clone();
        let method = svc.method(method_name).ok_or_else(|| RpcError::UnknownMethod {
            service: svc_name.to_string(),
            method: method_name.to_string(),
        })?;
        Ok((svc, method))
    }
}
