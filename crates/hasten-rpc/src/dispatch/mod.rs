//! Service registry and method dispatch.
//!
//! Re-exports the registry and the descriptor types so downstream consumers can
//! depend on this module directly.

pub mod registry;
pub mod service;

pub use registry::ServiceRegistry;
pub use service::{MethodType, RpcService, Service, ServiceBuilder, Slot};
