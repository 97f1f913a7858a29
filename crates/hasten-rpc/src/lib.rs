//! hasten RPC runtime.
//!
//! Wires the wire contracts from `hasten-core` into a working system: the
//! service registry and dispatcher, the server and the multiplexing client,
//! the discovery registry with heartbeat liveness, and endpoint balancing.
//! Consumed by the `hasten-rpc` binary and by integration tests.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

pub mod balancer;
pub mod client;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod server;
pub mod services;

pub use balancer::{new_balancer, BalanceStrategy, Balancer, RoundRobin};
pub use client::{Call, Client, ClientOptions};
pub use discovery::{Discovery, DiscoveryClient, DiscoveryRegistry, RegistrationHandle, RegistryOptions, StaticDiscovery};
pub use dispatch::{RpcService, Service, ServiceBuilder, ServiceRegistry};
pub use server::{Server, ServerOptions};
