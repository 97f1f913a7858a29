//! hasten core: transport-agnostic wire contracts, codecs, and error types.
//!
//! This crate defines the handshake, the `(Header, Body)` frame format, the
//! `Codec` seam and its default binary implementation, plus the discovery
//! wire messages. It carries no service or connection-management logic so
//! both the RPC runtime and test tooling can reuse it.
//!
//! # Defensive guarantees
//! Panics, `unwrap`, and `expect` are compile-denied here
//! (`#![deny(clippy::panic, clippy::unwrap_used, clippy::expect_used)]`).
//! Malformed input from a peer surfaces as `RpcError`, never as a crash.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod protocol;

/// Shared result type.
pub use error::{ErrorKind, Result, RpcError};
