//! Top-level facade crate for hasten.
//!
//! Re-exports the wire contracts and the RPC runtime so users can depend on a single crate.

pub mod core {
    pub use hasten_core::*;
}

pub mod rpc {
    pub use hasten_rpc::*;
}
