//! Built-in services.

pub mod compute;

pub use compute::{ComputeS1, TwoOperands};
