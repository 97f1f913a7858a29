//! Wire protocol modules.
//!
//! - `handshake`: the one-shot JSON line exchanged before any frame.
//! - `header`: the per-call envelope.
//! - `codec`: the `Codec` seam, codec selectors and the factory.
//! - `binary`: the default length-prefixed bincode codec.
//! - `discovery`: request/response messages of the discovery registry.
//! - `line`: newline-delimited JSON helpers shared by handshake and discovery.

pub mod binary;
pub mod codec;
pub mod discovery;
pub mod handshake;
pub mod header;
pub mod line;

pub use binary::BinaryCodec;
pub use codec::{new_codec, Codec, CodecConfig, CodecExt, CodecType};
pub use handshake::{Handshake, MAGIC_NUMBER};
pub use header::{Header, INVALID_SEQ};
