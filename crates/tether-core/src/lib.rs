//! tether-core — envelope model, line codec, content digests and config.
//! The other tether crates depend on this one.

pub mod config;
pub mod digest;
pub mod envelope;
pub mod wire;

pub use envelope::{Body, Envelope, FileChunk, Kind};
