//! disco-core — configuration, wire format, and cryptographic primitives.
//! All other Disco crates depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use config::{ConfigOverrides, DiscoConfig};
pub use wire::{Envelope, Message, PeerInfo, DISCOVERY_TOPIC};
