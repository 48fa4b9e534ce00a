//! disco-services — the membership engine.
//!
//! Peer and broadcast registries, the liveness detector, the transports
//! and the `Disco` coordinator that wires them together.

pub mod broadcast;
pub mod coordinator;
pub mod liveness;
pub mod multicast;
pub mod peer;
pub mod transport;

pub use broadcast::{BroadcastTask, MessageHandler, Payload, TaskRegistry};
pub use coordinator::{Disco, DiscoError, DiscoEvent, Status};
pub use liveness::{Liveness, LivenessFactory, LivenessHandle, PhiAccrualDetector, PhiAccrualFactory};
pub use multicast::MulticastTransport;
pub use peer::{MergeOutcome, Peer, PeerError, PeerRegistry};
pub use transport::{Inbound, Listener, MemoryHub, MemoryTransport, Transport, TransportError};
