//! Mesh chat protocol engine.
//! Host-driven: no I/O; host passes link events, frames and ticks, and receives actions.

pub mod cache;
pub mod peers;
pub mod protocol;
pub mod router;
pub mod scheduler;
pub mod wire;

pub use cache::DuplicateCache;
pub use peers::{PeerInfo, PeerRegistry};
pub use protocol::{Message, MessageKind, MAX_PACKET_SIZE, MAX_TTL, PROTOCOL_VERSION};
pub use router::{LinkId, MeshEvent, OutboundAction, Router, RouterError};
pub use scheduler::AnnounceSchedule;
pub use wire::{decode, encode, DecodeError, EncodeError};
