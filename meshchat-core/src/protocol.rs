//! Mesh wire protocol: message kinds, the message record and protocol constants.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Link handshake version. Bumped on incompatible frame layout changes.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum relay hops a message may carry.
pub const MAX_TTL: u8 = 7;

/// Largest encoded frame a link will carry, in bytes.
pub const MAX_PACKET_SIZE: usize = 512;

/// A peer is active while its last announce/pong is younger than this (ms).
pub const PEER_TIMEOUT_MS: u64 = 60_000;

/// Dedup cache entries older than this are evicted on housekeeping (ms).
pub const CACHE_TTL_MS: u64 = 300_000;

/// Closed set of message kinds. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum MessageKind {
    Chat = 0x01,
    /// Tagged private but carried in plaintext; there is no payload encryption.
    Private = 0x02,
    JoinRoom = 0x03,
    Announce = 0x04,
    Ping = 0x05,
    Pong = 0x06,
    /// Reserved for payload fragmentation. Parsed, never reassembled.
    Fragment = 0x07,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0x01 => Self::Chat,
            0x02 => Self::Private,
            0x03 => Self::JoinRoom,
            0x04 => Self::Announce,
            0x05 => Self::Ping,
            0x06 => Self::Pong,
            0x07 => Self::Fragment,
            _ => return None,
        })
    }
}

/// One mesh message. `id` never changes while the message propagates; relays
/// only produce copies with a lower `ttl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: String,
    pub kind: MessageKind,
    pub sender: String,
    /// Chat text; the room name for JoinRoom; the echoed Ping id for Pong.
    pub content: String,
    /// Only meaningful for Chat. An empty room is normalised to `None`.
    pub room: Option<String>,
    pub ttl: u8,
    /// Producer wall clock, epoch milliseconds. Not used for ordering.
    pub timestamp: i64,
}

impl Message {
    /// New message with a fresh v4 UUID id, stamped now.
    pub fn new(kind: MessageKind, sender: &str, content: &str, ttl: u8) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            sender: sender.to_string(),
            content: content.to_string(),
            room: None,
            ttl: ttl.min(MAX_TTL),
            timestamp: epoch_millis(),
        }
    }

    pub fn with_room(mut self, room: Option<&str>) -> Self {
        self.room = room.filter(|r| !r.is_empty()).map(str::to_string);
        self
    }

    /// Copy for the next hop. Caller checks `ttl > 0` first.
    pub fn relayed(&self) -> Self {
        Self {
            ttl: self.ttl.saturating_sub(1),
            ..self.clone()
        }
    }

    pub fn is_private(&self) -> bool {
        self.kind == MessageKind::Private
    }
}

/// Wall clock in epoch milliseconds; 0 if the clock is before the epoch.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
