//! Host-driven flood router: the host passes link events, received frames and ticks;
//! the router returns actions (frames to send per link, events for the UI).
//!
//! All calls are expected from one logical sequence. The router owns the dedup
//! cache, the peer registry and the connected-links table.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::DuplicateCache;
use crate::peers::PeerRegistry;
use crate::protocol::{Message, MessageKind, CACHE_TTL_MS, MAX_TTL};
use crate::wire::{self, EncodeError};

/// Opaque handle for one duplex link to a neighbour, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Events surfaced to whoever consumes the mesh (UI, console).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MeshEvent {
    /// Chat or Private message from the mesh. Private content is plaintext.
    MessageReceived { message: Message },
    /// Locally originated Chat or Private message, echoed back.
    MessageSent { message: Message },
    PeerJoined { nickname: String },
    PeerLeft { nickname: String },
}

/// Action for the host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Write one encoded frame to a link. Failures stay local to that link.
    Send(LinkId, Vec<u8>),
    Emit(MeshEvent),
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("no connected link to peer {0}")]
    UnknownPeer(String),
}

/// Flood relay state machine.
pub struct Router {
    nickname: String,
    cache: DuplicateCache,
    peers: PeerRegistry,
    links: BTreeSet<LinkId>,
    /// Last published active-peer projection, diffed to produce join/leave events.
    active: BTreeSet<String>,
}

impl Router {
    pub fn new(nickname: impl Into<String>) -> Self {
        Self {
            nickname: nickname.into(),
            cache: DuplicateCache::new(),
            peers: PeerRegistry::new(),
            links: BTreeSet::new(),
            active: BTreeSet::new(),
        }
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Rejects names the `sender` field cannot carry; the old name stays in effect.
    pub fn set_nickname(&mut self, nickname: impl Into<String>) -> Result<(), EncodeError> {
        let nickname = nickname.into();
        wire::short_field("sender", &nickname)?;
        self.nickname = nickname;
        Ok(())
    }

    pub fn peers(&self) -> &PeerRegistry {
        &self.peers
    }

    pub fn cache(&self) -> &DuplicateCache {
        &self.cache
    }

    /// Active peers as of the last projection sync (announce, pong or tick).
    pub fn active_peers(&self) -> Vec<String> {
        self.active.iter().cloned().collect()
    }

    /// Link came up: track it and greet the neighbour with a one-hop announce.
    pub fn on_link_up(&mut self, link: LinkId, now: u64) -> Vec<OutboundAction> {
        if !self.links.insert(link) {
            return vec![];
        }
        info!(%link, "link up");
        let hello = Message::new(MessageKind::Announce, &self.nickname, "", 1);
        match wire::encode(&hello) {
            Ok(frame) => {
                self.cache.should_process(&hello.id, now);
                vec![OutboundAction::Send(link, frame)]
            }
            Err(e) => {
                warn!(%link, error = %e, "cannot encode link greeting");
                vec![]
            }
        }
    }

    pub fn on_link_down(&mut self, link: LinkId) {
        if self.links.remove(&link) {
            info!(%link, "link down");
        }
    }

    /// Originate a Chat (or Private, plaintext) message with full hop budget.
    pub fn send_message(
        &mut self,
        content: &str,
        room: Option<&str>,
        private: bool,
        now: u64,
    ) -> Result<(Message, Vec<OutboundAction>), EncodeError> {
        let kind = if private {
            MessageKind::Private
        } else {
            MessageKind::Chat
        };
        let msg = Message::new(kind, &self.nickname, content, MAX_TTL).with_room(room);
        let mut actions = self.broadcast(&msg, now)?;
        actions.push(OutboundAction::Emit(MeshEvent::MessageSent {
            message: msg.clone(),
        }));
        Ok((msg, actions))
    }

    /// Announce joining a room. Fire-and-forget; nothing tracks membership.
    pub fn join_room(
        &mut self,
        room: &str,
        now: u64,
    ) -> Result<(Message, Vec<OutboundAction>), EncodeError> {
        // Chat messages carry the room in a one-byte-prefixed field.
        wire::short_field("room", room)?;
        let msg = Message::new(MessageKind::JoinRoom, &self.nickname, room, MAX_TTL);
        let actions = self.broadcast(&msg, now)?;
        Ok((msg, actions))
    }

    /// Unicast a Ping to the link a peer was last heard on. The Pong that comes
    /// back refreshes that neighbour's liveness.
    pub fn ping(
        &mut self,
        nickname: &str,
        now: u64,
    ) -> Result<(Message, Vec<OutboundAction>), RouterError> {
        let link = self
            .peers
            .get(nickname)
            .map(|p| p.address)
            .filter(|l| self.links.contains(l))
            .ok_or_else(|| RouterError::UnknownPeer(nickname.to_string()))?;
        let ping = Message::new(MessageKind::Ping, &self.nickname, "", 0);
        let frame = wire::encode(&ping)?;
        self.cache.should_process(&ping.id, now);
        Ok((ping, vec![OutboundAction::Send(link, frame)]))
    }

    /// Record `msg` as seen, then send it to every connected link.
    pub fn broadcast(&mut self, msg: &Message, now: u64) -> Result<Vec<OutboundAction>, EncodeError> {
        let frame = wire::encode(msg)?;
        self.cache.should_process(&msg.id, now);
        Ok(self.fan_out(frame, None))
    }

    fn fan_out(&self, frame: Vec<u8>, except: Option<LinkId>) -> Vec<OutboundAction> {
        self.links
            .iter()
            .filter(|&&l| Some(l) != except)
            .map(|&l| OutboundAction::Send(l, frame.clone()))
            .collect()
    }

    /// Process a frame that arrived on `arrival`. Malformed frames and
    /// duplicates are dropped; nothing here is fatal.
    pub fn handle(&mut self, bytes: &[u8], arrival: LinkId, now: u64) -> Vec<OutboundAction> {
        let msg = match wire::decode(bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(link = %arrival, error = %e, "dropping malformed frame");
                return vec![];
            }
        };
        if !self.cache.should_process(&msg.id, now) {
            return vec![];
        }
        debug!(link = %arrival, msg_id = %msg.id, kind = ?msg.kind, ttl = msg.ttl, "received");

        let mut actions = Vec::new();
        match msg.kind {
            MessageKind::Announce => {
                self.peers.upsert(&msg.sender, arrival, now);
                self.sync_active(now, &mut actions);
            }
            MessageKind::Chat => {
                actions.push(OutboundAction::Emit(MeshEvent::MessageReceived {
                    message: msg.clone(),
                }));
            }
            MessageKind::Private => {
                debug!(sender = %msg.sender, "private message (plaintext)");
                actions.push(OutboundAction::Emit(MeshEvent::MessageReceived {
                    message: msg.clone(),
                }));
            }
            MessageKind::JoinRoom => {
                info!(sender = %msg.sender, room = %msg.content, "peer joined room");
            }
            MessageKind::Ping => self.reply_pong(&msg, arrival, now, &mut actions),
            MessageKind::Pong => {
                if self.peers.touch(&msg.sender, now) {
                    self.sync_active(now, &mut actions);
                }
            }
            MessageKind::Fragment => {
                debug!(msg_id = %msg.id, "fragment ignored, no reassembly");
            }
        }

        if msg.ttl > 0 {
            match wire::encode(&msg.relayed()) {
                Ok(frame) => actions.extend(self.fan_out(frame, Some(arrival))),
                Err(e) => warn!(msg_id = %msg.id, error = %e, "cannot relay"),
            }
        }
        actions
    }

    fn reply_pong(
        &mut self,
        ping: &Message,
        arrival: LinkId,
        now: u64,
        actions: &mut Vec<OutboundAction>,
    ) {
        if !self.links.contains(&arrival) {
            return;
        }
        let pong = Message::new(MessageKind::Pong, &self.nickname, &ping.id, 1);
        match wire::encode(&pong) {
            Ok(frame) => {
                self.cache.should_process(&pong.id, now);
                actions.push(OutboundAction::Send(arrival, frame));
            }
            Err(e) => warn!(error = %e, "cannot encode pong"),
        }
    }

    /// Periodic announce and housekeeping: self-announce when linked, evict old
    /// dedup entries, recompute the active-peer projection.
    pub fn tick(&mut self, now: u64) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if !self.links.is_empty() {
            let announce = Message::new(MessageKind::Announce, &self.nickname, "", MAX_TTL);
            match self.broadcast(&announce, now) {
                Ok(sends) => actions.extend(sends),
                Err(e) => warn!(error = %e, "cannot encode announce"),
            }
        }
        let evicted = self.cache.evict_older_than(now.saturating_sub(CACHE_TTL_MS));
        if evicted > 0 {
            debug!(evicted, remaining = self.cache.len(), "dedup cache evicted");
        }
        self.sync_active(now, &mut actions);
        actions
    }

    fn sync_active(&mut self, now: u64, actions: &mut Vec<OutboundAction>) {
        let current = self.peers.active_nicknames(now);
        for nickname in current.difference(&self.active) {
            info!(%nickname, "peer active");
            actions.push(OutboundAction::Emit(MeshEvent::PeerJoined {
                nickname: nickname.clone(),
            }));
        }
        for nickname in self.active.difference(&current) {
            info!(%nickname, "peer inactive");
            actions.push(OutboundAction::Emit(MeshEvent::PeerLeft {
                nickname: nickname.clone(),
            }));
        }
        self.active = current;
    }
}
