//! Mesh service facade. One actor task owns the router and handles link events,
//! user commands and the announce tick strictly one at a time.

use std::time::Instant;

use meshchat_core::{
    AnnounceSchedule, EncodeError, MeshEvent, Message, OutboundAction, Router, RouterError,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::transport::{LinkEvent, Transport, TransportError};

/// Room every console starts in.
pub const DEFAULT_ROOM: &str = "general";

const EVENT_BUFFER: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("cannot encode message: {0}")]
    Encode(#[from] EncodeError),
    #[error("no connected link to peer {0}")]
    UnknownPeer(String),
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("mesh service stopped")]
    Stopped,
}

impl From<RouterError> for ServiceError {
    fn from(e: RouterError) -> Self {
        match e {
            RouterError::Encode(e) => ServiceError::Encode(e),
            RouterError::UnknownPeer(n) => ServiceError::UnknownPeer(n),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub nickname: String,
    pub schedule: AnnounceSchedule,
    /// Endpoints kept linked once the transport is up.
    pub peers: Vec<String>,
}

impl From<&Config> for ServiceOptions {
    fn from(c: &Config) -> Self {
        Self {
            nickname: c.nickname.clone(),
            schedule: c.schedule(),
            peers: c.peers.clone(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ServiceError>>;

enum Command {
    Send {
        content: String,
        room: Option<String>,
        private: bool,
        reply: Reply<Message>,
    },
    JoinRoom {
        room: String,
        reply: Reply<Message>,
    },
    Ping {
        nickname: String,
        reply: Reply<Message>,
    },
    SetNickname {
        nickname: String,
        reply: Reply<()>,
    },
    Nickname(oneshot::Sender<String>),
    ActivePeers(oneshot::Sender<Vec<String>>),
    Rooms(oneshot::Sender<Vec<String>>),
    Stop,
}

/// Running mesh. Dropping it ends the actor like `stop`, without waiting for it.
pub struct MeshService {
    inbox: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<MeshEvent>,
    task: JoinHandle<()>,
}

impl MeshService {
    /// Acquire the transport, keep configured peers linked and start the protocol actor.
    /// Must be called inside a tokio runtime.
    pub fn start<T: Transport>(transport: T, options: ServiceOptions) -> Result<Self, ServiceError> {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        transport.start(link_tx)?;
        for peer in &options.peers {
            transport.keep_linked(peer);
        }
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        info!(nickname = %options.nickname, "mesh service started");
        let actor = Actor {
            router: Router::new(options.nickname),
            transport,
            events: events.clone(),
            rooms: vec![DEFAULT_ROOM.to_string()],
            origin: Instant::now(),
        };
        let task = tokio::spawn(actor.run(inbox_rx, link_rx, options.schedule));
        Ok(Self {
            inbox,
            events,
            task,
        })
    }

    /// Stream of inbound messages, local echoes and peer changes.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    async fn request<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> Command) -> Result<R, ServiceError> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(make(tx)).map_err(|_| ServiceError::Stopped)?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    /// Broadcast a Chat (or plaintext Private) message with full hop budget; returns it.
    pub async fn send_message(
        &self,
        content: &str,
        room: Option<&str>,
        private: bool,
    ) -> Result<Message, ServiceError> {
        self.request(|reply| Command::Send {
            content: content.to_string(),
            room: room.map(str::to_string),
            private,
            reply,
        })
        .await?
    }

    /// Broadcast a JoinRoom and remember the room locally. No acknowledgment.
    pub async fn join_room(&self, room: &str) -> Result<Message, ServiceError> {
        self.request(|reply| Command::JoinRoom {
            room: room.to_string(),
            reply,
        })
        .await?
    }

    pub async fn ping(&self, nickname: &str) -> Result<Message, ServiceError> {
        self.request(|reply| Command::Ping {
            nickname: nickname.to_string(),
            reply,
        })
        .await?
    }

    /// Fails with `Encode` if the name does not fit the `sender` field.
    pub async fn set_nickname(&self, nickname: &str) -> Result<(), ServiceError> {
        self.request(|reply| Command::SetNickname {
            nickname: nickname.to_string(),
            reply,
        })
        .await?
    }

    pub async fn nickname(&self) -> Result<String, ServiceError> {
        self.request(Command::Nickname).await
    }

    pub async fn active_peers(&self) -> Result<Vec<String>, ServiceError> {
        self.request(Command::ActivePeers).await
    }

    pub async fn rooms(&self) -> Result<Vec<String>, ServiceError> {
        self.request(Command::Rooms).await
    }

    /// Cancel the tick, drop every link and release the transport.
    pub async fn stop(self) {
        let _ = self.inbox.send(Command::Stop);
        if let Err(e) = self.task.await {
            warn!(error = %e, "mesh actor ended abnormally");
        }
    }
}

struct Actor<T> {
    router: Router,
    transport: T,
    events: broadcast::Sender<MeshEvent>,
    rooms: Vec<String>,
    origin: Instant,
}

impl<T: Transport> Actor<T> {
    fn now(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Command>,
        mut links: mpsc::UnboundedReceiver<LinkEvent>,
        schedule: AnnounceSchedule,
    ) {
        let start = tokio::time::Instant::now() + schedule.initial_delay;
        let mut ticker = tokio::time::interval_at(start, schedule.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = inbox.recv() => match cmd {
                    Some(Command::Stop) | None => break,
                    Some(cmd) => self.on_command(cmd),
                },
                Some(event) = links.recv() => self.on_link_event(event),
                _ = ticker.tick() => {
                    let actions = self.router.tick(self.now());
                    self.perform(actions);
                }
            }
        }
        self.transport.shutdown();
        info!("mesh service stopped");
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        let now = self.now();
        match event {
            LinkEvent::Up(link) => {
                let actions = self.router.on_link_up(link, now);
                self.perform(actions);
            }
            LinkEvent::Down(link) => self.router.on_link_down(link),
            LinkEvent::Bytes(link, bytes) => {
                let actions = self.router.handle(&bytes, link, now);
                self.perform(actions);
            }
        }
    }

    fn on_command(&mut self, cmd: Command) {
        let now = self.now();
        match cmd {
            Command::Send {
                content,
                room,
                private,
                reply,
            } => {
                let result = self.router.send_message(&content, room.as_deref(), private, now);
                let _ = reply.send(self.finish(result.map_err(ServiceError::from)));
            }
            Command::JoinRoom { room, reply } => {
                let result = self.router.join_room(&room, now);
                let result = self.finish(result.map_err(ServiceError::from));
                if result.is_ok() && !self.rooms.contains(&room) {
                    self.rooms.push(room);
                }
                let _ = reply.send(result);
            }
            Command::Ping { nickname, reply } => {
                let result = self.router.ping(&nickname, now);
                let _ = reply.send(self.finish(result.map_err(ServiceError::from)));
            }
            Command::SetNickname { nickname, reply } => {
                let result = self.router.set_nickname(nickname.as_str());
                if result.is_ok() {
                    info!(%nickname, "nickname changed");
                }
                let _ = reply.send(result.map_err(ServiceError::from));
            }
            Command::Nickname(reply) => {
                let _ = reply.send(self.router.nickname().to_string());
            }
            Command::ActivePeers(reply) => {
                let _ = reply.send(self.router.active_peers());
            }
            Command::Rooms(reply) => {
                let _ = reply.send(self.rooms.clone());
            }
            Command::Stop => {}
        }
    }

    fn finish(
        &mut self,
        result: Result<(Message, Vec<OutboundAction>), ServiceError>,
    ) -> Result<Message, ServiceError> {
        let (msg, actions) = result?;
        self.perform(actions);
        Ok(msg)
    }

    /// Sends are queued per link; one failing link never stops the others.
    fn perform(&mut self, actions: Vec<OutboundAction>) {
        for action in actions {
            match action {
                OutboundAction::Send(link, frame) => {
                    if let Err(e) = self.transport.send(link, frame) {
                        warn!(%link, error = %e, "send failed");
                    }
                }
                OutboundAction::Emit(event) => {
                    debug!(?event, "event");
                    let _ = self.events.send(event);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use meshchat_core::{decode, encode, LinkId, MessageKind};

    use super::*;

    #[derive(Default)]
    struct MockState {
        events: Option<mpsc::UnboundedSender<LinkEvent>>,
        kept: Vec<String>,
        sent: Vec<(LinkId, Message)>,
        failing: HashSet<LinkId>,
        shut_down: bool,
    }

    #[derive(Clone, Default)]
    struct MockTransport(Arc<Mutex<MockState>>);

    impl MockTransport {
        fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
            self.0.lock().unwrap()
        }

        fn inject(&self, event: LinkEvent) {
            self.state().events.as_ref().unwrap().send(event).unwrap();
        }

        fn sent_on(&self, link: LinkId) -> Vec<Message> {
            self.state()
                .sent
                .iter()
                .filter(|(l, _)| *l == link)
                .map(|(_, m)| m.clone())
                .collect()
        }

        /// Bring a link up and wait until the greeting went out on it.
        async fn link_up(&self, link: LinkId) {
            self.inject(LinkEvent::Up(link));
            eventually(|| !self.sent_on(link).is_empty()).await;
        }
    }

    impl Transport for MockTransport {
        fn start(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), TransportError> {
            self.state().events = Some(events);
            Ok(())
        }

        fn connect(&self, _endpoint: &str) {}

        fn keep_linked(&self, endpoint: &str) {
            self.state().kept.push(endpoint.to_string());
        }

        fn send(&self, link: LinkId, frame: Vec<u8>) -> Result<(), TransportError> {
            let mut s = self.state();
            if s.failing.contains(&link) {
                return Err(TransportError::LinkClosed(link));
            }
            s.sent.push((link, decode(&frame).unwrap()));
            Ok(())
        }

        fn shutdown(&self) {
            self.state().shut_down = true;
        }
    }

    async fn eventually(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn next_event(rx: &mut broadcast::Receiver<MeshEvent>) -> MeshEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .unwrap()
    }

    fn options() -> ServiceOptions {
        ServiceOptions {
            nickname: "alice".into(),
            schedule: AnnounceSchedule::new(Duration::from_secs(3600), Duration::from_secs(3600)),
            peers: vec!["10.0.0.2:45780".into()],
        }
    }

    #[tokio::test]
    async fn start_dials_peers_and_stop_releases_transport() {
        let transport = MockTransport::default();
        let service = MeshService::start(transport.clone(), options()).unwrap();
        assert_eq!(transport.state().kept, vec!["10.0.0.2:45780".to_string()]);
        service.stop().await;
        assert!(transport.state().shut_down);
    }

    #[tokio::test]
    async fn send_message_fans_out_and_echoes() {
        let transport = MockTransport::default();
        let service = MeshService::start(transport.clone(), options()).unwrap();
        let mut events = service.subscribe();
        transport.link_up(LinkId(1)).await;
        transport.link_up(LinkId(2)).await;

        let msg = service.send_message("hi all", Some("general"), false).await.unwrap();
        assert_eq!(msg.kind, MessageKind::Chat);
        assert_eq!(msg.ttl, meshchat_core::MAX_TTL);
        assert_eq!(msg.sender, "alice");
        for link in [LinkId(1), LinkId(2)] {
            assert!(transport.sent_on(link).contains(&msg));
        }
        assert_eq!(
            next_event(&mut events).await,
            MeshEvent::MessageSent { message: msg }
        );
        service.stop().await;
    }

    #[tokio::test]
    async fn failing_link_does_not_block_others() {
        let transport = MockTransport::default();
        let service = MeshService::start(transport.clone(), options()).unwrap();
        transport.link_up(LinkId(1)).await;
        transport.link_up(LinkId(2)).await;
        transport.state().failing.insert(LinkId(1));

        let msg = service.send_message("still works", None, true).await.unwrap();
        assert!(msg.is_private());
        assert!(transport.sent_on(LinkId(2)).contains(&msg));
        assert!(!transport.sent_on(LinkId(1)).contains(&msg));
        service.stop().await;
    }

    #[tokio::test]
    async fn inbound_chat_is_emitted_and_relayed() {
        let transport = MockTransport::default();
        let service = MeshService::start(transport.clone(), options()).unwrap();
        let mut events = service.subscribe();
        transport.link_up(LinkId(1)).await;
        transport.link_up(LinkId(2)).await;

        let chat = Message::new(MessageKind::Chat, "bob", "hello alice", 3);
        transport.inject(LinkEvent::Bytes(LinkId(1), encode(&chat).unwrap()));
        assert_eq!(
            next_event(&mut events).await,
            MeshEvent::MessageReceived {
                message: chat.clone()
            }
        );
        eventually(|| transport.sent_on(LinkId(2)).iter().any(|m| m.id == chat.id)).await;
        let relayed = transport
            .sent_on(LinkId(2))
            .into_iter()
            .find(|m| m.id == chat.id)
            .unwrap();
        assert_eq!(relayed.ttl, 2);
        assert!(!transport.sent_on(LinkId(1)).iter().any(|m| m.id == chat.id));
        service.stop().await;
    }

    #[tokio::test]
    async fn announce_makes_peer_active_and_pingable() {
        let transport = MockTransport::default();
        let service = MeshService::start(transport.clone(), options()).unwrap();
        let mut events = service.subscribe();
        assert!(matches!(
            service.ping("bob").await,
            Err(ServiceError::UnknownPeer(_))
        ));

        transport.link_up(LinkId(1)).await;
        let announce = Message::new(MessageKind::Announce, "bob", "", 1);
        transport.inject(LinkEvent::Bytes(LinkId(1), encode(&announce).unwrap()));
        assert_eq!(
            next_event(&mut events).await,
            MeshEvent::PeerJoined {
                nickname: "bob".into()
            }
        );
        assert_eq!(service.active_peers().await.unwrap(), vec!["bob".to_string()]);

        let ping = service.ping("bob").await.unwrap();
        assert!(transport.sent_on(LinkId(1)).contains(&ping));
        service.stop().await;
    }

    #[tokio::test]
    async fn rooms_and_nickname_are_local_state() {
        let transport = MockTransport::default();
        let service = MeshService::start(transport.clone(), options()).unwrap();
        transport.link_up(LinkId(1)).await;

        service.set_nickname("alicia").await.unwrap();
        let join = service.join_room("rust").await.unwrap();
        assert_eq!(join.kind, MessageKind::JoinRoom);
        assert_eq!(join.sender, "alicia");
        assert_eq!(join.content, "rust");
        service.join_room("rust").await.unwrap();
        assert_eq!(
            service.rooms().await.unwrap(),
            vec!["general".to_string(), "rust".to_string()]
        );
        assert_eq!(service.nickname().await.unwrap(), "alicia");
        service.stop().await;
    }

    #[tokio::test]
    async fn refused_room_and_nickname_leave_state_untouched() {
        let transport = MockTransport::default();
        let service = MeshService::start(transport.clone(), options()).unwrap();
        transport.link_up(LinkId(1)).await;

        for len in [300, 600] {
            let room = "r".repeat(len);
            assert!(matches!(
                service.join_room(&room).await,
                Err(ServiceError::Encode(_))
            ));
        }
        assert_eq!(service.rooms().await.unwrap(), vec!["general".to_string()]);

        assert!(matches!(
            service.set_nickname(&"n".repeat(300)).await,
            Err(ServiceError::Encode(_))
        ));
        assert_eq!(service.nickname().await.unwrap(), "alice");
        let msg = service.send_message("hi", Some("general"), false).await.unwrap();
        assert_eq!(msg.sender, "alice");
        service.stop().await;
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let transport = MockTransport::default();
        let service = MeshService::start(transport.clone(), options()).unwrap();
        transport.link_up(LinkId(1)).await;
        let before = transport.sent_on(LinkId(1)).len();
        let err = service
            .send_message(&"x".repeat(1000), None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Encode(_)));
        assert_eq!(transport.sent_on(LinkId(1)).len(), before);
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn tick_announces_after_initial_delay() {
        let transport = MockTransport::default();
        let mut opts = options();
        opts.schedule = AnnounceSchedule::new(Duration::from_secs(5), Duration::from_secs(30));
        let service = MeshService::start(transport.clone(), opts).unwrap();
        transport.inject(LinkEvent::Up(LinkId(1)));
        tokio::time::sleep(Duration::from_secs(6)).await;
        let announces = transport
            .sent_on(LinkId(1))
            .into_iter()
            .filter(|m| m.kind == MessageKind::Announce && m.ttl == meshchat_core::MAX_TTL)
            .count();
        assert_eq!(announces, 1);
        service.stop().await;
    }
}
