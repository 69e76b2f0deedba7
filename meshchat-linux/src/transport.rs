//! Link transport: TCP server (incoming), TCP client (outbound to discovered or configured
//! peers), version handshake, length-prefixed mesh frames.
//!
//! Link state changes and received frames are pushed as `LinkEvent`s; the protocol
//! sequence consumes them one at a time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use meshchat_core::{LinkId, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::discovery;

const HANDSHAKE_SIZE: usize = 1 + 8; // version + instance id
const LEN_SIZE: usize = 4;
const MIN_REDIAL: Duration = Duration::from_millis(50);

/// Something that happened on a link, in the order the transport observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Up(LinkId),
    Down(LinkId),
    Bytes(LinkId, Vec<u8>),
}

/// Link layer consumed by the mesh service. Every call returns without waiting on I/O.
pub trait Transport: Send + 'static {
    /// Acquire the transport (listen, advertise, scan) and start reporting link events.
    fn start(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), TransportError>;
    /// Dial an endpoint once; success shows up later as `LinkEvent::Up`.
    fn connect(&self, endpoint: &str);
    /// Dial an endpoint now and again whenever nothing behind it is linked.
    fn keep_linked(&self, endpoint: &str);
    /// Queue one frame on a link.
    fn send(&self, link: LinkId, frame: Vec<u8>) -> Result<(), TransportError>;
    /// Drop every link and stop listening. In-flight writes may be lost.
    fn shutdown(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown link {0}")]
    UnknownLink(LinkId),
    #[error("link {0} closed")]
    LinkClosed(LinkId),
    #[error("frame of {0} bytes exceeds {MAX_PACKET_SIZE}")]
    FrameTooLarge(usize),
    #[error("transport already started")]
    AlreadyStarted,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct TcpOptions {
    pub listen_port: u16,
    /// UDP port for LAN discovery; `None` disables it.
    pub discovery_port: Option<u16>,
    /// How often unlinked `keep_linked` endpoints are dialled again.
    pub redial_interval: Duration,
}

struct LinkHandle {
    instance: u64,
    /// Dialled by us rather than accepted.
    outbound: bool,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    reader: Option<AbortHandle>,
}

struct Inner {
    instance: u64,
    options: TcpOptions,
    next_link: AtomicU64,
    links: Mutex<HashMap<LinkId, LinkHandle>>,
    dialing: Mutex<HashSet<String>>,
    /// Endpoints to keep linked, with the instance last found behind each.
    kept: Mutex<HashMap<String, Option<u64>>>,
    events: Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>,
    tasks: Mutex<Vec<AbortHandle>>,
}

/// TCP realisation of the addressable duplex link. Cheap to clone.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl TcpTransport {
    pub fn new(options: TcpOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                instance: rand::random(),
                options,
                next_link: AtomicU64::new(1),
                links: Mutex::new(HashMap::new()),
                dialing: Mutex::new(HashSet::new()),
                kept: Mutex::new(HashMap::new()),
                events: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Random id of this process, exchanged in the handshake and discovery beacon.
    pub fn instance(&self) -> u64 {
        self.inner.instance
    }

    pub fn listen_port(&self) -> u16 {
        self.inner.options.listen_port
    }

    pub fn is_linked(&self, instance: u64) -> bool {
        lock(&self.inner.links)
            .values()
            .any(|h| h.instance == instance)
    }

    fn emit(&self, event: LinkEvent) {
        if let Some(tx) = lock(&self.inner.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn track(&self, handle: AbortHandle) {
        lock(&self.inner.tasks).push(handle);
    }

    /// Both ends of a pair keep the connection dialled by the lower instance id,
    /// so crossed dials settle on the same stream.
    fn preferred(&self, remote: u64, outbound: bool) -> bool {
        outbound == (self.inner.instance < remote)
    }

    /// Bring up a link after a successful handshake. A second connection to an
    /// already linked instance replaces the first only if it is the preferred one.
    fn register(&self, stream: TcpStream, instance: u64, outbound: bool) {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let link = LinkId(self.inner.next_link.fetch_add(1, Ordering::Relaxed));
        let replaced = {
            let mut links = lock(&self.inner.links);
            let existing = links
                .iter()
                .find(|(_, h)| h.instance == instance)
                .map(|(l, h)| (*l, h.outbound));
            let replaced = match existing {
                Some((old, old_outbound))
                    if !self.preferred(instance, old_outbound)
                        && self.preferred(instance, outbound) =>
                {
                    if let Some(r) = links.remove(&old).and_then(|h| h.reader) {
                        r.abort();
                    }
                    Some(old)
                }
                Some(_) => {
                    debug!(instance, "already linked, dropping duplicate connection");
                    return;
                }
                None => None,
            };
            links.insert(
                link,
                LinkHandle {
                    instance,
                    outbound,
                    tx,
                    reader: None,
                },
            );
            replaced
        };
        if let Some(old) = replaced {
            debug!(%old, %link, instance, "crossed dial, keeping preferred connection");
            self.emit(LinkEvent::Down(old));
        }
        info!(%link, instance, "link established");
        tokio::spawn(write_loop(writer, rx, link));
        self.emit(LinkEvent::Up(link));

        let this = self.clone();
        let task = tokio::spawn(async move {
            read_loop(reader, link, &this).await;
            if this.remove(link) {
                this.emit(LinkEvent::Down(link));
            }
        });
        match lock(&self.inner.links).get_mut(&link) {
            Some(h) => h.reader = Some(task.abort_handle()),
            // Replaced before the reader was recorded.
            None => task.abort(),
        }
    }

    fn remove(&self, link: LinkId) -> bool {
        match lock(&self.inner.links).remove(&link) {
            Some(h) => {
                if let Some(r) = h.reader {
                    r.abort();
                }
                true
            }
            None => false,
        }
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        match handshake(stream, this.inner.instance).await {
                            Ok((stream, instance)) => this.register(stream, instance, false),
                            Err(e) => debug!(%addr, error = %e, "inbound handshake failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, listener stopped");
                    break;
                }
            }
        }
    }

    async fn dial(self, endpoint: String) {
        let result = async {
            let stream = TcpStream::connect(endpoint.as_str()).await?;
            handshake(stream, self.inner.instance).await
        }
        .await;
        match result {
            Ok((stream, instance)) => {
                if let Some(seen) = lock(&self.inner.kept).get_mut(&endpoint) {
                    *seen = Some(instance);
                }
                self.register(stream, instance, true);
            }
            Err(e) => debug!(%endpoint, error = %e, "dial failed"),
        }
        lock(&self.inner.dialing).remove(&endpoint);
    }

    /// Kept endpoints with no live link to the instance last found there.
    fn unlinked_endpoints(&self) -> Vec<String> {
        let kept = lock(&self.inner.kept);
        let links = lock(&self.inner.links);
        kept.iter()
            .filter(|(_, seen)| !seen.is_some_and(|i| links.values().any(|h| h.instance == i)))
            .map(|(endpoint, _)| endpoint.clone())
            .collect()
    }

    async fn redial_loop(self) {
        let period = self.inner.options.redial_interval.max(MIN_REDIAL);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for endpoint in self.unlinked_endpoints() {
                debug!(%endpoint, "redialling");
                self.connect(&endpoint);
            }
        }
    }
}

impl Transport for TcpTransport {
    fn start(&self, events: mpsc::UnboundedSender<LinkEvent>) -> Result<(), TransportError> {
        {
            let mut slot = lock(&self.inner.events);
            if slot.is_some() {
                return Err(TransportError::AlreadyStarted);
            }
            *slot = Some(events);
        }
        let std_listener = std::net::TcpListener::bind(("0.0.0.0", self.listen_port()))?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        info!(port = self.listen_port(), instance = self.inner.instance, "listening for links");
        let accept = tokio::spawn(self.clone().accept_loop(listener));
        self.track(accept.abort_handle());
        let redial = tokio::spawn(self.clone().redial_loop());
        self.track(redial.abort_handle());

        if let Some(port) = self.inner.options.discovery_port {
            let this = self.clone();
            let disc = tokio::spawn(async move {
                if let Err(e) = discovery::run_discovery(this, port).await {
                    warn!(error = %e, "discovery stopped");
                }
            });
            self.track(disc.abort_handle());
        }
        Ok(())
    }

    fn connect(&self, endpoint: &str) {
        if !lock(&self.inner.dialing).insert(endpoint.to_string()) {
            return;
        }
        let task = tokio::spawn(self.clone().dial(endpoint.to_string()));
        self.track(task.abort_handle());
    }

    fn keep_linked(&self, endpoint: &str) {
        lock(&self.inner.kept)
            .entry(endpoint.to_string())
            .or_insert(None);
        self.connect(endpoint);
    }

    fn send(&self, link: LinkId, frame: Vec<u8>) -> Result<(), TransportError> {
        if frame.len() > MAX_PACKET_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        let links = lock(&self.inner.links);
        let handle = links.get(&link).ok_or(TransportError::UnknownLink(link))?;
        handle
            .tx
            .send(frame)
            .map_err(|_| TransportError::LinkClosed(link))
    }

    fn shutdown(&self) {
        for task in lock(&self.inner.tasks).drain(..) {
            task.abort();
        }
        let links: Vec<LinkId> = lock(&self.inner.links).keys().copied().collect();
        for link in links {
            self.remove(link);
        }
        lock(&self.inner.events).take();
        info!("transport shut down");
    }
}

/// Exchange version + instance id. Refuses other versions and connections to ourselves.
async fn handshake(mut stream: TcpStream, instance: u64) -> std::io::Result<(TcpStream, u64)> {
    let mut out = [0u8; HANDSHAKE_SIZE];
    out[0] = PROTOCOL_VERSION;
    out[1..].copy_from_slice(&instance.to_be_bytes());
    stream.write_all(&out).await?;
    stream.flush().await?;

    let mut buf = [0u8; HANDSHAKE_SIZE];
    stream.read_exact(&mut buf).await?;
    if buf[0] != PROTOCOL_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&buf[1..]);
    let remote = u64::from_be_bytes(id);
    if remote == instance {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "connected to self",
        ));
    }
    Ok((stream, remote))
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    link: LinkId,
) {
    while let Some(frame) = rx.recv().await {
        let len = frame.len() as u32;
        let result = async {
            writer.write_all(&len.to_le_bytes()).await?;
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(%link, error = %e, "write failed");
            break;
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, link: LinkId, transport: &TcpTransport) {
    loop {
        let mut len_buf = [0u8; LEN_SIZE];
        if reader.read_exact(&mut len_buf).await.is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if len > MAX_PACKET_SIZE {
            warn!(%link, len, "oversized frame, closing link");
            break;
        }
        let mut frame = vec![0u8; len];
        if reader.read_exact(&mut frame).await.is_err() {
            break;
        }
        transport.emit(LinkEvent::Bytes(link, frame));
    }
}
