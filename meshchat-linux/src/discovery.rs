//! LAN discovery: UDP multicast beacon (advertise) and beacon listener (scan).
//! Hearing an unlinked instance makes the side with the lower instance id dial it.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use meshchat_core::PROTOCOL_VERSION;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::transport::{TcpTransport, Transport};

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);
const MAGIC: &[u8; 4] = b"MSHC";
const BEACON_SIZE: usize = 4 + 1 + 8 + 2;

/// Advertised presence of one mesh instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub instance: u64,
    pub listen_port: u16,
}

impl Beacon {
    pub fn to_bytes(self) -> [u8; BEACON_SIZE] {
        let mut out = [0u8; BEACON_SIZE];
        out[..4].copy_from_slice(MAGIC);
        out[4] = PROTOCOL_VERSION;
        out[5..13].copy_from_slice(&self.instance.to_be_bytes());
        out[13..].copy_from_slice(&self.listen_port.to_be_bytes());
        out
    }

    /// `None` for foreign traffic or other protocol versions.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() != BEACON_SIZE || &buf[..4] != MAGIC || buf[4] != PROTOCOL_VERSION {
            return None;
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[5..13]);
        Some(Self {
            instance: u64::from_be_bytes(id),
            listen_port: u16::from_be_bytes([buf[13], buf[14]]),
        })
    }
}

/// Whether we should dial the instance behind `beacon`.
fn should_dial(own: u64, beacon: &Beacon, linked: bool) -> bool {
    beacon.instance != own && !linked && own < beacon.instance
}

pub async fn run_discovery(transport: TcpTransport, discovery_port: u16) -> std::io::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    info!(port = discovery_port, "discovery running");

    let beacon = Beacon {
        instance: transport.instance(),
        listen_port: transport.listen_port(),
    }
    .to_bytes();
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    let send_socket = socket.clone();
    let beacon_task = async move {
        loop {
            if let Err(e) = send_socket.send_to(&beacon, dest).await {
                debug!(error = %e, "beacon send failed");
            }
            tokio::time::sleep(BEACON_INTERVAL).await;
        }
    };

    tokio::select! {
        _ = beacon_task => Ok(()),
        r = recv_loop(socket, transport) => r,
    }
}

async fn recv_loop(socket: Arc<UdpSocket>, transport: TcpTransport) -> std::io::Result<()> {
    let mut buf = [0u8; 64];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let Some(beacon) = Beacon::parse(&buf[..n]) else {
            continue;
        };
        let own = transport.instance();
        if should_dial(own, &beacon, transport.is_linked(beacon.instance)) {
            let endpoint = SocketAddr::new(from.ip(), beacon.listen_port).to_string();
            debug!(%endpoint, instance = beacon.instance, "discovered peer");
            transport.connect(&endpoint);
        }
    }
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}
