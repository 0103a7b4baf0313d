//! Service discovery: multicast a query for the service name, collect advertisements.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fieldrelay_core::protocol::match_advertisement;
use fieldrelay_core::wire::{decode_datagram, encode_datagram, MAX_DATAGRAM_LEN};
use fieldrelay_core::{DiscoveryError, Message, PeerDescriptor};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::audit::AuditLog;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 60, 61);

/// One discovery round against the local stack.
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    /// Peers currently advertising `service_name`, in the order they answered. May be empty.
    async fn browse(&self, service_name: &str) -> Result<Vec<PeerDescriptor>, DiscoveryError>;
}

/// Browse until at least one peer answers. `Busy` is retried silently, other transient
/// errors are logged and retried, `Environment` is returned to the caller.
pub async fn discover(
    browser: &dyn ServiceBrowser,
    service_name: &str,
    poll: Duration,
    audit: &AuditLog,
) -> Result<Vec<PeerDescriptor>, DiscoveryError> {
    loop {
        match browser.browse(service_name).await {
            Ok(peers) if !peers.is_empty() => return Ok(peers),
            Ok(_) => tracing::trace!(service = service_name, "no advertisement yet"),
            Err(DiscoveryError::Busy) => {}
            Err(e @ DiscoveryError::Environment(_)) => return Err(e),
            Err(e) => audit.record_error(&e.to_string()),
        }
        tokio::time::sleep(poll).await;
    }
}

/// UDP multicast browser. The socket is bound on first use so a host that cannot bind
/// surfaces as [`DiscoveryError::Environment`].
pub struct MulticastBrowser {
    port: u16,
    window: Duration,
    socket: Mutex<Option<Arc<UdpSocket>>>,
}

impl MulticastBrowser {
    pub fn new(port: u16, window: Duration) -> Self {
        Self {
            port,
            window,
            socket: Mutex::new(None),
        }
    }

    async fn socket(&self) -> Result<Arc<UdpSocket>, DiscoveryError> {
        let mut slot = self.socket.lock().await;
        if let Some(s) = slot.as_ref() {
            return Ok(s.clone());
        }
        let s = Arc::new(make_multicast_socket(self.port).map_err(classify_bind_error)?);
        *slot = Some(s.clone());
        Ok(s)
    }
}

#[async_trait]
impl ServiceBrowser for MulticastBrowser {
    async fn browse(&self, service_name: &str) -> Result<Vec<PeerDescriptor>, DiscoveryError> {
        let socket = self.socket().await?;
        let query = encode_datagram(&Message::query(service_name))
            .map_err(|e| DiscoveryError::Protocol(e.to_string()))?;
        let dest = SocketAddr::from((MULTICAST_GROUP, self.port));
        socket.send_to(&query, dest).await.map_err(classify_io_error)?;

        let deadline = Instant::now() + self.window;
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let mut peers: Vec<PeerDescriptor> = Vec::new();
        loop {
            let (n, from) =
                match tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await {
                    Err(_) => break,
                    Ok(r) => r.map_err(classify_io_error)?,
                };
            let Ok(msg) = decode_datagram(&buf[..n]) else {
                continue;
            };
            if let Some(peer) = match_advertisement(&msg, from.ip(), service_name) {
                if !peers.iter().any(|p| p.addr() == peer.addr()) {
                    tracing::debug!(peer = %peer.addr(), "service advertised");
                    peers.push(peer);
                }
            }
        }
        Ok(peers)
    }
}

fn make_multicast_socket(port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(false)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn classify_bind_error(e: std::io::Error) -> DiscoveryError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::PermissionDenied | ErrorKind::AddrInUse => DiscoveryError::Environment(e),
        _ => classify_io_error(e),
    }
}

/// Interface down or no route yet: the adapter is not ready.
fn classify_io_error(e: std::io::Error) -> DiscoveryError {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::AddrNotAvailable | ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            DiscoveryError::Busy
        }
        _ if e.raw_os_error() == Some(libc::ENETUNREACH)
            || e.raw_os_error() == Some(libc::ENODEV) =>
        {
            DiscoveryError::Busy
        }
        _ => DiscoveryError::Io(e),
    }
}
