//! Transfer link: one duplex byte stream to the paired companion.
//! Read and write halves are locked independently so send and receive never wait on each other.

use std::time::Duration;

use async_trait::async_trait;
use fieldrelay_core::{LinkError, PeerDescriptor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

pub struct TransferLink {
    peer: PeerDescriptor,
    reader: Mutex<Reader>,
    writer: Mutex<Writer>,
    closed: CancellationToken,
}

impl TransferLink {
    pub fn new(
        peer: PeerDescriptor,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            peer,
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            closed: CancellationToken::new(),
        }
    }

    pub fn peer(&self) -> &PeerDescriptor {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Write the whole buffer. Returns once the transport accepted it; there is no peer acknowledgment.
    pub async fn send(&self, bytes: &[u8]) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let mut writer = self.writer.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(LinkError::Closed),
            r = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => r.map_err(LinkError::from),
        }
    }

    /// One read of up to `buf.len()` bytes. EOF is reported as [`LinkError::PeerClosed`].
    pub async fn receive(&self, buf: &mut [u8]) -> Result<usize, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(LinkError::Closed),
            r = reader.read(buf) => match r {
                Ok(0) if !buf.is_empty() => Err(LinkError::PeerClosed),
                Ok(n) => Ok(n),
                Err(e) => Err(LinkError::from(e)),
            },
        }
    }

    /// Idempotent. Pending and later send/receive calls fail with [`LinkError::Closed`];
    /// the stream itself is released when the last handle to the link is dropped.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!(peer = %self.peer.addr(), "closing transfer link");
            self.closed.cancel();
        }
    }
}

/// Opens a [`TransferLink`] to a discovered peer.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, peer: &PeerDescriptor) -> Result<TransferLink, LinkError>;
}

/// Stream connection over TCP; succeeds once the handshake completes.
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, peer: &PeerDescriptor) -> Result<TransferLink, LinkError> {
        let addr = peer.addr();
        let stream = match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(source)) => {
                return Err(LinkError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => return Err(LinkError::ConnectTimeout(addr.to_string())),
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Ok(TransferLink::new(peer.clone(), reader, writer))
    }
}
