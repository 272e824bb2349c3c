//! SIP transport layer - one connected datagram socket per session
//!
//! The transport moves raw datagrams only; parsing happens in the
//! transaction layer. Closing a transport wakes any task blocked in
//! [`Transport::recv`], which then fails with `Transport("closed")`.

use super::message::{SipError, SipMessage};
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info};

/// Largest datagram we are prepared to receive
const MAX_DATAGRAM: usize = 65535;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
}

impl TransportProtocol {
    /// Token used in the Via header
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
        }
    }
}

/// Transport layer trait
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to the peer
    async fn send(&self, data: Bytes) -> Result<(), SipError>;

    /// Wait for the next datagram from the peer
    async fn recv(&self) -> Result<Bytes, SipError>;

    /// Close the transport, waking any pending `recv`
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Local address used in Via and Contact
    fn local_addr(&self) -> SocketAddr;
}

fn closed_error() -> SipError {
    SipError::Transport("closed".to_string())
}

/// Wait until the close flag flips to true
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            // Sender gone means the transport itself is gone
            return;
        }
    }
}

/// UDP transport implementation
pub struct UdpTransport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

impl UdpTransport {
    /// Resolve `host:port` and connect an ephemeral UDP socket to it
    pub async fn connect(host: &str, port: u16) -> Result<Self, SipError> {
        let remote_addr = lookup_host((host, port))
            .await
            .map_err(|e| SipError::Transport(format!("Failed to resolve {}: {}", host, e)))?
            .next()
            .ok_or_else(|| SipError::Transport(format!("No address found for {}", host)))?;

        Self::connect_addr(remote_addr).await
    }

    /// Connect to an already resolved address
    pub async fn connect_addr(remote_addr: SocketAddr) -> Result<Self, SipError> {
        let bind_addr: SocketAddr = if remote_addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| SipError::Transport(format!("Failed to bind UDP socket: {}", e)))?;
        socket
            .connect(remote_addr)
            .await
            .map_err(|e| SipError::Transport(format!("Failed to connect to {}: {}", remote_addr, e)))?;

        let local_addr = socket.local_addr()?;
        info!("UDP transport {} -> {}", local_addr, remote_addr);

        let (closed, _) = watch::channel(false);
        Ok(Self {
            socket,
            local_addr,
            remote_addr,
            closed,
        })
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, data: Bytes) -> Result<(), SipError> {
        if self.is_closed() {
            return Err(closed_error());
        }

        self.socket
            .send(&data)
            .await
            .map_err(|e| SipError::Transport(format!("Failed to send UDP packet: {}", e)))?;
        debug!("Sent {} bytes to {} via UDP", data.len(), self.remote_addr);
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, SipError> {
        let mut closed = self.closed.subscribe();
        let is_closed = *closed.borrow();
        if is_closed {
            return Err(closed_error());
        }

        let mut buf = vec![0u8; MAX_DATAGRAM];
        tokio::select! {
            result = self.socket.recv(&mut buf) => {
                let size = result
                    .map_err(|e| SipError::Transport(format!("Failed to receive UDP packet: {}", e)))?;
                debug!("Received {} bytes from {} via UDP", size, self.remote_addr);
                buf.truncate(size);
                Ok(Bytes::from(buf))
            }
            _ = wait_closed(&mut closed) => Err(closed_error()),
        }
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            info!("UDP transport {} closed", self.local_addr);
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// In-memory transport, the session side of a [`ChannelPeer`]
///
/// Used to drive a session without a network, e.g. from tests.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    local_addr: SocketAddr,
    closed: watch::Sender<bool>,
}

/// The far end of a [`ChannelTransport`]
pub struct ChannelPeer {
    sent: mpsc::UnboundedReceiver<Bytes>,
    inject: mpsc::UnboundedSender<Bytes>,
}

impl ChannelTransport {
    /// Create a connected transport/peer pair
    pub fn pair(local_addr: SocketAddr) -> (Self, ChannelPeer) {
        let (outbound, sent) = mpsc::unbounded_channel();
        let (inject, inbound) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        (
            Self {
                outbound,
                inbound: Mutex::new(inbound),
                local_addr,
                closed,
            },
            ChannelPeer { sent, inject },
        )
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, data: Bytes) -> Result<(), SipError> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.outbound
            .send(data)
            .map_err(|_| SipError::Transport("peer dropped".to_string()))
    }

    async fn recv(&self) -> Result<Bytes, SipError> {
        let mut closed = self.closed.subscribe();
        let is_closed = *closed.borrow();
        if is_closed {
            return Err(closed_error());
        }

        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            data = inbound.recv() => data.ok_or_else(|| SipError::Transport("peer dropped".to_string())),
            _ = wait_closed(&mut closed) => Err(closed_error()),
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl ChannelPeer {
    /// Next datagram the session sent, decoded
    pub async fn next_message(&mut self) -> Option<SipMessage> {
        self.sent.recv().await.map(|raw| SipMessage::decode(&raw))
    }

    /// A datagram already sent, without waiting
    pub fn try_next_message(&mut self) -> Option<SipMessage> {
        self.sent.try_recv().ok().map(|raw| SipMessage::decode(&raw))
    }

    /// Deliver a message to the session
    pub fn reply(&self, message: &SipMessage) -> bool {
        self.inject_raw(message.encode())
    }

    /// Deliver arbitrary bytes to the session
    pub fn inject_raw(&self, data: impl Into<Bytes>) -> bool {
        self.inject.send(data.into()).is_ok()
    }
}
