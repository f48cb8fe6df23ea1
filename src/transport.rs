#[cfg(test)] use mockall::automock;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{error, info, trace};

/// This is an abstraction for sending datagrams, introduced to decouple the protocol engine from
///  the actual socket and to facilitate mocking the I/O part away for testing.
///
/// Sending is fire-and-forget: errors are logged by the implementation, and retransmission is
///  handled at the protocol level.
#[cfg_attr(test, automock)]
pub trait Transport: Send + Sync + 'static {
    fn send(&self, to: SocketAddr, packet: Bytes);

    fn local_addr(&self) -> SocketAddr;
}

/// Transport based on a tokio UDP socket. Sends are queued and performed by a dedicated task,
///  so `send` never blocks the caller.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    send_queue: mpsc::UnboundedSender<(SocketAddr, Bytes)>,
}

impl UdpTransport {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("bound UDP socket to {:?}", local_addr);

        let (send_queue, receiver) = mpsc::unbounded_channel();
        tokio::spawn(Self::send_loop(socket.clone(), receiver));

        Ok(UdpTransport {
            socket,
            local_addr,
            send_queue,
        })
    }

    /// the underlying socket, for receiving
    pub fn udp_socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// runs until the transport (and with it the sending end of the queue) is dropped
    async fn send_loop(socket: Arc<UdpSocket>, mut receiver: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
        while let Some((to, packet)) = receiver.recv().await {
            trace!("UDP socket: sending packet to {:?}", to);
            if let Err(e) = socket.send_to(&packet, to).await {
                error!("error sending UDP packet to {:?}: {}", to, e);
            }
        }
        trace!("send loop for {:?} terminated", socket.local_addr().ok());
    }
}

impl Transport for UdpTransport {
    fn send(&self, to: SocketAddr, packet: Bytes) {
        if self.send_queue.send((to, packet)).is_err() {
            error!("send loop for {:?} is not running - dropping packet to {:?}", self.local_addr, to);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

/// resolves a host name (with port) to socket addresses
pub async fn resolve(host: &str) -> anyhow::Result<Vec<SocketAddr>> {
    Ok(tokio::net::lookup_host(host).await?
        .collect())
}
