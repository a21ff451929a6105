#[cfg(test)] use mockall::automock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{error, trace};

/// This is an abstraction for sending a datagram to a connection's peer, introduced to keep
///  connections free of I/O and to facilitate testing. A datagram is passed as a list of chunks
///  to be sent as one UDP packet.
///
/// NB: Sending never blocks. A datagram that can not be sent right away is dropped, which is
///  indistinguishable from loss on the network.
pub trait DatagramSink: Send + Sync {
    fn send_datagram(&self, chunks: &[&[u8]]);
}

/// Sends datagrams through a shared UDP socket to a fixed peer
pub struct UdpDatagramSink {
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
}

impl UdpDatagramSink {
    pub fn new(socket: Arc<UdpSocket>, peer_addr: SocketAddr) -> UdpDatagramSink {
        UdpDatagramSink { socket, peer_addr }
    }
}

impl DatagramSink for UdpDatagramSink {
    fn send_datagram(&self, chunks: &[&[u8]]) {
        let buf = chunks.concat();
        trace!("UDP socket: sending {} bytes to {:?}", buf.len(), self.peer_addr);

        match self.socket.try_send_to(&buf, self.peer_addr) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // readiness is not known yet or the socket buffer is full: hand off to a task
                let socket = self.socket.clone();
                let peer_addr = self.peer_addr;
                tokio::spawn(async move {
                    if let Err(e) = socket.send_to(&buf, peer_addr).await {
                        error!("error sending UDP packet to {:?}: {}", peer_addr, e);
                    }
                });
            }
            Err(e) => error!("error sending UDP packet to {:?}: {}", self.peer_addr, e),
        }
    }
}

/// Receives unreliable datagrams once they passed the staleness check
#[cfg_attr(test, automock)]
pub trait UnreliableDispatcher: Send + Sync {
    fn on_unreliable(&self, opcode: u16, payload: &[u8]);
}

/// Milliseconds since an arbitrary, fixed point in time
#[cfg_attr(test, automock)]
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// [Clock] based on tokio's time source, so that paused test runtimes control it
pub struct TokioClock {
    start: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> TokioClock {
        TokioClock { start: tokio::time::Instant::now() }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
