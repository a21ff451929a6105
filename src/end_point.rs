use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, span, trace, Instrument, Level};
use crate::buffers::segment_pool::SegmentPool;
use crate::config::ConnectlessConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::ConnectlessError;
use crate::packet_header::{Datagram, HelloHeader};
use crate::send_pipeline::{Clock, TokioClock, UdpDatagramSink, UnreliableDispatcher};
use crate::transform::{PassThrough, StreamTransform};

/// Creates the stream transform for each new connection
pub type TransformFactory = Arc<dyn Fn() -> Box<dyn StreamTransform> + Send + Sync>;

enum Command {
    Write { data: Bytes, reply: oneshot::Sender<Result<(), ConnectlessError>> },
    WriteUnreliable { opcode: u16, data: Bytes, reply: oneshot::Sender<Result<(), ConnectlessError>> },
    Close,
}

/// Forwards unreliable datagrams to the connection's handle
struct ChannelDispatcher {
    tx: mpsc::UnboundedSender<(u16, Bytes)>,
}

impl UnreliableDispatcher for ChannelDispatcher {
    fn on_unreliable(&self, opcode: u16, payload: &[u8]) {
        // the handle may be gone, nobody is interested in the datagram then
        let _ = self.tx.send((opcode, Bytes::copy_from_slice(payload)));
    }
}

/// State shared by the receive loop and the connection tasks
struct EndPointShared {
    socket: Arc<UdpSocket>,
    config: Arc<ConnectlessConfig>,
    pool: Arc<SegmentPool>,
    clock: Arc<dyn Clock>,
    transform_factory: TransformFactory,
    connections: Mutex<FxHashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>>,
    accept_tx: mpsc::UnboundedSender<ConnectionHandle>,
}

impl EndPointShared {
    fn lookup(&self, peer_addr: &SocketAddr) -> Option<mpsc::UnboundedSender<Bytes>> {
        self.connections.lock().unwrap()
            .get(peer_addr)
            .cloned()
    }

    /// Creates a connection with its own task and registers it for inbound datagrams
    fn spawn_connection(self: &Arc<Self>, peer_addr: SocketAddr, initiate: bool, first_datagram: Option<&[u8]>) -> ConnectionHandle {
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (unreliable_tx, unreliable_rx) = mpsc::unbounded_channel();
        let writable = Arc::new(Notify::new());

        let now = self.clock.now_ms();
        let mut connection = Connection::new(
            self.config.clone(),
            peer_addr,
            Arc::new(UdpDatagramSink::new(self.socket.clone(), peer_addr)),
            Arc::new(ChannelDispatcher { tx: unreliable_tx }),
            (self.transform_factory)(),
            self.pool.clone(),
            now,
        );
        if initiate {
            connection.connect(now);
        }
        if let Some(datagram) = first_datagram {
            connection.on_datagram(now, datagram);
        }
        let (state_tx, state_rx) = watch::channel(connection.state());

        self.connections.lock().unwrap()
            .insert(peer_addr, datagram_tx.clone());

        let task = ConnectionTask {
            connection,
            clock: self.clock.clone(),
            datagrams: datagram_rx,
            own_datagram_tx: datagram_tx,
            commands: command_rx,
            inbound_tx,
            state_tx,
            writable: writable.clone(),
            shared: Arc::downgrade(self),
        };
        tokio::spawn(task.run().instrument(span!(Level::DEBUG, "connection", ?peer_addr)));

        ConnectionHandle {
            peer_addr,
            commands: command_tx,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            unreliable: tokio::sync::Mutex::new(unreliable_rx),
            state: state_rx,
            writable,
        }
    }
}

/// EndPoint is where connections meet the network: it owns a UdpSocket, demultiplexes inbound
///  datagrams to their connections by peer address, and creates connections for peers that say
///  hello.
///
/// Every connection runs in a task of its own, so all protocol processing for a connection is
///  serialized without locking. Application code talks to a connection through its
///  [ConnectionHandle].
pub struct EndPoint {
    shared: Arc<EndPointShared>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ConnectionHandle>>,
    recv_loop_handle: JoinHandle<()>,
}

impl EndPoint {
    pub async fn bind(addr: SocketAddr, config: ConnectlessConfig) -> anyhow::Result<EndPoint> {
        Self::bind_with_transform(addr, config, Arc::new(|| Box::new(PassThrough) as Box<dyn StreamTransform>)).await
    }

    pub async fn bind_with_transform(addr: SocketAddr, config: ConnectlessConfig, transform_factory: TransformFactory) -> anyhow::Result<EndPoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("bound socket to {:?}", socket.local_addr()?);

        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(EndPointShared {
            socket,
            pool: Arc::new(SegmentPool::new(config.segment_size, config.segment_pool_size)),
            config: Arc::new(config),
            clock: Arc::new(TokioClock::new()),
            transform_factory,
            connections: Default::default(),
            accept_tx,
        });

        let recv_loop_handle = tokio::spawn(recv_loop(shared.clone()));

        Ok(EndPoint {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            recv_loop_handle,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Opens a connection to a peer. The connection becomes active when the peer answers or
    ///  the first data is written.
    pub fn connect(&self, peer_addr: SocketAddr) -> anyhow::Result<ConnectionHandle> {
        if self.shared.lookup(&peer_addr).is_some() {
            bail!("there is a connection to {:?} already", peer_addr);
        }
        debug!("opening connection to {:?}", peer_addr);
        Ok(self.shared.spawn_connection(peer_addr, true, None))
    }

    /// Waits for the next connection opened by a peer
    pub async fn accept(&self) -> Option<ConnectionHandle> {
        self.accept_rx.lock().await
            .recv().await
    }

    pub fn num_connections(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }
}

impl Drop for EndPoint {
    fn drop(&mut self) {
        self.recv_loop_handle.abort();
    }
}

async fn recv_loop(shared: Arc<EndPointShared>) {
    info!("starting receive loop");

    let mut buf = vec![0u8; 65536];
    loop {
        let (num_read, from) = match shared.socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                error!("socket error: {}", e);
                continue;
            }
        };
        let datagram = &buf[..num_read];

        let span = span!(Level::TRACE, "datagram_received", ?from);
        let _entered = span.enter();
        trace!("received {} bytes from {:?}", num_read, from);

        if let Some(tx) = shared.lookup(&from) {
            if tx.send(Bytes::copy_from_slice(datagram)).is_err() {
                debug!("connection to {:?} terminated concurrently - dropping datagram", from);
            }
            continue;
        }

        match Datagram::deser(datagram) {
            Ok(Datagram::Hello(hello)) if hello.protocol_version == HelloHeader::PROTOCOL_VERSION_1 => {
                info!("new connection from {:?}", from);
                let handle = shared.spawn_connection(from, false, Some(datagram));
                if shared.accept_tx.send(handle).is_err() {
                    debug!("endpoint is shutting down, not accepting {:?}", from);
                }
            }
            Ok(Datagram::Hello(hello)) => {
                debug!("hello from {:?} with unsupported protocol version {} - dropping", from, hello.protocol_version);
            }
            Ok(other) => {
                debug!("{:?} datagram from unknown peer {:?} - dropping", other.kind(), from);
            }
            Err(e) => {
                debug!("malformed datagram from unknown peer {:?} - dropping: {}", from, e);
            }
        }
    }
}

/// Converts a deadline in [Clock] milliseconds to a tokio instant. Deadlines in the past are due
///  right away.
fn deadline_instant(clock: &dyn Clock, deadline_ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(deadline_ms.saturating_sub(clock.now_ms()))
}

/// The task owning a [Connection]. It funnels datagrams, application commands and timer wakeups
///  into the connection one at a time.
struct ConnectionTask {
    connection: Connection,
    clock: Arc<dyn Clock>,
    datagrams: mpsc::UnboundedReceiver<Bytes>,
    own_datagram_tx: mpsc::UnboundedSender<Bytes>,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    state_tx: watch::Sender<ConnectionState>,
    writable: Arc<Notify>,
    shared: Weak<EndPointShared>,
}

impl ConnectionTask {
    async fn run(mut self) {
        let mut handle_dropped = false;
        self.after_event();

        while self.connection.state() != ConnectionState::Closed {
            let deadline = self.connection.next_deadline()
                .map(|ms| deadline_instant(self.clock.as_ref(), ms));

            select! {
                Some(datagram) = self.datagrams.recv() => {
                    self.connection.on_datagram(self.clock.now_ms(), &datagram);
                }
                command = self.commands.recv(), if !handle_dropped => {
                    let now = self.clock.now_ms();
                    match command {
                        Some(Command::Write { data, reply }) => {
                            let _ = reply.send(self.connection.write(&data, now));
                        }
                        Some(Command::WriteUnreliable { opcode, data, reply }) => {
                            let _ = reply.send(self.connection.write_unreliable(opcode, &data));
                        }
                        Some(Command::Close) => self.connection.close(now),
                        None => {
                            debug!("connection handle was dropped: closing");
                            handle_dropped = true;
                            self.connection.close(now);
                        }
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.connection.on_timer(self.clock.now_ms());
                }
            }

            self.after_event();
        }

        self.detach();
    }

    fn after_event(&mut self) {
        let ready = self.connection.read_ready(usize::MAX);
        if !ready.is_empty() {
            // NB: The handle may have been dropped, the data is discarded then
            let _ = self.inbound_tx.send(ready);
        }
        if self.connection.is_writable() {
            self.writable.notify_waiters();
        }

        let state = self.connection.state();
        self.state_tx.send_if_modified(|s| {
            if *s != state {
                *s = state;
                true
            }
            else {
                false
            }
        });
    }

    fn detach(&mut self) {
        debug!("connection terminated: {:?}", self.connection.close_reason());
        if let Some(shared) = self.shared.upgrade() {
            let mut connections = shared.connections.lock().unwrap();
            if let Some(tx) = connections.get(&self.connection.peer_addr()) {
                if tx.same_channel(&self.own_datagram_tx) {
                    connections.remove(&self.connection.peer_addr());
                }
            }
        }
        self.writable.notify_waiters();
    }
}

/// Application side of a connection
pub struct ConnectionHandle {
    peer_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    unreliable: tokio::sync::Mutex<mpsc::UnboundedReceiver<(u16, Bytes)>>,
    state: watch::Receiver<ConnectionState>,
    writable: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Writes to the reliable stream, waiting while the send window is full
    pub async fn write(&self, data: &[u8]) -> Result<(), ConnectlessError> {
        loop {
            // registered before the attempt so that no wakeup is lost
            let writable = self.writable.notified();
            match self.try_write(data).await {
                Err(ConnectlessError::WouldBlock) => {
                    trace!("send window to {:?} is full - waiting", self.peer_addr);
                    writable.await;
                }
                other => return other,
            }
        }
    }

    /// Writes to the reliable stream, failing with [ConnectlessError::WouldBlock] if the send
    ///  window is full
    pub async fn try_write(&self, data: &[u8]) -> Result<(), ConnectlessError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands.send(Command::Write { data: Bytes::copy_from_slice(data), reply })
            .map_err(|_| ConnectlessError::Closed)?;
        reply_rx.await
            .unwrap_or(Err(ConnectlessError::Closed))
    }

    pub async fn write_unreliable(&self, opcode: u16, data: &[u8]) -> Result<(), ConnectlessError> {
        let (reply, reply_rx) = oneshot::channel();
        self.commands.send(Command::WriteUnreliable { opcode, data: Bytes::copy_from_slice(data), reply })
            .map_err(|_| ConnectlessError::Closed)?;
        reply_rx.await
            .unwrap_or(Err(ConnectlessError::Closed))
    }

    /// Returns the next chunk of the reliable stream, or None once the connection is closed and
    ///  all data was read
    pub async fn read(&self) -> Option<Bytes> {
        self.inbound.lock().await
            .recv().await
    }

    /// Returns the next unreliable datagram with its opcode, or None once the connection is closed
    pub async fn recv_unreliable(&self) -> Option<(u16, Bytes)> {
        self.unreliable.lock().await
            .recv().await
    }

    /// Starts an orderly shutdown, see [Connection::close]
    pub fn close(&self) {
        if self.commands.send(Command::Close).is_err() {
            trace!("connection to {:?} is closed already", self.peer_addr);
        }
    }

    /// Waits until the connection reached its terminal state
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use crate::packet_header::ReliableHeader;
    use crate::send_pipeline::MockClock;
    use rstest::rstest;
    use crate::stream_seq::StreamSeq;

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_unknown_peer_without_hello_is_ignored() {
        let end_point = EndPoint::bind(localhost(), ConnectlessConfig::default_ipv4()).await.unwrap();
        let stranger = UdpSocket::bind(localhost()).await.unwrap();

        let mut buf = BytesMut::new();
        ReliableHeader { age: 0, seq: StreamSeq::ZERO }.ser(&mut buf);
        buf.extend_from_slice(b"data");
        stranger.send_to(&buf, end_point.local_addr().unwrap()).await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(200), end_point.accept()).await.is_err());
        assert_eq!(end_point.num_connections(), 0);
    }

    #[tokio::test]
    async fn test_hello_creates_connection() {
        let end_point = EndPoint::bind(localhost(), ConnectlessConfig::default_ipv4()).await.unwrap();
        let stranger = UdpSocket::bind(localhost()).await.unwrap();

        let mut buf = BytesMut::new();
        HelloHeader { protocol_version: HelloHeader::PROTOCOL_VERSION_1, mtu: 1400 }.ser(&mut buf);
        stranger.send_to(&buf, end_point.local_addr().unwrap()).await.unwrap();

        let handle = tokio::time::timeout(Duration::from_secs(5), end_point.accept()).await
            .unwrap()
            .unwrap();
        assert_eq!(handle.peer_addr(), stranger.local_addr().unwrap());
        assert_eq!(handle.state(), ConnectionState::Active);
        assert_eq!(end_point.num_connections(), 1);

        // the hello is answered
        let mut reply = [0u8; 100];
        let (len, _) = stranger.recv_from(&mut reply).await.unwrap();
        assert!(matches!(Datagram::deser(&reply[..len]), Ok(Datagram::Hello(_))));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let end_point = EndPoint::bind(localhost(), ConnectlessConfig::default_ipv4()).await.unwrap();
        let peer = SocketAddr::from(([127, 0, 0, 1], 9));
        let _handle = end_point.connect(peer).unwrap();
        assert!(end_point.connect(peer).is_err());
    }

    #[tokio::test]
    async fn test_dropped_handle_detaches_connection() {
        let end_point = EndPoint::bind(localhost(), ConnectlessConfig::default_ipv4()).await.unwrap();
        let peer = SocketAddr::from(([127, 0, 0, 1], 9));

        let handle = end_point.connect(peer).unwrap();
        assert_eq!(end_point.num_connections(), 1);
        drop(handle);

        for _ in 0..100 {
            if end_point.num_connections() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection was not detached");
    }

    #[rstest]
    #[case::ahead(1000, 1250, 250)]
    #[case::now(1000, 1000, 0)]
    #[case::overdue(1000, 400, 0)]
    #[tokio::test(start_paused = true)]
    async fn test_deadline_instant(#[case] now_ms: u64, #[case] deadline_ms: u64, #[case] expected_delay_ms: u64) {
        let mut clock = MockClock::new();
        clock.expect_now_ms()
            .return_const(now_ms);

        let start = Instant::now();
        assert_eq!(deadline_instant(&clock, deadline_ms), start + Duration::from_millis(expected_delay_ms));
    }

    #[test]
    fn test_channel_dispatcher() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = ChannelDispatcher { tx };
        dispatcher.on_unreliable(5, b"abc");
        assert_eq!(rx.try_recv().unwrap(), (5, Bytes::from_static(b"abc")));
    }
}
