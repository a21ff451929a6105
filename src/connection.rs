use std::net::SocketAddr;
use std::sync::Arc;
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, info, trace, warn};
use crate::buffers::segment_pool::SegmentPool;
use crate::config::ConnectlessConfig;
use crate::error::{CloseReason, ConnectlessError};
use crate::packet_header::{ser_close, AckHeader, Datagram, HelloHeader, ReliableHeader, UnreliableHeader};
use crate::reassembly_window::{FragmentOutcome, ReassemblyWindow};
use crate::rtt::RttEstimator;
use crate::send_ledger::{LedgerFull, SendLedger};
use crate::send_pipeline::{DatagramSink, UnreliableDispatcher};
use crate::stream_seq::StreamSeq;
use crate::transform::StreamTransform;
use crate::unreliable::UnreliableGate;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// The protocol state of a single peer: reliable stream in both directions, unreliable
///  datagrams, RTT estimation and the connection's lifecycle.
///
/// A connection does no I/O and has no notion of time of its own: inbound datagrams, timer
///  wakeups and application calls are passed in together with the current time in milliseconds,
///  and outbound datagrams go to a [DatagramSink]. The owner calls [Connection::on_timer] no
///  later than [Connection::next_deadline].
pub struct Connection {
    config: Arc<ConnectlessConfig>,
    peer_addr: SocketAddr,
    state: ConnectionState,
    close_reason: Option<CloseReason>,

    sink: Arc<dyn DatagramSink>,
    dispatcher: Arc<dyn UnreliableDispatcher>,
    transform: Box<dyn StreamTransform>,

    ledger: SendLedger,
    /// encoded outbound bytes that did not fit into the ledger yet
    staging: BytesMut,
    window: ReassemblyWindow,
    /// decoded inbound bytes waiting for the application
    decoded: BytesMut,
    gate: UnreliableGate,
    next_unreliable_counter: u32,
    rtt: RttEstimator,

    is_initiator: bool,
    /// only set for the side that initiated the connection, until the peer was heard from
    last_hello_sent: Option<u64>,
    last_recv: u64,
    /// last time an ack removed packets, or the ledger became non-empty
    last_ack_progress: u64,
    close_deadline: Option<u64>,
}

impl Connection {
    pub fn new(
        config: Arc<ConnectlessConfig>,
        peer_addr: SocketAddr,
        sink: Arc<dyn DatagramSink>,
        dispatcher: Arc<dyn UnreliableDispatcher>,
        transform: Box<dyn StreamTransform>,
        pool: Arc<SegmentPool>,
        now: u64,
    ) -> Connection {
        Connection {
            ledger: SendLedger::new(config.send_window_capacity, pool),
            window: ReassemblyWindow::new(config.receive_window_capacity),
            gate: UnreliableGate::new(config.max_buffered_unreliable),
            rtt: RttEstimator::new(&config),
            config,
            peer_addr,
            state: ConnectionState::Connecting,
            close_reason: None,
            sink,
            dispatcher,
            transform,
            staging: BytesMut::new(),
            decoded: BytesMut::new(),
            next_unreliable_counter: 1,
            is_initiator: false,
            last_hello_sent: None,
            last_recv: now,
            last_ack_progress: now,
            close_deadline: None,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Initiates the connection by sending a hello. The hello is repeated every RTO until
    ///  something is received from the peer.
    pub fn connect(&mut self, now: u64) {
        debug!("connecting to {:?}", self.peer_addr);
        self.is_initiator = true;
        self.send_hello();
        self.last_hello_sent = Some(now);
    }

    /// Queues bytes on the reliable stream. Data is refused with [ConnectlessError::WouldBlock]
    ///  while the send window is full, otherwise it is accepted completely.
    pub fn write(&mut self, data: &[u8], now: u64) -> Result<(), ConnectlessError> {
        self.check_open()?;
        if self.ledger.is_full() {
            return Err(ConnectlessError::WouldBlock);
        }

        if let Err(e) = self.transform.encode(data, &mut self.staging) {
            let msg = e.to_string();
            self.fail(CloseReason::TransformFailed, now);
            return Err(ConnectlessError::Transform(msg));
        }

        self.activate();
        self.flush_staging(now);
        Ok(())
    }

    /// Sends an unreliable datagram right away. It is tagged with the current reliable stream
    ///  position and not tracked after sending.
    pub fn write_unreliable(&mut self, opcode: u16, data: &[u8]) -> Result<(), ConnectlessError> {
        self.check_open()?;
        let max = self.config.max_unreliable_payload();
        if data.len() > max {
            return Err(ConnectlessError::DatagramTooLarge { len: data.len(), max });
        }

        let header = UnreliableHeader {
            baseline: self.ledger.high_water_mark().baseline(),
            counter: self.next_unreliable_counter,
            opcode,
        };
        self.next_unreliable_counter = self.next_unreliable_counter.wrapping_add(1);

        let mut buf = BytesMut::with_capacity(UnreliableHeader::SERIALIZED_LEN);
        header.ser(&mut buf);
        trace!("sending unreliable datagram to {:?}: {:?}", self.peer_addr, header);
        self.sink.send_datagram(&[buf.as_ref(), data]);

        self.activate();
        Ok(())
    }

    /// Takes up to `max` bytes of the reliable stream that arrived in order
    pub fn read_ready(&mut self, max: usize) -> Bytes {
        let n = max.min(self.decoded.len());
        self.decoded.split_to(n).freeze()
    }

    pub fn ready_len(&self) -> usize {
        self.decoded.len()
    }

    /// true if a call to [Connection::write] would currently accept data
    pub fn is_writable(&self) -> bool {
        self.check_open().is_ok() && !self.ledger.is_full()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.ledger.outstanding_bytes() + self.staging.len()
    }

    pub fn rto_ms(&self) -> u64 {
        self.rtt.rto_ms()
    }

    /// The reliable stream position acknowledged to the peer
    pub fn receive_base(&self) -> StreamSeq {
        self.window.base()
    }

    pub fn on_datagram(&mut self, now: u64, buf: &[u8]) {
        if self.state == ConnectionState::Closed {
            trace!("connection to {:?} is closed: ignoring datagram", self.peer_addr);
            return;
        }

        let datagram = match Datagram::deser(buf) {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("dropping malformed datagram from {:?}: {}", self.peer_addr, e);
                return;
            }
        };
        if let Datagram::Hello(hello) = &datagram {
            if hello.protocol_version != HelloHeader::PROTOCOL_VERSION_1 {
                warn!("dropping hello with unsupported protocol version {} from {:?}", hello.protocol_version, self.peer_addr);
                return;
            }
        }

        self.last_recv = now;
        self.last_hello_sent = None;
        self.activate();

        match datagram {
            Datagram::Hello(_) => {
                trace!("received hello from {:?}", self.peer_addr);
                if !self.is_initiator {
                    self.send_hello();
                }
            }
            Datagram::Reliable(header, data) => self.on_reliable(header, data, now),
            Datagram::Unreliable(header, data) => {
                let baseline = self.window.base().baseline();
                let dispatcher = &self.dispatcher;
                self.gate.on_datagram(header, data, baseline, &mut |opcode, payload| dispatcher.on_unreliable(opcode, payload));
            }
            Datagram::Ack(header) => self.on_ack(header, now),
            Datagram::Close => {
                debug!("peer {:?} closed the connection", self.peer_addr);
                self.enter_closing(CloseReason::Peer, now);
                self.check_drained();
            }
        }
    }

    fn on_reliable(&mut self, header: ReliableHeader, data: &[u8], now: u64) {
        let outcome = self.window.on_fragment(data, header.seq);
        trace!("reliable fragment {}+{} from {:?}: {:?}", header.seq, data.len(), self.peer_addr, outcome);

        if outcome.should_ack() {
            let mut buf = BytesMut::with_capacity(AckHeader::SERIALIZED_LEN);
            AckHeader {
                age: header.age,
                seq: header.seq,
                una: self.window.base(),
            }.ser(&mut buf);
            self.sink.send_datagram(&[buf.as_ref()]);
        }

        if outcome == (FragmentOutcome::Accepted { base_advanced: true }) {
            let ready = self.window.take_ready(usize::MAX);
            if let Err(e) = self.transform.decode(&ready, &mut self.decoded) {
                warn!("decoding the stream from {:?} failed: {}", self.peer_addr, e);
                self.fail(CloseReason::TransformFailed, now);
                return;
            }

            // buffered datagrams may be tagged with any position the base moved through
            let dispatcher = &self.dispatcher;
            for base in self.window.take_base_history() {
                self.gate.on_base_advanced(base.baseline(), &mut |opcode, payload| dispatcher.on_unreliable(opcode, payload));
            }
        }
    }

    fn on_ack(&mut self, header: AckHeader, now: u64) {
        let outcome = self.ledger.on_ack(header.age, header.seq, header.una, now);
        trace!("ack from {:?}: {:?} -> {:?}", self.peer_addr, header, outcome);

        if outcome.num_acked > 0 {
            self.last_ack_progress = now;
        }
        if let Some(rtt) = outcome.rtt_sample {
            self.rtt.on_sample(rtt);
        }
        if let Some(stop) = outcome.lost_before {
            while let Some(view) = self.ledger.retransmit_lost_up_to(now, stop) {
                debug!("fast retransmit of {} to {:?}", view.seq, self.peer_addr);
                send_reliable(self.sink.as_ref(), view.age, view.seq, view.head, view.tail);
            }
        }

        self.flush_staging(now);
        self.check_drained();
    }

    /// Handles timeouts and retransmissions that are due at `now`
    pub fn on_timer(&mut self, now: u64) {
        if self.state == ConnectionState::Closed {
            return;
        }

        if !self.ledger.is_empty() && now >= self.last_ack_progress + self.config.connection_timeout.as_millis() as u64 {
            warn!("no acknowledgement from {:?} for {:?}: closing connection", self.peer_addr, self.config.connection_timeout);
            self.fail(CloseReason::Timeout, now);
            return;
        }
        if let Some(idle_timeout) = self.config.idle_timeout {
            if now >= self.last_recv + idle_timeout.as_millis() as u64 {
                warn!("nothing received from {:?} for {:?}: closing connection", self.peer_addr, idle_timeout);
                self.fail(CloseReason::Timeout, now);
                return;
            }
        }
        if let Some(deadline) = self.close_deadline {
            if now >= deadline {
                info!("unacknowledged data remaining for {:?} after grace period: closing connection", self.peer_addr);
                self.enter_closed(CloseReason::GracePeriodElapsed);
                return;
            }
        }

        let rto = self.rtt.rto_ms();

        // NB: Writing activates a connection, but the peer only accepts it after seeing a hello
        if let Some(last_hello) = self.last_hello_sent {
            if now >= last_hello + rto {
                trace!("repeating hello to {:?}", self.peer_addr);
                self.send_hello();
                self.last_hello_sent = Some(now);
            }
        }

        if let Some(oldest) = self.ledger.oldest_timestamp() {
            if oldest + rto <= now {
                let expiry = now - rto;
                if self.last_recv <= oldest {
                    self.rtt.backoff();
                    debug!("retransmission timeout for {:?} without inbound traffic: RTO backed off to {}ms", self.peer_addr, self.rtt.rto_ms());
                }

                for _ in 0..self.ledger.outstanding_count() {
                    match self.ledger.retransmit_due(now, expiry) {
                        Some(view) => {
                            trace!("retransmitting {} with age {} to {:?}", view.seq, view.age, self.peer_addr);
                            send_reliable(self.sink.as_ref(), view.age, view.seq, view.head, view.tail);
                            send_reliable(self.sink.as_ref(), view.age, view.seq, view.head, view.tail);
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// The next time [Connection::on_timer] has work to do, or None if the connection is closed
    pub fn next_deadline(&self) -> Option<u64> {
        if self.state == ConnectionState::Closed {
            return None;
        }

        let rto = self.rtt.rto_ms();
        let candidates = [
            self.ledger.oldest_timestamp().map(|oldest| oldest + rto),
            self.last_hello_sent.map(|last_hello| last_hello + rto),
            (!self.ledger.is_empty()).then(|| self.last_ack_progress + self.config.connection_timeout.as_millis() as u64),
            self.config.idle_timeout.map(|idle| self.last_recv + idle.as_millis() as u64),
            self.close_deadline,
        ];
        candidates.into_iter().flatten().min()
    }

    /// Starts an orderly shutdown: no more data is accepted, and the connection is closed once
    ///  all data is acknowledged or the grace period elapsed
    pub fn close(&mut self, now: u64) {
        self.enter_closing(CloseReason::Local, now);
        self.check_drained();
    }

    fn check_open(&self) -> Result<(), ConnectlessError> {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Active => Ok(()),
            ConnectionState::Closing | ConnectionState::Closed => Err(ConnectlessError::Closed),
        }
    }

    fn activate(&mut self) {
        if self.state == ConnectionState::Connecting {
            debug!("connection to {:?} is active", self.peer_addr);
            self.state = ConnectionState::Active;
        }
    }

    fn flush_staging(&mut self, now: u64) {
        let max_payload = self.config.max_reliable_payload();
        while !self.staging.is_empty() {
            // packets may be shorter than the maximum so that the ledger fills up completely
            let room = self.ledger.capacity().saturating_sub(self.ledger.outstanding_bytes());
            let len = self.staging.len().min(max_payload).min(room);
            if len == 0 {
                trace!("send window to {:?} is full, {} bytes staged", self.peer_addr, self.staging.len());
                break;
            }
            if self.ledger.is_empty() {
                self.last_ack_progress = now;
            }
            match self.ledger.append(&self.staging[..len], now) {
                Ok(seq) => {
                    trace!("sending {} bytes at {} to {:?}", len, seq, self.peer_addr);
                    send_reliable(self.sink.as_ref(), 0, seq, &self.staging[..len], &[]);
                    self.staging.advance(len);
                }
                Err(LedgerFull) => {
                    debug!("send ledger for {:?} refused {} bytes despite available room", self.peer_addr, len);
                    break;
                }
            }
        }
    }

    fn enter_closing(&mut self, reason: CloseReason, now: u64) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Active => {
                debug!("closing connection to {:?}: {:?}", self.peer_addr, reason);
                self.state = ConnectionState::Closing;
                self.close_reason = Some(reason);
                self.close_deadline = Some(now + self.config.close_grace.as_millis() as u64);
            }
            ConnectionState::Closing | ConnectionState::Closed => {}
        }
    }

    /// A closing connection without unacknowledged data is done
    fn check_drained(&mut self) {
        if self.state == ConnectionState::Closing && self.ledger.is_empty() && self.staging.is_empty() {
            let mut buf = BytesMut::with_capacity(1);
            ser_close(&mut buf);
            self.sink.send_datagram(&[buf.as_ref()]);

            let reason = self.close_reason.unwrap_or(CloseReason::Local);
            self.enter_closed(reason);
        }
    }

    fn fail(&mut self, reason: CloseReason, now: u64) {
        self.enter_closing(reason, now);
        self.enter_closed(reason);
    }

    fn enter_closed(&mut self, reason: CloseReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        info!("connection to {:?} closed: {:?}", self.peer_addr, reason);
        self.state = ConnectionState::Closed;
        self.close_reason = Some(reason);
        self.close_deadline = None;
        self.last_hello_sent = None;
        self.ledger.clear();
        self.window.clear();
        self.staging.clear();
        self.gate.clear();
    }

    fn send_hello(&self) {
        let mut buf = BytesMut::new();
        HelloHeader {
            protocol_version: HelloHeader::PROTOCOL_VERSION_1,
            mtu: self.config.mtu as u32,
        }.ser(&mut buf);
        self.sink.send_datagram(&[buf.as_ref()]);
    }
}

fn send_reliable(sink: &dyn DatagramSink, age: u8, seq: StreamSeq, head: &[u8], tail: &[u8]) {
    let mut header = BytesMut::with_capacity(ReliableHeader::SERIALIZED_LEN);
    ReliableHeader { age, seq }.ser(&mut header);
    sink.send_datagram(&[header.as_ref(), head, tail]);
}
