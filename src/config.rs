use std::time::Duration;
use anyhow::bail;

/// Size of a reliable fragment's header: tag, age and seq
pub const RELIABLE_HEADER_LEN: usize = 1 + 1 + 8;
/// Size of an unreliable datagram's header: tag, baseline, counter and opcode
pub const UNRELIABLE_HEADER_LEN: usize = 1 + 4 + 4 + 2;

#[derive(Debug, Clone)]
pub struct ConnectlessConfig {
    /// This is the maximum UDP payload size Connectless produces. Connectless never relies on IP
    ///  fragmentation, so this size must be supported by all routes between peers.
    ///
    /// With full Ethernet frames and no optional IP headers, this payload is `1500 - 20 - 8 = 1472`
    ///  for IPV4 and `1500 - 40 - 8 = 1452` for IPV6. The default stays well below that to leave
    ///  room for tunnels and other surprising network hardware.
    pub mtu: usize,

    /// Upper bound for bytes retained in the send ledger, i.e. sent but not yet reclaimed. Writes
    ///  are refused with [crate::error::ConnectlessError::WouldBlock] while the ledger is full.
    pub send_window_capacity: usize,

    /// Fragments extending beyond the receiver's base by more than this are dropped
    pub receive_window_capacity: usize,

    /// Size of the segments backing the send ledger's ring. A packet spans at most two segments,
    ///  so this must be at least the maximum reliable payload.
    pub segment_size: usize,

    /// This is the number of segments that will be pooled at a given time - segments in excess of
    ///  this number are discarded when they are returned.
    pub segment_pool_size: usize,

    pub min_rto: Duration,
    pub max_rto: Duration,
    /// lower bound for the variance term of the RTO, compensating for timer granularity
    pub rto_granularity: Duration,
    /// SRTT assumed before the first RTT sample is taken
    pub initial_srtt: Duration,

    /// A connection with outstanding data that sees no acknowledgement progress for this long
    ///  is torn down
    pub connection_timeout: Duration,
    /// A connection that receives nothing for this long is torn down. `None` disables the check.
    pub idle_timeout: Option<Duration>,
    /// Time a closing connection waits for outstanding data to be acknowledged
    pub close_grace: Duration,

    /// Upper bound for unreliable datagrams buffered because they are ahead of the reliable stream
    pub max_buffered_unreliable: usize,
}

impl ConnectlessConfig {
    /// IPV4 defaults with a conservative UDP payload size
    pub fn default_ipv4() -> ConnectlessConfig {
        ConnectlessConfig {
            mtu: 1400,
            send_window_capacity: 64*1024,
            receive_window_capacity: 256*1024,
            segment_size: 4096,
            segment_pool_size: 64,
            min_rto: Duration::from_millis(30),
            max_rto: Duration::from_millis(60_000),
            rto_granularity: Duration::from_millis(30),
            initial_srtt: Duration::from_millis(1000),
            connection_timeout: Duration::from_secs(30),
            idle_timeout: None,
            close_grace: Duration::from_secs(5),
            max_buffered_unreliable: 256,
        }
    }

    pub fn max_reliable_payload(&self) -> usize {
        self.mtu - RELIABLE_HEADER_LEN
    }

    pub fn max_unreliable_payload(&self) -> usize {
        self.mtu - UNRELIABLE_HEADER_LEN
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 100 {
            bail!("MTU is too small");
        }
        if self.mtu > 65507 {
            bail!("MTU exceeds the maximum UDP payload");
        }
        if self.segment_size < self.max_reliable_payload() {
            bail!("segment size {} is smaller than the maximum reliable payload {}", self.segment_size, self.max_reliable_payload());
        }
        if self.send_window_capacity < self.max_reliable_payload() {
            bail!("send window capacity must hold at least one full packet");
        }
        if self.receive_window_capacity < self.max_reliable_payload() {
            bail!("receive window capacity must hold at least one full packet");
        }
        if self.min_rto.is_zero() || self.min_rto > self.max_rto {
            bail!("min RTO must be positive and not exceed max RTO");
        }
        if self.connection_timeout.is_zero() {
            bail!("connection timeout must be positive");
        }

        Ok(())
    }
}
