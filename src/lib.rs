//! Connectless is a transport for game servers that multiplexes two channels over a single UDP
//!  socket per peer: a reliable, ordered byte stream and best-effort datagrams whose delivery is
//!  tied to the reliable stream's progress.
//!
//! ## Design goals
//!
//! * Reliability is a miniature ARQ protocol in the spirit of TCP / KCP
//!   * every reliable fragment is identified by its byte offset in the stream (`seq`)
//!   * the receiver acknowledges *every* fragment it accepts, echoing its `seq` and `age` and
//!     adding its cumulative position (`una`, first byte not received contiguously)
//!   * the sender retransmits on timeout (RTO based on smoothed RTT) and immediately when an ack
//!     reveals that earlier packets were lost
//!   * `age` counts retransmissions of a packet. An ack echoing an outdated age does not
//!     produce an RTT sample, which avoids the retransmission ambiguity
//! * There is no congestion control. The send window is a fixed number of bytes, and writes are
//!   refused (backpressure) while it is full
//! * Unreliable datagrams are tagged with the sender's reliable stream position at send time.
//!   They are delivered only when the receiver is at exactly that position, buffered if the
//!   receiver is behind, and dropped if it is ahead or a newer datagram was delivered already.
//!   This keeps state updates sent as datagrams consistent with the reliable stream, favouring
//!   recency over completeness
//! * No IP level fragmentation: the MTU is configured, and the reliable stream is split into
//!   fragments that fit
//! * Protocol logic is free of I/O and clocks ([connection::Connection]), the tokio based
//!   [end_point::EndPoint] drives it with one task per connection
//! * An optional [transform::StreamTransform] (e.g. compression) is applied to the reliable
//!   stream as a whole
//!
//! ## Datagrams
//!
//! All numbers are in network byte order (BE). The first byte is the kind of datagram:
//!
//! ```ascii
//! 0: hello
//!    1: protocol version (u8)
//!    2: sender's MTU (varint u32)
//! 1: reliable fragment
//!    1: age (u8)
//!    2: seq (u64)
//!   10: payload
//! 2: unreliable datagram
//!    1: baseline (u32) - the sender's reliable stream position, truncated
//!    5: counter (u32) - increasing per datagram
//!    9: opcode (u16)
//!   11: payload
//! 3: ack
//!    1: age (u8) - echoed from the acknowledged fragment
//!    2: seq (u64) - of the acknowledged fragment
//!   10: una (u64) - everything before this offset was received
//! 4: close
//!    [no payload]
//! ```
//!
//! ## Connection lifecycle
//!
//! `Connecting -> Active -> Closing -> Closed`. The initiating side sends a hello and repeats it
//!  until anything is received from the peer; an endpoint creates connections for unknown peers
//!  only when they send a valid hello, and answers it. A closing connection waits until all
//!  data is acknowledged (or a grace period elapses) and then sends a close datagram. Timeouts
//!  and transform failures terminate a connection without a close datagram.
//!
//! ## Related:
//! * KCP
//!   * selective ack per fragment plus cumulative `una`, fast retransmit on out-of-order acks
//!   * congestion control optional
//! * TCP
//!   * RTO estimation (RFC 6298)
//!   * byte offset based sequence numbers

pub mod buffers;
pub mod config;
pub mod connection;
pub mod end_point;
pub mod error;
pub mod packet_header;
pub mod reassembly_window;
pub mod rtt;
pub mod safe_converter;
pub mod send_ledger;
pub mod send_pipeline;
pub mod stream_seq;
pub mod transform;
pub mod unreliable;

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            // .with_max_level(Level::DEBUG)
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
