use thiserror::Error;

/// Errors surfaced to application code by [crate::connection::Connection] and the endpoint's
///  connection handles.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectlessError {
    /// The send ledger is full. This is a backpressure signal: retry once acknowledgements have
    ///  freed up space.
    #[error("send window is full - retry later")]
    WouldBlock,

    /// An unreliable datagram must fit into a single UDP packet
    #[error("unreliable datagram of {len} bytes exceeds the maximum of {max} bytes")]
    DatagramTooLarge { len: usize, max: usize },

    /// The connection is closing or closed and does not accept new data
    #[error("connection is closed")]
    Closed,

    /// The byte stream transform failed; the connection was torn down
    #[error("stream transform failed: {0}")]
    Transform(String),
}

/// Why a connection reached its terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// closed locally, all data was acknowledged
    Local,
    /// the peer sent a close datagram
    Peer,
    /// unacknowledged data remained when the grace period elapsed
    GracePeriodElapsed,
    /// no acknowledgement progress or no inbound traffic for longer than the configured timeout
    Timeout,
    /// the stream transform failed in either direction
    TransformFailed,
}
