use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// A byte offset into the reliable stream. Every reliable fragment is identified by the offset of
///  its first byte, and acknowledgements refer to offsets as well.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct StreamSeq(u64);

impl Display for StreamSeq {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl StreamSeq {
    pub const ZERO: StreamSeq = StreamSeq(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// The 32 bit snapshot of this offset that tags unreliable datagrams
    pub fn baseline(&self) -> u32 {
        self.0 as u32
    }

    /// number of bytes from `other` to `self`, or None if `other` is ahead of `self`
    pub fn distance_from(&self, other: StreamSeq) -> Option<u64> {
        self.0.checked_sub(other.0)
    }

    /// None if the result does not fit into u64. Offsets from the peer can be arbitrary.
    pub fn checked_add(&self, rhs: u64) -> Option<StreamSeq> {
        self.0.checked_add(rhs).map(StreamSeq)
    }
}

impl Add<u64> for StreamSeq {
    type Output = StreamSeq;

    fn add(self, rhs: u64) -> Self::Output {
        StreamSeq(self.0 + rhs)
    }
}

impl Add<usize> for StreamSeq {
    type Output = StreamSeq;

    fn add(self, rhs: usize) -> Self::Output {
        StreamSeq(self.0 + rhs as u64)
    }
}

impl AddAssign<usize> for StreamSeq {
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs as u64;
    }
}

impl Sub<u64> for StreamSeq {
    type Output = Option<StreamSeq>;

    fn sub(self, rhs: u64) -> Self::Output {
        self.0.checked_sub(rhs).map(StreamSeq)
    }
}
