//! Delivery rules for unreliable datagrams.
//!
//! Every unreliable datagram carries the sender's reliable stream position at send time (the
//!  'baseline') and a per-connection counter. A datagram is only meaningful relative to the
//!  reliable data that preceded it, so:
//!
//! * if the receiver's reliable stream is at exactly the datagram's baseline, it is delivered
//!   unless a datagram with a higher counter was delivered already
//! * if the receiver is behind, the datagram is buffered until the reliable stream catches up
//! * if the receiver is ahead, the datagram is outdated and dropped
//!
//! NB: This favours recency over completeness. The last delivered counter is never reset, so a
//!  datagram overtaken by a newer one is dropped even if the newer one had a different baseline.

use std::cmp::Ordering;
use bytes::Bytes;
use tracing::{debug, trace};
use crate::packet_header::UnreliableHeader;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum UnreliableVerdict {
    Deliver,
    Buffer,
    Drop,
}

/// Compares u32 stream positions with wrap-around, i.e. `a` is considered greater than `b` if it
///  is less than half the number range ahead of it
pub fn serial_cmp(a: u32, b: u32) -> Ordering {
    (a.wrapping_sub(b) as i32).cmp(&0)
}

struct BufferedDatagram {
    header: UnreliableHeader,
    payload: Bytes,
}

pub struct UnreliableGate {
    last_delivered_counter: u32,
    buffered: Vec<BufferedDatagram>,
    max_buffered: usize,
}

impl UnreliableGate {
    pub fn new(max_buffered: usize) -> UnreliableGate {
        UnreliableGate {
            last_delivered_counter: 0,
            buffered: Vec::new(),
            max_buffered,
        }
    }

    pub fn classify(&self, baseline: u32, counter: u32, receiver_baseline: u32) -> UnreliableVerdict {
        match serial_cmp(baseline, receiver_baseline) {
            Ordering::Equal if serial_cmp(counter, self.last_delivered_counter) == Ordering::Greater => UnreliableVerdict::Deliver,
            Ordering::Equal => UnreliableVerdict::Drop,
            Ordering::Greater => UnreliableVerdict::Buffer,
            Ordering::Less => UnreliableVerdict::Drop,
        }
    }

    /// Applies the delivery rules to an inbound datagram, passing it to `deliver` right away if
    ///  it is current
    pub fn on_datagram(&mut self, header: UnreliableHeader, payload: &[u8], receiver_baseline: u32, deliver: &mut impl FnMut(u16, &[u8])) -> UnreliableVerdict {
        let verdict = self.classify(header.baseline, header.counter, receiver_baseline);
        match verdict {
            UnreliableVerdict::Deliver => {
                self.last_delivered_counter = header.counter;
                deliver(header.opcode, payload);
            }
            UnreliableVerdict::Buffer => {
                if self.buffered.len() >= self.max_buffered {
                    debug!("unreliable buffer full: dropping datagram with baseline {} and counter {}", header.baseline, header.counter);
                    return UnreliableVerdict::Drop;
                }
                trace!("buffering unreliable datagram with baseline {} ahead of {}", header.baseline, receiver_baseline);
                self.buffered.push(BufferedDatagram {
                    header,
                    payload: Bytes::copy_from_slice(payload),
                });
            }
            UnreliableVerdict::Drop => {
                trace!("dropping outdated unreliable datagram with baseline {} and counter {}", header.baseline, header.counter);
            }
        }
        verdict
    }

    /// Re-evaluates buffered datagrams after the reliable stream advanced, in
    ///  `(baseline, counter)` order
    pub fn on_base_advanced(&mut self, receiver_baseline: u32, deliver: &mut impl FnMut(u16, &[u8])) {
        if self.buffered.is_empty() {
            return;
        }

        let (still_ahead, mut due): (Vec<_>, Vec<_>) = std::mem::take(&mut self.buffered)
            .into_iter()
            .partition(|d| serial_cmp(d.header.baseline, receiver_baseline) == Ordering::Greater);
        self.buffered = still_ahead;

        due.sort_by_key(|d| (d.header.baseline.wrapping_sub(receiver_baseline) as i32, d.header.counter));
        for datagram in due {
            let header = datagram.header;
            if self.classify(header.baseline, header.counter, receiver_baseline) == UnreliableVerdict::Deliver {
                self.last_delivered_counter = header.counter;
                deliver(header.opcode, &datagram.payload);
            }
            else {
                trace!("dropping buffered unreliable datagram with baseline {} and counter {}", header.baseline, header.counter);
            }
        }
    }

    #[cfg(test)]
    pub fn num_buffered(&self) -> usize {
        self.buffered.len()
    }

    pub fn clear(&mut self) {
        self.buffered.clear();
    }
}
