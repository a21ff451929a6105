//! The send side of the reliable stream: every packet that was sent but not yet acknowledged.
//!
//! Payload bytes live in a [SegmentRing] at their stream offset, packet metadata in an index
//!  based slab. Outstanding packets are linked in transmission order (oldest first) so that
//!  timer driven and fast retransmission always look at the head of the list. A second queue
//!  keeps all retained packets in seq order: ring space is reclaimed from its front, and only
//!  while the front packet is acknowledged.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};
use crate::buffers::segment_pool::SegmentPool;
use crate::buffers::segment_ring::SegmentRing;
use crate::stream_seq::StreamSeq;

/// Returned by [SendLedger::append] if the packet does not fit into the send window
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct LedgerFull;

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct AckOutcome {
    /// round trip time of the acknowledged transmission, if the ack echoed the packet's current age
    pub rtt_sample: Option<u64>,
    /// Transmission ordinal of the selectively acknowledged packet if packets sent before it are
    ///  still outstanding. Those are considered lost.
    pub lost_before: Option<u64>,
    /// number of packets removed by this ack
    pub num_acked: usize,
}

/// A (re)transmitted packet's header fields and payload. The payload may wrap around a segment
///  boundary, so it is exposed as two slices.
#[derive(Debug)]
pub struct PacketView<'a> {
    pub age: u8,
    pub seq: StreamSeq,
    pub head: &'a [u8],
    pub tail: &'a [u8],
    /// send timestamp of the previous transmission
    pub previous_stamp: u64,
}

impl PacketView<'_> {
    pub fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }
}

struct PacketRecord {
    seq: StreamSeq,
    len: usize,
    age: u8,
    stamp: u64,
    ordinal: u64,
    acked: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct SendLedger {
    ring: SegmentRing,
    capacity: usize,

    records: Vec<PacketRecord>,
    free_slots: Vec<usize>,
    /// slab indices of all packets retained in the ring, ordered by seq
    seq_order: VecDeque<usize>,

    /// outstanding packets in transmission order
    head: Option<usize>,
    tail: Option<usize>,
    num_outstanding: usize,

    next_ordinal: u64,
}

impl SendLedger {
    pub fn new(capacity: usize, pool: Arc<SegmentPool>) -> SendLedger {
        SendLedger {
            ring: SegmentRing::new(pool),
            capacity,
            records: Vec::new(),
            free_slots: Vec::new(),
            seq_order: VecDeque::new(),
            head: None,
            tail: None,
            num_outstanding: 0,
            next_ordinal: 0,
        }
    }

    /// Adds a packet with the next stream offset, age 0 and send timestamp `now`. The payload
    ///  must not be empty.
    pub fn append(&mut self, data: &[u8], now: u64) -> Result<StreamSeq, LedgerFull> {
        debug_assert!(!data.is_empty());
        if self.ring.retained_len() + data.len() > self.capacity {
            trace!("send window full: {} bytes retained, {} requested", self.ring.retained_len(), data.len());
            return Err(LedgerFull);
        }

        let seq = self.ring.append(data);
        let record = PacketRecord {
            seq,
            len: data.len(),
            age: 0,
            stamp: now,
            ordinal: self.take_ordinal(),
            acked: false,
            prev: None,
            next: None,
        };

        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.records[idx] = record;
                idx
            }
            None => {
                self.records.push(record);
                self.records.len() - 1
            }
        };
        self.seq_order.push_back(idx);
        self.link_at_tail(idx);
        self.num_outstanding += 1;

        Ok(seq)
    }

    /// Processes an acknowledgement: the packet with exactly `seq` is removed (selective ack),
    ///  and so is every packet before `una` (cumulative ack).
    pub fn on_ack(&mut self, age: u8, seq: StreamSeq, una: StreamSeq, now: u64) -> AckOutcome {
        let mut outcome = AckOutcome::default();
        let mut earlier_outstanding = false;

        let mut cur = self.head;
        while let Some(idx) = cur {
            let record = &self.records[idx];
            cur = record.next;

            if record.seq == seq {
                if record.age == age {
                    outcome.rtt_sample = Some(now.saturating_sub(record.stamp));
                }
                else {
                    trace!("ack for {} echoes age {}, packet has age {}: no RTT sample", seq, age, record.age);
                }
                if earlier_outstanding {
                    outcome.lost_before = Some(record.ordinal);
                }
                self.remove(idx);
                outcome.num_acked += 1;
            }
            else if record.seq < una {
                self.remove(idx);
                outcome.num_acked += 1;
            }
            else {
                earlier_outstanding = true;
            }
        }

        self.reclaim();
        outcome
    }

    /// Timer driven retransmission: if the oldest outstanding packet was sent at or before
    ///  `expiry`, it gets a new age and timestamp and moves to the end of the transmission order.
    pub fn retransmit_due(&mut self, now: u64, expiry: u64) -> Option<PacketView<'_>> {
        let idx = self.head?;
        if self.records[idx].stamp > expiry {
            return None;
        }
        Some(self.retransmit(idx, now))
    }

    /// Fast retransmission: resends the oldest outstanding packet if it was transmitted before
    ///  the transmission with ordinal `stop`. Callers loop until this returns None.
    pub fn retransmit_lost_up_to(&mut self, now: u64, stop: u64) -> Option<PacketView<'_>> {
        let idx = self.head?;
        if self.records[idx].ordinal >= stop {
            return None;
        }
        Some(self.retransmit(idx, now))
    }

    pub fn is_full(&self) -> bool {
        self.ring.retained_len() >= self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.num_outstanding == 0
    }

    /// bytes retained in the ring, including acknowledged packets that could not be reclaimed yet
    pub fn outstanding_bytes(&self) -> usize {
        self.ring.retained_len()
    }

    pub fn outstanding_count(&self) -> usize {
        self.num_outstanding
    }

    pub fn oldest_timestamp(&self) -> Option<u64> {
        self.head.map(|idx| self.records[idx].stamp)
    }

    /// the stream offset after the last byte ever appended
    pub fn high_water_mark(&self) -> StreamSeq {
        self.ring.tail()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops all packets, e.g. on connection teardown
    pub fn clear(&mut self) {
        if self.num_outstanding > 0 {
            debug!("discarding {} unacknowledged packets", self.num_outstanding);
        }
        self.records.clear();
        self.free_slots.clear();
        self.seq_order.clear();
        self.head = None;
        self.tail = None;
        self.num_outstanding = 0;
        self.ring.release_up_to(self.ring.tail());
    }

    fn retransmit(&mut self, idx: usize, now: u64) -> PacketView<'_> {
        self.unlink(idx);
        self.link_at_tail(idx);
        let ordinal = self.take_ordinal();

        let record = &mut self.records[idx];
        let previous_stamp = record.stamp;
        record.age = record.age.wrapping_add(1);
        record.stamp = now;
        record.ordinal = ordinal;
        trace!("retransmitting {} with age {}", record.seq, record.age);

        let record = &self.records[idx];
        let (head, tail) = self.ring.get(record.seq, record.len);
        PacketView {
            age: record.age,
            seq: record.seq,
            head,
            tail,
            previous_stamp,
        }
    }

    fn take_ordinal(&mut self) -> u64 {
        let result = self.next_ordinal;
        self.next_ordinal += 1;
        result
    }

    fn remove(&mut self, idx: usize) {
        self.unlink(idx);
        self.records[idx].acked = true;
        self.num_outstanding -= 1;
    }

    fn reclaim(&mut self) {
        while let Some(&idx) = self.seq_order.front() {
            let record = &self.records[idx];
            if !record.acked {
                break;
            }
            let end = record.seq + record.len;
            self.seq_order.pop_front();
            self.free_slots.push(idx);
            self.ring.release_up_to(end);
        }
    }

    fn link_at_tail(&mut self, idx: usize) {
        self.records[idx].prev = self.tail;
        self.records[idx].next = None;
        match self.tail {
            Some(tail) => self.records[tail].next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let prev = self.records[idx].prev.take();
        let next = self.records[idx].next.take();
        match prev {
            Some(prev) => self.records[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.records[next].prev = prev,
            None => self.tail = prev,
        }
    }

    #[cfg(test)]
    fn transmission_order(&self) -> Vec<u64> {
        let mut result = Vec::new();
        let mut cur = self.head;
        while let Some(idx) = cur {
            result.push(self.records[idx].seq.to_raw());
            cur = self.records[idx].next;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn seq(raw: u64) -> StreamSeq {
        StreamSeq::from_raw(raw)
    }

    /// ledger with packets of 10 bytes each at seqs 0, 10, 20, ... sent at t=100, 101, 102, ...
    fn ledger_with_packets(num_packets: u64) -> SendLedger {
        let pool = Arc::new(SegmentPool::new(64, 16));
        let mut ledger = SendLedger::new(1000, pool);
        for i in 0..num_packets {
            let data = [i as u8; 10];
            assert_eq!(ledger.append(&data, 100 + i), Ok(seq(i * 10)));
        }
        ledger
    }

    #[test]
    fn test_append() {
        let ledger = ledger_with_packets(3);
        assert_eq!(ledger.outstanding_count(), 3);
        assert_eq!(ledger.outstanding_bytes(), 30);
        assert_eq!(ledger.high_water_mark(), seq(30));
        assert_eq!(ledger.oldest_timestamp(), Some(100));
        assert_eq!(ledger.transmission_order(), vec![0, 10, 20]);
    }

    #[test]
    fn test_backpressure() {
        let pool = Arc::new(SegmentPool::new(64, 16));
        let mut ledger = SendLedger::new(25, pool);

        assert!(ledger.append(&[1; 10], 0).is_ok());
        assert!(ledger.append(&[2; 10], 0).is_ok());
        assert!(!ledger.is_full());
        assert_eq!(ledger.append(&[3; 10], 0), Err(LedgerFull));
        assert_eq!(ledger.outstanding_count(), 2);

        assert!(ledger.append(&[3; 5], 0).is_ok());
        assert!(ledger.is_full());

        ledger.on_ack(0, seq(0), seq(0), 10);
        assert!(!ledger.is_full());
        assert_eq!(ledger.append(&[4; 10], 0), Ok(seq(25)));
    }

    #[rstest]
    #[case::selective_middle(0, 10, 0, vec![0, 20, 30], Some(1))]
    #[case::selective_head(0, 0, 0, vec![10, 20, 30], None)]
    #[case::cumulative(0, 99, 20, vec![20, 30], None)]
    #[case::cumulative_and_selective(0, 30, 20, vec![20], Some(3))]
    #[case::unknown_seq(0, 15, 0, vec![0, 10, 20, 30], None)]
    #[case::cumulative_all(0, 40, 40, vec![], None)]
    fn test_on_ack(#[case] age: u8, #[case] ack_seq: u64, #[case] una: u64, #[case] expected_remaining: Vec<u64>, #[case] expected_lost_before: Option<u64>) {
        let mut ledger = ledger_with_packets(4);
        let outcome = ledger.on_ack(age, seq(ack_seq), seq(una), 200);

        assert_eq!(ledger.transmission_order(), expected_remaining);
        assert_eq!(ledger.outstanding_count(), expected_remaining.len());
        assert_eq!(outcome.num_acked, 4 - expected_remaining.len());
        assert_eq!(outcome.lost_before, expected_lost_before);
    }

    #[test]
    fn test_rtt_sample_requires_matching_age() {
        let mut ledger = ledger_with_packets(2);

        assert_eq!(ledger.on_ack(0, seq(10), seq(0), 150).rtt_sample, Some(49));

        // packet 0 is retransmitted at t=300, an ack for the first transmission arrives
        assert!(ledger.retransmit_due(300, 100).is_some());
        let outcome = ledger.on_ack(0, seq(0), seq(0), 310);
        assert_eq!(outcome.rtt_sample, None);
        assert_eq!(outcome.num_acked, 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_ack_is_idempotent() {
        let mut ledger = ledger_with_packets(3);
        assert_eq!(ledger.on_ack(0, seq(10), seq(0), 200).num_acked, 1);
        assert_eq!(ledger.on_ack(0, seq(10), seq(0), 200), AckOutcome::default());
        assert_eq!(ledger.outstanding_count(), 2);
    }

    #[test]
    fn test_reclaim_only_from_head() {
        let mut ledger = ledger_with_packets(3);

        ledger.on_ack(0, seq(10), seq(0), 200);
        ledger.on_ack(0, seq(20), seq(0), 200);
        assert_eq!(ledger.outstanding_count(), 1);
        assert_eq!(ledger.outstanding_bytes(), 30);

        ledger.on_ack(0, seq(0), seq(0), 200);
        assert_eq!(ledger.outstanding_count(), 0);
        assert_eq!(ledger.outstanding_bytes(), 0);
        assert_eq!(ledger.high_water_mark(), seq(30));
    }

    #[test]
    fn test_retransmit_due() {
        let mut ledger = ledger_with_packets(3);

        assert!(ledger.retransmit_due(200, 99).is_none());

        let view = ledger.retransmit_due(200, 101).unwrap();
        assert_eq!((view.age, view.seq, view.len(), view.previous_stamp), (1, seq(0), 10, 100));
        assert_eq!(view.head, &[0u8; 10]);

        let view = ledger.retransmit_due(200, 101).unwrap();
        assert_eq!((view.age, view.seq), (1, seq(10)));

        // packet 20 was sent at 102, the retransmitted ones at 200
        assert!(ledger.retransmit_due(200, 101).is_none());
        assert_eq!(ledger.transmission_order(), vec![20, 0, 10]);
        assert_eq!(ledger.oldest_timestamp(), Some(102));
    }

    #[test]
    fn test_fast_retransmit() {
        let mut ledger = ledger_with_packets(4);

        let outcome = ledger.on_ack(0, seq(20), seq(0), 150);
        let stop = outcome.lost_before.unwrap();

        let mut resent = Vec::new();
        while let Some(view) = ledger.retransmit_lost_up_to(150, stop) {
            assert_eq!(view.age, 1);
            resent.push(view.seq.to_raw());
        }
        assert_eq!(resent, vec![0, 10]);
        assert_eq!(ledger.transmission_order(), vec![30, 0, 10]);
    }

    #[test]
    fn test_age_wraps() {
        let mut ledger = ledger_with_packets(1);
        for _ in 0..256 {
            ledger.retransmit_due(0, u64::MAX);
        }
        let view = ledger.retransmit_due(0, u64::MAX).unwrap();
        assert_eq!(view.age, 1);
    }

    #[test]
    fn test_payload_across_segments() {
        let pool = Arc::new(SegmentPool::new(16, 4));
        let mut ledger = SendLedger::new(100, pool);
        ledger.append(b"0123456789", 0).unwrap();
        ledger.append(b"abcdefghij", 0).unwrap();
        ledger.on_ack(0, seq(0), seq(0), 0);

        let view = ledger.retransmit_due(5, 0).unwrap();
        assert_eq!(view.seq, seq(10));
        assert_eq!(view.head, b"abcdef");
        assert_eq!(view.tail, b"ghij");
    }

    #[test]
    fn test_slots_are_reused() {
        let mut ledger = ledger_with_packets(2);
        ledger.on_ack(0, seq(0), seq(20), 0);
        ledger.append(&[9; 10], 0).unwrap();
        ledger.append(&[9; 10], 0).unwrap();
        assert_eq!(ledger.records.len(), 2);
        assert_eq!(ledger.transmission_order(), vec![20, 30]);
    }

    #[test]
    fn test_clear() {
        let mut ledger = ledger_with_packets(3);
        ledger.clear();
        assert!(ledger.is_empty());
        assert_eq!(ledger.outstanding_bytes(), 0);
        assert_eq!(ledger.oldest_timestamp(), None);
    }
}
