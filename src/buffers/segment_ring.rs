use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;
use crate::buffers::segment_pool::{Segment, SegmentPool};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::stream_seq::StreamSeq;

/// A byte ring addressed by stream offset: the byte at stream offset `n` lives at offset
///  `n % segment_size` in segment number `n / segment_size`. Bytes are appended at the tail and
///  released from the head, and segments are returned to the pool once the head has passed
///  them completely.
pub struct SegmentRing {
    pool: Arc<SegmentPool>,
    segment_size: u64,
    segments: VecDeque<Segment>,
    /// stream offset of the first byte of `segments[0]`
    first_segment_offset: u64,
    /// first byte that was not released yet
    head: StreamSeq,
    /// next byte to be written
    tail: StreamSeq,
}

impl SegmentRing {
    pub fn new(pool: Arc<SegmentPool>) -> SegmentRing {
        let segment_size = pool.segment_size().safe_cast();
        SegmentRing {
            pool,
            segment_size,
            segments: VecDeque::new(),
            first_segment_offset: 0,
            head: StreamSeq::ZERO,
            tail: StreamSeq::ZERO,
        }
    }

    pub fn tail(&self) -> StreamSeq {
        self.tail
    }

    /// number of bytes between head and tail
    pub fn retained_len(&self) -> usize {
        (self.tail.to_raw() - self.head.to_raw()).prechecked_cast()
    }

    /// Appends data at the tail, returning the stream offset of its first byte
    pub fn append(&mut self, mut data: &[u8]) -> StreamSeq {
        let start = self.tail;
        while !data.is_empty() {
            let offs_in_segment: usize = (self.tail.to_raw() % self.segment_size).prechecked_cast();
            if offs_in_segment == 0 && self.segment_end() == self.tail.to_raw() {
                self.segments.push_back(self.pool.get_from_pool());
            }

            let segment = self.segments.back_mut()
                .expect("a segment was just added if the tail was at a segment boundary");
            let n = data.len().min(segment.len() - offs_in_segment);
            segment[offs_in_segment..offs_in_segment + n].copy_from_slice(&data[..n]);
            data = &data[n..];
            self.tail += n;
        }
        start
    }

    /// Returns the bytes in `[seq, seq+len)` as (up to) two slices. The range must lie between
    ///  head and tail and not exceed the segment size.
    pub fn get(&self, seq: StreamSeq, len: usize) -> (&[u8], &[u8]) {
        assert!(seq >= self.head && seq + len <= self.tail, "range {}+{} outside of ring [{}, {})", seq, len, self.head, self.tail);
        assert!(len.safe_cast() <= self.segment_size);

        let rel = seq.to_raw() - self.first_segment_offset;
        let idx: usize = (rel / self.segment_size).prechecked_cast();
        let offs: usize = (rel % self.segment_size).prechecked_cast();

        let first = &self.segments[idx];
        if offs + len <= first.len() {
            (&first[offs..offs + len], &[])
        }
        else {
            let head_len = first.len() - offs;
            (&first[offs..], &self.segments[idx + 1][..len - head_len])
        }
    }

    /// Releases all bytes before `up_to`, returning fully released segments to the pool
    pub fn release_up_to(&mut self, up_to: StreamSeq) {
        assert!(up_to <= self.tail);
        if up_to <= self.head {
            return;
        }
        self.head = up_to;

        // NB: a segment is only complete once the tail passed its end, and up_to never exceeds the tail
        while !self.segments.is_empty() && self.first_segment_offset + self.segment_size <= up_to.to_raw() {
            if let Some(segment) = self.segments.pop_front() {
                trace!("releasing segment at offset {}", self.first_segment_offset);
                self.pool.return_to_pool(segment);
            }
            self.first_segment_offset += self.segment_size;
        }
    }

    fn segment_end(&self) -> u64 {
        self.first_segment_offset + self.segments.len() as u64 * self.segment_size
    }

    #[cfg(test)]
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }
}

impl Drop for SegmentRing {
    fn drop(&mut self) {
        for segment in self.segments.drain(..) {
            self.pool.return_to_pool(segment);
        }
    }
}
