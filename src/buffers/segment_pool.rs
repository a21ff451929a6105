use std::sync::Mutex;
use tracing::{debug, trace};

/// A fixed-size chunk of memory backing part of a send ledger's ring
pub type Segment = Box<[u8]>;

/// Pool of equally sized segments, shared by all connections of an endpoint. Segments are
///  handed out with arbitrary content: the ring only ever reads bytes it wrote before.
pub struct SegmentPool {
    segment_size: usize,
    segments: Mutex<Vec<Segment>>,
}

impl SegmentPool {
    pub fn new(segment_size: usize, max_pool_size: usize) -> Self {
        SegmentPool {
            segment_size,
            segments: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn get_from_pool(&self) -> Segment {
        {
            let mut segments = self.segments.lock().unwrap();
            if let Some(segment) = segments.pop() {
                trace!("returning segment from pool");
                return segment;
            }
        }

        debug!("no segment in pool: creating new segment");
        vec![0u8; self.segment_size].into_boxed_slice()
    }

    pub fn return_to_pool(&self, segment: Segment) {
        assert_eq!(segment.len(), self.segment_size,
                   "returned segment does not have the regular size of {} bytes", self.segment_size);

        let mut segments = self.segments.lock().unwrap();
        if segments.capacity() > segments.len() {
            trace!("returning segment to pool");
            segments.push(segment);
        }
        else {
            debug!("pool is full: discarding returned segment");
        }
    }

    #[cfg(test)]
    pub fn num_pooled(&self) -> usize {
        self.segments.lock().unwrap().len()
    }
}
