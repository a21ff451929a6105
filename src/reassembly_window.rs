use std::collections::BTreeMap;
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::stream_seq::StreamSeq;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FragmentOutcome {
    /// The fragment was stored. If it closed the gap at the window's base, the base advanced.
    Accepted { base_advanced: bool },
    /// a fragment with this seq is pending already
    Duplicate,
    /// all of the fragment's bytes were delivered before
    Stale,
    /// the fragment extends beyond the window and was dropped
    OutOfWindow,
}

impl FragmentOutcome {
    /// Out-of-window fragments must not be acknowledged, the sender has to retransmit them
    pub fn should_ack(&self) -> bool {
        *self != FragmentOutcome::OutOfWindow
    }
}

/// The receive side of the reliable stream. Fragments arrive in arbitrary order, possibly
///  duplicated, and are written to their position relative to the window's base. Once the
///  fragment at the base is there, all contiguous fragments are moved to the ready buffer.
pub struct ReassemblyWindow {
    capacity: usize,
    /// first stream offset not received contiguously yet, i.e. the cumulative ack
    base: StreamSeq,
    /// bytes at stream offsets `[base, base + window.len())`, valid only where a pending fragment is
    window: BytesMut,
    /// seq and length of fragments received beyond base
    pending: BTreeMap<StreamSeq, usize>,
    ready: BytesMut,
    /// every base the window moved to since the last call to [ReassemblyWindow::take_base_history]
    base_history: Vec<StreamSeq>,
}

impl ReassemblyWindow {
    pub fn new(capacity: usize) -> ReassemblyWindow {
        ReassemblyWindow {
            capacity,
            base: StreamSeq::ZERO,
            window: BytesMut::new(),
            pending: BTreeMap::default(),
            ready: BytesMut::new(),
            base_history: Vec::new(),
        }
    }

    pub fn on_fragment(&mut self, data: &[u8], seq: StreamSeq) -> FragmentOutcome {
        let end = match seq.checked_add(data.len().safe_cast()) {
            Some(end) => end,
            None => {
                debug!("fragment {}+{} exceeds the stream's offset range", seq, data.len());
                return FragmentOutcome::OutOfWindow;
            }
        };
        if end <= self.base || data.is_empty() {
            trace!("fragment {}+{} was delivered already", seq, data.len());
            return FragmentOutcome::Stale;
        }
        if end.distance_from(self.base).unwrap_or(0) > self.capacity.safe_cast() {
            trace!("fragment {}+{} is outside the receive window starting at {}", seq, data.len(), self.base);
            return FragmentOutcome::OutOfWindow;
        }

        // a fragment overlapping the base contributes its unseen tail only
        let (seq, data) = match self.base.distance_from(seq) {
            Some(skip) if skip > 0 => (self.base, &data[skip.prechecked_cast()..]),
            _ => (seq, data),
        };

        if self.pending.contains_key(&seq) {
            trace!("duplicate fragment {}", seq);
            return FragmentOutcome::Duplicate;
        }

        let offs: usize = seq.distance_from(self.base)
            .expect("stale fragments were filtered")
            .prechecked_cast();
        if self.window.len() < offs + data.len() {
            self.window.resize(offs + data.len(), 0);
        }
        self.window[offs..offs + data.len()].copy_from_slice(data);
        self.pending.insert(seq, data.len());

        FragmentOutcome::Accepted { base_advanced: self.merge() }
    }

    /// Moves all fragments that are contiguous with the base to the ready buffer. The end of
    ///  each fragment passed on the way is recorded in the base history.
    fn merge(&mut self) -> bool {
        let mut new_base = self.base;
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > new_base {
                break;
            }
            let end = *entry.key() + *entry.get();
            entry.remove();
            if end > new_base {
                new_base = end;
                self.base_history.push(end);
            }
        }

        let advanced: usize = match new_base.distance_from(self.base) {
            Some(0) | None => return false,
            Some(n) => n.prechecked_cast(),
        };

        trace!("receive window base advanced from {} to {}", self.base, new_base);
        let chunk = self.window.split_to(advanced);
        self.ready.unsplit(chunk);
        self.base = new_base;
        true
    }

    /// Takes up to `max` bytes of contiguous data
    pub fn take_ready(&mut self, max: usize) -> Bytes {
        let n = max.min(self.ready.len());
        self.ready.split_to(n).freeze()
    }

    pub fn base(&self) -> StreamSeq {
        self.base
    }

    /// Returns the bases the window moved through since the last call, in ascending order. When
    ///  a gap is filled the base may jump past several fragments at once, and unreliable
    ///  datagrams tagged with any of the intermediate positions are still current there.
    pub fn take_base_history(&mut self) -> Vec<StreamSeq> {
        std::mem::take(&mut self.base_history)
    }

    #[cfg(test)]
    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    #[cfg(test)]
    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.window.clear();
        self.pending.clear();
        self.ready.clear();
        self.base_history.clear();
    }
}
