//! Per-session pipe chain.
//!
//! Slots are addressed relative to the stage about to run: slot 0 feeds the
//! current stage, slot 1 the next one, and so on. The chain persists across
//! command lines, which is what lets `ls |2` reach a stage two lines later.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

#[derive(Debug)]
pub struct PipeChain {
    slots: VecDeque<Option<Bytes>>,
    /// Most bytes one slot may hold.
    limit: usize,
}

impl PipeChain {
    pub fn new(limit: usize) -> Self {
        Self {
            slots: VecDeque::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether a pipe exists at `slot`, even if nothing was written to it.
    pub fn has(&self, slot: usize) -> bool {
        matches!(self.slots.get(slot), Some(Some(_)))
    }

    /// Create the pipe at `slot` if it does not exist yet.
    pub fn open(&mut self, slot: usize) {
        if self.slots.len() <= slot {
            self.slots.resize(slot + 1, None);
        }
        self.slots[slot].get_or_insert_with(Bytes::new);
    }

    /// Append a stage's output to `slot`, creating the pipe if needed.
    ///
    /// Returns `true` if the slot hit its limit and part of `data` was
    /// dropped.
    pub fn append(&mut self, slot: usize, mut data: Vec<u8>) -> bool {
        self.open(slot);
        let limit = self.limit;
        let Some(Some(buf)) = self.slots.get_mut(slot) else {
            return false;
        };
        let room = limit.saturating_sub(buf.len());
        let truncated = data.len() > room;
        data.truncate(room);
        if buf.is_empty() {
            *buf = Bytes::from(data);
        } else if !data.is_empty() {
            let mut joined = BytesMut::with_capacity(buf.len() + data.len());
            joined.extend_from_slice(&buf[..]);
            joined.extend_from_slice(&data);
            *buf = joined.freeze();
        }
        truncated
    }

    /// Contents of the pipe feeding the current stage, if any. The slot stays
    /// in place until [`advance`](Self::advance) retires it.
    pub fn current(&self) -> Option<Bytes> {
        self.slots.front().cloned().flatten()
    }

    /// Retire slot 0 and shift every other slot one step closer.
    pub fn advance(&mut self) {
        self.slots.pop_front();
        while matches!(self.slots.back(), Some(None)) {
            self.slots.pop_back();
        }
    }

    /// Number of pipes currently in flight.
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
