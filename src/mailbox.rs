//! User-to-user redirection mailboxes.
//!
//! `cmd >N` leaves the stage's output in the mailbox from the sender to user
//! N; `cmd <N` on the receiving side consumes it. At most one mailbox is
//! pending per (from, to) pair.

use std::collections::BTreeMap;

use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UserPipeError {
    #[error("*** Error: user #{0} does not exist yet. ***")]
    NoSuchUser(u32),
    #[error("*** Error: the pipe #{from}->#{to} already exists. ***")]
    AlreadyExists { from: u32, to: u32 },
    #[error("*** Error: the pipe #{from}->#{to} does not exist yet. ***")]
    Missing { from: u32, to: u32 },
}

#[derive(Debug)]
pub struct Mailboxes {
    boxes: BTreeMap<(u32, u32), Bytes>,
    capacity: usize,
}

impl Mailboxes {
    pub fn new(capacity: usize) -> Self {
        Self {
            boxes: BTreeMap::new(),
            capacity,
        }
    }

    pub fn contains(&self, from: u32, to: u32) -> bool {
        self.boxes.contains_key(&(from, to))
    }

    /// Fail if a mailbox from `from` to `to` is already pending.
    pub fn check_vacant(&self, from: u32, to: u32) -> Result<(), UserPipeError> {
        if self.contains(from, to) {
            return Err(UserPipeError::AlreadyExists { from, to });
        }
        Ok(())
    }

    /// Leave `data` for `to`. Contents beyond the capacity are dropped; the
    /// return value reports whether that happened.
    pub fn deposit(&mut self, from: u32, to: u32, mut data: Vec<u8>) -> Result<bool, UserPipeError> {
        self.check_vacant(from, to)?;
        let truncated = data.len() > self.capacity;
        data.truncate(self.capacity);
        self.boxes.insert((from, to), Bytes::from(data));
        Ok(truncated)
    }

    /// Consume the mailbox from `from` to `to`.
    pub fn take(&mut self, from: u32, to: u32) -> Result<Bytes, UserPipeError> {
        self.boxes
            .remove(&(from, to))
            .ok_or(UserPipeError::Missing { from, to })
    }

    /// Drop every mailbox sent by or addressed to `id`.
    pub fn discard_user(&mut self, id: u32) -> usize {
        let before = self.boxes.len();
        self.boxes.retain(|&(from, to), _| from != id && to != id);
        before - self.boxes.len()
    }
}
