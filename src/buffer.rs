//! Per-session receive buffer.
//!
//! Bytes arrive from the socket in arbitrary chunks. The buffer holds
//! everything not yet terminated by `\n` and hands out complete command
//! lines as they become available, independent of how the stream was split.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("*** Error: command too long (max {max} bytes). ***")]
pub struct Overflow {
    pub max: usize,
}

/// Result of feeding one chunk into a [`CommandBuffer`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Feed {
    /// Complete lines, in arrival order, without the delimiter.
    pub lines: Vec<String>,
    /// Set when the unterminated remainder hit the size limit and was dropped.
    pub overflow: Option<Overflow>,
}

/// Line splitter with a size limit.
///
/// A command may hold at most `max - 1` bytes before its newline. Once the
/// buffered bytes reach `max`, the buffer is reset and the rest of that
/// over-long line is dropped up to and including its newline, so the outcome
/// does not depend on how the stream was split into reads.
#[derive(Debug)]
pub struct CommandBuffer {
    buf: Vec<u8>,
    max: usize,
    /// Set while skipping the tail of a line that already overflowed.
    discarding: bool,
}

impl CommandBuffer {
    pub fn new(max: usize) -> Self {
        Self {
            buf: Vec::new(),
            max,
            discarding: false,
        }
    }

    /// Number of buffered bytes not yet resolved into a line.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append a chunk and extract every line it completes.
    ///
    /// Lines completed by this chunk are returned even if another line in
    /// the same chunk overflows.
    pub fn feed(&mut self, chunk: &[u8]) -> Feed {
        let mut feed = Feed::default();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos);
            rest = &tail[1..];
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if self.buf.len() + head.len() >= self.max {
                feed.overflow = Some(self.reset());
            } else {
                self.buf.extend_from_slice(head);
                feed.lines.push(take_line(&mut self.buf));
            }
        }

        if self.discarding {
            return feed;
        }
        if self.buf.len() + rest.len() >= self.max {
            feed.overflow = Some(self.reset());
            self.discarding = true;
        } else {
            self.buf.extend_from_slice(rest);
        }
        feed
    }

    fn reset(&mut self) -> Overflow {
        self.buf.clear();
        Overflow { max: self.max }
    }
}

fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}
