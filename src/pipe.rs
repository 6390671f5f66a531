use std::io::{Read, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use nix::fcntl::OFlag;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("failed to create pipe: {0}")]
    Create(#[source] nix::Error),

    #[error("pipe end already closed")]
    Closed,

    #[error("failed to duplicate pipe end: {0}")]
    Dup(#[source] std::io::Error),

    #[error("failed to read pipe: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write pipe: {0}")]
    Write(#[source] std::io::Error),

    #[error("pipe spool task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// An anonymous OS pipe. Both ends are close-on-exec, so the only child that
/// ever holds an end is the one it was explicitly handed to.
#[derive(Debug)]
pub struct AnonPipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl AnonPipe {
    pub fn create() -> Result<Self, PipeError> {
        let (read, write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(PipeError::Create)?;
        Ok(Self {
            read: Some(read),
            write: Some(write),
        })
    }

    /// Duplicate the write end, e.g. to hand one copy to stdout and one to stderr.
    pub fn write_end(&self) -> Result<OwnedFd, PipeError> {
        let fd = self.write.as_ref().ok_or(PipeError::Closed)?;
        fd.as_fd().try_clone_to_owned().map_err(PipeError::Dup)
    }

    /// Duplicate the read end.
    pub fn read_end(&self) -> Result<OwnedFd, PipeError> {
        let fd = self.read.as_ref().ok_or(PipeError::Closed)?;
        fd.as_fd().try_clone_to_owned().map_err(PipeError::Dup)
    }

    pub fn take_read(&mut self) -> Result<OwnedFd, PipeError> {
        self.read.take().ok_or(PipeError::Closed)
    }

    pub fn take_write(&mut self) -> Result<OwnedFd, PipeError> {
        self.write.take().ok_or(PipeError::Closed)
    }

    pub fn close_read(&mut self) {
        self.read = None;
    }

    pub fn close_write(&mut self) {
        self.write = None;
    }

    pub fn close(&mut self) {
        self.close_read();
        self.close_write();
    }

    pub fn is_open(&self) -> bool {
        self.read.is_some() || self.write.is_some()
    }
}

/// Everything a [`Capture`] collected.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Captured {
    pub data: Vec<u8>,
    /// The writers produced more than the limit; `data` holds the first
    /// `limit` bytes.
    pub truncated: bool,
}

/// Output side of a stage: a pipe whose read end is drained into memory on
/// the blocking pool while the stage runs, so a chatty stage never stalls on
/// pipe capacity.
///
/// At most `limit` bytes are kept. Once a writer goes past that, the read
/// end is closed, and the writer gets `SIGPIPE` (or `EPIPE`) on its next
/// write.
pub struct Capture {
    pipe: AnonPipe,
    reader: JoinHandle<std::io::Result<Vec<u8>>>,
    overflowed: Arc<AtomicBool>,
}

impl Capture {
    pub fn spawn(limit: usize) -> Result<Self, PipeError> {
        let mut pipe = AnonPipe::create()?;
        let read = pipe.take_read()?;
        let overflowed = Arc::new(AtomicBool::new(false));
        let flag = overflowed.clone();
        let reader = tokio::task::spawn_blocking(move || {
            let mut source = std::fs::File::from(read).take((limit as u64).saturating_add(1));
            let mut out = Vec::new();
            source.read_to_end(&mut out)?;
            if out.len() > limit {
                out.truncate(limit);
                // Raise the flag before the read end closes, so it is visible
                // by the time the writer has died of SIGPIPE.
                flag.store(true, Ordering::Release);
            }
            drop(source);
            Ok(out)
        });
        Ok(Self {
            pipe,
            reader,
            overflowed,
        })
    }

    /// A fresh handle to the write end, suitable for a child's stdout/stderr.
    pub fn stdio(&self) -> Result<Stdio, PipeError> {
        Ok(Stdio::from(self.pipe.write_end()?))
    }

    /// Write bytes into the capture from the server side. Bytes past the
    /// limit are dropped.
    pub fn write_all(&self, data: &[u8]) -> Result<(), PipeError> {
        let mut file = std::fs::File::from(self.pipe.write_end()?);
        match file.write_all(data) {
            Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
            result => result.map_err(PipeError::Write),
        }
    }

    /// Whether a writer has already gone past the limit.
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }

    /// Close the server's write end and collect everything written.
    ///
    /// Resolves once every holder of the write end has closed it, i.e. after
    /// the stage (and anything it left running with the pipe open) exits, or
    /// as soon as the limit is reached.
    pub async fn finish(mut self) -> Result<Captured, PipeError> {
        self.pipe.close_write();
        let data = self.reader.await?.map_err(PipeError::Read)?;
        Ok(Captured {
            data,
            truncated: self.overflowed.load(Ordering::Acquire),
        })
    }
}

/// Input side of a stage: a pipe whose write end is filled from `data` on the
/// blocking pool. Returns the read end for the child and the feeder task.
///
/// The feeder stops quietly on a broken pipe, since a stage may exit without
/// consuming all of its input.
pub fn feed(data: Bytes) -> Result<(Stdio, JoinHandle<()>), PipeError> {
    let mut pipe = AnonPipe::create()?;
    let read = pipe.take_read()?;
    let write = pipe.take_write()?;
    let writer = tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::from(write);
        if let Err(e) = file.write_all(&data) {
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                tracing::debug!(?e, "stage input feeder stopped");
            }
        }
    });
    Ok((Stdio::from(read), writer))
}
