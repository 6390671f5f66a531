use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::buffer::CommandBuffer;
use crate::chain::PipeChain;
use crate::config::ServerConfig;
use crate::id_pool::IdPool;
use crate::mailbox::{Mailboxes, UserPipeError};
use crate::outbox::Outbox;

/// Display name of a session that has not run `name` yet.
pub const UNNAMED: &str = "(no name)";

/// Format a peer address the way the wire protocol shows it: `ip/port`.
pub fn format_addr(addr: &SocketAddr) -> String {
    format!("{}/{}", addr.ip(), addr.port())
}

/// The shared, registry-visible part of a session.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: u32,
    pub name: Option<String>,
    pub addr: SocketAddr,
    pub outbox: Outbox,
}

impl Peer {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(UNNAMED)
    }

    pub fn address(&self) -> String {
        format_addr(&self.addr)
    }
}

/// Connection-local state of one client.
///
/// Owned by the task serving the connection; nothing here is shared with
/// other sessions. Identity and name live in the [`SessionRegistry`].
#[derive(Debug)]
pub struct Session {
    pub id: u32,
    pub outbox: Outbox,
    /// Variables passed to every stage this session spawns.
    pub env: BTreeMap<String, String>,
    pub buffer: CommandBuffer,
    pub chain: PipeChain,
}

impl Session {
    pub fn new(peer: &Peer, config: &ServerConfig) -> Self {
        Self {
            id: peer.id,
            outbox: peer.outbox.clone(),
            env: initial_env(config),
            buffer: CommandBuffer::new(config.max_command_size),
            chain: PipeChain::new(config.output_limit),
        }
    }

    pub fn setenv(&mut self, name: &str, value: &str) {
        self.env.insert(name.to_string(), value.to_string());
    }

    pub fn getenv(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }
}

pub fn initial_env(config: &ServerConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("PATH".to_string(), config.default_path.clone());
    env
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("*** Error: server is full. ***")]
    Full,
}

/// Failures of operations that address a live peer.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("*** User '{0}' already exists. ***")]
    NameExists(String),
    #[error("*** Error: user #{0} does not exist yet. ***")]
    NotFound(u32),
}

struct RegistryInner {
    /// Live sessions in connection order.
    peers: Vec<Peer>,
    ids: IdPool,
    mailboxes: Mailboxes,
}

impl RegistryInner {
    fn peer(&self, id: u32) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }
}

/// All live sessions, their ids, and the mailboxes between them.
///
/// Every mutation happens under one lock, so id allocation, name checks,
/// and mailbox hand-offs are atomic with respect to each other. Broadcasts
/// are enqueued under the same lock, so all sessions see them in the same
/// order.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl SessionRegistry {
    pub fn new(max_users: u32, mailbox_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RegistryInner {
                peers: Vec::new(),
                ids: IdPool::new(1, max_users),
                mailboxes: Mailboxes::new(mailbox_capacity),
            })),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.max_users, config.mailbox_capacity)
    }

    /// Admit a new connection: allocate the smallest free id and insert an
    /// unnamed peer. Fails with [`RegistryError::Full`] when the id pool is
    /// exhausted.
    pub fn register(&self, addr: SocketAddr, outbox: Outbox) -> Result<Peer, RegistryError> {
        let mut inner = self.inner.lock();
        let id = inner.ids.acquire().ok_or(RegistryError::Full)?;
        let peer = Peer {
            id,
            name: None,
            addr,
            outbox,
        };
        inner.peers.push(peer.clone());
        tracing::info!(id, addr = %addr, in_use = inner.ids.in_use(), "session registered");
        Ok(peer)
    }

    /// Remove a session, release its id, and drop its mailboxes.
    pub fn remove(&self, id: u32) -> Option<Peer> {
        let mut inner = self.inner.lock();
        let index = inner.peers.iter().position(|p| p.id == id)?;
        let peer = inner.peers.remove(index);
        inner.ids.release(id);
        let dropped = inner.mailboxes.discard_user(id);
        if dropped > 0 {
            tracing::debug!(id, dropped, "discarded mailboxes of departing session");
        }
        tracing::info!(id, "session removed");
        Some(peer)
    }

    pub fn get(&self, id: u32) -> Option<Peer> {
        self.inner.lock().peer(id).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Peer> {
        let inner = self.inner.lock();
        inner
            .peers
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .cloned()
    }

    /// Snapshot of every live session, ordered by id.
    pub fn list(&self) -> Vec<Peer> {
        let mut peers = self.inner.lock().peers.clone();
        peers.sort_by_key(|p| p.id);
        peers
    }

    pub fn len(&self) -> usize {
        self.inner.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Set a session's name unless another live session already holds it.
    /// The name check and the update are one atomic step.
    pub fn rename(&self, id: u32, name: &str) -> Result<Peer, PeerError> {
        let mut inner = self.inner.lock();
        if inner.peers.iter().any(|p| p.name.as_deref() == Some(name)) {
            return Err(PeerError::NameExists(name.to_string()));
        }
        let peer = inner
            .peers
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(PeerError::NotFound(id))?;
        peer.name = Some(name.to_string());
        tracing::info!(id, name, "session renamed");
        Ok(peer.clone())
    }

    /// Send one line to every live session, the sender included.
    pub fn broadcast(&self, text: &str) {
        let inner = self.inner.lock();
        let data = line_bytes(text);
        for peer in &inner.peers {
            peer.outbox.send(data.clone());
        }
    }

    /// Send one line to the session with `id`.
    pub fn unicast(&self, id: u32, text: &str) -> Result<(), PeerError> {
        let inner = self.inner.lock();
        let peer = inner.peer(id).ok_or(PeerError::NotFound(id))?;
        peer.outbox.send(line_bytes(text));
        Ok(())
    }

    /// Validate a `>N` redirection from `from` before the stage runs:
    /// the target must be live and no mailbox `from -> to` may be pending.
    pub fn check_send(&self, from: u32, to: u32) -> Result<Peer, UserPipeError> {
        let inner = self.inner.lock();
        let target = inner.peer(to).ok_or(UserPipeError::NoSuchUser(to))?;
        inner.mailboxes.check_vacant(from, to)?;
        Ok(target.clone())
    }

    /// Take the mailbox `from -> to` for a `<N` redirection. Returns the
    /// sender's peer record alongside the contents.
    pub fn take_mailbox(&self, from: u32, to: u32) -> Result<(Peer, Bytes), UserPipeError> {
        let mut inner = self.inner.lock();
        let sender = inner.peer(from).cloned().ok_or(UserPipeError::NoSuchUser(from))?;
        let data = inner.mailboxes.take(from, to)?;
        Ok((sender, data))
    }

    /// Leave a stage's output in the mailbox `from -> to`. Output addressed to
    /// a session that left in the meantime is discarded.
    pub fn deposit(&self, from: u32, to: u32, data: Vec<u8>) -> Result<(), UserPipeError> {
        let mut inner = self.inner.lock();
        if inner.peer(to).is_none() {
            tracing::debug!(from, to, "mailbox target left before delivery");
            return Err(UserPipeError::NoSuchUser(to));
        }
        let len = data.len();
        if inner.mailboxes.deposit(from, to, data)? {
            tracing::warn!(from, to, len, "mailbox contents truncated");
        }
        Ok(())
    }

    pub fn has_mailbox(&self, from: u32, to: u32) -> bool {
        self.inner.lock().mailboxes.contains(from, to)
    }
}

fn line_bytes(text: &str) -> Bytes {
    let mut data = Vec::with_capacity(text.len() + 1);
    data.extend_from_slice(text.as_bytes());
    data.push(b'\n');
    Bytes::from(data)
}
