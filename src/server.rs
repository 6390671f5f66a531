//! TCP listener and per-connection session loop.
//!
//! Each accepted connection gets its own task. The task reads bytes from the
//! socket, splits them into command lines, dispatches each line, and writes
//! a prompt after it. Everything sent to the client goes through the
//! session's [`Outbox`], drained by a dedicated writer task.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::chat;
use crate::config::{ConfigError, ServerConfig};
use crate::outbox::{self, Outbox};
use crate::parser;
use crate::pipeline::Executor;
use crate::session::{Session, SessionRegistry};

const SETENV_USAGE: &str = "Usage: setenv [variable name] [value to assign].";
const READ_CHUNK: usize = 4096;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// What the session loop does after a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Bind the listening socket described by `config`.
pub async fn bind(config: &ServerConfig) -> Result<TcpListener, ServerError> {
    let addr = config.listen_addr();
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Accept connections until `cancel` fires.
///
/// Cancelling stops the accept loop and tells every live session to close;
/// each one broadcasts its leave notice on the way out. Returns once every
/// session task has finished.
pub async fn serve(
    listener: TcpListener,
    config: Arc<ServerConfig>,
    registry: SessionRegistry,
    cancel: CancellationToken,
) -> io::Result<()> {
    tracing::info!(addr = %listener.local_addr()?, max_users = config.max_users, "server listening");

    let tracker = TaskTracker::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("received cancel signal, stopping accept loop");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let config = config.clone();
                        let registry = registry.clone();
                        let cancel = cancel.clone();
                        tracker.spawn(async move {
                            if let Err(e) = handle_client(stream, addr, config, registry, cancel).await {
                                tracing::debug!(?e, addr = %addr, "client connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(?e, "failed to accept connection");
                        // Back off so a persistent accept error does not spin.
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    tracker.close();
    tracing::debug!(sessions = tracker.len(), "waiting for sessions to close");
    tracker.wait().await;
    Ok(())
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    config: Arc<ServerConfig>,
    registry: SessionRegistry,
    cancel: CancellationToken,
) -> io::Result<()> {
    let (mut reader, writer) = stream.into_split();
    let (outbox, rx) = Outbox::channel();
    let writer_task = tokio::spawn(outbox::run_writer(rx, writer));

    outbox.send(chat::BANNER);
    let peer = match registry.register(addr, outbox.clone()) {
        Ok(peer) => peer,
        Err(e) => {
            tracing::warn!(addr = %addr, "refusing connection: {e}");
            outbox.line(e.to_string());
            drop(outbox);
            finish_writer(writer_task, None).await;
            return Ok(());
        }
    };
    tracing::info!(id = peer.id, addr = %addr, "client connected");
    chat::announce_join(&registry, &peer);
    outbox.prompt();

    let mut session = Session::new(&peer, &config);
    drop(peer);
    drop(outbox);

    let result = session_loop(&mut reader, &mut session, &config, &registry, &cancel).await;

    let id = session.id;
    if !session.buffer.is_empty() {
        tracing::debug!(id, pending = session.buffer.len(), "dropping unterminated input");
    }
    chat::announce_leave(&registry, id);
    registry.remove(id);
    drop(session);
    finish_writer(writer_task, Some(id)).await;
    tracing::info!(id, addr = %addr, "client disconnected");
    result
}

async fn finish_writer(task: JoinHandle<io::Result<()>>, id: Option<u32>) {
    match task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(?e, ?id, "socket write failed"),
        Err(e) => tracing::warn!(?e, ?id, "writer task failed"),
    }
}

/// Read, split, dispatch, prompt. Returns on end of stream, `exit`, or
/// cancellation.
async fn session_loop<R: AsyncRead + Unpin>(
    reader: &mut R,
    session: &mut Session,
    config: &ServerConfig,
    registry: &SessionRegistry,
    cancel: &CancellationToken,
) -> io::Result<()> {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(id = session.id, "closing session on shutdown");
                return Ok(());
            }
            read = reader.read(&mut chunk) => read?,
        };
        if n == 0 {
            return Ok(());
        }

        let feed = session.buffer.feed(&chunk[..n]);
        for line in feed.lines {
            if dispatch(&line, session, config, registry).await == Flow::Exit {
                return Ok(());
            }
            session.outbox.prompt();
        }
        if let Some(overflow) = feed.overflow {
            tracing::debug!(id = session.id, max = overflow.max, "command buffer overflow");
            session.outbox.line(overflow.to_string());
            session.outbox.prompt();
        }
    }
}

/// Dispatch one command line: internal commands first, then chat commands,
/// then pipeline execution. Errors are reported to this session only.
pub async fn dispatch(
    line: &str,
    session: &mut Session,
    config: &ServerConfig,
    registry: &SessionRegistry,
) -> Flow {
    let line = line.trim();
    if line.is_empty() {
        return Flow::Continue;
    }
    tracing::debug!(id = session.id, command = line, "dispatch");

    if let Some(flow) = run_internal(line, session) {
        return flow;
    }

    let Some(me) = registry.get(session.id) else {
        tracing::warn!(id = session.id, "session missing from registry");
        return Flow::Exit;
    };

    if let Some(parsed) = chat::parse(line) {
        if let Err(e) = parsed.and_then(|cmd| chat::dispatch(registry, &me, cmd)) {
            session.outbox.line(e.to_string());
        }
        return Flow::Continue;
    }

    let pipeline = match parser::parse(line) {
        Ok(pipeline) if !pipeline.is_empty() => pipeline,
        Ok(_) => return Flow::Continue,
        Err(e) => {
            session.outbox.line(e.to_string());
            return Flow::Continue;
        }
    };

    let executor = Executor {
        me: &me,
        registry,
        config,
        env: &session.env,
    };
    match executor.run(&pipeline, &mut session.chain).await {
        Ok(output) if !output.is_empty() => session.outbox.send(output),
        Ok(_) => {}
        Err(e) => session.outbox.line(e.to_string()),
    }
    Flow::Continue
}

/// `exit`, `printenv` and `setenv`. Returns `None` for anything else.
fn run_internal(line: &str, session: &mut Session) -> Option<Flow> {
    let mut words = line.split_whitespace();
    match words.next()? {
        "exit" => Some(Flow::Exit),
        "printenv" => {
            match words.next() {
                Some(name) => {
                    if let Some(value) = session.getenv(name) {
                        session.outbox.line(format!("{name}={value}"));
                    }
                }
                None => {
                    let listing: String = session
                        .env
                        .iter()
                        .map(|(name, value)| format!("{name}={value}\n"))
                        .collect();
                    session.outbox.send(listing);
                }
            }
            Some(Flow::Continue)
        }
        "setenv" => {
            match (words.next(), words.next()) {
                (Some(name), Some(value)) => session.setenv(name, value),
                _ => session.outbox.line(SETENV_USAGE),
            }
            Some(Flow::Continue)
        }
        _ => None,
    }
}
