//! Redirection resolver.
//!
//! Decides, for each standard stream of a stage, what it connects to right
//! before the stage is spawned: nothing, a file, a pipe-chain slot, or a
//! user mailbox. All checks happen here, so a stage that fails to resolve is
//! never spawned.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;

use crate::chain::PipeChain;
use crate::config::ServerConfig;
use crate::mailbox::UserPipeError;
use crate::parser::{Pipeline, Redirection, Stage};
use crate::session::{Peer, SessionRegistry};

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("*** Error: ambiguous input redirection. ***")]
    Ambiguous,
    #[error("*** Error: cannot open '{}': {}. ***", .path.display(), .source)]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    UserPipe(#[from] UserPipeError),
}

/// Where a stage reads its standard input from.
#[derive(Debug)]
pub enum Source {
    Null,
    File(File),
    /// Contents of pipe-chain slot 0.
    Chain(Bytes),
    /// Contents of a mailbox, already taken.
    Mailbox(Bytes),
}

/// Where a stage's standard output or error goes.
#[derive(Debug)]
pub enum Sink {
    /// The pipeline's shared output capture, relayed to the client.
    Capture,
    File(File),
    Chain(usize),
    Mailbox(u32),
}

#[derive(Debug)]
pub struct Resolved {
    pub stdin: Source,
    pub stdout: Sink,
    pub stderr: Sink,
    /// Broadcast lines announcing user-pipe traffic, in emission order.
    pub notices: Vec<String>,
}

/// Everything the resolver needs to know about the acting session.
pub struct Context<'a> {
    pub me: &'a Peer,
    pub registry: &'a SessionRegistry,
    pub config: &'a ServerConfig,
}

/// Reject a pipeline in which any stage would receive both an explicit
/// input redirection and a pipe from the chain. Checked up front so such a
/// pipeline spawns nothing at all.
pub fn check_ambiguity(pipeline: &Pipeline, chain: &PipeChain) -> Result<(), RedirectError> {
    for (k, stage) in pipeline.stages.iter().enumerate() {
        if stage.stdin == Redirection::None {
            continue;
        }
        let from_earlier_line = chain.has(k);
        let from_this_line = pipeline.stages[..k].iter().enumerate().any(|(j, earlier)| {
            let distance = k - j;
            earlier.stdout == Redirection::Pipe(distance)
                || earlier.stderr == Redirection::Pipe(distance)
        });
        if from_earlier_line || from_this_line {
            return Err(RedirectError::Ambiguous);
        }
    }
    Ok(())
}

/// Resolve the three streams of `stage`.
///
/// Checks run before anything is mutated: files are opened and the send
/// side of a user pipe is validated first, then a pending mailbox is taken
/// and chain slots are created. A failure therefore leaves the chain and the
/// mailboxes untouched.
pub fn resolve(
    stage: &Stage,
    line: &str,
    chain: &mut PipeChain,
    ctx: &Context<'_>,
) -> Result<Resolved, RedirectError> {
    if chain.has(0) && stage.stdin != Redirection::None {
        return Err(RedirectError::Ambiguous);
    }

    let stdin_file = match &stage.stdin {
        Redirection::File(path) => Some(open_input(&ctx.config.resolve_path(path))?),
        _ => None,
    };
    let stdout_file = match &stage.stdout {
        Redirection::File(path) => Some(open_output(&ctx.config.resolve_path(path))?),
        _ => None,
    };
    let stderr_file = match &stage.stderr {
        Redirection::File(path) => Some(open_output(&ctx.config.resolve_path(path))?),
        _ => None,
    };
    let send_target = match stage.stdout {
        Redirection::User(to) => Some(ctx.registry.check_send(ctx.me.id, to)?),
        _ => None,
    };

    let mut notices = Vec::new();
    let stdin = match (&stage.stdin, stdin_file) {
        (_, Some(file)) => Source::File(file),
        (Redirection::User(from), _) => {
            let (sender, data) = ctx.registry.take_mailbox(*from, ctx.me.id)?;
            notices.push(format!(
                "*** {} (#{}) just received from {} (#{}) by '{}' ***",
                ctx.me.display_name(),
                ctx.me.id,
                sender.display_name(),
                sender.id,
                line
            ));
            Source::Mailbox(data)
        }
        _ => match chain.current() {
            Some(data) => Source::Chain(data),
            None => Source::Null,
        },
    };

    if let Some(target) = &send_target {
        notices.push(format!(
            "*** {} (#{}) just piped '{}' to {} (#{}) ***",
            ctx.me.display_name(),
            ctx.me.id,
            line,
            target.display_name(),
            target.id
        ));
    }

    let stdout = output_sink(&stage.stdout, stdout_file, chain);
    let stderr = output_sink(&stage.stderr, stderr_file, chain);

    Ok(Resolved {
        stdin,
        stdout,
        stderr,
        notices,
    })
}

fn output_sink(redirect: &Redirection, file: Option<File>, chain: &mut PipeChain) -> Sink {
    if let Some(file) = file {
        return Sink::File(file);
    }
    match redirect {
        Redirection::Pipe(slot) => {
            chain.open(*slot);
            Sink::Chain(*slot)
        }
        Redirection::User(to) => Sink::Mailbox(*to),
        Redirection::None | Redirection::File(_) => Sink::Capture,
    }
}

fn open_input(path: &Path) -> Result<File, RedirectError> {
    File::open(path).map_err(|source| RedirectError::Open {
        path: path.to_path_buf(),
        source,
    })
}

fn open_output(path: &Path) -> Result<File, RedirectError> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|source| RedirectError::Open {
            path: path.to_path_buf(),
            source,
        })
}
