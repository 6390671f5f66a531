//! Pipeline executor.
//!
//! Stages run one after another: each is spawned, awaited, and its status
//! inspected before the next one starts. Output meant for later stages is
//! spooled into the session's [`PipeChain`] through real OS pipes, and every
//! byte meant for the client lands in one shared [`Capture`].

use std::collections::BTreeMap;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

use crate::chain::PipeChain;
use crate::config::ServerConfig;
use crate::parser::{Pipeline, Stage};
use crate::pipe::{self, Capture, PipeError};
use crate::redirect::{self, Context, RedirectError, Resolved, Sink, Source};
use crate::session::{Peer, SessionRegistry};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Redirect(#[from] RedirectError),

    #[error("*** Error: {0}. ***")]
    Pipe(#[from] PipeError),

    #[error("*** Error: failed to wait for '{stage}': {source}. ***")]
    Wait {
        stage: String,
        #[source]
        source: std::io::Error,
    },
}

/// A stage wrote more than a bound allows. Reported into the output of the
/// session that ran it.
#[derive(Debug, Error)]
pub enum LimitError {
    #[error("*** Error: output exceeded {limit} bytes. ***")]
    Output { limit: usize },

    #[error("*** Error: pipe output exceeded {limit} bytes. ***")]
    Chain { limit: usize },

    #[error("*** Error: the pipe to #{to} exceeded {limit} bytes. ***")]
    Mailbox { to: u32, limit: usize },
}

/// Where a spooled stream ends up once its stage exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Chain(usize),
    Mailbox(u32),
}

struct Spool {
    target: Target,
    capture: Capture,
}

/// Runs pipelines on behalf of one session.
pub struct Executor<'a> {
    pub me: &'a Peer,
    pub registry: &'a SessionRegistry,
    pub config: &'a ServerConfig,
    /// The complete environment handed to every stage.
    pub env: &'a BTreeMap<String, String>,
}

impl Executor<'_> {
    /// Execute `pipeline` and return everything it produced for the client.
    ///
    /// An ambiguous input redirection anywhere in the pipeline is rejected
    /// with an error before any stage is spawned. Failures after that point
    /// are written into the output and stop the remaining stages.
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        chain: &mut PipeChain,
    ) -> Result<Vec<u8>, PipelineError> {
        redirect::check_ambiguity(pipeline, chain)?;

        let ctx = Context {
            me: self.me,
            registry: self.registry,
            config: self.config,
        };
        let limit = self.config.output_limit;
        let capture = Capture::spawn(limit)?;

        for (index, stage) in pipeline.stages.iter().enumerate() {
            let resolved = match redirect::resolve(stage, &pipeline.line, chain, &ctx) {
                Ok(resolved) => resolved,
                Err(e) => {
                    tracing::debug!(id = self.me.id, stage = %stage.executable, error = %e, "redirection failed");
                    capture.write_all(format!("{e}\n").as_bytes())?;
                    break;
                }
            };
            for notice in &resolved.notices {
                self.registry.broadcast(notice);
            }

            let success = self.run_stage(stage, resolved, &capture, chain).await?;
            tracing::debug!(id = self.me.id, stage = %stage.executable, index, success, "stage exited");
            if !success || capture.overflowed() {
                break;
            }
            chain.advance();
        }

        let mut captured = capture.finish().await?;
        if captured.truncated {
            tracing::warn!(id = self.me.id, limit, "command output truncated");
            if captured.data.last().is_some_and(|&b| b != b'\n') {
                captured.data.push(b'\n');
            }
            captured
                .data
                .extend_from_slice(format!("{}\n", LimitError::Output { limit }).as_bytes());
        }
        Ok(captured.data)
    }

    async fn run_stage(
        &self,
        stage: &Stage,
        resolved: Resolved,
        capture: &Capture,
        chain: &mut PipeChain,
    ) -> Result<bool, PipelineError> {
        let mut command = Command::new(&stage.executable);
        command
            .args(&stage.args)
            .env_clear()
            .envs(self.env)
            .kill_on_drop(true);
        if let Some(dir) = &self.config.workdir {
            command.current_dir(dir);
        }

        let mut feeder = None;
        let stdin = match resolved.stdin {
            Source::Null => Stdio::null(),
            Source::File(file) => Stdio::from(file),
            Source::Chain(data) | Source::Mailbox(data) => {
                let (stdin, handle) = pipe::feed(data)?;
                feeder = Some(handle);
                stdin
            }
        };

        let mut spools = Vec::new();
        let stdout = self.output_stdio(resolved.stdout, capture, &mut spools, chain.limit())?;
        let stderr = self.output_stdio(resolved.stderr, capture, &mut spools, chain.limit())?;
        command.stdin(stdin).stdout(stdout).stderr(stderr);

        let spawned = command.spawn();
        // Release the parent's copies of the stage's pipe ends.
        drop(command);

        let mut success = match spawned {
            Ok(mut child) => {
                let status = child.wait().await.map_err(|source| PipelineError::Wait {
                    stage: stage.executable.clone(),
                    source,
                })?;
                status.success()
            }
            Err(e) => {
                let message = match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        format!("Unknown command: [{}].\n", stage.executable)
                    }
                    _ => format!(
                        "*** Error: failed to start '{}': {}. ***\n",
                        stage.executable, e
                    ),
                };
                tracing::debug!(id = self.me.id, stage = %stage.executable, error = %e, "spawn failed");
                capture.write_all(message.as_bytes())?;
                false
            }
        };

        if let Some(feeder) = feeder {
            feeder.await.map_err(PipeError::from)?;
        }

        for spool in spools {
            let captured = spool.capture.finish().await?;
            let overflow = match spool.target {
                Target::Chain(slot) => {
                    let dropped = chain.append(slot, captured.data);
                    (captured.truncated || dropped).then(|| LimitError::Chain {
                        limit: chain.limit(),
                    })
                }
                Target::Mailbox(to) => {
                    if let Err(e) = self.registry.deposit(self.me.id, to, captured.data) {
                        capture.write_all(format!("{e}\n").as_bytes())?;
                    }
                    captured.truncated.then(|| LimitError::Mailbox {
                        to,
                        limit: self.config.mailbox_capacity,
                    })
                }
            };
            if let Some(e) = overflow {
                tracing::warn!(id = self.me.id, stage = %stage.executable, "{e}");
                capture.write_all(format!("{e}\n").as_bytes())?;
                success = false;
            }
        }

        Ok(success)
    }

    /// Turn a resolved output sink into the child's stdio. Streams headed
    /// for the same chain slot or mailbox share one spool so their bytes keep
    /// the order the stage wrote them in.
    fn output_stdio(
        &self,
        sink: Sink,
        capture: &Capture,
        spools: &mut Vec<Spool>,
        chain_limit: usize,
    ) -> Result<Stdio, PipeError> {
        let (target, limit) = match sink {
            Sink::Capture => return capture.stdio(),
            Sink::File(file) => return Ok(Stdio::from(file)),
            Sink::Chain(slot) => (Target::Chain(slot), chain_limit),
            Sink::Mailbox(to) => (Target::Mailbox(to), self.config.mailbox_capacity),
        };
        if let Some(spool) = spools.iter().find(|s| s.target == target) {
            return spool.capture.stdio();
        }
        let spool = Spool {
            target,
            capture: Capture::spawn(limit)?,
        };
        let stdio = spool.capture.stdio()?;
        spools.push(spool);
        Ok(stdio)
    }
}
