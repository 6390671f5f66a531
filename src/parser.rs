//! One-line command grammar.
//!
//! Turns a raw command line into a [`Pipeline`]: an ordered list of stages,
//! each with its executable, arguments, and a redirection for each of its
//! three standard streams. Parsing has no side effects; whether a pipe slot,
//! file, or user actually exists is decided later by the resolver.

use std::path::PathBuf;

use thiserror::Error;

/// Largest accepted `|N` / `!N`.
pub const MAX_PIPE_NUMBER: usize = 1000;

/// Where one standard stream of a stage connects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Redirection {
    /// Inherited default: no input, output captured back to the client.
    #[default]
    None,
    /// A file, read for input or created/truncated for output.
    File(PathBuf),
    /// A pipe-chain slot, relative to this stage (1 = the next stage).
    Pipe(usize),
    /// Another user's mailbox, by user id.
    User(u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Stage {
    pub executable: String,
    pub args: Vec<String>,
    pub stdin: Redirection,
    pub stdout: Redirection,
    pub stderr: Redirection,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pipeline {
    /// The command line as typed, trimmed. Quoted in user-pipe notices.
    pub line: String,
    pub stages: Vec<Stage>,
}

impl Pipeline {
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("*** Error: missing command before '{0}'. ***")]
    MissingCommand(String),
    #[error("*** Error: missing target after '{0}'. ***")]
    MissingTarget(String),
    #[error("*** Error: invalid pipe number in '{0}'. ***")]
    BadNumber(String),
    #[error("*** Error: '{0}' must end the command. ***")]
    TrailingTokens(String),
    #[error("*** Error: missing command after '|'. ***")]
    DanglingPipe,
}

/// Parse one command line.
///
/// An empty or all-whitespace line yields an empty pipeline.
pub fn parse(line: &str) -> Result<Pipeline, ParseError> {
    let line = line.trim();
    let mut stages = Vec::new();
    let mut stage = Stage::default();
    let mut tokens = line.split_whitespace();
    // Set once a numbered pipe closes the line; nothing may follow it.
    let mut closed_by: Option<String> = None;
    let mut dangling = false;

    while let Some(token) = tokens.next() {
        if let Some(closer) = &closed_by {
            return Err(ParseError::TrailingTokens(closer.clone()));
        }
        dangling = false;

        match classify(token)? {
            Token::Pipe { slot, stderr } => {
                if stage.executable.is_empty() {
                    return Err(ParseError::MissingCommand(token.to_string()));
                }
                stage.stdout = Redirection::Pipe(slot);
                if stderr {
                    stage.stderr = Redirection::Pipe(slot);
                }
                stages.push(std::mem::take(&mut stage));
                if is_numbered(token) {
                    closed_by = Some(token.to_string());
                } else {
                    dangling = true;
                }
            }
            Token::FileOut => {
                stage.stdout = Redirection::File(file_target(token, tokens.next())?);
            }
            Token::FileErr => {
                stage.stderr = Redirection::File(file_target(token, tokens.next())?);
            }
            Token::FileIn => {
                stage.stdin = Redirection::File(file_target(token, tokens.next())?);
            }
            Token::UserOut(id) => stage.stdout = Redirection::User(id),
            Token::UserIn(id) => stage.stdin = Redirection::User(id),
            Token::Word => {
                if stage.executable.is_empty() {
                    stage.executable = token.to_string();
                } else {
                    stage.args.push(token.to_string());
                }
            }
        }
    }

    if dangling {
        return Err(ParseError::DanglingPipe);
    }
    if !stage.executable.is_empty() {
        stages.push(stage);
    } else if stage != Stage::default() {
        // Redirections with no command, e.g. "> out".
        return Err(ParseError::MissingCommand(line.to_string()));
    }

    Ok(Pipeline {
        line: line.to_string(),
        stages,
    })
}

enum Token {
    Pipe { slot: usize, stderr: bool },
    FileOut,
    FileErr,
    FileIn,
    UserOut(u32),
    UserIn(u32),
    Word,
}

fn classify(token: &str) -> Result<Token, ParseError> {
    match token {
        "|" => return Ok(Token::Pipe { slot: 1, stderr: false }),
        "!" => return Ok(Token::Pipe { slot: 1, stderr: true }),
        ">" => return Ok(Token::FileOut),
        "2>" => return Ok(Token::FileErr),
        "<" => return Ok(Token::FileIn),
        _ => {}
    }

    let mut chars = token.chars();
    let Some(op) = chars.next() else {
        return Ok(Token::Word);
    };
    let digits = chars.as_str();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(Token::Word);
    }
    let bad = || ParseError::BadNumber(token.to_string());
    match op {
        '|' | '!' => {
            let slot: usize = digits.parse().map_err(|_| bad())?;
            if slot == 0 || slot > MAX_PIPE_NUMBER {
                return Err(bad());
            }
            Ok(Token::Pipe { slot, stderr: op == '!' })
        }
        '>' | '<' => {
            let id: u32 = digits.parse().map_err(|_| bad())?;
            if id == 0 {
                return Err(bad());
            }
            Ok(if op == '>' { Token::UserOut(id) } else { Token::UserIn(id) })
        }
        _ => Ok(Token::Word),
    }
}

fn is_numbered(token: &str) -> bool {
    token.len() > 1
}

fn file_target(op: &str, next: Option<&str>) -> Result<PathBuf, ParseError> {
    next.map(PathBuf::from)
        .ok_or_else(|| ParseError::MissingTarget(op.to_string()))
}
