//! Chat commands and room notices.
//!
//! `tell`, `yell`, `name` and `who` act on the shared [`SessionRegistry`].
//! Failures are reported to the invoking session only and never change
//! shared state.

use thiserror::Error;

use crate::session::{Peer, PeerError, SessionRegistry, UNNAMED};

pub const BANNER: &str = "\
****************************************
** Welcome to the information server. **
****************************************
";

pub const WHO_HEADER: &str = "<ID>\t<nickname>\t<IP/port>\t<indicate me>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Tell { to: u32, message: String },
    Yell { message: String },
    Name { name: String },
    Who,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("*** Error: user #{0} does not exist yet. ***")]
    NoSuchUser(u32),
    #[error("*** User '{0}' already exists. ***")]
    NameTaken(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
}

impl From<PeerError> for ChatError {
    fn from(e: PeerError) -> Self {
        match e {
            PeerError::NameExists(name) => ChatError::NameTaken(name),
            PeerError::NotFound(id) => ChatError::NoSuchUser(id),
        }
    }
}

const TELL_USAGE: &str = "tell [user id] [message]";
const YELL_USAGE: &str = "yell [message]";
const NAME_USAGE: &str = "name [new name]";

/// Recognize a chat command. Returns `None` when the line is not one, so the
/// caller can fall through to pipeline execution.
///
/// Messages are taken verbatim from the raw line, so they may contain pipe
/// and redirection characters.
pub fn parse(line: &str) -> Option<Result<ChatCommand, ChatError>> {
    let line = line.trim_start();
    let (word, rest) = split_word(line);
    let parsed = match word {
        "tell" => {
            let (id, message) = split_word(rest);
            match (id.parse::<u32>(), message.is_empty()) {
                (Ok(to), false) => Ok(ChatCommand::Tell {
                    to,
                    message: message.to_string(),
                }),
                _ => Err(ChatError::Usage(TELL_USAGE)),
            }
        }
        "yell" => {
            if rest.is_empty() {
                Err(ChatError::Usage(YELL_USAGE))
            } else {
                Ok(ChatCommand::Yell {
                    message: rest.to_string(),
                })
            }
        }
        "name" => {
            let name = rest.trim_end();
            if name.is_empty() {
                Err(ChatError::Usage(NAME_USAGE))
            } else {
                Ok(ChatCommand::Name {
                    name: name.to_string(),
                })
            }
        }
        "who" => Ok(ChatCommand::Who),
        _ => return None,
    };
    Some(parsed)
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

/// Run a chat command on behalf of `me`.
pub fn dispatch(registry: &SessionRegistry, me: &Peer, cmd: ChatCommand) -> Result<(), ChatError> {
    match cmd {
        ChatCommand::Tell { to, message } => tell(registry, me, to, &message),
        ChatCommand::Yell { message } => {
            yell(registry, me, &message);
            Ok(())
        }
        ChatCommand::Name { name } => rename(registry, me, &name),
        ChatCommand::Who => {
            who(registry, me);
            Ok(())
        }
    }
}

pub fn tell(registry: &SessionRegistry, me: &Peer, to: u32, message: &str) -> Result<(), ChatError> {
    let text = format!("*** {} told you ***: {}", me.display_name(), message);
    registry.unicast(to, &text)?;
    Ok(())
}

pub fn yell(registry: &SessionRegistry, me: &Peer, message: &str) {
    registry.broadcast(&format!("*** {} yelled ***: {}", me.display_name(), message));
}

pub fn rename(registry: &SessionRegistry, me: &Peer, name: &str) -> Result<(), ChatError> {
    let peer = registry.rename(me.id, name)?;
    registry.broadcast(&format!(
        "*** User from {} is named '{}'. ***",
        peer.address(),
        name
    ));
    Ok(())
}

pub fn who(registry: &SessionRegistry, me: &Peer) {
    let mut table = String::from(WHO_HEADER);
    table.push('\n');
    for peer in registry.list() {
        table.push_str(&format!(
            "{}\t{}\t{}",
            peer.id,
            peer.display_name(),
            peer.address()
        ));
        if peer.id == me.id {
            table.push_str("\t<-me");
        }
        table.push('\n');
    }
    me.outbox.send(table);
}

pub fn announce_join(registry: &SessionRegistry, peer: &Peer) {
    registry.broadcast(&format!(
        "*** User '{}' entered from {}. ***",
        UNNAMED,
        peer.address()
    ));
}

/// Announce a departure. Reads the current name from the registry, since
/// the session may have been renamed since it joined.
pub fn announce_leave(registry: &SessionRegistry, id: u32) {
    if let Some(peer) = registry.get(id) {
        registry.broadcast(&format!("*** User '{}' left. ***", peer.display_name()));
    }
}
