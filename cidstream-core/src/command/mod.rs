//! Serialized execution of player-affecting commands.
//!
//! Provides:
//! - [`Command`] and its outcome types
//! - [`CommandExecutor`], the seam the queue drives (implemented by the
//!   playback session)
//! - [`spawn_command_queue`] and the [`CommandQueue`] handle

pub mod queue;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

pub use queue::{CommandQueue, spawn_command_queue};

use crate::cid::Cid;
use crate::provider::ProviderKey;
use crate::session::SessionError;

/// What a load command should load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadTarget {
    /// An explicit CID, loaded once without caller-level retry
    Cid(String),
    /// The rotation entry after the current one
    Next,
    /// The rotation entry before the current one
    Previous,
}

/// A player-affecting request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Load(LoadTarget),
    Play,
    Pause,
    /// Byte offset into the current source
    Seek { position: u64 },
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Load(_) => CommandKind::Load,
            Self::Play => CommandKind::Play,
            Self::Pause => CommandKind::Pause,
            Self::Seek { .. } => CommandKind::Seek,
        }
    }
}

/// Command discriminant used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Load,
    Play,
    Pause,
    Seek,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load => "load",
            Self::Play => "play",
            Self::Pause => "pause",
            Self::Seek => "seek",
        };
        f.write_str(name)
    }
}

/// Result of a successfully executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Loaded { cid: Cid, provider: ProviderKey },
    Playing,
    /// The player refused to start; the observer was notified
    AutoplayBlocked,
    Paused,
    Seeked { position: u64 },
}

/// Errors returned to command callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Command {kind} timed out after {timeout:?}")]
    Timeout { kind: CommandKind, timeout: Duration },

    #[error("Command cleared before it started")]
    Cleared,

    #[error("Command queue is shut down")]
    QueueClosed,

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Runs commands one at a time on behalf of the queue.
#[async_trait]
pub trait CommandExecutor: Send + 'static {
    /// Executes `command` to completion.
    ///
    /// The queue drops the returned future when the command times out, so
    /// implementations must leave consistent state at every await point.
    ///
    /// # Errors
    ///
    /// - `SessionError` - The command failed
    async fn execute(&mut self, command: Command) -> Result<CommandOutcome, SessionError>;
}
