use capctl_frame::FrameError;
use capctl_transport::TransportError;

/// Errors that can occur on the controller/helper command channel.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A frame named a command ID with no registry entry.
    #[error("unknown command id {0}")]
    UnknownCommand(u32),

    /// A send named a command that was never registered.
    #[error("unknown command '{0}'")]
    UnknownName(String),

    /// Command names must fit the fixed SYNC name field.
    #[error("command name '{name}' is too long ({len} bytes, max {max})")]
    NameTooLong { name: String, len: usize, max: usize },

    /// A command name was registered twice.
    #[error("command '{0}' is already registered")]
    DuplicateName(String),

    /// An in-process registry was extended after the helper was spawned.
    #[error("command '{0}' registered after the helper was spawned")]
    RegisteredAfterSpawn(String),

    /// A non-built-in command was sent before the sync handshake finished.
    #[error("command '{0}' sent before the sync handshake completed")]
    NotSynced(String),

    /// The sync handshake received something it cannot apply.
    #[error("sync failed: {0}")]
    SyncFailed(String),

    /// A payload could not be decoded.
    #[error("malformed {command} payload: {reason}")]
    MalformedPayload { command: String, reason: String },

    /// The peer reported a fatal condition.
    #[error("peer reported fatal error: {0}")]
    PeerFatal(String),

    /// A command handler failed.
    #[error("{command} handler failed: {message}")]
    Handler { command: String, message: String },

    /// No synced helper is attached.
    #[error("privileged helper unavailable: {0}")]
    HelperUnavailable(String),

    /// The channel has already failed fatally.
    #[error("channel is dead: {0}")]
    Dead(String),
}

impl IpcError {
    /// Build a payload decoding error.
    pub fn malformed(command: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            command: command.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a handler failure.
    pub fn handler(command: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Handler {
            command: command.into(),
            message: err.to_string(),
        }
    }

    /// Errors after which the channel must not be used again.
    pub fn is_fatal(&self) -> bool {
        match self {
            IpcError::Transport(_)
            | IpcError::UnknownCommand(_)
            | IpcError::SyncFailed(_)
            | IpcError::MalformedPayload { .. }
            | IpcError::PeerFatal(_)
            | IpcError::Frame(_)
            | IpcError::Dead(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;
