use capctl_ipc::IpcError;
use capctl_transport::TransportError;

use crate::driver::DriverError;

/// Errors raised while resolving, running, or supervising capture sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Command channel failure.
    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),

    /// Local OS plumbing failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A driver operation failed.
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    /// A source definition string could not be parsed.
    #[error("invalid source definition '{definition}': {reason}")]
    InvalidDefinition { definition: String, reason: String },

    /// A channel list could not be parsed.
    #[error("invalid channel list '{text}': {reason}")]
    InvalidChannelList { text: String, reason: String },

    /// A channel list ID with no stored list.
    #[error("unknown channel list {0}")]
    UnknownChannelList(u16),

    /// A channel list name with no stored list.
    #[error("unknown channel list '{0}'")]
    UnknownChannelListName(String),

    /// A source ID with no record.
    #[error("unknown source {0}")]
    UnknownSource(u16),

    /// A driver type with no registered prototype.
    #[error("unknown driver type '{0}'")]
    UnknownDriver(String),

    /// A source payload could not be decoded.
    #[error("malformed {command} payload: {reason}")]
    Payload { command: &'static str, reason: String },

    /// The 16-bit source ID space is used up.
    #[error("no free source ids")]
    SourceIdsExhausted,

    /// The 16-bit channel list ID space is used up.
    #[error("no free channel list ids")]
    ChannelListIdsExhausted,

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SourceError {
    pub fn definition(definition: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            definition: definition.to_string(),
            reason: reason.into(),
        }
    }

    pub fn channel_list(text: &str, reason: impl Into<String>) -> Self {
        Self::InvalidChannelList {
            text: text.to_string(),
            reason: reason.into(),
        }
    }

    pub fn payload(command: &'static str, reason: impl Into<String>) -> Self {
        Self::Payload {
            command,
            reason: reason.into(),
        }
    }

    /// True for errors that end the process rather than one source.
    pub fn is_fatal(&self) -> bool {
        match self {
            SourceError::Ipc(err) => err.is_fatal(),
            SourceError::Transport(_) => true,
            _ => false,
        }
    }
}

/// Result type for source operations.
pub type Result<T> = std::result::Result<T, SourceError>;
