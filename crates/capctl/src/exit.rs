use std::fmt;
use std::io;

use capctl_ipc::IpcError;
use capctl_source::SourceError;
use capctl_transport::TransportError;

// sysexits-style exit codes.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
/// At least one source ended in error.
pub const SOURCE_ERROR: i32 = 2;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HELPER_ERROR: i32 = 4;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::NotFound => USAGE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        TransportError::Spawn { .. } => CliError::new(HELPER_ERROR, format!("{context}: {err}")),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn ipc_error(context: &str, err: IpcError) -> CliError {
    match err {
        IpcError::Transport(err) => transport_error(context, err),
        IpcError::PeerFatal(_) | IpcError::HelperUnavailable(_) => {
            CliError::new(HELPER_ERROR, format!("{context}: {err}"))
        }
        IpcError::MalformedPayload { .. } => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

pub fn source_error(context: &str, err: SourceError) -> CliError {
    match err {
        SourceError::Ipc(err) => ipc_error(context, err),
        SourceError::Transport(err) => transport_error(context, err),
        SourceError::Io(err) => io_error(context, err),
        SourceError::InvalidDefinition { .. }
        | SourceError::InvalidChannelList { .. }
        | SourceError::UnknownChannelListName(_)
        | SourceError::UnknownDriver(_) => CliError::new(USAGE, format!("{context}: {err}")),
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_channel_list_is_a_usage_error() {
        let err = SourceError::InvalidChannelList {
            text: "1,x".into(),
            reason: "bad channel".into(),
        };
        let cli = source_error("channel list", err);
        assert_eq!(cli.code, USAGE);
        assert!(cli.message.starts_with("channel list: "));
    }

    #[test]
    fn fatal_peer_message_is_a_helper_error() {
        let err = SourceError::Ipc(IpcError::PeerFatal("out of memory".into()));
        assert_eq!(source_error("run", err).code, HELPER_ERROR);
    }

    #[test]
    fn permission_denied_maps_through_layers() {
        let io = io::Error::from(io::ErrorKind::PermissionDenied);
        let err = SourceError::Transport(TransportError::Io(io));
        assert_eq!(source_error("open", err).code, PERMISSION_DENIED);
    }
}
