use std::path::PathBuf;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind to the specified address.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the specified address.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on the transport stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// Could not start the helper program.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },

    /// An inherited descriptor number was unusable.
    #[error("invalid inherited descriptor {fd}: {source}")]
    InvalidDescriptor { fd: i32, source: std::io::Error },

    /// A capture socket could not be opened.
    #[error("failed to open capture socket on {interface}: {source}")]
    Capture {
        interface: String,
        source: std::io::Error,
    },

    /// A descriptor message arrived without an attached descriptor.
    #[error("no descriptor attached to side-channel message")]
    NoDescriptor,

    /// Timed out waiting for the peer.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
