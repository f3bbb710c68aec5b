use capctl_transport::TransportError;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header does not end in the expected sentinel.
    #[error("invalid frame sentinel 0x{found:08X} (expected 0xDECAFBAD)")]
    InvalidSentinel { found: u32 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The underlying transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// True for errors after which the stream can no longer be trusted.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            FrameError::InvalidSentinel { .. } | FrameError::PayloadTooLarge { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
