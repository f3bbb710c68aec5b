use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::builtin::MessageFlags;
use crate::error::{IpcError, Result};

/// Something that can carry commands to the peer process.
///
/// Implemented by [`IpcChannel`](crate::IpcChannel), by the
/// [`CommandContext`](crate::CommandContext) handed to command handlers, and
/// by [`Detached`] for a process running without a peer.
pub trait CommandSink {
    /// Queue a registered command for the peer.
    fn send_command(&mut self, name: &str, payload: Bytes) -> Result<()>;

    /// Queue a command that replaces any still-unsent one of the same name
    /// whose payload shares its first `key_len` bytes.
    fn send_superseding(&mut self, name: &str, payload: Bytes, _key_len: usize) -> Result<()> {
        self.send_command(name, payload)
    }

    /// Queue an operator-facing message for the peer.
    fn send_message(&mut self, flags: MessageFlags, text: &str) -> Result<()>;

    /// True when a synced peer is attached.
    fn is_linked(&self) -> bool;
}

/// Sink used when no peer exists: commands fail, messages are logged here.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl CommandSink for Detached {
    fn send_command(&mut self, name: &str, _payload: Bytes) -> Result<()> {
        Err(IpcError::HelperUnavailable(format!(
            "cannot send {name} without a helper"
        )))
    }

    fn send_message(&mut self, flags: MessageFlags, text: &str) -> Result<()> {
        log_message("local", flags, text);
        Ok(())
    }

    fn is_linked(&self) -> bool {
        false
    }
}

/// Emit a `MESSAGE` through `tracing` at a level derived from its flags.
pub fn log_message(origin: &str, flags: MessageFlags, text: &str) {
    if flags.contains(MessageFlags::FATAL) {
        error!(origin, "{text}");
    } else if flags.contains(MessageFlags::ERROR) || flags.contains(MessageFlags::ALERT) {
        warn!(origin, "{text}");
    } else if flags.contains(MessageFlags::INFO) {
        info!(origin, "{text}");
    } else {
        debug!(origin, "{text}");
    }
}
