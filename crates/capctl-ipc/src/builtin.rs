//! Payloads of the built-in `MESSAGE` and `SYNC` commands.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{IpcError, Result};

/// Width of the NUL-padded name field in a `SYNC` payload.
pub const SYNC_NAME_LEN: usize = 32;

/// Longest command name that fits the `SYNC` name field with its terminator.
pub const MAX_COMMAND_NAME_LEN: usize = SYNC_NAME_LEN - 1;

/// Severity and routing flags carried by a `MESSAGE` frame.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u32);

impl MessageFlags {
    pub const DEBUG: Self = Self(0x01);
    pub const INFO: Self = Self(0x02);
    pub const ERROR: Self = Self(0x04);
    pub const ALERT: Self = Self(0x08);
    pub const FATAL: Self = Self(0x10);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for MessageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::DEBUG, "DEBUG"),
            (Self::INFO, "INFO"),
            (Self::ERROR, "ERROR"),
            (Self::ALERT, "ALERT"),
            (Self::FATAL, "FATAL"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            write!(f, "MessageFlags(0x{:x})", self.0)
        } else {
            write!(f, "MessageFlags({})", set.join("|"))
        }
    }
}

/// Decoded `MESSAGE` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub flags: MessageFlags,
    pub text: String,
}

/// `flags:u32` followed by NUL-terminated text.
pub fn encode_message(flags: MessageFlags, text: &str) -> Bytes {
    let text = text.as_bytes();
    let text = match text.iter().position(|&b| b == 0) {
        Some(end) => &text[..end],
        None => text,
    };
    let mut buf = BytesMut::with_capacity(4 + text.len() + 1);
    buf.put_u32_le(flags.bits());
    buf.put_slice(text);
    buf.put_u8(0);
    buf.freeze()
}

pub fn decode_message(mut payload: &[u8]) -> Result<Message> {
    if payload.len() < 5 {
        return Err(IpcError::malformed("MESSAGE", "shorter than flags and terminator"));
    }
    let flags = MessageFlags::from_bits(payload.get_u32_le());
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| IpcError::malformed("MESSAGE", "text is not NUL-terminated"))?;
    Ok(Message {
        flags,
        text: String::from_utf8_lossy(&payload[..end]).into_owned(),
    })
}

/// One `SYNC` record: bind `name` to `id`. ID 0 ends the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEntry {
    pub id: u32,
    pub name: String,
}

impl SyncEntry {
    pub fn bind(name: impl Into<String>, id: u32) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    /// The terminating record.
    pub fn complete() -> Self {
        Self {
            id: 0,
            name: String::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.id == 0
    }
}

pub fn encode_sync(entry: &SyncEntry) -> Result<Bytes> {
    if !(entry.is_complete() && entry.name.is_empty()) {
        validate_command_name(&entry.name)?;
    }
    let mut buf = BytesMut::with_capacity(4 + SYNC_NAME_LEN);
    buf.put_u32_le(entry.id);
    buf.put_slice(entry.name.as_bytes());
    buf.put_bytes(0, SYNC_NAME_LEN - entry.name.len());
    Ok(buf.freeze())
}

pub fn decode_sync(mut payload: &[u8]) -> Result<SyncEntry> {
    if payload.len() != 4 + SYNC_NAME_LEN {
        return Err(IpcError::malformed(
            "SYNC",
            format!("expected {} bytes, got {}", 4 + SYNC_NAME_LEN, payload.len()),
        ));
    }
    let id = payload.get_u32_le();
    let end = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| IpcError::malformed("SYNC", "name is not NUL-terminated"))?;
    let name = std::str::from_utf8(&payload[..end])
        .map_err(|_| IpcError::malformed("SYNC", "name is not UTF-8"))?
        .to_string();
    Ok(SyncEntry { id, name })
}

/// Check that a command name can travel in a `SYNC` record.
pub fn validate_command_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('\0') {
        return Err(IpcError::SyncFailed(format!(
            "invalid command name {name:?}"
        )));
    }
    if name.len() > MAX_COMMAND_NAME_LEN {
        return Err(IpcError::NameTooLong {
            name: name.to_string(),
            len: name.len(),
            max: MAX_COMMAND_NAME_LEN,
        });
    }
    Ok(())
}
