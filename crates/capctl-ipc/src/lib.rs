//! Command channel between the capture controller and its privileged helper.
//!
//! Each process builds a [`CommandRegistry`] on its own. After the helper is
//! spawned the controller sends its authoritative `name -> id` bindings as
//! `SYNC` records; once both ends agree, commands flow over an [`IpcChannel`]
//! as acknowledged frames. [`PrivilegedHelper`] owns the helper process and
//! the descriptor side-channel on the controller side.

pub mod builtin;
pub mod channel;
pub mod error;
pub mod helper;
pub mod registry;
pub mod sink;
pub mod sync;

pub use builtin::{
    decode_message, encode_message, Message, MessageFlags, SyncEntry, MAX_COMMAND_NAME_LEN,
};
pub use channel::{ChannelConfig, ChannelEvent, CommandContext, IpcChannel};
pub use error::{IpcError, Result};
pub use helper::{Backoff, HelperConfig, PrivilegedHelper, DEFAULT_FD_PREFIX};
pub use registry::{CommandRegistry, Handler, NameTable, Role};
pub use sink::{log_message, CommandSink, Detached};
