//! Command framing for the controller/helper channel.
//!
//! Every message is framed with a fixed 13-byte header:
//! - a 4-byte little-endian command ID
//! - a 4-byte little-endian payload length
//! - a 1-byte acknowledgment flag
//! - a 4-byte little-endian sentinel (`0xDECAFBAD`)
//!
//! A sentinel mismatch means the two ends have lost framing and is never
//! recovered from.

pub mod codec;
pub mod command;
pub mod error;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_frame, encode_frame, Frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE, SENTINEL,
};
pub use command::{DIE, FIRST_DYNAMIC_ID, MESSAGE, SYNC};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
