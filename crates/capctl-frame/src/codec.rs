use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Frame header: command (4) + length (4) + ack (1) + sentinel (4) = 13 bytes.
pub const HEADER_SIZE: usize = 13;

/// Fixed value closing every header.
pub const SENTINEL: u32 = 0xDECA_FBAD;

/// Default maximum payload size: 64 KiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// One command message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Numeric command ID, as agreed during the sync handshake.
    pub command_id: u32,
    /// Whether this frame acknowledges an earlier command.
    pub is_ack: bool,
    /// Command payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new command frame.
    pub fn new(command_id: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            command_id,
            is_ack: false,
            payload: payload.into(),
        }
    }

    /// Create an empty acknowledgment for `command_id`.
    pub fn ack(command_id: u32) -> Self {
        Self {
            command_id,
            is_ack: true,
            payload: Bytes::new(),
        }
    }

    /// The total wire size of this frame (header + payload).
    pub fn wire_size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────────┬────────────┬─────────┬──────────────┬──────────────────┐
/// │ Command    │ Length     │ Ack     │ Sentinel     │ Payload          │
/// │ (4B LE)    │ (4B LE)    │ (1B)    │ 0xDECAFBAD   │ (Length bytes)   │
/// └────────────┴────────────┴─────────┴──────────────┴──────────────────┘
/// ```
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if frame.payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: frame.payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(frame.wire_size());
    dst.put_u32_le(frame.command_id);
    dst.put_u32_le(frame.payload.len() as u32);
    dst.put_u8(u8::from(frame.is_ack));
    dst.put_u32_le(SENTINEL);
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// The header is validated before the payload length is trusted; on success
/// the frame bytes are consumed from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &src[..HEADER_SIZE];
    let command_id = header.get_u32_le();
    let payload_len = header.get_u32_le() as usize;
    let is_ack = header.get_u8() != 0;
    let sentinel = header.get_u32_le();

    if sentinel != SENTINEL {
        return Err(FrameError::InvalidSentinel { found: sentinel });
    }
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();

    Ok(Some(Frame {
        command_id,
        is_ack,
        payload,
    }))
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: 64 KiB.
    pub max_payload_size: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: &Frame) -> Frame {
        let mut buf = BytesMut::new();
        encode_frame(frame, &mut buf).unwrap();
        assert_eq!(buf.len(), frame.wire_size());
        let decoded = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn empty_single_byte_and_max_payloads_survive() {
        for size in [0usize, 1, DEFAULT_MAX_PAYLOAD] {
            let payload: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let frame = Frame::new(17, payload.clone());
            let decoded = roundtrip(&frame);
            assert_eq!(decoded.command_id, 17);
            assert_eq!(decoded.payload.as_ref(), payload.as_slice(), "size {size}");
            assert!(!decoded.is_ack);
        }
    }

    #[test]
    fn ack_flag_is_carried() {
        let decoded = roundtrip(&Frame::ack(9));
        assert!(decoded.is_ack);
        assert_eq!(decoded.command_id, 9);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn header_layout_is_little_endian() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::new(0x0102_0304, &b"xy"[..]), &mut buf).unwrap();
        assert_eq!(&buf[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[4..8], &[2, 0, 0, 0]);
        assert_eq!(buf[8], 0);
        assert_eq!(&buf[9..13], &[0xAD, 0xFB, 0xCA, 0xDE]);
        assert_eq!(&buf[13..], b"xy");
    }

    #[test]
    fn corrupted_sentinel_is_rejected() {
        for byte in 9..HEADER_SIZE {
            let mut buf = BytesMut::new();
            encode_frame(&Frame::new(5, &b"data"[..]), &mut buf).unwrap();
            buf[byte] ^= 0x40;
            let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
            assert!(
                matches!(result, Err(FrameError::InvalidSentinel { .. })),
                "byte {byte}"
            );
        }
    }

    #[test]
    fn incomplete_header_needs_more() {
        let mut buf = BytesMut::from(&[0x04, 0x00, 0x00][..]);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
    }

    #[test]
    fn incomplete_payload_needs_more() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::new(1, &b"hello"[..]), &mut buf).unwrap();
        buf.truncate(HEADER_SIZE + 2);
        assert!(decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().is_none());
        assert_eq!(buf.len(), HEADER_SIZE + 2);
    }

    #[test]
    fn oversized_length_rejected_before_payload_arrives() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(4);
        buf.put_u32_le(1024 * 1024);
        buf.put_u8(0);
        buf.put_u32_le(SENTINEL);

        let result = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD);
        assert!(matches!(result, Err(FrameError::PayloadTooLarge { .. })));
    }

    #[test]
    fn back_to_back_frames() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::new(4, &b"first"[..]), &mut buf).unwrap();
        encode_frame(&Frame::ack(4), &mut buf).unwrap();

        let f1 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!((f1.command_id, f1.payload.as_ref()), (4, b"first".as_ref()));
        let f2 = decode_frame(&mut buf, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert!(f2.is_ack);
        assert!(buf.is_empty());
    }
}
