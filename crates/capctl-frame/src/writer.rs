use std::io::{ErrorKind, Write};

use bytes::{Buf, BytesMut};
use tracing::trace;

use crate::codec::{encode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes frames to a non-blocking `Write` stream.
///
/// [`queue`] encodes into an internal buffer; [`write_pending`] drains it as
/// far as the stream accepts and keeps the remainder for the next call.
///
/// [`queue`]: FrameWriter::queue
/// [`write_pending`]: FrameWriter::write_pending
pub struct FrameWriter<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Write> FrameWriter<T> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Encode a frame behind any bytes still waiting to be written.
    pub fn queue(&mut self, frame: &Frame) -> Result<()> {
        if frame.payload.len() > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.config.max_payload_size,
            });
        }
        encode_frame(frame, &mut self.buf)?;
        trace!(
            command_id = frame.command_id,
            ack = frame.is_ack,
            len = frame.payload.len(),
            "queued frame"
        );
        Ok(())
    }

    /// Write as much buffered data as the stream accepts right now.
    ///
    /// Returns `true` once nothing is left to write.
    pub fn write_pending(&mut self) -> Result<bool> {
        while !self.buf.is_empty() {
            match self.inner.write(&self.buf) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => self.buf.advance(n),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
        Ok(true)
    }

    /// True while encoded bytes are waiting to be written.
    pub fn has_pending(&self) -> bool {
        !self.buf.is_empty()
    }
}
