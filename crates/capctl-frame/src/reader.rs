use std::io::{ErrorKind, Read};

use bytes::BytesMut;
use tracing::trace;

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Assembles frames from a non-blocking `Read` stream.
///
/// Partial input stays buffered between calls; callers only ever see
/// complete frames.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Return the next frame if one can be assembled without blocking.
    ///
    /// Meant to be called after the poll loop reports the stream readable.
    /// `WouldBlock` yields `Ok(None)`; EOF is `ConnectionClosed`.
    pub fn try_read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.try_decode()? {
                return Ok(Some(frame));
            }
            match self.fill() {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(_) => continue,
                Err(FrameError::Io(err)) if err.kind() == ErrorKind::WouldBlock => {
                    return Ok(None)
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Bytes received but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    fn try_decode(&mut self) -> Result<Option<Frame>> {
        let frame = decode_frame(&mut self.buf, self.config.max_payload_size)?;
        if let Some(frame) = &frame {
            trace!(
                command_id = frame.command_id,
                ack = frame.is_ack,
                len = frame.payload.len(),
                "decoded frame"
            );
        }
        Ok(frame)
    }

    fn fill(&mut self) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }
}
