use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::os;

/// A connected, ordered, reliable IPC stream between controller and helper.
///
/// Wraps one end of a Unix stream socket pair. Frame boundaries are carried
/// by the frame header, so a stream gives the in-order delivery the command
/// protocol relies on.
pub struct IpcStream {
    inner: UnixStream,
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl IpcStream {
    /// Create a connected pair: `(controller_end, helper_end)`.
    ///
    /// Both ends are close-on-exec; the spawner clears the flag on the helper
    /// end in the child only.
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = UnixStream::pair()?;
        debug!(
            controller_fd = left.as_raw_fd(),
            helper_fd = right.as_raw_fd(),
            "created ipc socket pair"
        );
        Ok((Self::from_unix(left), Self::from_unix(right)))
    }

    /// Adopt an inherited descriptor number passed on the command line.
    pub fn from_inherited_fd(fd: RawFd) -> Result<Self> {
        let stream = os::adopt_unix_stream(fd)
            .map_err(|source| TransportError::InvalidDescriptor { fd, source })?;
        Ok(Self::from_unix(stream))
    }

    pub(crate) fn from_unix(stream: UnixStream) -> Self {
        Self { inner: stream }
    }

    /// Switch the stream between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.inner.set_nonblocking(nonblocking).map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self::from_unix(self.inner.try_clone()?))
    }

    /// Get the credentials of the connected peer as `(uid, gid, pid)`.
    ///
    /// Returns `None` on platforms that do not expose peer credentials.
    pub fn peer_credentials(&self) -> Option<(u32, u32, u32)> {
        os::peer_credentials(self.inner.as_raw_fd())
    }

    /// Give up the wrapper and return the owned descriptor.
    pub fn into_owned_fd(self) -> OwnedFd {
        self.inner.into()
    }
}

impl AsRawFd for IpcStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl AsFd for IpcStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream")
            .field("fd", &self.inner.as_raw_fd())
            .finish()
    }
}
