//! `select`-style readiness polling for the cooperative run loop.

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::Result;
use crate::os;

/// Readiness reported for one registered descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// Data (or EOF) can be read without blocking.
    pub readable: bool,
    /// Data can be written without blocking.
    pub writable: bool,
    /// The peer hung up or the descriptor is in error.
    pub hangup: bool,
}

/// Token returned by [`PollSet::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token(usize);

/// A one-shot set of descriptors to wait on.
#[derive(Debug, Default)]
pub struct PollSet {
    fds: Vec<libc::pollfd>,
}

impl PollSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor; `write` asks for writability as well as readability.
    pub fn register(&mut self, fd: RawFd, read: bool, write: bool) -> Token {
        let mut events = 0;
        if read {
            events |= libc::POLLIN;
        }
        if write {
            events |= libc::POLLOUT;
        }
        self.fds.push(libc::pollfd {
            fd,
            events,
            revents: 0,
        });
        Token(self.fds.len() - 1)
    }

    /// Wait until something is ready or `timeout` elapses.
    ///
    /// Returns the number of ready descriptors; zero on timeout or signal.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(i32::MAX as u128) as i32,
        };
        Ok(os::poll(&mut self.fds, timeout_ms)?)
    }

    /// Readiness of a registered descriptor after [`wait`](Self::wait).
    pub fn readiness(&self, token: Token) -> Readiness {
        let Some(entry) = self.fds.get(token.0) else {
            return Readiness::default();
        };
        let hangup = entry.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
        Readiness {
            // EOF must reach the reader so it can observe the zero-length read.
            readable: entry.revents & libc::POLLIN != 0 || hangup,
            writable: entry.revents & libc::POLLOUT != 0,
            hangup,
        }
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn clear(&mut self) {
        self.fds.clear();
    }
}

/// Put an arbitrary descriptor (e.g. a capture socket) in non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    Ok(os::set_nonblocking(fd, true)?)
}

/// Non-blocking read from a descriptor this process does not wrap.
pub fn read_available(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    os::read_descriptor(fd, buf)
}
