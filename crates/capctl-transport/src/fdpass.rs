//! Descriptor-passing side-channel.
//!
//! The privileged helper creates `<dir>/<prefix>_<pid>` and the controller
//! connects once it knows the helper's pid. Each transfer is one marker byte
//! carrying a single descriptor as `SCM_RIGHTS` ancillary data. Descriptors
//! stay valid in the receiver after either endpoint closes.

use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::os;
use crate::uds::PathListener;

const MARKER: u8 = b'F';

/// How long the helper waits for the controller to connect on first send.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Side-channel path for a helper process.
pub fn descriptor_path(dir: &Path, prefix: &str, helper_pid: u32) -> PathBuf {
    dir.join(format!("{prefix}_{helper_pid}"))
}

/// Helper-side endpoint: owns the socket path and sends descriptors.
pub struct DescriptorSender {
    listener: PathListener,
    conn: Option<UnixStream>,
    accept_timeout: Duration,
}

impl DescriptorSender {
    /// Create the side-channel for the current process under `dir`.
    pub fn bind(dir: &Path, prefix: &str) -> Result<Self> {
        Self::bind_at(descriptor_path(dir, prefix, std::process::id()))
    }

    /// Create the side-channel at an explicit path.
    pub fn bind_at(path: impl AsRef<Path>) -> Result<Self> {
        let listener = PathListener::bind(path)?;
        Ok(Self {
            listener,
            conn: None,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
        })
    }

    /// Override how long the first send waits for the controller.
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Path of the side-channel socket.
    pub fn path(&self) -> &Path {
        self.listener.path()
    }

    /// Whether the controller has connected yet.
    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Transmit one descriptor to the controller.
    ///
    /// The first call accepts the controller's pending connection.
    pub fn send_descriptor(&mut self, fd: BorrowedFd<'_>) -> Result<()> {
        if self.conn.is_none() {
            let stream = self.listener.accept_timeout(self.accept_timeout)?;
            info!(path = ?self.listener.path(), "descriptor side-channel connected");
            self.conn = Some(stream);
        }
        let Some(conn) = self.conn.as_ref() else {
            return Err(TransportError::Shutdown);
        };

        let sent = os::send_with_descriptor(conn.as_raw_fd(), &[MARKER], fd.as_raw_fd())?;
        if sent != 1 {
            return Err(TransportError::Shutdown);
        }
        debug!(fd = fd.as_raw_fd(), "sent descriptor");
        Ok(())
    }
}

impl std::fmt::Debug for DescriptorSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSender")
            .field("path", &self.listener.path())
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

/// Controller-side endpoint: receives descriptors from the helper.
#[derive(Debug)]
pub struct DescriptorReceiver {
    stream: UnixStream,
    path: PathBuf,
}

impl DescriptorReceiver {
    /// Connect to the side-channel of helper `helper_pid`.
    pub fn connect(dir: &Path, prefix: &str, helper_pid: u32) -> Result<Self> {
        Self::connect_path(descriptor_path(dir, prefix, helper_pid))
    }

    /// Connect to an explicit side-channel path.
    pub fn connect_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = PathListener::connect(&path)?;
        Ok(Self { stream, path })
    }

    /// Block until the next descriptor arrives.
    pub fn receive_descriptor(&mut self) -> Result<OwnedFd> {
        let mut marker = [0u8; 1];
        let (n, fd) = os::recv_with_descriptor(self.stream.as_raw_fd(), &mut marker)?;
        if n == 0 {
            return Err(TransportError::Shutdown);
        }
        let fd = fd.ok_or(TransportError::NoDescriptor)?;
        debug!(path = ?self.path, fd = fd.as_raw_fd(), "received descriptor");
        Ok(fd)
    }

    /// Bound how long [`receive_descriptor`](Self::receive_descriptor) may block.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsFd;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("capctl-fdpass-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn path_uses_prefix_and_pid() {
        let path = descriptor_path(Path::new("/tmp"), "capctl_fd", 4242);
        assert_eq!(path, PathBuf::from("/tmp/capctl_fd_4242"));
    }

    #[test]
    fn transferred_descriptor_survives_sender_close() {
        let dir = temp_dir("xfer");
        let mut sender = DescriptorSender::bind(&dir, "fdp").unwrap();
        let mut receiver =
            DescriptorReceiver::connect(&dir, "fdp", std::process::id()).unwrap();

        let (mut local, remote) = UnixStream::pair().unwrap();
        sender.send_descriptor(remote.as_fd()).unwrap();
        let received = receiver.receive_descriptor().unwrap();

        drop(remote);
        drop(sender);
        drop(receiver);

        let mut received = UnixStream::from(received);
        received.write_all(b"through").unwrap();
        let mut buf = [0u8; 7];
        local.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"through");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn sends_several_descriptors_in_order() {
        let dir = temp_dir("order");
        let mut sender = DescriptorSender::bind(&dir, "fdp").unwrap();
        let mut receiver =
            DescriptorReceiver::connect_path(sender.path().to_path_buf()).unwrap();

        let (mut a_local, a_remote) = UnixStream::pair().unwrap();
        let (mut b_local, b_remote) = UnixStream::pair().unwrap();
        sender.send_descriptor(a_remote.as_fd()).unwrap();
        sender.send_descriptor(b_remote.as_fd()).unwrap();

        let mut first = UnixStream::from(receiver.receive_descriptor().unwrap());
        let mut second = UnixStream::from(receiver.receive_descriptor().unwrap());
        first.write_all(b"a").unwrap();
        second.write_all(b"b").unwrap();

        let mut buf = [0u8; 1];
        a_local.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"a");
        b_local.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"b");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn send_without_controller_times_out() {
        let dir = temp_dir("noctl");
        let mut sender = DescriptorSender::bind(&dir, "fdp")
            .unwrap()
            .with_accept_timeout(Duration::from_millis(30));
        let (_local, remote) = UnixStream::pair().unwrap();
        let result = sender.send_descriptor(remote.as_fd());
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn helper_exit_reports_shutdown() {
        let dir = temp_dir("closed");
        let mut sender = DescriptorSender::bind(&dir, "fdp").unwrap();
        let mut receiver =
            DescriptorReceiver::connect_path(sender.path().to_path_buf()).unwrap();
        let (_local, remote) = UnixStream::pair().unwrap();
        sender.send_descriptor(remote.as_fd()).unwrap();
        let _ = receiver.receive_descriptor().unwrap();
        drop(sender);
        assert!(matches!(
            receiver.receive_descriptor(),
            Err(TransportError::Shutdown)
        ));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
