//! Raw OS calls.
//!
//! Every `unsafe` block in capctl lives in this module. Callers elsewhere use
//! the safe wrappers in [`crate::capture`], [`crate::fdpass`], [`crate::spawn`],
//! [`crate::poll`] and [`crate::stream`].

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

const FD_SIZE: usize = std::mem::size_of::<libc::c_int>();

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: libc::c_int = libc::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: libc::c_int = 0;

/// Effective user id of this process.
pub(crate) fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

/// Returns true if `fd` names an open descriptor in this process.
pub(crate) fn descriptor_is_open(fd: RawFd) -> bool {
    // SAFETY: F_GETFD only inspects the descriptor table.
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

/// Clear `FD_CLOEXEC` so `fd` survives `exec`.
///
/// Only calls `fcntl`, which is async-signal-safe, so this is usable from a
/// `pre_exec` hook.
pub(crate) fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an integer descriptor; errors are reported via errno.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set or clear `O_NONBLOCK` on an arbitrary descriptor.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    // SAFETY: fcntl on an integer descriptor; errors are reported via errno.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Take ownership of an inherited Unix stream descriptor.
///
/// The caller must guarantee nothing else in the process owns `fd`; we check
/// that it is open and is a socket before wrapping it.
pub(crate) fn adopt_unix_stream(fd: RawFd) -> io::Result<UnixStream> {
    if fd < 0 || !descriptor_is_open(fd) {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("descriptor {fd} is not open"),
        ));
    }

    // SAFETY: `stat` is a plain C struct for which all-zero is a valid value.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    // SAFETY: `st` is a valid writable pointer and `fd` is open.
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if st.st_mode & libc::S_IFMT != libc::S_IFSOCK {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("descriptor {fd} is not a socket"),
        ));
    }

    // SAFETY: `fd` is open, is a socket, and ownership is transferred by the
    // caller's contract.
    Ok(unsafe { UnixStream::from_raw_fd(fd) })
}

/// Send `data` with `fd` attached as `SCM_RIGHTS` ancillary data.
///
/// The kernel duplicates the descriptor into the receiver; the sender keeps
/// its own copy.
pub(crate) fn send_with_descriptor(sock: RawFd, data: &[u8], fd: RawFd) -> io::Result<usize> {
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(FD_SIZE as u32) } as usize;
    // u64 storage keeps the control buffer aligned for cmsghdr.
    let mut cmsg_buf = vec![0u64; cmsg_space.div_ceil(8)];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };

    // SAFETY: msghdr is a plain C struct for which all-zero is a valid value.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: msg_control points at a buffer of at least CMSG_SPACE(int)
    // bytes, so the first header and its data slot are in bounds.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        if cmsg.is_null() {
            return Err(io::Error::other("control buffer too small"));
        }
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(FD_SIZE as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), fd);
    }

    loop {
        // SAFETY: `msg` and everything it points to outlive the call.
        let n = unsafe { libc::sendmsg(sock, &msg, 0) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Receive into `buf`, extracting the first `SCM_RIGHTS` descriptor if any.
///
/// Additional descriptors in the same message are closed.
pub(crate) fn recv_with_descriptor(
    sock: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, Option<OwnedFd>)> {
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(FD_SIZE as u32) } as usize;
    let mut cmsg_buf = vec![0u64; (cmsg_space * 4).div_ceil(8)];

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    // SAFETY: msghdr is a plain C struct for which all-zero is a valid value.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = (cmsg_buf.len() * 8) as _;

    let n = loop {
        // SAFETY: `msg` points at live, writable buffers sized as declared.
        let n = unsafe { libc::recvmsg(sock, &mut msg, RECV_FLAGS) };
        if n >= 0 {
            break n as usize;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };

    let mut received: Option<OwnedFd> = None;
    // SAFETY: the kernel filled msg_control/msg_controllen; the CMSG_* macros
    // walk only within that region.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize) / FD_SIZE;
                for i in 0..count {
                    let raw: libc::c_int =
                        std::ptr::read_unaligned(data.add(i * FD_SIZE).cast::<libc::c_int>());
                    let owned = OwnedFd::from_raw_fd(raw);
                    if received.is_none() {
                        received = Some(owned);
                    }
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok((n, received))
}

/// Read from an arbitrary descriptor without taking ownership.
pub(crate) fn read_descriptor(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        // SAFETY: `buf` is a valid writable region of `buf.len()` bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// `poll(2)` over a prepared descriptor set.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    // SAFETY: `fds` is a valid slice of pollfd for its whole length.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(rc as usize)
}

/// Peer credentials of a connected Unix socket (Linux only).
#[cfg(target_os = "linux")]
pub(crate) fn peer_credentials(fd: RawFd) -> Option<(u32, u32, u32)> {
    let mut cred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

    // SAFETY: `cred` and `len` are valid writable pointers for the provided sizes,
    // and `fd` is an open Unix socket descriptor owned by this process.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
            &mut len,
        )
    };

    if rc == 0 && len as usize == std::mem::size_of::<libc::ucred>() {
        Some((cred.uid, cred.gid, cred.pid as u32))
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn peer_credentials(_fd: RawFd) -> Option<(u32, u32, u32)> {
    None
}

/// Raw `AF_PACKET` socket bound to `interface`, non-blocking and close-on-exec.
#[cfg(target_os = "linux")]
pub(crate) fn open_packet_socket(interface: &str) -> io::Result<OwnedFd> {
    let name = std::ffi::CString::new(interface)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
    // SAFETY: `name` is a valid NUL-terminated string for the call's duration.
    let ifindex = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if ifindex == 0 {
        return Err(io::Error::last_os_error());
    }

    let protocol = (libc::ETH_P_ALL as u16).to_be();
    // SAFETY: plain socket(2) call; the result is checked before use.
    let raw = unsafe {
        libc::socket(
            libc::AF_PACKET,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::c_int::from(protocol),
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // SAFETY: sockaddr_ll is a plain C struct for which all-zero is valid.
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as u16;
    addr.sll_protocol = protocol;
    addr.sll_ifindex = ifindex as i32;
    // SAFETY: `addr` is a fully initialised sockaddr_ll and the length matches.
    let rc = unsafe {
        libc::bind(
            std::os::fd::AsRawFd::as_raw_fd(&fd),
            (&addr as *const libc::sockaddr_ll).cast::<libc::sockaddr>(),
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn open_packet_socket(_interface: &str) -> io::Result<OwnedFd> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "packet capture sockets are only available on Linux",
    ))
}

/// Arrange for `fd` to be inherited across `exec` in a spawned child.
pub(crate) fn inherit_on_exec(cmd: &mut std::process::Command, fd: RawFd) {
    use std::os::unix::process::CommandExt;

    // SAFETY: the hook runs in the forked child before exec and only calls
    // fcntl, which is async-signal-safe; it touches no parent memory.
    unsafe {
        cmd.pre_exec(move || clear_cloexec(fd));
    }
}
