//! Capture descriptors opened on behalf of a source.

use std::os::fd::OwnedFd;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::os;

/// Open a raw link-layer socket receiving every frame on `interface`.
///
/// Needs `CAP_NET_RAW`; this is what the privileged helper passes back to the
/// controller over the side-channel.
pub fn open_packet_socket(interface: &str) -> Result<OwnedFd> {
    let fd = os::open_packet_socket(interface).map_err(|source| TransportError::Capture {
        interface: interface.to_string(),
        source,
    })?;
    debug!(interface, "opened packet socket");
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_interface_is_capture_error() {
        let result = open_packet_socket("capctl-no-such-if0");
        assert!(matches!(result, Err(TransportError::Capture { .. })));
    }
}
