//! Privilege-separated wireless capture with channel hopping.
//!
//! An unprivileged controller owns every capture source and runs the
//! channel-hop scheduler. Sources whose driver needs root are opened by a
//! privileged helper process the controller spawns and talks to over a
//! socket pair; the helper passes the opened capture descriptors back.
//!
//! # Crate Structure
//!
//! - [`transport`]: socket pair, descriptor passing, helper spawn, polling
//! - [`frame`]: command frame codec
//! - [`ipc`]: command registry, sync handshake, acknowledged channel
//! - [`source`]: channel lists, drivers, sources, scheduler, run loops

/// Re-export transport types.
pub mod transport {
    pub use capctl_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use capctl_frame::*;
}

/// Re-export command channel types.
pub mod ipc {
    pub use capctl_ipc::*;
}

/// Re-export source management types.
pub mod source {
    pub use capctl_source::*;
}
