//! Local OS plumbing for the capture controller.
//!
//! - [`IpcStream`]: one end of the controller/helper socket pair
//! - [`spawn`]: exec the privileged helper with the pair's other end inherited
//! - [`fdpass`]: path-addressed side-channel that moves open descriptors
//! - [`poll`]: readiness polling for the single-threaded run loop
//! - [`capture`]: raw packet sockets for privileged capture sources
//!
//! This is the lowest layer of capctl; all `unsafe` OS calls are confined to
//! the private `os` module.

pub mod capture;
pub mod error;
pub mod fdpass;
pub mod poll;
pub mod spawn;
pub mod stream;
pub mod uds;

mod os;

pub use capture::open_packet_socket;
pub use error::{Result, TransportError};
pub use fdpass::{descriptor_path, DescriptorReceiver, DescriptorSender};
pub use poll::{PollSet, Readiness, Token};
pub use spawn::{current_program, is_privileged, spawn_helper, HelperCommand, IPC_FD_ARG};
pub use stream::IpcStream;
pub use uds::PathListener;
