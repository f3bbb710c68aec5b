//! Built-in driver implementations.

mod broken;
mod linuxwifi;
mod sim;

pub use broken::BrokenDriver;
pub use linuxwifi::LinuxWifiDriver;
pub use sim::{SimDriver, SimHandle};
