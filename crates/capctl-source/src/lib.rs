//! Capture sources and the channel-hop scheduler.
//!
//! A source is a capture interface bound to a driver and a channel list.
//! [`SourceTracker`] resolves definitions such as `wlan0:channellist=IEEE80211b`
//! into sources, spreads sources that share a list across it, and advances
//! each hopping source on a fixed 10 Hz tick. Sources whose driver needs
//! privilege are mirrored into the helper process over the command channel;
//! [`runtime`] holds the run loops for both processes.

pub mod chanlist;
pub mod commands;
pub mod config;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod health;
pub mod runtime;
pub mod scheduler;
pub mod source;
pub mod split;
pub mod tracker;
pub mod wire;

pub use chanlist::{ChannelEntry, ChannelList, ChannelListStore, DEFAULT_LISTS, NO_CHANNELS};
pub use commands::{controller_registry, helper_registry, ControllerState, HelperState};
pub use config::{SchedulerConfig, SourceDefaults};
pub use driver::{Driver, DriverError, DriverInfo, DriverRegistry, DriverResult};
pub use error::{Result, SourceError};
pub use health::ReopenTimer;
pub use runtime::{run_helper, Controller, HelperOptions};
pub use source::{HopDriver, Source, SourceDefinition, SourceState, SourceSummary};
pub use split::split_positions;
pub use tracker::SourceTracker;
