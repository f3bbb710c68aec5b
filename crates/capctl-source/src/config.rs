//! Scheduler tunables and global source defaults.

use std::time::Duration;

/// Fixed scheduler parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Scheduler ticks per second. Default: 10.
    pub ticks_per_second: u32,
    /// Consecutive channel-set failures before a source is closed. Default: 5.
    pub max_consecutive_channel_errors: u32,
    /// Consecutive empty reads before a source counts as disconnected. Default: 100.
    pub zero_poll_threshold: u32,
    /// How often errored sources are retried. Default: 10 s.
    pub reopen_interval: Duration,
    /// Ticks between channel usage reports. Default: 10.
    pub tick_report_period: u32,
}

impl SchedulerConfig {
    /// Wall-clock length of one tick.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.ticks_per_second.max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            ticks_per_second: 10,
            max_consecutive_channel_errors: 5,
            zero_poll_threshold: 100,
            reopen_interval: Duration::from_secs(10),
            tick_report_period: 10,
        }
    }
}

/// Hop settings applied to sources that do not override them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDefaults {
    /// Hop through the channel list. Default: true.
    pub hop: bool,
    /// Channels per second when hopping by rate. Default: 5.
    pub hop_rate: i32,
    /// Seconds per channel; when non-zero, replaces `hop_rate`. Default: 0.
    pub dwell_seconds: i32,
    /// Spread sources sharing a channel list across it. Default: true.
    pub split: bool,
    /// Retry errored sources on the reopen timer. Default: true.
    pub reopen: bool,
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            hop: true,
            hop_rate: 5,
            dwell_seconds: 0,
            split: true,
            reopen: true,
        }
    }
}
