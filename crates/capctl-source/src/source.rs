//! Source definitions and per-source records.

use std::collections::BTreeMap;
use std::fmt;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::str::FromStr;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;

use crate::driver::Driver;
use crate::error::{Result, SourceError};

/// Options understood in a source definition.
pub const KNOWN_OPTIONS: &[&str] = &[
    "type",
    "name",
    "channellist",
    "hop",
    "dwell",
    "hoprate",
    "split",
    "channel",
    "reopen",
    "hopdriver",
];

/// Parsed `interface[:option=value,...]` definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDefinition {
    pub interface: String,
    options: BTreeMap<String, String>,
}

impl SourceDefinition {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (interface, rest) = match text.split_once(':') {
            Some((interface, rest)) => (interface.trim(), Some(rest)),
            None => (text, None),
        };
        if interface.is_empty() {
            return Err(SourceError::definition(text, "missing interface"));
        }

        let mut options = BTreeMap::new();
        for pair in rest.into_iter().flat_map(|r| r.split(',')) {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let Some((key, value)) = pair.split_once('=') else {
                return Err(SourceError::definition(text, format!("option '{pair}' has no value")));
            };
            let key = key.trim().to_ascii_lowercase();
            if !KNOWN_OPTIONS.contains(&key.as_str()) {
                warn!(definition = text, option = %key, "ignoring unknown source option");
            }
            if options.insert(key.clone(), value.trim().to_string()).is_some() {
                return Err(SourceError::definition(text, format!("option '{key}' given twice")));
            }
        }

        Ok(Self {
            interface: interface.to_string(),
            options,
        })
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    pub fn bool_option(&self, key: &str) -> Result<Option<bool>> {
        let Some(value) = self.option(key) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" => Ok(Some(false)),
            _ => Err(self.bad_value(key, value)),
        }
    }

    pub fn number_option<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.option(key)
            .map(|value| value.parse::<T>().map_err(|_| self.bad_value(key, value)))
            .transpose()
    }

    fn bad_value(&self, key: &str, value: &str) -> SourceError {
        SourceError::definition(&self.interface, format!("invalid value '{value}' for {key}"))
    }
}

/// Lifecycle of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Unstarted,
    Starting,
    Running,
    Error,
    Reopening,
    Removed,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceState::Unstarted => "unstarted",
            SourceState::Starting => "starting",
            SourceState::Running => "running",
            SourceState::Error => "error",
            SourceState::Reopening => "reopening",
            SourceState::Removed => "removed",
        };
        f.write_str(name)
    }
}

/// Which process advances a privileged source through its channel list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HopDriver {
    /// The helper runs the hop loop and reports back.
    #[default]
    Helper,
    /// The controller hops and sends one channel-set per hop.
    Controller,
}

impl FromStr for HopDriver {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "helper" => Ok(HopDriver::Helper),
            "controller" => Ok(HopDriver::Controller),
            other => Err(format!("unknown hop driver '{other}'")),
        }
    }
}

/// One capture source and its scheduling state.
#[derive(Debug)]
pub struct Source {
    pub id: u16,
    pub name: String,
    pub interface: String,
    pub definition: String,
    pub driver_type: String,
    pub(crate) driver: Box<dyn Driver>,
    pub requires_privilege: bool,
    pub channel_list_id: u16,
    pub channel: u32,
    pub hop_enabled: bool,
    pub dwell_seconds: i32,
    pub hop_rate: i32,
    pub split_enabled: bool,
    pub position: usize,
    pub range_position: usize,
    pub(crate) countdown: u32,
    pub consecutive_channel_errors: u32,
    pub zero_poll_count: u32,
    pub state: SourceState,
    pub warning: Option<String>,
    pub reopen_on_error: bool,
    /// Unresolvable; never reopened.
    pub permanent_error: bool,
    pub hop_driver: HopDriver,
    /// Whether an operator asked for the source to run.
    pub(crate) start_requested: bool,
    /// Whether this process has already passed the descriptor on.
    pub(crate) descriptor_delivered: bool,
    pub(crate) descriptor: Option<OwnedFd>,
    pub(crate) cycle_started: Option<Instant>,
    pub last_hop_cycle: Option<Duration>,
    pub packets: u64,
    pub bytes: u64,
}

impl Source {
    pub(crate) fn new(id: u16, definition: &str, interface: &str, driver: Box<dyn Driver>) -> Self {
        Self {
            id,
            name: interface.to_string(),
            interface: interface.to_string(),
            definition: definition.to_string(),
            driver_type: driver.type_name().to_string(),
            requires_privilege: driver.requires_privilege(),
            driver,
            channel_list_id: 0,
            channel: 0,
            hop_enabled: false,
            dwell_seconds: 0,
            hop_rate: 0,
            split_enabled: false,
            position: 0,
            range_position: 0,
            countdown: 0,
            consecutive_channel_errors: 0,
            zero_poll_count: 0,
            state: SourceState::Unstarted,
            warning: None,
            reopen_on_error: true,
            permanent_error: false,
            hop_driver: HopDriver::Helper,
            start_requested: false,
            descriptor_delivered: false,
            descriptor: None,
            cycle_started: None,
            last_hop_cycle: None,
            packets: 0,
            bytes: 0,
        }
    }

    pub fn is_error(&self) -> bool {
        self.state == SourceState::Error
    }

    pub fn is_running(&self) -> bool {
        self.state == SourceState::Running
    }

    /// Hopping by rate or dwelling, as opposed to a fixed channel.
    pub fn is_hopping(&self) -> bool {
        self.hop_enabled && (self.dwell_seconds > 0 || self.hop_rate > 0)
    }

    pub fn descriptor(&self) -> Option<BorrowedFd<'_>> {
        self.descriptor.as_ref().map(AsFd::as_fd)
    }

    pub fn has_descriptor(&self) -> bool {
        self.descriptor.is_some()
    }

    pub(crate) fn set_error(&mut self, reason: impl Into<String>) {
        self.state = SourceState::Error;
        self.warning = Some(reason.into());
    }

    /// Release the capture; the source keeps its configuration.
    pub(crate) fn close(&mut self) {
        self.driver.close();
        self.descriptor = None;
        self.descriptor_delivered = false;
        self.cycle_started = None;
    }

    pub fn summary(&self) -> SourceSummary {
        SourceSummary {
            id: self.id,
            name: self.name.clone(),
            interface: self.interface.clone(),
            driver: self.driver_type.clone(),
            state: self.state,
            channel_list_id: self.channel_list_id,
            channel: self.channel,
            hopping: self.is_hopping(),
            hop_driver: self.hop_driver,
            position: self.position,
            packets: self.packets,
            bytes: self.bytes,
            hop_cycle_ms: self.last_hop_cycle.map(|d| d.as_millis() as u64),
            warning: self.warning.clone(),
        }
    }
}

/// Snapshot of a source for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub id: u16,
    pub name: String,
    pub interface: String,
    pub driver: String,
    pub state: SourceState,
    pub channel_list_id: u16,
    pub channel: u32,
    pub hopping: bool,
    pub hop_driver: HopDriver,
    pub position: usize,
    pub packets: u64,
    pub bytes: u64,
    pub hop_cycle_ms: Option<u64>,
    pub warning: Option<String>,
}
