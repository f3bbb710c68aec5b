//! Capture driver capability interface and the registry of prototypes.
//!
//! The registry holds one prototype per driver type. Resolving a source
//! either names the type or probes each prototype in registration order,
//! then asks the chosen prototype for a fresh instance owned by the source.

use std::fmt;
use std::os::fd::OwnedFd;

use serde::Serialize;

use crate::drivers::{BrokenDriver, LinuxWifiDriver, SimDriver};

/// Failure reported by a driver operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// Worth retrying; counts toward the consecutive-error threshold.
    #[error("{0}")]
    Transient(String),

    /// The source cannot continue and must be closed.
    #[error("unrecoverable: {0}")]
    Fatal(String),
}

impl DriverError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Fatal(_))
    }
}

/// Result type for driver operations.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// What a capture driver can do for one interface.
pub trait Driver: Send + fmt::Debug {
    /// Type name used in source definitions (`type=`) and on the wire.
    fn type_name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Whether opening the interface needs elevated rights.
    fn requires_privilege(&self) -> bool;

    /// Whether the driver can change channel at all.
    fn can_hop(&self) -> bool {
        true
    }

    /// Channel list used when neither the definition nor the hardware names one.
    fn default_channel_list(&self) -> &'static str;

    /// Claim an interface during auto-detection.
    fn probe(&self, interface: &str) -> bool;

    /// A new, unopened instance for one source.
    fn instantiate(&self) -> Box<dyn Driver>;

    /// Channels the hardware reports; empty when unknown.
    fn supported_channels(&mut self, _interface: &str) -> DriverResult<Vec<u32>> {
        Ok(Vec::new())
    }

    fn enable_monitor(&mut self, interface: &str) -> DriverResult<()>;

    fn disable_monitor(&mut self, interface: &str) -> DriverResult<()>;

    /// Open the capture; the returned descriptor is the source's live descriptor.
    fn open(&mut self, interface: &str) -> DriverResult<Option<OwnedFd>>;

    fn close(&mut self);

    fn set_channel(&mut self, interface: &str, channel: u32) -> DriverResult<()>;

    fn fetch_channel(&mut self, interface: &str) -> DriverResult<u32>;
}

/// Inventory row for one registered prototype.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriverInfo {
    pub type_name: &'static str,
    pub description: &'static str,
    pub requires_privilege: bool,
    pub can_hop: bool,
    pub default_channel_list: &'static str,
}

/// Named driver prototypes.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    prototypes: Vec<Box<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Linux wireless plus the privileged and unprivileged simulated radios.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(LinuxWifiDriver::new()));
        registry.register(Box::new(SimDriver::privileged()));
        registry.register(Box::new(SimDriver::new()));
        registry
    }

    /// Add a prototype; a later registration of the same type replaces it.
    pub fn register(&mut self, prototype: Box<dyn Driver>) {
        self.prototypes
            .retain(|existing| existing.type_name() != prototype.type_name());
        self.prototypes.push(prototype);
    }

    pub fn find(&self, type_name: &str) -> Option<&dyn Driver> {
        self.prototypes
            .iter()
            .find(|p| p.type_name() == type_name)
            .map(|p| p.as_ref())
    }

    /// First prototype claiming `interface`.
    pub fn probe(&self, interface: &str) -> Option<&dyn Driver> {
        self.prototypes
            .iter()
            .find(|p| p.probe(interface))
            .map(|p| p.as_ref())
    }

    /// Placeholder instance for a source that could not be resolved.
    pub fn broken(&self, reason: impl Into<String>) -> Box<dyn Driver> {
        Box::new(BrokenDriver::new(reason))
    }

    pub fn describe(&self) -> Vec<DriverInfo> {
        self.prototypes
            .iter()
            .map(|p| DriverInfo {
                type_name: p.type_name(),
                description: p.description(),
                requires_privilege: p.requires_privilege(),
                can_hop: p.can_hop(),
                default_channel_list: p.default_channel_list(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.prototypes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_follows_registration_order() {
        let registry = DriverRegistry::with_defaults();
        assert_eq!(registry.probe("simroot0").unwrap().type_name(), "simroot");
        assert_eq!(registry.probe("sim3").unwrap().type_name(), "sim");
        assert!(registry.probe("capctl-nothing").is_none());
    }

    #[test]
    fn find_by_type_name() {
        let registry = DriverRegistry::with_defaults();
        assert!(registry.find("linuxwifi").unwrap().requires_privilege());
        assert!(!registry.find("sim").unwrap().requires_privilege());
        assert!(registry.find("bogus").is_none());
    }

    #[test]
    fn reregistering_replaces_prototype() {
        let mut registry = DriverRegistry::with_defaults();
        let before = registry.len();
        registry.register(Box::new(SimDriver::new().with_channels(vec![1, 2])));
        assert_eq!(registry.len(), before);
        assert_eq!(registry.describe().last().unwrap().type_name, "sim");
    }

    #[test]
    fn broken_placeholder_fails_fatally() {
        let registry = DriverRegistry::new();
        let mut broken = registry.broken("no driver for wlan9");
        assert_eq!(broken.type_name(), "broken");
        assert!(broken.open("wlan9").unwrap_err().is_fatal());
    }
}
