use std::os::fd::OwnedFd;

use crate::chanlist::NO_CHANNELS;
use crate::driver::{Driver, DriverError, DriverResult};

/// Stand-in for a source whose driver could not be resolved.
///
/// Keeps the source visible in inventory; every operation fails fatally.
#[derive(Debug, Clone)]
pub struct BrokenDriver {
    reason: String,
}

impl BrokenDriver {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn fail<T>(&self) -> DriverResult<T> {
        Err(DriverError::Fatal(self.reason.clone()))
    }
}

impl Driver for BrokenDriver {
    fn type_name(&self) -> &'static str {
        "broken"
    }

    fn description(&self) -> &'static str {
        "placeholder for an unresolved source"
    }

    fn requires_privilege(&self) -> bool {
        false
    }

    fn can_hop(&self) -> bool {
        false
    }

    fn default_channel_list(&self) -> &'static str {
        NO_CHANNELS
    }

    fn probe(&self, _interface: &str) -> bool {
        false
    }

    fn instantiate(&self) -> Box<dyn Driver> {
        Box::new(self.clone())
    }

    fn enable_monitor(&mut self, _interface: &str) -> DriverResult<()> {
        self.fail()
    }

    fn disable_monitor(&mut self, _interface: &str) -> DriverResult<()> {
        Ok(())
    }

    fn open(&mut self, _interface: &str) -> DriverResult<Option<OwnedFd>> {
        self.fail()
    }

    fn close(&mut self) {}

    fn set_channel(&mut self, _interface: &str, _channel: u32) -> DriverResult<()> {
        self.fail()
    }

    fn fetch_channel(&mut self, _interface: &str) -> DriverResult<u32> {
        self.fail()
    }
}
