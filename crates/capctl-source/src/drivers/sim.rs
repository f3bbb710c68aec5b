use std::io::Write;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::driver::{Driver, DriverError, DriverResult};

const DEFAULT_CHANNELS: &[u32] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

#[derive(Debug, Default)]
struct Radio {
    channel: u32,
    monitor: bool,
    open: bool,
    opens: u32,
    history: Vec<u32>,
    transient_failures: u32,
    fatal_failure: Option<String>,
    open_failure: Option<String>,
    peer: Option<UnixStream>,
}

/// Simulated radio. Probes any interface named `sim*` (or `simroot*` for the
/// privileged variant) and captures from one end of a socket pair.
#[derive(Debug)]
pub struct SimDriver {
    privileged: bool,
    channels: Vec<u32>,
    radio: Arc<Mutex<Radio>>,
}

impl SimDriver {
    pub fn new() -> Self {
        Self {
            privileged: false,
            channels: DEFAULT_CHANNELS.to_vec(),
            radio: Arc::default(),
        }
    }

    /// Variant that claims to need root, so it runs in the helper.
    pub fn privileged() -> Self {
        Self {
            privileged: true,
            ..Self::new()
        }
    }

    /// Channels reported as hardware-supported.
    pub fn with_channels(mut self, channels: Vec<u32>) -> Self {
        self.channels = channels;
        self
    }

    /// Test handle onto this instance's radio.
    pub fn handle(&self) -> SimHandle {
        SimHandle {
            radio: Arc::clone(&self.radio),
        }
    }

    fn radio(&self) -> MutexGuard<'_, Radio> {
        self.radio.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SimDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for SimDriver {
    fn type_name(&self) -> &'static str {
        if self.privileged {
            "simroot"
        } else {
            "sim"
        }
    }

    fn description(&self) -> &'static str {
        if self.privileged {
            "simulated radio opened by the privileged helper"
        } else {
            "simulated radio"
        }
    }

    fn requires_privilege(&self) -> bool {
        self.privileged
    }

    fn default_channel_list(&self) -> &'static str {
        "IEEE80211b"
    }

    fn probe(&self, interface: &str) -> bool {
        let is_root = interface.starts_with("simroot");
        interface.starts_with("sim") && is_root == self.privileged
    }

    fn instantiate(&self) -> Box<dyn Driver> {
        Box::new(Self {
            privileged: self.privileged,
            channels: self.channels.clone(),
            radio: Arc::default(),
        })
    }

    fn supported_channels(&mut self, _interface: &str) -> DriverResult<Vec<u32>> {
        Ok(self.channels.clone())
    }

    fn enable_monitor(&mut self, _interface: &str) -> DriverResult<()> {
        self.radio().monitor = true;
        Ok(())
    }

    fn disable_monitor(&mut self, _interface: &str) -> DriverResult<()> {
        self.radio().monitor = false;
        Ok(())
    }

    fn open(&mut self, interface: &str) -> DriverResult<Option<OwnedFd>> {
        let mut radio = self.radio();
        if let Some(reason) = radio.open_failure.clone() {
            return Err(DriverError::Transient(reason));
        }
        let (capture, peer) =
            UnixStream::pair().map_err(|e| DriverError::Transient(e.to_string()))?;
        capture
            .set_nonblocking(true)
            .map_err(|e| DriverError::Transient(e.to_string()))?;
        radio.peer = Some(peer);
        radio.open = true;
        radio.opens += 1;
        debug!(interface, "opened simulated radio");
        Ok(Some(capture.into()))
    }

    fn close(&mut self) {
        let mut radio = self.radio();
        radio.peer = None;
        radio.open = false;
    }

    fn set_channel(&mut self, _interface: &str, channel: u32) -> DriverResult<()> {
        let mut radio = self.radio();
        if let Some(reason) = radio.fatal_failure.clone() {
            return Err(DriverError::Fatal(reason));
        }
        if radio.transient_failures > 0 {
            radio.transient_failures -= 1;
            return Err(DriverError::Transient(format!("radio refused channel {channel}")));
        }
        radio.channel = channel;
        radio.history.push(channel);
        Ok(())
    }

    fn fetch_channel(&mut self, _interface: &str) -> DriverResult<u32> {
        Ok(self.radio().channel)
    }
}

/// Inspect and steer a [`SimDriver`] instance from outside the source.
#[derive(Debug, Clone)]
pub struct SimHandle {
    radio: Arc<Mutex<Radio>>,
}

impl SimHandle {
    fn radio(&self) -> MutexGuard<'_, Radio> {
        self.radio.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channel(&self) -> u32 {
        self.radio().channel
    }

    /// Every channel successfully set, in order.
    pub fn history(&self) -> Vec<u32> {
        self.radio().history.clone()
    }

    pub fn is_monitor(&self) -> bool {
        self.radio().monitor
    }

    pub fn is_open(&self) -> bool {
        self.radio().open
    }

    pub fn open_count(&self) -> u32 {
        self.radio().opens
    }

    /// Make the next `count` channel changes fail transiently.
    pub fn fail_next_channel_sets(&self, count: u32) {
        self.radio().transient_failures = count;
    }

    /// Make every channel change fail with an unrecoverable error.
    pub fn fail_fatally(&self, reason: impl Into<String>) {
        self.radio().fatal_failure = Some(reason.into());
    }

    /// Make `open` fail until cleared with `None`.
    pub fn fail_open(&self, reason: Option<String>) {
        self.radio().open_failure = reason;
    }

    pub fn clear_failures(&self) {
        let mut radio = self.radio();
        radio.transient_failures = 0;
        radio.fatal_failure = None;
        radio.open_failure = None;
    }

    /// Push bytes into the capture descriptor.
    pub fn inject(&self, frame: &[u8]) -> std::io::Result<()> {
        match self.radio().peer.as_mut() {
            Some(peer) => peer.write_all(frame),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "simulated radio is closed",
            )),
        }
    }

    /// Drop the far end so the capture descriptor reads end-of-file.
    pub fn unplug(&self) {
        self.radio().peer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn probe_separates_privileged_variant() {
        assert!(SimDriver::new().probe("sim0"));
        assert!(!SimDriver::new().probe("simroot0"));
        assert!(SimDriver::privileged().probe("simroot0"));
        assert!(!SimDriver::privileged().probe("sim0"));
        assert!(!SimDriver::new().probe("wlan0"));
    }

    #[test]
    fn instances_do_not_share_radios() {
        let prototype = SimDriver::new();
        let mut a = prototype.instantiate();
        let b = prototype.instantiate();
        a.set_channel("sim0", 6).unwrap();
        assert_eq!(prototype.handle().channel(), 0);
        drop(b);
    }

    #[test]
    fn injected_frames_reach_the_capture_descriptor() {
        let mut driver = SimDriver::new();
        let handle = driver.handle();
        let fd = driver.open("sim0").unwrap().unwrap();
        handle.inject(b"frame").unwrap();

        let mut capture = UnixStream::from(fd);
        capture.set_nonblocking(false).unwrap();
        let mut buf = [0u8; 5];
        capture.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"frame");

        handle.unplug();
        assert_eq!(capture.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn fault_injection() {
        let mut driver = SimDriver::new();
        let handle = driver.handle();
        handle.fail_next_channel_sets(2);
        assert!(!driver.set_channel("sim0", 1).unwrap_err().is_fatal());
        assert!(!driver.set_channel("sim0", 1).unwrap_err().is_fatal());
        driver.set_channel("sim0", 6).unwrap();
        assert_eq!(handle.history(), vec![6]);

        handle.fail_fatally("radio gone");
        assert!(driver.set_channel("sim0", 11).unwrap_err().is_fatal());
        handle.clear_failures();
        driver.set_channel("sim0", 11).unwrap();
        assert_eq!(driver.fetch_channel("sim0").unwrap(), 11);
    }
}
