use std::io::ErrorKind;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use capctl_transport::TransportError;
use tracing::{debug, info};

use crate::driver::{Driver, DriverError, DriverResult};

const SYSFS_NET: &str = "/sys/class/net";

/// Linux mac80211 interfaces, driven through the `ip` and `iw` programs.
#[derive(Debug, Clone)]
pub struct LinuxWifiDriver {
    sysfs: PathBuf,
}

impl LinuxWifiDriver {
    pub fn new() -> Self {
        Self {
            sysfs: PathBuf::from(SYSFS_NET),
        }
    }

    /// Probe against a different sysfs root.
    pub fn with_sysfs(sysfs: impl Into<PathBuf>) -> Self {
        Self {
            sysfs: sysfs.into(),
        }
    }

    fn interface_info(&self, interface: &str) -> DriverResult<String> {
        run("iw", &["dev", interface, "info"])
    }
}

impl Default for LinuxWifiDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Driver for LinuxWifiDriver {
    fn type_name(&self) -> &'static str {
        "linuxwifi"
    }

    fn description(&self) -> &'static str {
        "Linux mac80211 wireless interface"
    }

    fn requires_privilege(&self) -> bool {
        true
    }

    fn default_channel_list(&self) -> &'static str {
        "IEEE80211ab"
    }

    fn probe(&self, interface: &str) -> bool {
        is_wireless(&self.sysfs, interface)
    }

    fn instantiate(&self) -> Box<dyn Driver> {
        Box::new(self.clone())
    }

    fn supported_channels(&mut self, interface: &str) -> DriverResult<Vec<u32>> {
        let info = self.interface_info(interface)?;
        let Some(phy) = parse_wiphy(&info) else {
            return Ok(Vec::new());
        };
        let listing = run("iw", &["phy", &format!("phy{phy}"), "channels"])?;
        Ok(parse_phy_channels(&listing))
    }

    fn enable_monitor(&mut self, interface: &str) -> DriverResult<()> {
        run("ip", &["link", "set", interface, "down"])?;
        run("iw", &["dev", interface, "set", "type", "monitor"])?;
        run("ip", &["link", "set", interface, "up"])?;
        info!(interface, "monitor mode enabled");
        Ok(())
    }

    fn disable_monitor(&mut self, interface: &str) -> DriverResult<()> {
        run("ip", &["link", "set", interface, "down"])?;
        run("iw", &["dev", interface, "set", "type", "managed"])?;
        run("ip", &["link", "set", interface, "up"])?;
        info!(interface, "monitor mode disabled");
        Ok(())
    }

    fn open(&mut self, interface: &str) -> DriverResult<Option<OwnedFd>> {
        match capctl_transport::open_packet_socket(interface) {
            Ok(fd) => Ok(Some(fd)),
            Err(TransportError::Capture { source, .. })
                if source.kind() == ErrorKind::PermissionDenied =>
            {
                Err(DriverError::Fatal(format!(
                    "no permission to capture on {interface}: {source}"
                )))
            }
            Err(err) => Err(DriverError::Transient(err.to_string())),
        }
    }

    fn close(&mut self) {}

    fn set_channel(&mut self, interface: &str, channel: u32) -> DriverResult<()> {
        run("iw", &["dev", interface, "set", "channel", &channel.to_string()])?;
        debug!(interface, channel, "set channel");
        Ok(())
    }

    fn fetch_channel(&mut self, interface: &str) -> DriverResult<u32> {
        let info = self.interface_info(interface)?;
        parse_current_channel(&info)
            .ok_or_else(|| DriverError::Transient(format!("{interface} reports no channel")))
    }
}

fn is_wireless(sysfs: &Path, interface: &str) -> bool {
    if interface.is_empty() || interface.contains('/') {
        return false;
    }
    sysfs.join(interface).join("phy80211").exists()
}

fn run(program: &str, args: &[&str]) -> DriverResult<String> {
    let output = Command::new(program).args(args).output().map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            DriverError::Fatal(format!("{program} is not installed"))
        } else {
            DriverError::Transient(format!("failed to run {program}: {err}"))
        }
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DriverError::Transient(format!(
            "{program} {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// `wiphy N` line of `iw dev <if> info`.
fn parse_wiphy(info: &str) -> Option<u32> {
    info.lines()
        .filter_map(|line| line.trim().strip_prefix("wiphy "))
        .find_map(|rest| rest.trim().parse().ok())
}

/// `channel N (F MHz), ...` line of `iw dev <if> info`.
fn parse_current_channel(info: &str) -> Option<u32> {
    info.lines()
        .filter_map(|line| line.trim().strip_prefix("channel "))
        .find_map(|rest| rest.split_whitespace().next()?.parse().ok())
}

/// Enabled channels from `iw phy <phy> channels`, lines like `* 2412 MHz [1]`.
fn parse_phy_channels(listing: &str) -> Vec<u32> {
    listing
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("* ") && !line.contains("disabled"))
        .filter_map(|line| {
            let open = line.find('[')?;
            let close = line[open..].find(']')? + open;
            line[open + 1..close].parse().ok()
        })
        .collect()
}
