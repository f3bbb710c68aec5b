//! Controller-side handle on the privileged helper process.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::time::{Duration, Instant};

use bytes::Bytes;
use capctl_transport::{spawn_helper, DescriptorReceiver, HelperCommand, IpcStream};
use tracing::{debug, info, warn};

use crate::channel::{ChannelConfig, IpcChannel};
use crate::error::{IpcError, Result};
use crate::registry::CommandRegistry;

/// Default file-name prefix of the descriptor side-channel.
pub const DEFAULT_FD_PREFIX: &str = "capctl_fd";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How to launch and supervise the helper.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// Program and arguments; `--ipc-fd <n>` is appended.
    pub command: HelperCommand,
    /// Directory holding the descriptor side-channel socket.
    pub fd_dir: PathBuf,
    /// File-name prefix of the side-channel socket.
    pub fd_prefix: String,
    /// Channel settings.
    pub channel: ChannelConfig,
    /// How long to wait for the helper to exit after `DIE`. Default: 3 s.
    pub exit_timeout: Duration,
    /// How long to wait for a descriptor announced by `SOURCEFD`. Default: 5 s.
    pub descriptor_timeout: Duration,
    /// First respawn delay. Default: 1 s.
    pub min_backoff: Duration,
    /// Respawn delay ceiling. Default: 60 s.
    pub max_backoff: Duration,
}

impl HelperConfig {
    pub fn new(command: HelperCommand) -> Self {
        Self {
            command,
            fd_dir: std::env::temp_dir(),
            fd_prefix: DEFAULT_FD_PREFIX.to_string(),
            channel: ChannelConfig::default(),
            exit_timeout: Duration::from_secs(3),
            descriptor_timeout: Duration::from_secs(5),
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }

    /// Respawn schedule matching this configuration.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.min_backoff, self.max_backoff)
    }
}

/// A running helper: its process, command channel and descriptor receiver.
pub struct PrivilegedHelper<C> {
    channel: IpcChannel<C>,
    child: Child,
    receiver: Option<DescriptorReceiver>,
    fd_dir: PathBuf,
    fd_prefix: String,
    exit_timeout: Duration,
    descriptor_timeout: Duration,
    exited: Option<ExitStatus>,
}

impl<C> PrivilegedHelper<C> {
    /// Spawn the helper and queue the `SYNC` handshake.
    ///
    /// `registry` must hold every controller command; it is frozen here.
    pub fn spawn(config: &HelperConfig, mut registry: CommandRegistry<C>) -> Result<Self> {
        let (controller_end, helper_end) = IpcStream::pair()?;
        registry.mark_spawned();
        let child = spawn_helper(&config.command, helper_end)?;
        let mut channel =
            IpcChannel::with_config(controller_end, registry, config.channel.clone())?;
        channel.begin_sync()?;

        Ok(Self {
            channel,
            child,
            receiver: None,
            fd_dir: config.fd_dir.clone(),
            fd_prefix: config.fd_prefix.clone(),
            exit_timeout: config.exit_timeout,
            descriptor_timeout: config.descriptor_timeout,
            exited: None,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn channel(&self) -> &IpcChannel<C> {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut IpcChannel<C> {
        &mut self.channel
    }

    /// Connect the descriptor side-channel; call once the helper has synced.
    pub fn connect_side_channel(&mut self) -> Result<()> {
        if self.receiver.is_some() {
            return Ok(());
        }
        let receiver = DescriptorReceiver::connect(&self.fd_dir, &self.fd_prefix, self.pid())?;
        receiver.set_timeout(Some(self.descriptor_timeout))?;
        info!(pid = self.pid(), "connected descriptor side-channel");
        self.receiver = Some(receiver);
        Ok(())
    }

    /// Take the next descriptor the helper passed over the side-channel.
    pub fn receive_descriptor(&mut self) -> Result<OwnedFd> {
        self.connect_side_channel()?;
        let receiver = self
            .receiver
            .as_mut()
            .ok_or_else(|| IpcError::HelperUnavailable("no side-channel".to_string()))?;
        Ok(receiver.receive_descriptor()?)
    }

    /// Non-blocking check for helper exit.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exited {
            return Ok(Some(status));
        }
        let status = self
            .child
            .try_wait()
            .map_err(capctl_transport::TransportError::from)?;
        if let Some(status) = status {
            info!(pid = self.pid(), %status, "helper exited");
            self.exited = Some(status);
        }
        Ok(status)
    }

    /// Send the optional final command and `DIE`, then reap the helper,
    /// killing it if it outlives the exit timeout.
    pub fn shutdown(mut self, state: &mut C, final_command: Option<(&str, Bytes)>) -> Result<ExitStatus> {
        if self.try_wait()?.is_none() && !self.channel.is_fatal() {
            if let Err(err) = self.channel.shutdown(state, final_command) {
                warn!(error = %err, "helper channel did not flush cleanly");
            }
        }

        let deadline = Instant::now() + self.exit_timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            if Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        }

        warn!(pid = self.pid(), "helper ignored shutdown; killing it");
        if let Err(err) = self.child.kill() {
            debug!(error = %err, "kill failed");
        }
        let status = self
            .child
            .wait()
            .map_err(capctl_transport::TransportError::from)?;
        Ok(status)
    }
}

impl<C> AsRawFd for PrivilegedHelper<C> {
    fn as_raw_fd(&self) -> RawFd {
        self.channel.as_raw_fd()
    }
}

impl<C> std::fmt::Debug for PrivilegedHelper<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivilegedHelper")
            .field("pid", &self.child.id())
            .field("channel", &self.channel)
            .field("side_channel", &self.receiver.is_some())
            .finish()
    }
}

/// Exponential respawn delay: doubles from `min` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    next_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            current: min,
            next_attempt: None,
        }
    }

    /// Record a failure at `now`; returns the delay before the next attempt.
    pub fn schedule(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        self.next_attempt = Some(now + delay);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Whether a respawn may be attempted at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_attempt.is_none_or(|at| now >= at)
    }

    pub fn next_attempt(&self) -> Option<Instant> {
        self.next_attempt
    }

    /// Forget earlier failures after a successful sync.
    pub fn reset(&mut self) {
        self.current = self.min;
        self.next_attempt = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> HelperConfig {
        let mut config = HelperConfig::new(
            HelperCommand::new("/bin/sh").arg("-c").arg(script).arg("sh"),
        );
        config.exit_timeout = Duration::from_millis(200);
        config.channel.shutdown_flush_timeout = Duration::from_millis(200);
        config
    }

    #[test]
    fn backoff_doubles_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let now = Instant::now();
        assert!(backoff.is_due(now));

        let delays: Vec<u64> = (0..8).map(|_| backoff.schedule(now).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert!(!backoff.is_due(now));
        assert!(backoff.is_due(now + Duration::from_secs(60)));

        backoff.reset();
        assert!(backoff.is_due(now));
        assert_eq!(backoff.schedule(now), Duration::from_secs(1));
    }

    #[test]
    fn exit_is_observed() {
        let mut helper =
            PrivilegedHelper::<()>::spawn(&sh("exit 3"), CommandRegistry::controller()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let status = loop {
            if let Some(status) = helper.try_wait().unwrap() {
                break status;
            }
            assert!(Instant::now() < deadline, "helper never exited");
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn unresponsive_helper_is_killed() {
        let helper =
            PrivilegedHelper::<()>::spawn(&sh("sleep 30"), CommandRegistry::controller()).unwrap();
        let started = Instant::now();
        let status = helper.shutdown(&mut (), None).unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_side_channel_is_an_error() {
        let mut config = sh("sleep 30");
        config.fd_dir = std::env::temp_dir().join("capctl-no-such-dir");
        let mut helper =
            PrivilegedHelper::<()>::spawn(&config, CommandRegistry::controller()).unwrap();
        assert!(helper.connect_side_channel().is_err());
        let _ = helper.shutdown(&mut (), None);
    }
}
