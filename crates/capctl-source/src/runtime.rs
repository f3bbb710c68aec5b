//! Cooperative run loops for the controller and the exec'd helper.
//!
//! Both loops are single-threaded: each iteration waits in one `poll` on the
//! command channel and any capture descriptors, dispatches what arrived, and
//! runs the 10 Hz scheduler tick when it is due.

use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use capctl_ipc::{
    Backoff, ChannelEvent, CommandSink, Detached, HelperConfig, IpcChannel, IpcError,
    PrivilegedHelper, DEFAULT_FD_PREFIX,
};
use capctl_transport::poll::{read_available, set_nonblocking};
use capctl_transport::{DescriptorSender, IpcStream, PollSet, Token};
use tracing::{debug, info, warn};

use crate::commands::{controller_registry, deliver_descriptors, helper_registry, ControllerState, HelperState};
use crate::driver::DriverRegistry;
use crate::error::Result;
use crate::tracker::SourceTracker;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound on a single wait when nothing else is scheduled sooner.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_millis(100);

/// Run `f` against the helper's channel, or against [`Detached`] when no
/// helper is attached.
fn with_sink<R>(
    helper: &mut Option<PrivilegedHelper<ControllerState>>,
    f: impl FnOnce(&mut dyn CommandSink) -> R,
) -> R {
    match helper.as_mut() {
        Some(helper) => f(helper.channel_mut()),
        None => f(&mut Detached),
    }
}

/// The unprivileged controller: owns the source registry, reads capture
/// descriptors, and supervises the helper.
pub struct Controller {
    state: ControllerState,
    helper: Option<PrivilegedHelper<ControllerState>>,
    helper_config: Option<HelperConfig>,
    backoff: Backoff,
    next_tick: Option<Instant>,
    read_buf: Vec<u8>,
}

impl Controller {
    /// `helper_config` of `None` runs without a helper; privileged sources
    /// then stay in error.
    pub fn new(tracker: SourceTracker, helper_config: Option<HelperConfig>) -> Self {
        let backoff = match &helper_config {
            Some(config) => config.backoff(),
            None => Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
        };
        Self {
            state: ControllerState::new(tracker),
            helper: None,
            helper_config,
            backoff,
            next_tick: None,
            read_buf: vec![0; READ_BUFFER_SIZE],
        }
    }

    pub fn tracker(&self) -> &SourceTracker {
        &self.state.tracker
    }

    pub fn tracker_mut(&mut self) -> &mut SourceTracker {
        &mut self.state.tracker
    }

    /// Pid of the attached helper, if any.
    pub fn helper_pid(&self) -> Option<u32> {
        self.helper.as_ref().map(PrivilegedHelper::pid)
    }

    /// True once the attached helper has confirmed the handshake.
    pub fn helper_synced(&self) -> bool {
        self.helper
            .as_ref()
            .is_some_and(|helper| helper.channel().is_peer_synced())
    }

    /// Whether any source can only be opened through the helper.
    pub fn needs_helper(&self) -> bool {
        let tracker = &self.state.tracker;
        tracker
            .sources()
            .any(|source| tracker.is_remote(source) && !source.permanent_error)
    }

    /// Spawn the helper if one is configured, needed, and not running.
    ///
    /// Spawn failures here are returned to the caller.
    pub fn ensure_helper(&mut self) -> Result<()> {
        if self.helper.is_some() || !self.needs_helper() {
            return Ok(());
        }
        let Some(config) = self.helper_config.as_ref() else {
            debug!("privileged sources present but no helper configured");
            return Ok(());
        };
        let helper = PrivilegedHelper::spawn(config, controller_registry()?)?;
        info!(pid = helper.pid(), "started privileged helper");
        self.helper = Some(helper);
        Ok(())
    }

    pub fn add_source(&mut self, definition: &str) -> Result<u16> {
        let tracker = &mut self.state.tracker;
        with_sink(&mut self.helper, |sink| tracker.add_source(definition, sink))
    }

    pub fn start_source(&mut self, id: u16) -> Result<()> {
        let tracker = &mut self.state.tracker;
        with_sink(&mut self.helper, |sink| tracker.start(id, sink))
    }

    /// Start every source that has not been started.
    pub fn start_all(&mut self) -> Result<()> {
        let ids: Vec<u16> = self.state.tracker.sources().map(|s| s.id).collect();
        for id in ids {
            self.start_source(id)?;
        }
        Ok(())
    }

    pub fn remove_source(&mut self, id: u16) -> Result<()> {
        let tracker = &mut self.state.tracker;
        with_sink(&mut self.helper, |sink| tracker.remove_source(id, sink))
    }

    /// Lock a source to `channel`.
    pub fn set_channel(&mut self, id: u16, channel: u32) -> Result<()> {
        let tracker = &mut self.state.tracker;
        with_sink(&mut self.helper, |sink| tracker.set_channel(id, channel, sink))
    }

    pub fn set_hopping(&mut self, id: u16, enable: bool) -> Result<()> {
        let tracker = &mut self.state.tracker;
        with_sink(&mut self.helper, |sink| tracker.set_hopping(id, enable, sink))
    }

    /// Run until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            self.run_once(DEFAULT_MAX_WAIT)?;
        }
        info!("controller loop stopping");
        Ok(())
    }

    /// One wait-and-dispatch round, waiting at most `max_wait`.
    pub fn run_once(&mut self, max_wait: Duration) -> Result<()> {
        let now = Instant::now();
        self.supervise(now)?;

        let tick_interval = self.state.tracker.config().tick_interval();
        let next_tick = *self.next_tick.get_or_insert(now + tick_interval);

        let mut set = PollSet::new();
        let helper_token = self
            .helper
            .as_ref()
            .filter(|helper| !helper.channel().is_fatal())
            .map(|helper| set.register(helper.as_raw_fd(), true, helper.channel().wants_write()));
        let captures: Vec<(u16, Token)> = self
            .state
            .tracker
            .sources()
            .filter(|source| source.is_running())
            .filter_map(|source| {
                let fd = source.descriptor()?;
                Some((source.id, set.register(fd.as_raw_fd(), true, false)))
            })
            .collect();

        let mut wait = next_tick.saturating_duration_since(now).min(max_wait);
        if self.helper.is_none() && self.helper_config.is_some() {
            if let Some(at) = self.backoff.next_attempt() {
                wait = wait.min(at.saturating_duration_since(now));
            }
        }
        set.wait(Some(wait))?;

        if let Some(token) = helper_token {
            let ready = set.readiness(token);
            self.poll_helper(ready.readable, ready.writable)?;
        }
        self.receive_descriptors();
        for (id, token) in captures {
            if set.readiness(token).readable {
                self.read_capture(id);
            }
        }

        let now = Instant::now();
        if now >= next_tick {
            let tracker = &mut self.state.tracker;
            with_sink(&mut self.helper, |sink| {
                tracker.tick(now, sink);
                tracker.reopen_due(now, sink);
            });
            let mut following = next_tick + tick_interval;
            if following <= now {
                debug!("scheduler fell behind; skipping missed ticks");
                following = now + tick_interval;
            }
            self.next_tick = Some(following);
        }

        if self
            .helper
            .as_ref()
            .is_some_and(|helper| !helper.channel().is_fatal() && helper.channel().wants_write())
        {
            self.poll_helper(false, true)?;
        }
        Ok(())
    }

    /// Stop local sources, then send `DIE` to the helper and reap it.
    pub fn shutdown(mut self) -> Result<()> {
        self.state.tracker.shutdown();
        if let Some(helper) = self.helper.take() {
            let status = helper.shutdown(&mut self.state, None)?;
            info!(%status, "privileged helper stopped");
        }
        Ok(())
    }

    fn poll_helper(&mut self, readable: bool, writable: bool) -> Result<()> {
        let Some(helper) = self.helper.as_mut() else {
            return Ok(());
        };
        let events = match helper.channel_mut().poll(&mut self.state, readable, writable) {
            Ok(events) => events,
            Err(IpcError::PeerFatal(text)) => return Err(IpcError::PeerFatal(text).into()),
            Err(err) if err.is_fatal() => {
                // Supervision notices the latched channel on the next round.
                debug!(error = %err, "helper channel failed");
                return Ok(());
            }
            Err(err) => {
                warn!(error = %err, "helper channel error");
                return Ok(());
            }
        };

        for event in events {
            match event {
                ChannelEvent::SyncComplete => {
                    info!(pid = helper.pid(), "privileged helper synced");
                    if let Err(err) = helper.connect_side_channel() {
                        warn!(error = %err, "could not connect descriptor side-channel");
                    }
                    self.backoff.reset();
                    if let Err(err) = self.state.tracker.push_to_helper(helper.channel_mut()) {
                        warn!(error = %err, "could not hand sources to helper");
                    }
                }
                ChannelEvent::PeerShutdown => info!("privileged helper is shutting down"),
            }
        }
        Ok(())
    }

    fn receive_descriptors(&mut self) {
        while let Some(id) = self.state.pending_descriptors.pop_front() {
            let Some(helper) = self.helper.as_mut() else {
                self.state.pending_descriptors.clear();
                return;
            };
            match helper.receive_descriptor() {
                Ok(fd) => {
                    if let Err(err) = set_nonblocking(fd.as_raw_fd()) {
                        warn!(source_id = id, error = %err, "capture descriptor stays blocking");
                    }
                    self.state.tracker.attach_descriptor(id, fd);
                }
                Err(err) => {
                    let reason = format!("capture descriptor never arrived: {err}");
                    self.state.tracker.fail_source(id, reason, helper.channel_mut());
                }
            }
        }
    }

    fn read_capture(&mut self, id: u16) {
        let Some(fd) = self
            .state
            .tracker
            .source(id)
            .and_then(|source| source.descriptor())
            .map(|fd| fd.as_raw_fd())
        else {
            return;
        };
        let bytes = match read_available(fd, &mut self.read_buf) {
            Ok(n) => n,
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::Interrupted => {
                return
            }
            Err(err) => {
                debug!(source_id = id, error = %err, "capture read failed");
                0
            }
        };
        let tracker = &mut self.state.tracker;
        with_sink(&mut self.helper, |sink| tracker.record_poll(id, bytes, sink));
    }

    /// Notice a dead helper and respawn it when the backoff allows.
    fn supervise(&mut self, now: Instant) -> Result<()> {
        if let Some(helper) = self.helper.as_mut() {
            let exited = helper.try_wait()?;
            let reason = match exited {
                Some(status) => format!("helper exited ({status})"),
                None => match helper.channel().fatal_reason() {
                    Some(reason) => format!("helper channel failed: {reason}"),
                    None => return Ok(()),
                },
            };
            if let Some(helper) = self.helper.take() {
                if exited.is_none() {
                    if let Err(err) = helper.shutdown(&mut self.state, None) {
                        debug!(error = %err, "reaping failed helper");
                    }
                }
            }
            self.state.pending_descriptors.clear();
            self.state.tracker.helper_lost(&reason);
            let delay = self.backoff.schedule(now);
            warn!(reason = %reason, retry_in_ms = delay.as_millis() as u64, "lost privileged helper");
            return Ok(());
        }

        if self.helper_config.is_none() || !self.needs_helper() || !self.backoff.is_due(now) {
            return Ok(());
        }
        let Some(config) = self.helper_config.as_ref() else {
            return Ok(());
        };
        match PrivilegedHelper::spawn(config, controller_registry()?) {
            Ok(helper) => {
                info!(pid = helper.pid(), "respawned privileged helper");
                self.helper = Some(helper);
            }
            Err(err) => {
                let delay = self.backoff.schedule(now);
                warn!(error = %err, retry_in_ms = delay.as_millis() as u64, "could not respawn helper");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("sources", &self.state.tracker.sources().count())
            .field("helper", &self.helper_pid())
            .field("pending_descriptors", &self.state.pending_descriptors.len())
            .finish()
    }
}

/// Settings for the exec'd helper process.
#[derive(Debug, Clone)]
pub struct HelperOptions {
    /// Inherited command-channel descriptor.
    pub ipc_fd: RawFd,
    /// Directory for the descriptor side-channel socket.
    pub fd_dir: PathBuf,
    pub fd_prefix: String,
    /// How long a descriptor send waits for the controller to connect.
    pub accept_timeout: Duration,
}

impl HelperOptions {
    pub fn new(ipc_fd: RawFd) -> Self {
        Self {
            ipc_fd,
            fd_dir: std::env::temp_dir(),
            fd_prefix: DEFAULT_FD_PREFIX.to_string(),
            accept_timeout: capctl_transport::fdpass::DEFAULT_ACCEPT_TIMEOUT,
        }
    }
}

/// Entry point of the exec'd helper: serve the controller until it sends
/// `DIE`, the channel fails, or `stop` is set. A stop sends `DIE` upstream.
pub fn run_helper(options: &HelperOptions, drivers: DriverRegistry, stop: &AtomicBool) -> Result<()> {
    let stream = IpcStream::from_inherited_fd(options.ipc_fd)?;
    let mut channel = IpcChannel::new(stream, helper_registry()?)?;

    // Bound before the sync reply so the controller can connect right after.
    let descriptors = match DescriptorSender::bind(&options.fd_dir, &options.fd_prefix) {
        Ok(sender) => {
            debug!(path = ?sender.path(), "descriptor side-channel listening");
            Some(sender.with_accept_timeout(options.accept_timeout))
        }
        Err(err) => {
            warn!(error = %err, "no descriptor side-channel; captures stay in the helper");
            None
        }
    };
    let mut state = HelperState::new(SourceTracker::helper(drivers), descriptors);
    info!(pid = std::process::id(), "helper waiting for controller");

    let result = helper_loop(&mut channel, &mut state, stop);
    state.tracker.shutdown();
    result
}

fn helper_loop(channel: &mut IpcChannel<HelperState>, state: &mut HelperState, stop: &AtomicBool) -> Result<()> {
    let tick_interval = state.tracker.config().tick_interval();
    let mut next_tick = Instant::now() + tick_interval;

    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        let mut set = PollSet::new();
        let token = set.register(channel.as_raw_fd(), true, channel.wants_write());
        set.wait(Some(next_tick.saturating_duration_since(now).min(DEFAULT_MAX_WAIT)))?;

        let ready = set.readiness(token);
        let events = channel.poll(state, ready.readable, ready.writable)?;
        if events.contains(&ChannelEvent::PeerShutdown) {
            info!("controller requested shutdown");
            return Ok(());
        }

        let now = Instant::now();
        if now >= next_tick {
            if channel.is_linked() {
                state.tracker.tick(now, channel);
                deliver_descriptors(state, channel)?;
            }
            next_tick = (next_tick + tick_interval).max(now);
        }
        if channel.wants_write() {
            channel.poll(state, false, true)?;
        }
    }
    info!("helper loop stopping");
    if let Err(err) = channel.shutdown(state, None) {
        debug!(error = %err, "could not tell the controller about shutdown");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::fd::IntoRawFd;
    use std::sync::Arc;

    use capctl_ipc::CommandRegistry;
    use capctl_transport::DescriptorReceiver;

    use super::*;
    use crate::chanlist::{parse_entries, ChannelListStore};
    use crate::driver::Driver;
    use crate::drivers::SimDriver;
    use crate::source::SourceState;

    fn local_controller() -> Controller {
        let mut lists = ChannelListStore::with_defaults().unwrap();
        lists.define("three", parse_entries("1,6,11").unwrap()).unwrap();
        let tracker = SourceTracker::controller(DriverRegistry::with_defaults(), lists)
            .with_privilege(false);
        Controller::new(tracker, None)
    }

    #[test]
    fn local_source_hops_in_the_loop() {
        let mut controller = local_controller();
        let driver = SimDriver::new();
        let radio = driver.handle();
        let id = controller
            .tracker_mut()
            .add_source_with("sim0:channellist=three,hoprate=10", Some(Box::new(driver) as Box<dyn Driver>), &mut Detached)
            .unwrap();
        controller.start_source(id).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while radio.history().len() < 4 {
            assert!(Instant::now() < deadline, "no hops observed");
            controller.run_once(Duration::from_millis(20)).unwrap();
        }
        let history = radio.history();
        assert!(history.windows(2).all(|pair| pair[0] != pair[1]));
        assert!(controller.tracker().ticks() > 0);
        controller.shutdown().unwrap();
    }

    #[test]
    fn captured_bytes_are_counted() {
        let mut controller = local_controller();
        let driver = SimDriver::new();
        let radio = driver.handle();
        let id = controller
            .tracker_mut()
            .add_source_with("sim0:channel=6", Some(Box::new(driver) as Box<dyn Driver>), &mut Detached)
            .unwrap();
        controller.start_source(id).unwrap();

        radio.inject(&[0u8; 60]).unwrap();
        controller.run_once(Duration::from_millis(50)).unwrap();
        let source = controller.tracker().source(id).unwrap();
        assert_eq!(source.bytes, 60);
        assert_eq!(source.packets, 1);
    }

    #[test]
    fn unplugged_device_goes_to_error() {
        let mut controller = local_controller();
        let driver = SimDriver::new();
        let radio = driver.handle();
        let id = controller
            .tracker_mut()
            .add_source_with("sim0:channel=6,reopen=false", Some(Box::new(driver) as Box<dyn Driver>), &mut Detached)
            .unwrap();
        controller.start_source(id).unwrap();
        radio.unplug();

        for _ in 0..150 {
            controller.run_once(Duration::from_millis(5)).unwrap();
            if controller.tracker().source(id).unwrap().is_error() {
                break;
            }
        }
        let source = controller.tracker().source(id).unwrap();
        assert_eq!(source.state, SourceState::Error);
        assert!(!source.has_descriptor());
    }

    #[test]
    fn privileged_source_without_helper_is_flagged() {
        let mut controller = local_controller();
        let id = controller.add_source("simroot0:channel=3").unwrap();
        controller.start_source(id).unwrap();
        assert!(controller.needs_helper());
        controller.ensure_helper().unwrap();
        assert_eq!(controller.helper_pid(), None);
        assert!(controller.tracker().source(id).unwrap().is_error());
    }

    #[test]
    fn helper_loop_serves_a_controller() {
        let prefix = format!("capctl_rt_{}", std::process::id());
        let dir = std::env::temp_dir();
        let (controller_end, helper_end) = IpcStream::pair().unwrap();

        let mut options = HelperOptions::new(helper_end.into_owned_fd().into_raw_fd());
        options.fd_dir = dir.clone();
        options.fd_prefix = prefix.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let helper_stop = Arc::clone(&stop);
        let helper = std::thread::spawn(move || {
            run_helper(&options, DriverRegistry::with_defaults(), &helper_stop)
        });

        let mut registry: CommandRegistry<ControllerState> = controller_registry().unwrap();
        registry.mark_spawned();
        let mut channel = IpcChannel::new(controller_end, registry).unwrap();
        channel.begin_sync().unwrap();

        let mut lists = ChannelListStore::with_defaults().unwrap();
        lists.define("three", parse_entries("1,6,11").unwrap()).unwrap();
        let tracker = SourceTracker::controller(DriverRegistry::with_defaults(), lists)
            .with_privilege(false);
        let mut state = ControllerState::new(tracker);

        let deadline = Instant::now() + Duration::from_secs(5);
        let pump = |channel: &mut IpcChannel<ControllerState>, state: &mut ControllerState| {
            assert!(Instant::now() < deadline, "helper did not respond");
            channel.poll(state, true, true).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        };
        while !channel.is_peer_synced() {
            pump(&mut channel, &mut state);
        }
        // The helper thread shares this pid.
        let mut receiver = DescriptorReceiver::connect(&dir, &prefix, std::process::id()).unwrap();

        let id = state
            .tracker
            .add_source("simroot0:channellist=three", &mut channel)
            .unwrap();
        state.tracker.start(id, &mut channel).unwrap();
        while state.pending_descriptors.is_empty() {
            pump(&mut channel, &mut state);
        }
        assert_eq!(state.pending_descriptors.pop_front(), Some(id));
        let fd = receiver.receive_descriptor().unwrap();
        assert!(state.tracker.attach_descriptor(id, fd));
        while !state.tracker.source(id).unwrap().is_running() {
            pump(&mut channel, &mut state);
        }

        channel.shutdown(&mut state, None).unwrap();
        helper.join().unwrap().unwrap();
        stop.store(true, Ordering::Relaxed);
    }

    #[test]
    fn stopped_helper_sends_die() {
        let prefix = format!("capctl_stop_{}", std::process::id());
        let (controller_end, helper_end) = IpcStream::pair().unwrap();
        let mut options = HelperOptions::new(helper_end.into_owned_fd().into_raw_fd());
        options.fd_prefix = prefix;
        let stop = Arc::new(AtomicBool::new(false));
        let helper_stop = Arc::clone(&stop);
        let helper = std::thread::spawn(move || {
            run_helper(&options, DriverRegistry::with_defaults(), &helper_stop)
        });

        let mut registry: CommandRegistry<ControllerState> = controller_registry().unwrap();
        registry.mark_spawned();
        let mut channel = IpcChannel::new(controller_end, registry).unwrap();
        channel.begin_sync().unwrap();
        let tracker = SourceTracker::controller(
            DriverRegistry::with_defaults(),
            ChannelListStore::with_defaults().unwrap(),
        )
        .with_privilege(false);
        let mut state = ControllerState::new(tracker);

        let deadline = Instant::now() + Duration::from_secs(5);
        while !channel.is_peer_synced() {
            assert!(Instant::now() < deadline, "helper did not sync");
            channel.poll(&mut state, true, true).unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }

        stop.store(true, Ordering::Relaxed);
        while !channel.peer_requested_shutdown() {
            assert!(Instant::now() < deadline, "helper stopped without DIE");
            if let Err(err) = channel.poll(&mut state, true, true) {
                assert!(channel.peer_requested_shutdown(), "channel failed before DIE: {err}");
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        helper.join().unwrap().unwrap();
    }
}
