//! Command handlers for both ends of the channel.

use std::collections::VecDeque;

use capctl_ipc::{CommandContext, CommandRegistry, CommandSink, IpcError};
use capctl_transport::DescriptorSender;
use tracing::{debug, warn};

use crate::error::SourceError;
use crate::source::Source;
use crate::tracker::SourceTracker;
use crate::wire::{self, ChanSet, SourceAdd, SourceReport, SourceRun};

/// State behind the controller's handlers.
#[derive(Debug)]
pub struct ControllerState {
    pub tracker: SourceTracker,
    /// Sources whose descriptor is waiting on the side-channel.
    pub pending_descriptors: VecDeque<u16>,
}

impl ControllerState {
    pub fn new(tracker: SourceTracker) -> Self {
        Self {
            tracker,
            pending_descriptors: VecDeque::new(),
        }
    }
}

/// State behind the helper's handlers.
#[derive(Debug)]
pub struct HelperState {
    pub tracker: SourceTracker,
    /// Side-channel for capture descriptors; absent when none could be bound.
    pub descriptors: Option<DescriptorSender>,
}

impl HelperState {
    pub fn new(tracker: SourceTracker, descriptors: Option<DescriptorSender>) -> Self {
        Self {
            tracker,
            descriptors,
        }
    }
}

fn malformed(err: SourceError) -> IpcError {
    match err {
        SourceError::Payload { command, reason } => IpcError::malformed(command, reason),
        other => IpcError::handler("payload", other),
    }
}

/// Register everything the controller sends and handles.
pub fn controller_registry() -> capctl_ipc::Result<CommandRegistry<ControllerState>> {
    let mut registry = CommandRegistry::controller();
    for name in wire::CONTROLLER_COMMANDS {
        registry.register_outgoing(name)?;
    }

    registry.register(
        wire::SOURCEREPORT,
        |state: &mut ControllerState, ctx: &mut CommandContext<'_>| {
            let report = SourceReport::decode(ctx.payload()).map_err(malformed)?;
            debug!(
                source_id = report.source_id,
                status = report.status_flags,
                channel = report.last_channel,
                "source report"
            );
            state.tracker.apply_report(&report);
            Ok(())
        },
    )?;

    registry.register(
        wire::CHANNELTICKS,
        |state: &mut ControllerState, ctx: &mut CommandContext<'_>| {
            let ticks = wire::decode_channel_ticks(ctx.payload()).map_err(malformed)?;
            state.tracker.merge_channel_ticks(&ticks);
            Ok(())
        },
    )?;

    registry.register(
        wire::SOURCEFD,
        |state: &mut ControllerState, ctx: &mut CommandContext<'_>| {
            let id = wire::decode_source_id(wire::SOURCEFD, ctx.payload()).map_err(malformed)?;
            state.pending_descriptors.push_back(id);
            Ok(())
        },
    )?;

    Ok(registry)
}

/// Register everything the exec'd helper sends and handles.
pub fn helper_registry() -> capctl_ipc::Result<CommandRegistry<HelperState>> {
    let mut registry = CommandRegistry::exec_helper();
    register_helper_commands(&mut registry)?;
    Ok(registry)
}

pub fn register_helper_commands(
    registry: &mut CommandRegistry<HelperState>,
) -> capctl_ipc::Result<()> {
    for name in wire::HELPER_COMMANDS {
        registry.register_outgoing(name)?;
    }

    registry.register(wire::CHANLIST, |state: &mut HelperState, ctx: &mut CommandContext<'_>| {
        let list = wire::decode_channel_list(ctx.payload()).map_err(malformed)?;
        debug!(channel_list = list.id, name = %list.name, entries = list.len(), "received channel list");
        state.tracker.channel_lists_mut().insert(list);
        Ok(())
    })?;

    registry.register(wire::SOURCEADD, |state: &mut HelperState, ctx: &mut CommandContext<'_>| {
        let add = SourceAdd::decode(ctx.payload()).map_err(malformed)?;
        if let Err(err) = state.tracker.insert_remote(&add) {
            warn!(source_id = add.source_id, error = %err, "rejected source");
            state.tracker.report_rejected(add.source_id, &err.to_string(), ctx);
        }
        Ok(())
    })?;

    registry.register(wire::SOURCERUN, |state: &mut HelperState, ctx: &mut CommandContext<'_>| {
        let run = SourceRun::decode(ctx.payload()).map_err(malformed)?;
        let result = if run.start {
            state.tracker.start(run.source_id, ctx)
        } else {
            state.tracker.stop(run.source_id, ctx)
        };
        match result {
            Ok(()) => deliver_descriptors(state, ctx),
            Err(err) => {
                warn!(source_id = run.source_id, error = %err, "cannot run source");
                state.tracker.report_rejected(run.source_id, &err.to_string(), ctx);
                Ok(())
            }
        }
    })?;

    registry.register(wire::CHANSET, |state: &mut HelperState, ctx: &mut CommandContext<'_>| {
        let set = ChanSet::decode(ctx.payload()).map_err(malformed)?;
        if let Err(err) = state.tracker.apply_chanset(&set, ctx) {
            warn!(source_id = set.source_id, error = %err, "rejected channel set");
            state.tracker.report_rejected(set.source_id, &err.to_string(), ctx);
        }
        Ok(())
    })?;

    registry.register(
        wire::SOURCEREMOVE,
        |state: &mut HelperState, ctx: &mut CommandContext<'_>| {
            let id = wire::decode_source_id(wire::SOURCEREMOVE, ctx.payload()).map_err(malformed)?;
            if let Err(err) = state.tracker.remove_source(id, ctx) {
                debug!(source_id = id, error = %err, "ignoring removal");
            }
            Ok(())
        },
    )?;

    Ok(())
}

/// Pass newly opened capture descriptors to the controller.
///
/// Each descriptor goes over the side-channel first, then `SOURCEFD` tells
/// the controller which source it belongs to.
pub fn deliver_descriptors(state: &mut HelperState, sink: &mut dyn CommandSink) -> capctl_ipc::Result<()> {
    for id in state.tracker.undelivered_descriptors() {
        let Some(sender) = state.descriptors.as_mut() else {
            debug!(source_id = id, "no side-channel; keeping descriptor");
            return Ok(());
        };
        let Some(fd) = state.tracker.source(id).and_then(Source::descriptor) else {
            continue;
        };
        if let Err(err) = sender.send_descriptor(fd) {
            warn!(source_id = id, error = %err, "could not pass descriptor to controller");
            continue;
        }
        sink.send_command(wire::SOURCEFD, wire::encode_source_id(id))?;
        state.tracker.mark_descriptor_delivered(id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::os::unix::net::UnixStream;
    use std::time::{Duration, Instant};

    use capctl_ipc::{ChannelEvent, IpcChannel};
    use capctl_transport::{DescriptorReceiver, IpcStream};

    use super::*;
    use crate::chanlist::{parse_entries, ChannelListStore};
    use crate::driver::DriverRegistry;
    use crate::source::SourceState;

    struct Pair {
        controller: IpcChannel<ControllerState>,
        helper: IpcChannel<HelperState>,
        controller_state: ControllerState,
        helper_state: HelperState,
    }

    impl Pair {
        fn new(descriptors: Option<DescriptorSender>) -> Self {
            let (controller_end, helper_end) = IpcStream::pair().unwrap();
            let mut registry = controller_registry().unwrap();
            registry.mark_spawned();
            let mut controller = IpcChannel::new(controller_end, registry).unwrap();
            let helper = IpcChannel::new(helper_end, helper_registry().unwrap()).unwrap();
            controller.begin_sync().unwrap();

            let mut lists = ChannelListStore::with_defaults().unwrap();
            lists
                .define("ten", parse_entries("1,2,3,4,5,6,7,8,9,10").unwrap())
                .unwrap();
            let tracker = SourceTracker::controller(DriverRegistry::with_defaults(), lists)
                .with_privilege(false);

            let mut pair = Self {
                controller,
                helper,
                controller_state: ControllerState::new(tracker),
                helper_state: HelperState::new(
                    SourceTracker::helper(DriverRegistry::with_defaults()),
                    descriptors,
                ),
            };
            pair.pump_until(|p| p.controller.is_peer_synced());
            pair
        }

        fn pump(&mut self) -> Vec<ChannelEvent> {
            let mut events = self
                .controller
                .poll(&mut self.controller_state, true, true)
                .unwrap();
            events.extend(self.helper.poll(&mut self.helper_state, true, true).unwrap());
            events
        }

        fn pump_until(&mut self, done: impl Fn(&Self) -> bool) {
            let deadline = Instant::now() + Duration::from_secs(5);
            while !done(self) {
                assert!(Instant::now() < deadline, "channel did not settle");
                self.pump();
                std::thread::sleep(Duration::from_millis(1));
            }
        }

        fn settle(&mut self) {
            self.pump_until(|p| p.controller.is_ready() && p.helper.is_ready());
            for _ in 0..3 {
                self.pump();
            }
        }
    }

    fn fd_probe(pair: &Pair, id: u16) -> std::os::fd::OwnedFd {
        let source = pair.controller_state.tracker.source(id).unwrap();
        source.descriptor().unwrap().try_clone_to_owned().unwrap()
    }

    #[test]
    fn privileged_source_runs_in_helper() {
        let mut pair = Pair::new(None);
        let id = pair
            .controller_state
            .tracker
            .add_source("simroot0:channellist=ten,hoprate=5", &mut pair.controller)
            .unwrap();
        pair.controller_state
            .tracker
            .start(id, &mut pair.controller)
            .unwrap();
        pair.settle();

        let helper_source = pair.helper_state.tracker.source(id).unwrap();
        assert_eq!(helper_source.state, SourceState::Running);
        assert_eq!(helper_source.driver_type, "simroot");
        assert_eq!(
            pair.controller_state.tracker.source(id).unwrap().state,
            SourceState::Running
        );

        pair.controller_state
            .tracker
            .remove_source(id, &mut pair.controller)
            .unwrap();
        pair.settle();
        assert!(pair.helper_state.tracker.source(id).is_none());
    }

    #[test]
    fn unknown_channel_list_is_rejected_and_reported() {
        let mut pair = Pair::new(None);
        let id = pair
            .controller_state
            .tracker
            .add_source("simroot0:channellist=ten", &mut pair.controller)
            .unwrap();
        pair.settle();
        pair.helper_state.tracker.remove_source(id, &mut capctl_ipc::Detached).unwrap();

        let add = SourceAdd {
            source_id: id,
            driver_type: "simroot".into(),
            source_line: "simroot0".into(),
            channel_list_id: 999,
            channel: 1,
            hop_enabled: true,
            dwell_seconds: 0,
            hop_rate: 5,
            position: 0,
        };
        pair.controller
            .send(wire::SOURCEADD, add.encode().unwrap())
            .unwrap();
        pair.settle();

        assert!(pair.helper_state.tracker.source(id).is_none());
        let source = pair.controller_state.tracker.source(id).unwrap();
        assert!(source.is_error());
        assert!(source.warning.as_deref().unwrap().contains("unknown channel list 999"));
    }

    #[test]
    fn descriptor_follows_sourcefd() {
        let dir = std::env::temp_dir().join(format!("capctl-cmd-fd-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("side");
        let sender = DescriptorSender::bind_at(&path).unwrap();
        let mut receiver = DescriptorReceiver::connect_path(&path).unwrap();

        let mut pair = Pair::new(Some(sender));
        let id = pair
            .controller_state
            .tracker
            .add_source("simroot0:channellist=ten,hop=false", &mut pair.controller)
            .unwrap();
        pair.controller_state
            .tracker
            .start(id, &mut pair.controller)
            .unwrap();
        pair.pump_until(|p| !p.controller_state.pending_descriptors.is_empty());

        assert_eq!(pair.controller_state.pending_descriptors.pop_front(), Some(id));
        let fd = receiver.receive_descriptor().unwrap();
        assert!(pair.controller_state.tracker.attach_descriptor(id, fd));

        assert!(pair.helper_state.tracker.undelivered_descriptors().is_empty());
        assert!(pair.controller_state.tracker.source(id).unwrap().has_descriptor());

        let mut capture = UnixStream::from(fd_probe(&pair, id));
        capture.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 4];
        assert!(capture.read(&mut buf).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn helper_reports_flow_back() {
        let mut pair = Pair::new(None);
        let id = pair
            .controller_state
            .tracker
            .add_source("simroot0:channellist=ten,hoprate=10", &mut pair.controller)
            .unwrap();
        pair.controller_state
            .tracker
            .start(id, &mut pair.controller)
            .unwrap();
        pair.settle();

        let start = Instant::now();
        for i in 0..10u64 {
            pair.helper_state
                .tracker
                .tick(start + Duration::from_millis(100 * i), &mut pair.helper);
        }
        pair.settle();

        let usage: u64 = pair.controller_state.tracker.channel_usage().values().sum();
        assert_eq!(usage, 10);
    }
}
