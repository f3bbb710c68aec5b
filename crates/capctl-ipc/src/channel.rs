use std::collections::VecDeque;
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bytes::Bytes;
use capctl_frame::command::{is_builtin, DIE, MESSAGE, SYNC};
use capctl_frame::{Frame, FrameConfig, FrameError, FrameReader, FrameWriter};
use capctl_transport::{IpcStream, PollSet, TransportError};
use tracing::{debug, error, info, warn};

use crate::builtin::{decode_message, decode_sync, encode_message, encode_sync, MessageFlags, SyncEntry};
use crate::error::{IpcError, Result};
use crate::registry::{CommandRegistry, NameTable, Role};
use crate::sink::{log_message, CommandSink};

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Configuration for an [`IpcChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Frame codec limits.
    pub frame: FrameConfig,
    /// How long [`IpcChannel::shutdown`] keeps flushing. Default: 3 s.
    pub shutdown_flush_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            frame: FrameConfig::default(),
            shutdown_flush_timeout: Duration::from_secs(3),
        }
    }
}

/// Something [`IpcChannel::poll`] observed that the run loop acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Both command tables now agree; channel-affecting commands may flow.
    SyncComplete,
    /// The peer sent `DIE`.
    PeerShutdown,
}

/// Outbound frames not yet handed to the writer.
#[derive(Debug)]
pub(crate) struct Outbox {
    queue: VecDeque<Frame>,
    acks: VecDeque<Frame>,
    awaiting_ack: Option<u32>,
    max_payload: usize,
}

impl Outbox {
    fn new(max_payload: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            acks: VecDeque::new(),
            awaiting_ack: None,
            max_payload,
        }
    }

    fn push(&mut self, frame: Frame) -> Result<()> {
        if frame.payload.len() > self.max_payload {
            return Err(FrameError::PayloadTooLarge {
                size: frame.payload.len(),
                max: self.max_payload,
            }
            .into());
        }
        self.queue.push_back(frame);
        Ok(())
    }

    fn push_ack(&mut self, command_id: u32) {
        self.acks.push_back(Frame::ack(command_id));
    }

    fn enqueue_named(&mut self, names: &NameTable, name: &str, payload: Bytes) -> Result<()> {
        let id = names
            .id_of(name)
            .ok_or_else(|| IpcError::UnknownName(name.to_string()))?;
        self.enqueue_id(names, id, payload)
    }

    fn enqueue_id(&mut self, names: &NameTable, id: u32, payload: Bytes) -> Result<()> {
        let name = names.name_of(id).ok_or(IpcError::UnknownCommand(id))?;
        if !is_builtin(id) && !names.is_final() {
            return Err(IpcError::NotSynced(name.to_string()));
        }
        self.push(Frame::new(id, payload))
    }

    /// Queue `payload`, or overwrite an unsent frame of the same command
    /// whose payload starts with the same `key_len` bytes.
    fn supersede_named(&mut self, names: &NameTable, name: &str, payload: Bytes, key_len: usize) -> Result<()> {
        let id = names
            .id_of(name)
            .ok_or_else(|| IpcError::UnknownName(name.to_string()))?;
        let queued = payload.get(..key_len).and_then(|key| {
            self.queue
                .iter_mut()
                .find(|frame| frame.command_id == id && frame.payload.get(..key_len) == Some(key))
        });
        match queued {
            Some(frame) => {
                frame.payload = payload;
                Ok(())
            }
            None => self.enqueue_id(names, id, payload),
        }
    }

    /// Next frame the writer may take: acks first, then the queue head
    /// unless it is a command and an earlier one is still unacknowledged.
    fn next_sendable(&mut self) -> Option<Frame> {
        if let Some(ack) = self.acks.pop_front() {
            return Some(ack);
        }
        let head = self.queue.front()?;
        let needs_ack = !is_builtin(head.command_id);
        if needs_ack && self.awaiting_ack.is_some() {
            return None;
        }
        let frame = self.queue.pop_front()?;
        if needs_ack {
            self.awaiting_ack = Some(frame.command_id);
        }
        Some(frame)
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.acks.is_empty()
    }
}

/// Handle given to command handlers.
///
/// Carries the received payload and lets the handler queue replies while the
/// channel is busy dispatching.
pub struct CommandContext<'a> {
    role: Role,
    command: &'a str,
    command_id: u32,
    payload: Bytes,
    names: &'a NameTable,
    outbox: &'a mut Outbox,
}

impl CommandContext<'_> {
    /// Role of the process running the handler.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Name of the command being handled.
    pub fn command(&self) -> &str {
        self.command
    }

    pub fn command_id(&self) -> u32 {
        self.command_id
    }

    /// Received payload (empty for acknowledgments).
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl CommandSink for CommandContext<'_> {
    fn send_command(&mut self, name: &str, payload: Bytes) -> Result<()> {
        self.outbox.enqueue_named(self.names, name, payload)
    }

    fn send_message(&mut self, flags: MessageFlags, text: &str) -> Result<()> {
        self.outbox.push(Frame::new(MESSAGE, encode_message(flags, text)))
    }

    fn is_linked(&self) -> bool {
        self.names.is_final()
    }
}

/// One end of the controller/helper command channel.
///
/// Sends never block: frames are queued and written by [`poll`](Self::poll)
/// as the socket allows. Protocol errors latch the channel dead; every later
/// call then fails with [`IpcError::Dead`].
pub struct IpcChannel<C> {
    role: Role,
    registry: CommandRegistry<C>,
    outbox: Outbox,
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
    config: ChannelConfig,
    peer_synced: bool,
    peer_shutdown: bool,
    fatal: Option<String>,
}

impl<C> IpcChannel<C> {
    /// Wrap a connected stream with default configuration.
    pub fn new(stream: IpcStream, registry: CommandRegistry<C>) -> Result<Self> {
        Self::with_config(stream, registry, ChannelConfig::default())
    }

    /// Wrap a connected stream. The stream is switched to non-blocking mode.
    pub fn with_config(
        stream: IpcStream,
        registry: CommandRegistry<C>,
        config: ChannelConfig,
    ) -> Result<Self> {
        stream.set_nonblocking(true)?;
        let write_half = stream.try_clone()?;
        Ok(Self {
            role: registry.role(),
            registry,
            outbox: Outbox::new(config.frame.max_payload_size),
            reader: FrameReader::with_config(stream, config.frame.clone()),
            writer: FrameWriter::with_config(write_half, config.frame.clone()),
            config,
            peer_synced: false,
            peer_shutdown: false,
            fatal: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &CommandRegistry<C> {
        &self.registry
    }

    /// Local command table is final, so non-built-in commands may be sent.
    pub fn is_synced(&self) -> bool {
        self.registry.is_final()
    }

    /// The helper confirmed the handshake (controller side), or the
    /// controller's terminator arrived (helper side).
    pub fn is_peer_synced(&self) -> bool {
        self.peer_synced
    }

    /// The peer has sent `DIE`.
    pub fn peer_requested_shutdown(&self) -> bool {
        self.peer_shutdown
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.is_some()
    }

    pub fn fatal_reason(&self) -> Option<&str> {
        self.fatal.as_deref()
    }

    /// ID of the command whose acknowledgment is outstanding.
    pub fn awaiting_ack(&self) -> Option<u32> {
        self.outbox.awaiting_ack
    }

    /// Nothing queued, nothing half-written, and no acknowledgment pending.
    pub fn is_ready(&self) -> bool {
        self.outbox.is_empty() && !self.writer.has_pending() && self.outbox.awaiting_ack.is_none()
    }

    /// Whether the poll loop should ask for writability.
    pub fn wants_write(&self) -> bool {
        if self.writer.has_pending() || !self.outbox.acks.is_empty() {
            return true;
        }
        match self.outbox.queue.front() {
            Some(head) => is_builtin(head.command_id) || self.outbox.awaiting_ack.is_none(),
            None => false,
        }
    }

    /// Controller: freeze the registry and queue the `SYNC` records.
    pub fn begin_sync(&mut self) -> Result<()> {
        self.ensure_alive()?;
        let records = self.registry.sync_records()?;
        info!(
            commands = records.len() - 1,
            "sending command table to helper"
        );
        for record in &records {
            self.outbox.push(Frame::new(SYNC, encode_sync(record)?))?;
        }
        Ok(())
    }

    /// Queue a command by name.
    pub fn send(&mut self, name: &str, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_alive()?;
        self.outbox
            .enqueue_named(self.registry.names(), name, payload.into())
    }

    /// Queue a command by numeric ID.
    pub fn send_id(&mut self, id: u32, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_alive()?;
        self.outbox.enqueue_id(self.registry.names(), id, payload.into())
    }

    /// Process readable input and drain queued output.
    ///
    /// Errors are returned once; protocol-level ones also mark the channel
    /// dead.
    pub fn poll(&mut self, state: &mut C, readable: bool, writable: bool) -> Result<Vec<ChannelEvent>> {
        self.ensure_alive()?;
        let mut events = Vec::new();
        let result = self.poll_inner(state, readable, writable, &mut events);
        match result {
            Ok(()) => Ok(events),
            Err(err) => Err(self.latch(err)),
        }
    }

    fn poll_inner(
        &mut self,
        state: &mut C,
        readable: bool,
        writable: bool,
        events: &mut Vec<ChannelEvent>,
    ) -> Result<()> {
        if readable {
            while let Some(frame) = self.reader.try_read_frame()? {
                self.dispatch(state, frame, events)?;
            }
        }
        if writable || self.wants_write() {
            self.flush_outbox()?;
        }
        Ok(())
    }

    fn latch(&mut self, err: IpcError) -> IpcError {
        if err.is_fatal() && self.fatal.is_none() {
            let closed = matches!(err, IpcError::Frame(FrameError::ConnectionClosed));
            if closed && self.peer_shutdown {
                info!(role = %self.role, "peer closed the channel after shutdown");
            } else {
                error!(role = %self.role, error = %err, "ipc channel failed");
            }
            self.fatal = Some(err.to_string());
        }
        err
    }

    fn ensure_alive(&self) -> Result<()> {
        match &self.fatal {
            Some(reason) => Err(IpcError::Dead(reason.clone())),
            None => Ok(()),
        }
    }

    /// Write queued frames until the socket would block or the queue stalls.
    ///
    /// Returns `true` when nothing more can be written right now.
    fn flush_outbox(&mut self) -> Result<bool> {
        loop {
            if !self.writer.write_pending()? {
                return Ok(false);
            }
            match self.outbox.next_sendable() {
                Some(frame) => {
                    debug!(
                        role = %self.role,
                        command = self.registry.name_of(frame.command_id).unwrap_or("?"),
                        id = frame.command_id,
                        ack = frame.is_ack,
                        len = frame.payload.len(),
                        "sending frame"
                    );
                    self.writer.queue(&frame)?;
                }
                None => return Ok(true),
            }
        }
    }

    fn dispatch(&mut self, state: &mut C, frame: Frame, events: &mut Vec<ChannelEvent>) -> Result<()> {
        if frame.is_ack {
            self.handle_ack(state, frame.command_id);
            return Ok(());
        }
        match frame.command_id {
            DIE => {
                info!(role = %self.role, "peer requested shutdown");
                self.peer_shutdown = true;
                events.push(ChannelEvent::PeerShutdown);
                Ok(())
            }
            MESSAGE => {
                let message = decode_message(&frame.payload)?;
                let origin = self.role.peer().to_string();
                log_message(&origin, message.flags, &message.text);
                if message.flags.contains(MessageFlags::FATAL) {
                    return Err(IpcError::PeerFatal(message.text));
                }
                Ok(())
            }
            SYNC => self.handle_sync(&frame.payload, events),
            id => self.dispatch_command(state, id, frame.payload),
        }
    }

    fn handle_sync(&mut self, payload: &[u8], events: &mut Vec<ChannelEvent>) -> Result<()> {
        let entry = decode_sync(payload)?;
        match self.role {
            Role::Helper => {
                if self.registry.apply_sync(&entry)? {
                    info!(
                        commands = self.registry.commands().len(),
                        "command table synced with controller"
                    );
                    self.outbox
                        .push(Frame::new(SYNC, encode_sync(&SyncEntry::complete())?))?;
                    self.peer_synced = true;
                    events.push(ChannelEvent::SyncComplete);
                }
                Ok(())
            }
            Role::Controller => {
                if !entry.is_complete() || self.peer_synced {
                    return Err(IpcError::SyncFailed(format!(
                        "unexpected SYNC from helper for '{}'",
                        entry.name
                    )));
                }
                info!("helper confirmed command table");
                self.peer_synced = true;
                events.push(ChannelEvent::SyncComplete);
                Ok(())
            }
        }
    }

    fn dispatch_command(&mut self, state: &mut C, id: u32, payload: Bytes) -> Result<()> {
        let names = self.registry.names();
        let index = names.index_of(id).ok_or(IpcError::UnknownCommand(id))?;
        let command = names.name_of(id).unwrap_or("?");

        match &self.registry.entry(index).handler {
            Some(handler) => {
                debug!(role = %self.role, command, len = payload.len(), "dispatching command");
                let mut ctx = CommandContext {
                    role: self.role,
                    command,
                    command_id: id,
                    payload,
                    names,
                    outbox: &mut self.outbox,
                };
                if let Err(err) = handler(state, &mut ctx) {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    warn!(role = %self.role, command, error = %err, "command handler failed");
                }
            }
            None => debug!(role = %self.role, command, "no local handler"),
        }

        self.outbox.push_ack(id);
        Ok(())
    }

    fn handle_ack(&mut self, state: &mut C, id: u32) {
        if self.outbox.awaiting_ack == Some(id) {
            self.outbox.awaiting_ack = None;
        } else {
            debug!(role = %self.role, id, "unexpected acknowledgment");
        }

        let names = self.registry.names();
        let Some(index) = names.index_of(id) else {
            return;
        };
        let command = names.name_of(id).unwrap_or("?");
        if let Some(handler) = &self.registry.entry(index).ack_handler {
            let mut ctx = CommandContext {
                role: self.role,
                command,
                command_id: id,
                payload: Bytes::new(),
                names,
                outbox: &mut self.outbox,
            };
            if let Err(err) = handler(state, &mut ctx) {
                warn!(role = %self.role, command, error = %err, "ack handler failed");
            }
        }
    }

    /// Queue an optional final command and `DIE`, then flush for a bounded
    /// time. Incoming frames are still dispatched so acknowledgments the
    /// final command waits on can arrive.
    pub fn shutdown(&mut self, state: &mut C, final_command: Option<(&str, Bytes)>) -> Result<()> {
        self.ensure_alive()?;
        if let Some((name, payload)) = final_command {
            if self.is_synced() {
                self.send(name, payload)?;
            } else {
                debug!(command = name, "skipping final command before sync");
            }
        }
        self.outbox.push(Frame::new(DIE, Bytes::new()))?;

        let timeout = self.config.shutdown_flush_timeout;
        let deadline = Instant::now() + timeout;
        loop {
            let flushed = match self.flush_outbox() {
                Ok(flushed) => flushed,
                Err(err) => return Err(self.latch(err)),
            };
            if flushed && self.outbox.is_empty() {
                break;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(role = %self.role, "gave up flushing before shutdown");
                return Err(TransportError::Timeout(timeout).into());
            }

            let mut set = PollSet::new();
            let token = set.register(self.as_raw_fd(), true, self.writer.has_pending());
            set.wait(Some((deadline - now).min(SHUTDOWN_POLL_INTERVAL)))?;
            if set.readiness(token).readable {
                let mut ignored = Vec::new();
                if let Err(err) = self.poll_inner(state, true, false, &mut ignored) {
                    return Err(self.latch(err));
                }
            }
        }

        info!(role = %self.role, "channel shut down");
        Ok(())
    }
}

impl<C> CommandSink for IpcChannel<C> {
    fn send_command(&mut self, name: &str, payload: Bytes) -> Result<()> {
        self.send(name, payload)
    }

    fn send_superseding(&mut self, name: &str, payload: Bytes, key_len: usize) -> Result<()> {
        self.ensure_alive()?;
        self.outbox
            .supersede_named(self.registry.names(), name, payload, key_len)
    }

    fn send_message(&mut self, flags: MessageFlags, text: &str) -> Result<()> {
        self.ensure_alive()?;
        self.outbox
            .push(Frame::new(MESSAGE, encode_message(flags, text)))
    }

    fn is_linked(&self) -> bool {
        self.fatal.is_none() && self.registry.is_final() && self.peer_synced
    }
}

impl<C> AsRawFd for IpcChannel<C> {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.get_ref().as_raw_fd()
    }
}

impl<C> std::fmt::Debug for IpcChannel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcChannel")
            .field("role", &self.role)
            .field("fd", &self.as_raw_fd())
            .field("synced", &self.is_synced())
            .field("peer_synced", &self.peer_synced)
            .field("awaiting_ack", &self.outbox.awaiting_ack)
            .field("fatal", &self.fatal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Default)]
    struct Log {
        received: Vec<(String, Vec<u8>)>,
        acked: Vec<String>,
    }

    fn record(log: &mut Log, ctx: &mut CommandContext<'_>) {
        log.received
            .push((ctx.command().to_string(), ctx.payload().to_vec()));
    }

    fn controller_registry() -> CommandRegistry<Log> {
        let mut registry = CommandRegistry::controller();
        registry.register_outgoing("CHANSET").unwrap();
        registry
            .register("SOURCEREPORT", |log: &mut Log, ctx| {
                record(log, ctx);
                Ok(())
            })
            .unwrap();
        registry.register_outgoing("BROKEN").unwrap();
        registry
            .on_ack("CHANSET", |log: &mut Log, ctx| {
                log.acked.push(ctx.command().to_string());
                Ok(())
            })
            .unwrap();
        registry.mark_spawned();
        registry
    }

    fn helper_registry() -> CommandRegistry<Log> {
        // Registered in a different order from the controller.
        let mut registry = CommandRegistry::helper();
        registry
            .register("BROKEN", |_: &mut Log, _| Err(IpcError::handler("BROKEN", "nope")))
            .unwrap();
        registry.register_outgoing("SOURCEREPORT").unwrap();
        registry
            .register("CHANSET", |log: &mut Log, ctx| {
                record(log, ctx);
                ctx.send_command("SOURCEREPORT", Bytes::from_static(b"done"))
            })
            .unwrap();
        registry.mark_spawned();
        registry
    }

    fn channels() -> (IpcChannel<Log>, IpcChannel<Log>) {
        let (left, right) = IpcStream::pair().unwrap();
        (
            IpcChannel::new(left, controller_registry()).unwrap(),
            IpcChannel::new(right, helper_registry()).unwrap(),
        )
    }

    struct Pair {
        controller: IpcChannel<Log>,
        helper: IpcChannel<Log>,
        c_log: Log,
        h_log: Log,
    }

    impl Pair {
        fn new() -> Self {
            let (controller, helper) = channels();
            Self {
                controller,
                helper,
                c_log: Log::default(),
                h_log: Log::default(),
            }
        }

        fn synced() -> Self {
            let mut pair = Self::new();
            pair.controller.begin_sync().unwrap();
            pair.pump();
            pair
        }

        /// Alternate both ends until the exchange settles.
        fn pump(&mut self) -> (Vec<ChannelEvent>, Vec<ChannelEvent>) {
            let mut c_events = Vec::new();
            let mut h_events = Vec::new();
            for _ in 0..20 {
                c_events.extend(self.controller.poll(&mut self.c_log, true, true).unwrap());
                h_events.extend(self.helper.poll(&mut self.h_log, true, true).unwrap());
            }
            (c_events, h_events)
        }
    }

    #[test]
    fn handshake_completes_on_both_ends() {
        let mut pair = Pair::new();
        assert!(matches!(
            pair.controller.send("CHANSET", Bytes::new()),
            Err(IpcError::NotSynced(_))
        ));
        assert!(matches!(
            pair.helper.send("SOURCEREPORT", Bytes::new()),
            Err(IpcError::NotSynced(_))
        ));

        pair.controller.begin_sync().unwrap();
        let (c_events, h_events) = pair.pump();

        assert_eq!(c_events, vec![ChannelEvent::SyncComplete]);
        assert_eq!(h_events, vec![ChannelEvent::SyncComplete]);
        assert!(pair.controller.is_peer_synced());
        assert!(pair.helper.is_synced());
        for name in ["CHANSET", "SOURCEREPORT", "BROKEN"] {
            assert_eq!(
                pair.helper.registry().id_of(name),
                pair.controller.registry().id_of(name),
                "{name}"
            );
        }
        assert!(pair.controller.is_linked());
        assert!(pair.controller.is_ready());
    }

    #[test]
    fn commands_are_dispatched_and_acknowledged() {
        let mut pair = Pair::synced();

        pair.controller.send("CHANSET", &b"ch6"[..]).unwrap();
        pair.pump();

        assert_eq!(
            pair.h_log.received,
            vec![("CHANSET".to_string(), b"ch6".to_vec())]
        );
        assert_eq!(
            pair.c_log.received,
            vec![("SOURCEREPORT".to_string(), b"done".to_vec())]
        );
        assert_eq!(pair.c_log.acked, vec!["CHANSET".to_string()]);
        assert!(pair.controller.is_ready());
        assert!(pair.helper.is_ready());
    }

    #[test]
    fn superseding_send_overwrites_unsent_frame() {
        let mut pair = Pair::synced();
        pair.controller.send("CHANSET", &b"s1-a"[..]).unwrap();
        pair.controller.poll(&mut pair.c_log, false, true).unwrap();

        // Everything below queues behind the unacknowledged s1-a.
        for payload in ["s1-b", "s2-a", "s1-c", "s1-d"] {
            pair.controller
                .send_superseding("CHANSET", Bytes::from(payload), 2)
                .unwrap();
        }
        assert_eq!(pair.controller.outbox.queue.len(), 2);

        pair.pump();
        let received: Vec<&[u8]> = pair
            .h_log
            .received
            .iter()
            .map(|(_, payload)| payload.as_slice())
            .collect();
        assert_eq!(received, vec![&b"s1-a"[..], &b"s1-d"[..], &b"s2-a"[..]]);
    }

    #[test]
    fn second_command_waits_for_first_ack() {
        let mut pair = Pair::synced();
        pair.controller.send("CHANSET", &b"a"[..]).unwrap();
        pair.controller.send("CHANSET", &b"b"[..]).unwrap();

        pair.controller.poll(&mut pair.c_log, false, true).unwrap();
        let id = pair.controller.registry().id_of("CHANSET");
        assert_eq!(pair.controller.awaiting_ack(), id);
        assert!(!pair.controller.is_ready());

        // The helper sees exactly one command before the controller hears back.
        pair.helper.poll(&mut pair.h_log, true, true).unwrap();
        assert_eq!(pair.h_log.received.len(), 1);

        pair.pump();
        assert_eq!(pair.h_log.received.len(), 2);
        assert_eq!(pair.h_log.received[1].1, b"b".to_vec());
        assert!(pair.controller.is_ready());
    }

    #[test]
    fn handler_error_is_logged_and_still_acknowledged() {
        let mut pair = Pair::synced();
        pair.controller.send("BROKEN", Bytes::new()).unwrap();
        pair.pump();
        assert!(!pair.helper.is_fatal());
        assert!(pair.controller.is_ready());
    }

    #[test]
    fn die_is_reported_to_peer() {
        let mut pair = Pair::synced();
        pair.controller.shutdown(&mut pair.c_log, None).unwrap();
        let events = pair.helper.poll(&mut pair.h_log, true, true).unwrap();
        assert_eq!(events, vec![ChannelEvent::PeerShutdown]);
        assert!(pair.helper.peer_requested_shutdown());
    }

    #[test]
    fn shutdown_sends_final_command_before_die() {
        let Pair {
            mut controller,
            mut helper,
            mut c_log,
            ..
        } = Pair::synced();

        let helper_thread = std::thread::spawn(move || {
            let mut log = Log::default();
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                let events = helper.poll(&mut log, true, true).unwrap();
                if events.contains(&ChannelEvent::PeerShutdown) {
                    return (log, true);
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            (log, false)
        });

        controller
            .shutdown(&mut c_log, Some(("CHANSET", Bytes::from_static(b"last"))))
            .unwrap();
        let (h_log, saw_die) = helper_thread.join().unwrap();

        assert!(saw_die);
        assert_eq!(h_log.received, vec![("CHANSET".to_string(), b"last".to_vec())]);
        assert_eq!(c_log.acked, vec!["CHANSET".to_string()]);
    }

    #[test]
    fn shutdown_gives_up_when_ack_never_comes() {
        let Pair {
            controller,
            helper: _helper,
            mut c_log,
            ..
        } = Pair::synced();
        let mut controller = controller;
        controller.config.shutdown_flush_timeout = Duration::from_millis(100);

        let err = controller
            .shutdown(&mut c_log, Some(("CHANSET", Bytes::new())))
            .unwrap_err();
        assert!(matches!(
            err,
            IpcError::Transport(TransportError::Timeout(_))
        ));
    }

    #[test]
    fn message_is_delivered_and_fatal_latches() {
        let mut pair = Pair::synced();
        pair.helper
            .send_message(MessageFlags::INFO, "monitor mode enabled")
            .unwrap();
        pair.pump();
        assert!(!pair.controller.is_fatal());

        pair.helper
            .send_message(MessageFlags::FATAL, "radio vanished")
            .unwrap();
        pair.helper.poll(&mut pair.h_log, false, true).unwrap();
        let err = pair.controller.poll(&mut pair.c_log, true, false).unwrap_err();
        assert!(matches!(err, IpcError::PeerFatal(ref text) if text == "radio vanished"));
        assert!(pair.controller.is_fatal());
        assert!(matches!(
            pair.controller.send("CHANSET", Bytes::new()),
            Err(IpcError::Dead(_))
        ));
    }

    #[test]
    fn bad_sentinel_is_fatal() {
        let (mut raw, right) = IpcStream::pair().unwrap();
        let mut helper = IpcChannel::new(right, helper_registry()).unwrap();

        let mut junk = vec![0u8; 13];
        junk[0] = 4;
        raw.write_all(&junk).unwrap();

        let err = helper.poll(&mut Log::default(), true, false).unwrap_err();
        assert!(matches!(
            err,
            IpcError::Frame(FrameError::InvalidSentinel { .. })
        ));
        assert!(helper.is_fatal());
    }

    #[test]
    fn unknown_command_is_fatal() {
        let (raw, right) = IpcStream::pair().unwrap();
        let mut helper = IpcChannel::new(right, helper_registry()).unwrap();

        let mut writer = FrameWriter::new(raw);
        writer.queue(&Frame::new(999, Bytes::new())).unwrap();
        assert!(writer.write_pending().unwrap());

        let err = helper.poll(&mut Log::default(), true, false).unwrap_err();
        assert!(matches!(err, IpcError::UnknownCommand(999)));
        assert!(helper.is_fatal());
    }

    #[test]
    fn peer_close_is_fatal() {
        let (mut controller, helper) = channels();
        drop(helper);
        let err = controller.poll(&mut Log::default(), true, false).unwrap_err();
        assert!(matches!(
            err,
            IpcError::Frame(FrameError::ConnectionClosed)
        ));
        assert!(!controller.is_linked());
    }
}
