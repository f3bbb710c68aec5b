//! Source registry: resolution, lifecycle, and forwarding to the helper.
//!
//! The controller and the helper each own a [`SourceTracker`]. A source whose
//! driver needs privilege is opened by whichever process has it: directly
//! when the controller runs as root, otherwise by forwarding `SOURCEADD` and
//! `SOURCERUN` to the helper and waiting for `SOURCEREPORT`.

use std::collections::{BTreeMap, HashSet};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use capctl_ipc::{CommandSink, Role};
use tracing::{debug, info, warn};

use crate::chanlist::{ChannelEntry, ChannelList, ChannelListStore, NO_CHANNELS};
use crate::config::{SchedulerConfig, SourceDefaults};
use crate::driver::{Driver, DriverRegistry, DriverResult};
use crate::error::{Result, SourceError};
use crate::health::ReopenTimer;
use crate::source::{HopDriver, Source, SourceDefinition, SourceState, SourceSummary};
use crate::wire::{
    self, ChanSet, SourceAdd, SourceReport, SourceRun, CAP_DESCRIPTOR, CAP_HOP, CAP_PRIVILEGED,
    STATUS_ERROR, STATUS_RUNNING,
};

const NO_HELPER: &str = "source requires privilege and no privileged helper is running";

/// All sources known to one process.
#[derive(Debug)]
pub struct SourceTracker {
    role: Role,
    privileged: bool,
    pub(crate) config: SchedulerConfig,
    defaults: SourceDefaults,
    drivers: DriverRegistry,
    pub(crate) lists: ChannelListStore,
    pub(crate) sources: BTreeMap<u16, Source>,
    next_source_id: u16,
    pushed_lists: HashSet<u16>,
    pub(crate) ticks: u64,
    pub(crate) period_usage: BTreeMap<u32, u32>,
    pub(crate) usage: BTreeMap<u32, u64>,
    pub(crate) reopen: ReopenTimer,
}

impl SourceTracker {
    /// Controller-side tracker; privilege follows the effective uid.
    pub fn controller(drivers: DriverRegistry, lists: ChannelListStore) -> Self {
        Self::new(Role::Controller, drivers, lists, capctl_transport::is_privileged())
    }

    /// Helper-side tracker; channel lists arrive from the controller.
    pub fn helper(drivers: DriverRegistry) -> Self {
        Self::new(Role::Helper, drivers, ChannelListStore::empty(), true)
    }

    fn new(role: Role, drivers: DriverRegistry, lists: ChannelListStore, privileged: bool) -> Self {
        let config = SchedulerConfig::default();
        Self {
            role,
            privileged,
            reopen: ReopenTimer::new(config.reopen_interval),
            config,
            defaults: SourceDefaults::default(),
            drivers,
            lists,
            sources: BTreeMap::new(),
            next_source_id: 1,
            pushed_lists: HashSet::new(),
            ticks: 0,
            period_usage: BTreeMap::new(),
            usage: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.reopen = ReopenTimer::new(config.reopen_interval);
        self.config = config;
        self
    }

    pub fn with_defaults(mut self, defaults: SourceDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Override whether this process can open privileged sources itself.
    pub fn with_privilege(mut self, privileged: bool) -> Self {
        self.privileged = privileged;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_privileged(&self) -> bool {
        self.privileged
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    pub fn channel_lists(&self) -> &ChannelListStore {
        &self.lists
    }

    pub fn channel_lists_mut(&mut self) -> &mut ChannelListStore {
        &mut self.lists
    }

    pub fn channel_list(&self, id: u16) -> Option<Arc<ChannelList>> {
        self.lists.get(id)
    }

    pub fn source(&self, id: u16) -> Option<&Source> {
        self.sources.get(&id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &Source> {
        self.sources.values()
    }

    pub fn summaries(&self) -> Vec<SourceSummary> {
        self.sources.values().map(Source::summary).collect()
    }

    /// Cumulative ticks spent per channel.
    pub fn channel_usage(&self) -> &BTreeMap<u32, u64> {
        &self.usage
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Resolve a definition and register the source.
    ///
    /// Unresolvable definitions still produce a source, held in permanent
    /// error, so it remains visible.
    pub fn add_source(&mut self, definition: &str, sink: &mut dyn CommandSink) -> Result<u16> {
        self.add_source_with(definition, None, sink)
    }

    /// Like [`add_source`](Self::add_source) with a caller-supplied driver instance.
    pub fn add_source_with(
        &mut self,
        definition: &str,
        instance: Option<Box<dyn Driver>>,
        sink: &mut dyn CommandSink,
    ) -> Result<u16> {
        let id = self.allocate_source_id()?;
        let source = match self.resolve(id, definition, instance) {
            Ok(source) => source,
            Err(err) => {
                warn!(source_id = id, definition, error = %err, "source could not be resolved");
                self.broken_source(id, definition, err.to_string())
            }
        };
        info!(
            source_id = id,
            name = %source.name,
            driver = %source.driver_type,
            channel_list = source.channel_list_id,
            "added source"
        );
        let list_id = source.channel_list_id;
        let remote = self.is_remote(&source);
        self.sources.insert(id, source);
        self.resplit(list_id, Some(id), sink);

        if remote {
            if !sink.is_linked() {
                self.mark_error(id, NO_HELPER);
            } else if let Err(err) = self.forward_add(id, sink) {
                self.mark_error(id, format!("could not forward to helper: {err}"));
            }
        }
        Ok(id)
    }

    /// Open a source, or ask the helper to.
    pub fn start(&mut self, id: u16, sink: &mut dyn CommandSink) -> Result<()> {
        let remote = self.is_remote(self.get(id)?);
        let source = self.get_mut(id)?;
        if source.permanent_error {
            debug!(source_id = id, "not starting unresolved source");
            return Ok(());
        }
        source.start_requested = true;

        if !remote {
            self.open_local(id, sink);
            return Ok(());
        }
        if !sink.is_linked() {
            self.mark_error(id, NO_HELPER);
            return Ok(());
        }
        source.state = SourceState::Starting;
        let run = SourceRun {
            source_id: id,
            start: true,
        };
        if let Err(err) = sink.send_command(wire::SOURCERUN, run.encode()) {
            self.mark_error(id, format!("could not reach helper: {err}"));
        }
        Ok(())
    }

    /// Close a source and leave it unstarted.
    pub fn stop(&mut self, id: u16, sink: &mut dyn CommandSink) -> Result<()> {
        let remote = self.is_remote(self.get(id)?);
        let source = self.get_mut(id)?;
        source.start_requested = false;
        if remote {
            source.close();
            source.state = SourceState::Unstarted;
            if sink.is_linked() {
                let run = SourceRun {
                    source_id: id,
                    start: false,
                };
                sink.send_command(wire::SOURCERUN, run.encode())?;
            }
            return Ok(());
        }
        release(source);
        source.state = SourceState::Unstarted;
        info!(source_id = id, "stopped source");
        self.report_status(id, sink);
        Ok(())
    }

    /// Stop and forget a source. Frames that still name it are ignored.
    pub fn remove_source(&mut self, id: u16, sink: &mut dyn CommandSink) -> Result<()> {
        let remote = self.is_remote(self.get(id)?);
        let Some(mut source) = self.sources.remove(&id) else {
            return Err(SourceError::UnknownSource(id));
        };
        if remote {
            source.close();
            if sink.is_linked() {
                sink.send_command(wire::SOURCEREMOVE, wire::encode_source_id(id))?;
            }
        } else {
            release(&mut source);
        }
        source.state = SourceState::Removed;
        info!(source_id = id, name = %source.name, "removed source");
        self.resplit(source.channel_list_id, None, sink);
        Ok(())
    }

    /// Stop every source this process opened itself.
    pub fn shutdown(&mut self) {
        for source in self.sources.values_mut() {
            if !source.requires_privilege || self.privileged {
                release(source);
            } else {
                source.close();
            }
        }
    }

    /// Fix a source to one channel, stopping any hopping.
    pub fn set_channel(&mut self, id: u16, channel: u32, sink: &mut dyn CommandSink) -> Result<()> {
        let source = self.get_mut(id)?;
        let was_hopping = source.is_hopping();
        let list_id = source.channel_list_id;
        source.hop_enabled = false;
        source.channel = channel;
        self.apply_channel(id, sink);
        if was_hopping {
            self.resplit(list_id, Some(id), sink);
        }
        Ok(())
    }

    /// Turn hopping on or off for a source.
    ///
    /// Resuming starts from the source's current list position. Stopping
    /// leaves the source on whatever channel it is tuned to.
    pub fn set_hopping(&mut self, id: u16, enable: bool, sink: &mut dyn CommandSink) -> Result<()> {
        let list_id = self.get(id)?.channel_list_id;
        let list = self
            .lists
            .get(list_id)
            .ok_or(SourceError::UnknownChannelList(list_id))?;
        let source = self.get_mut(id)?;
        if source.hop_enabled == enable {
            return Ok(());
        }
        if enable && (!source.driver.can_hop() || list.is_fixed()) {
            return Err(SourceError::definition(
                &source.definition,
                "source cannot hop on its channel list",
            ));
        }
        source.hop_enabled = enable;
        source.range_position = 0;
        info!(source_id = id, hopping = enable, "hopping changed");

        self.resplit(list_id, Some(id), sink);
        if enable {
            self.retune(id, sink);
        } else {
            let source = self.get(id)?;
            if self.is_remote(source) && source.hop_driver == HopDriver::Helper && sink.is_linked() {
                send_chanset(source, sink)?;
            }
        }
        Ok(())
    }

    /// Send all lists and privileged sources to a freshly synced helper.
    pub fn push_to_helper(&mut self, sink: &mut dyn CommandSink) -> Result<()> {
        self.pushed_lists.clear();
        let remote: Vec<u16> = self
            .sources
            .values()
            .filter(|s| self.is_remote(s) && !s.permanent_error)
            .map(|s| s.id)
            .collect();

        for id in remote {
            self.forward_add(id, sink)?;
            let source = self.get_mut(id)?;
            if source.start_requested {
                source.state = SourceState::Starting;
                let run = SourceRun {
                    source_id: id,
                    start: true,
                };
                sink.send_command(wire::SOURCERUN, run.encode())?;
            } else if source.is_error() {
                source.state = SourceState::Unstarted;
                source.warning = None;
            }
        }
        Ok(())
    }

    /// The helper went away: every source it held is now in error.
    pub fn helper_lost(&mut self, reason: &str) {
        self.pushed_lists.clear();
        let privileged = self.privileged;
        for source in self.sources.values_mut() {
            if !source.requires_privilege || privileged || source.permanent_error {
                continue;
            }
            source.close();
            if source.state != SourceState::Unstarted {
                source.set_error(format!("privileged helper lost: {reason}"));
                warn!(source_id = source.id, reason, "source lost with helper");
            }
        }
    }

    /// Attach a descriptor received from the helper.
    pub fn attach_descriptor(&mut self, id: u16, fd: OwnedFd) -> bool {
        let Some(source) = self.sources.get_mut(&id) else {
            debug!(source_id = id, "dropping descriptor for unknown source");
            return false;
        };
        source.descriptor = Some(fd);
        source.zero_poll_count = 0;
        debug!(source_id = id, "attached capture descriptor");
        true
    }

    /// Apply a helper's status report.
    pub fn apply_report(&mut self, report: &SourceReport) {
        let Some(source) = self.sources.get_mut(&report.source_id) else {
            debug!(source_id = report.source_id, "report for unknown source");
            return;
        };
        if report.is_error() {
            let reason = if report.warning.is_empty() {
                "helper reported an error".to_string()
            } else {
                report.warning.clone()
            };
            if !source.is_error() {
                warn!(source_id = source.id, reason = %reason, "helper reported source error");
            }
            source.close();
            source.set_error(reason);
        } else if report.is_running() {
            if source.state != SourceState::Running {
                info!(source_id = source.id, "source running in helper");
            }
            source.state = SourceState::Running;
            source.warning = None;
        } else {
            source.close();
            source.state = SourceState::Unstarted;
        }
        if source.hop_driver == HopDriver::Helper {
            source.channel = report.last_channel;
        }
        if report.hop_cycle_seconds > 0 || report.hop_cycle_micros > 0 {
            source.last_hop_cycle = Some(
                Duration::from_secs(u64::from(report.hop_cycle_seconds))
                    + Duration::from_micros(u64::from(report.hop_cycle_micros)),
            );
        }
    }

    /// Fold a helper's per-channel tick counts into the totals.
    pub fn merge_channel_ticks(&mut self, ticks: &BTreeMap<u32, u32>) {
        for (&channel, &count) in ticks {
            *self.usage.entry(channel).or_insert(0) += u64::from(count);
        }
    }

    /// Helper side: create a source described by the controller.
    pub fn insert_remote(&mut self, add: &SourceAdd) -> Result<()> {
        let list = self
            .lists
            .get(add.channel_list_id)
            .ok_or(SourceError::UnknownChannelList(add.channel_list_id))?;
        let prototype = self
            .drivers
            .find(&add.driver_type)
            .ok_or_else(|| SourceError::UnknownDriver(add.driver_type.clone()))?;
        let definition = SourceDefinition::parse(&add.source_line)?;

        let mut source = Source::new(
            add.source_id,
            &add.source_line,
            &definition.interface,
            prototype.instantiate(),
        );
        if let Some(name) = definition.option("name") {
            source.name = name.to_string();
        }
        if let Some(hop_driver) = definition.option("hopdriver") {
            source.hop_driver = hop_driver.parse().unwrap_or_default();
        }
        source.channel_list_id = add.channel_list_id;
        source.channel = add.channel;
        source.hop_enabled = add.hop_enabled;
        source.dwell_seconds = add.dwell_seconds.max(0);
        source.hop_rate = add.hop_rate;
        source.position = wrap_position(add.position, &list);
        source.reopen_on_error = false;

        if let Some(mut old) = self.sources.insert(add.source_id, source) {
            release(&mut old);
        }
        info!(
            source_id = add.source_id,
            interface = %definition.interface,
            driver = %add.driver_type,
            "created source for controller"
        );
        Ok(())
    }

    /// Helper side: apply a channel-set from the controller.
    pub fn apply_chanset(&mut self, set: &ChanSet, sink: &mut dyn CommandSink) -> Result<()> {
        let list = self
            .lists
            .get(set.channel_list_id)
            .ok_or(SourceError::UnknownChannelList(set.channel_list_id))?;
        let source = self.get_mut(set.source_id)?;
        source.channel_list_id = set.channel_list_id;
        source.hop_enabled = set.hop_enabled;
        source.dwell_seconds = set.dwell_seconds.max(0);
        source.hop_rate = set.hop_rate;
        source.split_enabled = set.split_enabled;
        source.position = wrap_position(set.position, &list);
        source.range_position = 0;
        if !set.hop_enabled {
            source.channel = set.channel;
        }
        if source.is_running() {
            self.prime(set.source_id);
            self.apply_channel(set.source_id, sink);
        }
        Ok(())
    }

    /// Helper side: answer a rejected request with an error report.
    pub fn report_rejected(&self, id: u16, reason: &str, sink: &mut dyn CommandSink) {
        let report = SourceReport {
            source_id: id,
            status_flags: STATUS_ERROR,
            warning: reason.to_string(),
            ..SourceReport::default()
        };
        send_report(&report, sink);
    }

    /// Mark a descriptor as handed to the controller.
    pub fn mark_descriptor_delivered(&mut self, id: u16) {
        if let Some(source) = self.sources.get_mut(&id) {
            source.descriptor_delivered = true;
        }
    }

    /// Running sources whose descriptor has not been passed on yet.
    pub fn undelivered_descriptors(&self) -> Vec<u16> {
        self.sources
            .values()
            .filter(|s| s.is_running() && s.descriptor.is_some() && !s.descriptor_delivered)
            .map(|s| s.id)
            .collect()
    }

    pub(crate) fn is_remote(&self, source: &Source) -> bool {
        source.requires_privilege && !self.privileged
    }

    pub(crate) fn get(&self, id: u16) -> Result<&Source> {
        self.sources.get(&id).ok_or(SourceError::UnknownSource(id))
    }

    pub(crate) fn get_mut(&mut self, id: u16) -> Result<&mut Source> {
        self.sources.get_mut(&id).ok_or(SourceError::UnknownSource(id))
    }

    /// Set the current channel and countdown from the list position.
    pub(crate) fn prime(&mut self, id: u16) {
        let tps = self.config.ticks_per_second;
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        if !source.is_hopping() {
            return;
        }
        let Some(list) = self.lists.get(source.channel_list_id) else {
            return;
        };
        if let Some(entry) = list.entry(source.position) {
            source.channel = entry.channel_at(source.range_position);
            source.countdown = crate::scheduler::countdown_for(entry, source, tps);
        }
    }

    /// Close a source after a failure and tell whoever needs to know.
    pub(crate) fn fail_source(&mut self, id: u16, reason: impl Into<String>, sink: &mut dyn CommandSink) {
        let reason = reason.into();
        let remote = match self.sources.get(&id) {
            Some(source) => self.is_remote(source),
            None => return,
        };
        self.mark_error(id, reason);
        if remote && sink.is_linked() {
            let run = SourceRun {
                source_id: id,
                start: false,
            };
            if let Err(err) = sink.send_command(wire::SOURCERUN, run.encode()) {
                warn!(source_id = id, error = %err, "could not stop source in helper");
            }
        }
        self.report_status(id, sink);
    }

    /// Send this source's status upstream when running as the helper.
    pub(crate) fn report_status(&self, id: u16, sink: &mut dyn CommandSink) {
        if self.role != Role::Helper || !sink.is_linked() {
            return;
        }
        if let Some(source) = self.sources.get(&id) {
            send_report(&status_report(source), sink);
        }
    }

    fn mark_error(&mut self, id: u16, reason: impl Into<String>) {
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        let reason = reason.into();
        source.close();
        warn!(source_id = id, name = %source.name, reason = %reason, "source in error");
        source.set_error(reason);
    }

    fn open_local(&mut self, id: u16, sink: &mut dyn CommandSink) {
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        source.close();
        source.state = SourceState::Starting;
        match open_driver(source) {
            Ok(descriptor) => {
                source.descriptor = descriptor;
                source.state = SourceState::Running;
                source.warning = None;
                source.zero_poll_count = 0;
                source.consecutive_channel_errors = 0;
                source.range_position = 0;
                source.cycle_started = Some(Instant::now());
                info!(
                    source_id = id,
                    interface = %source.interface,
                    descriptor = source.descriptor.is_some(),
                    "source running"
                );
            }
            Err(err) => {
                self.fail_source(id, format!("open failed: {err}"), sink);
                return;
            }
        }
        self.prime(id);
        self.apply_channel(id, sink);
        self.learn_channel(id);
        self.report_status(id, sink);
    }

    /// Record the channel an untuned source's radio is already on.
    fn learn_channel(&mut self, id: u16) {
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        if !source.is_running() || source.is_hopping() || source.channel != 0 {
            return;
        }
        match source.driver.fetch_channel(&source.interface) {
            Ok(channel) => source.channel = channel,
            Err(err) => debug!(source_id = id, error = %err, "radio did not report its channel"),
        }
    }

    fn forward_add(&mut self, id: u16, sink: &mut dyn CommandSink) -> Result<()> {
        let list_id = self.get(id)?.channel_list_id;
        if !self.pushed_lists.contains(&list_id) {
            let list = self
                .lists
                .get(list_id)
                .ok_or(SourceError::UnknownChannelList(list_id))?;
            sink.send_command(wire::CHANLIST, wire::encode_channel_list(&list)?)?;
            self.pushed_lists.insert(list_id);
        }

        let source = self.get(id)?;
        let add = SourceAdd {
            source_id: id,
            driver_type: source.driver_type.clone(),
            source_line: source.definition.clone(),
            channel_list_id: list_id,
            channel: source.channel,
            hop_enabled: source.hop_enabled && source.hop_driver == HopDriver::Helper,
            dwell_seconds: source.dwell_seconds,
            hop_rate: source.hop_rate,
            position: position_field(source.position),
        };
        sink.send_command(wire::SOURCEADD, add.encode()?)?;
        debug!(source_id = id, "forwarded source to helper");
        Ok(())
    }

    /// Recompute split positions for a list and retune the sources that moved.
    fn resplit(&mut self, list_id: u16, skip: Option<u16>, sink: &mut dyn CommandSink) {
        let moved = self.assign_split(list_id);
        for id in moved {
            if Some(id) != skip {
                self.retune(id, sink);
            }
        }
    }

    /// Put a source on the channel its record now names: the helper hops
    /// delegated sources itself, everything else is primed and tuned here.
    fn retune(&mut self, id: u16, sink: &mut dyn CommandSink) {
        let Some(source) = self.sources.get(&id) else {
            return;
        };
        if self.is_remote(source) && source.hop_driver == HopDriver::Helper {
            if !sink.is_linked() {
                return;
            }
            if let Err(err) = send_chanset(source, sink) {
                warn!(source_id = id, error = %err, "could not retune source in helper");
            }
            return;
        }
        if source.is_running() {
            self.prime(id);
            self.apply_channel(id, sink);
        }
    }

    fn resolve(
        &mut self,
        id: u16,
        definition: &str,
        instance: Option<Box<dyn Driver>>,
    ) -> Result<Source> {
        let def = SourceDefinition::parse(definition)?;
        let mut driver = match instance {
            Some(driver) => driver,
            None => self.instantiate_for(&def)?,
        };
        let channel_list_id = self.resolve_channel_list(&def, driver.as_mut())?;

        let mut source = Source::new(id, definition, &def.interface, driver);
        if let Some(name) = def.option("name") {
            source.name = name.to_string();
        }
        source.channel_list_id = channel_list_id;
        self.apply_hop_options(&mut source, &def)?;
        source.reopen_on_error = def.bool_option("reopen")?.unwrap_or(self.defaults.reopen);
        if let Some(hop_driver) = def.option("hopdriver") {
            source.hop_driver = hop_driver
                .parse()
                .map_err(|reason: String| SourceError::definition(definition, reason))?;
        }
        Ok(source)
    }

    fn instantiate_for(&self, def: &SourceDefinition) -> Result<Box<dyn Driver>> {
        match def.option("type") {
            Some(type_name) => self
                .drivers
                .find(type_name)
                .map(|prototype| prototype.instantiate())
                .ok_or_else(|| SourceError::UnknownDriver(type_name.to_string())),
            None => self
                .drivers
                .probe(&def.interface)
                .map(|prototype| prototype.instantiate())
                .ok_or_else(|| SourceError::definition(&def.interface, "no driver claims this interface")),
        }
    }

    fn resolve_channel_list(&mut self, def: &SourceDefinition, driver: &mut dyn Driver) -> Result<u16> {
        if let Some(name) = def.option("channellist") {
            return self.lists.lookup(name);
        }
        match driver.supported_channels(&def.interface) {
            Ok(channels) if !channels.is_empty() => return self.lists.intern_hardware(&channels),
            Ok(_) => {}
            Err(err) => {
                debug!(interface = %def.interface, error = %err, "driver reported no channels");
            }
        }
        self.lists.lookup(driver.default_channel_list())
    }

    fn apply_hop_options(&self, source: &mut Source, def: &SourceDefinition) -> Result<()> {
        let tps = self.config.ticks_per_second as i32;
        let list = self
            .lists
            .get(source.channel_list_id)
            .ok_or(SourceError::UnknownChannelList(source.channel_list_id))?;

        let fixed: Option<u32> = def.number_option("channel")?;
        let rate: Option<i32> = def.number_option("hoprate")?;
        let dwell: Option<i32> = def.number_option("dwell")?;
        if rate.is_some_and(|r| r > 0) && dwell.is_some_and(|d| d > 0) {
            return Err(SourceError::definition(
                &source.definition,
                "hoprate and dwell cannot both be set",
            ));
        }
        if dwell.is_some_and(|d| d < 0) {
            return Err(SourceError::definition(&source.definition, "dwell cannot be negative"));
        }

        source.dwell_seconds = match (dwell, rate) {
            (Some(dwell), _) => dwell,
            (None, Some(_)) => 0,
            (None, None) => self.defaults.dwell_seconds.max(0),
        };
        let mut hop_rate = rate.unwrap_or(self.defaults.hop_rate);
        if source.dwell_seconds == 0 && !(1..=tps).contains(&hop_rate) {
            let clamped = hop_rate.clamp(1, tps);
            warn!(
                source = %source.name,
                requested = hop_rate,
                clamped,
                "hop rate out of range"
            );
            hop_rate = clamped;
        }
        source.hop_rate = hop_rate;
        source.split_enabled = def.bool_option("split")?.unwrap_or(self.defaults.split);
        source.hop_enabled = def.bool_option("hop")?.unwrap_or(self.defaults.hop)
            && source.driver.can_hop()
            && !list.is_fixed()
            && fixed.is_none();
        source.channel = fixed
            .or_else(|| list.entry(0).map(ChannelEntry::first_channel))
            .unwrap_or(0);
        Ok(())
    }

    fn broken_source(&mut self, id: u16, definition: &str, reason: String) -> Source {
        let interface = definition.split(':').next().unwrap_or_default().trim();
        let interface = if interface.is_empty() { definition } else { interface };
        let mut source = Source::new(id, definition, interface, self.drivers.broken(reason.clone()));
        source.channel_list_id = self.lists.id_of(NO_CHANNELS).unwrap_or(0);
        source.permanent_error = true;
        source.reopen_on_error = false;
        source.set_error(reason);
        source
    }

    fn allocate_source_id(&mut self) -> Result<u16> {
        let id = self.next_source_id;
        if id == u16::MAX {
            return Err(SourceError::SourceIdsExhausted);
        }
        self.next_source_id += 1;
        Ok(id)
    }
}

fn open_driver(source: &mut Source) -> DriverResult<Option<OwnedFd>> {
    source.driver.enable_monitor(&source.interface)?;
    source.driver.open(&source.interface)
}

/// Close a locally opened source and take the interface out of monitor mode.
fn release(source: &mut Source) {
    let was_open = source.state == SourceState::Running || source.descriptor.is_some();
    source.close();
    if was_open {
        if let Err(err) = source.driver.disable_monitor(&source.interface) {
            debug!(source_id = source.id, error = %err, "could not leave monitor mode");
        }
    }
}

fn wrap_position(position: i32, list: &ChannelList) -> usize {
    usize::try_from(position.max(0)).unwrap_or(0) % list.len().max(1)
}

fn position_field(position: usize) -> i32 {
    i32::try_from(position).unwrap_or(i32::MAX)
}

pub(crate) fn chanset_for(source: &Source) -> ChanSet {
    ChanSet {
        source_id: source.id,
        channel_list_id: source.channel_list_id,
        channel: source.channel,
        hop_enabled: source.hop_enabled && source.hop_driver == HopDriver::Helper,
        dwell_seconds: source.dwell_seconds,
        hop_rate: source.hop_rate,
        split_enabled: source.split_enabled,
        position: position_field(source.position),
    }
}

/// Queue a `CHANSET` for `source`, replacing any unsent one for it.
pub(crate) fn send_chanset(source: &Source, sink: &mut dyn CommandSink) -> capctl_ipc::Result<()> {
    sink.send_superseding(wire::CHANSET, chanset_for(source).encode(), wire::CHANSET_KEY_LEN)
}

fn status_report(source: &Source) -> SourceReport {
    let mut capability_flags = 0;
    if source.driver.can_hop() {
        capability_flags |= CAP_HOP;
    }
    if source.requires_privilege {
        capability_flags |= CAP_PRIVILEGED;
    }
    if source.descriptor.is_some() {
        capability_flags |= CAP_DESCRIPTOR;
    }
    let status_flags = match source.state {
        SourceState::Running => STATUS_RUNNING,
        SourceState::Error => STATUS_ERROR,
        _ => 0,
    };
    let cycle = source.last_hop_cycle.unwrap_or_default();
    SourceReport {
        source_id: source.id,
        channel_list_id: source.channel_list_id,
        capability_flags,
        status_flags,
        hop_cycle_seconds: u32::try_from(cycle.as_secs()).unwrap_or(u32::MAX),
        hop_cycle_micros: cycle.subsec_micros(),
        last_channel: source.channel,
        warning: source.warning.clone().unwrap_or_default(),
    }
}

pub(crate) fn send_report(report: &SourceReport, sink: &mut dyn CommandSink) {
    let payload = match report.encode() {
        Ok(payload) => payload,
        Err(err) => {
            warn!(source_id = report.source_id, error = %err, "could not encode source report");
            return;
        }
    };
    if let Err(err) = sink.send_command(wire::SOURCEREPORT, payload) {
        warn!(source_id = report.source_id, error = %err, "could not send source report");
    }
}
