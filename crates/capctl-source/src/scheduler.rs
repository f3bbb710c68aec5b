//! The fixed-rate channel scheduler.
//!
//! Each tick every hopping source with a live descriptor counts down; at
//! zero it advances through its channel list and tunes to the next channel.
//! Tuning goes to the driver when this process opened the source, or out as
//! a `CHANSET` when the controller hops a source held by the helper.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::time::Instant;

use capctl_ipc::{CommandSink, Role};
use tracing::{debug, warn};

use crate::chanlist::{ChannelEntry, ChannelList};
use crate::driver::DriverError;
use crate::source::{HopDriver, Source, SourceState};
use crate::tracker::{send_chanset, SourceTracker};
use crate::wire;

/// Ticks to stay on `entry` before the next hop.
///
/// Dwell: `weight * dwell * tps`. Rate: `weight * (tps / rate)` for discrete
/// entries and `tps - rate` inside a range. Never less than one tick.
pub fn countdown_for(entry: &ChannelEntry, source: &Source, ticks_per_second: u32) -> u32 {
    let weight = entry.dwell_weight();
    let ticks = if source.dwell_seconds > 0 {
        weight
            .saturating_mul(source.dwell_seconds.unsigned_abs())
            .saturating_mul(ticks_per_second)
    } else {
        let rate = source.hop_rate.clamp(1, ticks_per_second.max(1) as i32) as u32;
        if entry.is_range() {
            ticks_per_second.saturating_sub(rate)
        } else {
            weight.saturating_mul(ticks_per_second / rate)
        }
    };
    ticks.max(1)
}

/// Move a source one slot along its list. Returns true when the list wrapped.
fn advance(source: &mut Source, list: &ChannelList) -> bool {
    if let Some(entry) = list.entry(source.position) {
        if entry.is_range() {
            source.range_position += 1;
            if source.range_position < entry.range_total() {
                return false;
            }
            source.range_position = 0;
        }
    }
    source.position += 1;
    if source.position >= list.len() {
        source.position = 0;
        return true;
    }
    false
}

impl SourceTracker {
    /// Run one scheduler tick.
    pub fn tick(&mut self, now: Instant, sink: &mut dyn CommandSink) {
        self.ticks += 1;

        let scheduled: Vec<u16> = self
            .sources
            .values()
            .filter(|s| self.is_scheduled(s))
            .map(|s| s.id)
            .collect();

        let channels: BTreeSet<u32> = scheduled
            .iter()
            .filter_map(|id| self.sources.get(id))
            .map(|s| s.channel)
            .collect();
        for channel in channels {
            *self.period_usage.entry(channel).or_insert(0) += 1;
        }

        for id in scheduled {
            self.step(id, now, sink);
        }

        let period = u64::from(self.config.tick_report_period.max(1));
        if self.ticks % period == 0 {
            self.flush_channel_ticks(sink);
        }
    }

    fn is_scheduled(&self, source: &Source) -> bool {
        source.state == SourceState::Running
            && source.is_hopping()
            && source.descriptor.is_some()
            && (!self.is_remote(source) || source.hop_driver == HopDriver::Controller)
    }

    fn step(&mut self, id: u16, now: Instant, sink: &mut dyn CommandSink) {
        let tps = self.config.ticks_per_second;
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        let Some(list) = self.lists.get(source.channel_list_id) else {
            let reason = format!("channel list {} disappeared", source.channel_list_id);
            self.fail_source(id, reason, sink);
            return;
        };

        source.countdown = source.countdown.saturating_sub(1);
        if source.countdown > 0 {
            return;
        }

        if advance(source, &list) {
            if let Some(started) = source.cycle_started.replace(now) {
                let cycle = now.saturating_duration_since(started);
                source.last_hop_cycle = Some(cycle);
                debug!(source_id = id, cycle_ms = cycle.as_millis() as u64, "hop cycle complete");
                self.report_status(id, sink);
            }
        }

        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        let Some(entry) = list.entry(source.position) else {
            return;
        };
        source.channel = entry.channel_at(source.range_position);
        source.countdown = countdown_for(entry, source, tps);
        self.apply_channel(id, sink);
    }

    /// Tune a source to its current channel, counting failures.
    pub(crate) fn apply_channel(&mut self, id: u16, sink: &mut dyn CommandSink) {
        let max_errors = self.config.max_consecutive_channel_errors;
        let remote = match self.sources.get(&id) {
            Some(source) => self.is_remote(source),
            None => return,
        };
        let Some(source) = self.sources.get_mut(&id) else {
            return;
        };
        if source.channel == 0 && !source.is_hopping() {
            return;
        }

        let result = if remote {
            send_chanset(source, sink)
                .map_err(|err| DriverError::Transient(err.to_string()))
        } else {
            source.driver.set_channel(&source.interface, source.channel)
        };

        match result {
            Ok(()) => {
                source.consecutive_channel_errors = 0;
            }
            Err(DriverError::Fatal(reason)) => {
                let reason = format!("channel {} failed: {reason}", source.channel);
                self.fail_source(id, reason, sink);
            }
            Err(DriverError::Transient(reason)) => {
                source.consecutive_channel_errors += 1;
                let errors = source.consecutive_channel_errors;
                if errors >= max_errors {
                    let reason = format!(
                        "{errors} consecutive channel failures, last on channel {}: {reason}",
                        source.channel
                    );
                    self.fail_source(id, reason, sink);
                } else {
                    warn!(
                        source_id = id,
                        channel = source.channel,
                        errors,
                        reason = %reason,
                        "channel change failed"
                    );
                }
            }
        }
    }

    /// Send or fold in the per-channel tick counts of the finished period.
    fn flush_channel_ticks(&mut self, sink: &mut dyn CommandSink) {
        let period: BTreeMap<u32, u32> = mem::take(&mut self.period_usage);
        if period.is_empty() {
            return;
        }
        if self.role() == Role::Helper {
            if !sink.is_linked() {
                return;
            }
            match wire::encode_channel_ticks(&period) {
                Ok(payload) => {
                    if let Err(err) = sink.send_command(wire::CHANNELTICKS, payload) {
                        warn!(error = %err, "could not send channel usage");
                    }
                }
                Err(err) => warn!(error = %err, "could not encode channel usage"),
            }
            return;
        }
        self.merge_channel_ticks(&period);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use capctl_ipc::{Detached, IpcError, MessageFlags};
    use bytes::Bytes;

    use super::*;
    use crate::chanlist::{parse_entries, ChannelListStore};
    use crate::driver::{Driver, DriverRegistry};
    use crate::drivers::{SimDriver, SimHandle};

    fn tracker() -> SourceTracker {
        let mut lists = ChannelListStore::with_defaults().unwrap();
        lists
            .define("ten", parse_entries("1,2,3,4,5,6,7,8,9,10").unwrap())
            .unwrap();
        lists.define("sweep", parse_entries("range-1-11-4-1").unwrap()).unwrap();
        SourceTracker::controller(DriverRegistry::with_defaults(), lists).with_privilege(false)
    }

    fn add_sim(tracker: &mut SourceTracker, definition: &str) -> (u16, SimHandle) {
        let driver = SimDriver::new();
        let handle = driver.handle();
        let id = tracker
            .add_source_with(definition, Some(Box::new(driver) as Box<dyn Driver>), &mut Detached)
            .unwrap();
        (id, handle)
    }

    fn run_ticks(tracker: &mut SourceTracker, ticks: u32) {
        let start = Instant::now();
        for i in 0..ticks {
            tracker.tick(start + Duration::from_millis(100 * u64::from(i)), &mut Detached);
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(String, Bytes)>,
    }

    impl CommandSink for Recorder {
        fn send_command(&mut self, name: &str, payload: Bytes) -> capctl_ipc::Result<()> {
            self.sent.push((name.to_string(), payload));
            Ok(())
        }

        fn send_message(&mut self, _flags: MessageFlags, _text: &str) -> capctl_ipc::Result<()> {
            Ok(())
        }

        fn is_linked(&self) -> bool {
            true
        }
    }

    #[test]
    fn countdowns() {
        let mut tracker = tracker();
        let (id, _) = add_sim(&mut tracker, "sim0:channellist=ten,hoprate=5");
        let source = tracker.source(id).unwrap();
        let weighted = ChannelEntry::Discrete {
            channel: 1,
            dwell_weight: 3,
        };
        let range = ChannelEntry::Range {
            start: 1,
            end: 11,
            width: 4,
            iteration_step: 1,
        };
        assert_eq!(countdown_for(&ChannelEntry::discrete(1), source, 10), 2);
        assert_eq!(countdown_for(&weighted, source, 10), 6);
        assert_eq!(countdown_for(&range, source, 10), 5);

        let (id, _) = add_sim(&mut tracker, "sim1:channellist=ten,dwell=2");
        let dwelling = tracker.source(id).unwrap();
        assert_eq!(countdown_for(&weighted, dwelling, 10), 60);

        let (id, _) = add_sim(&mut tracker, "sim2:channellist=ten,hoprate=10");
        let fastest = tracker.source(id).unwrap();
        assert_eq!(countdown_for(&range, fastest, 10), 1);
    }

    #[test]
    fn split_sources_stay_phase_shifted() {
        let mut tracker = tracker();
        let (a, radio_a) = add_sim(&mut tracker, "sim0:channellist=ten,hoprate=5,split=true");
        let (b, radio_b) = add_sim(&mut tracker, "sim1:channellist=ten,hoprate=5,split=true");
        assert_eq!(tracker.source(a).unwrap().position, 0);
        assert_eq!(tracker.source(b).unwrap().position, 6);

        tracker.start(a, &mut Detached).unwrap();
        tracker.start(b, &mut Detached).unwrap();
        run_ticks(&mut tracker, 40);

        let seq_a = radio_a.history();
        let seq_b = radio_b.history();
        assert_eq!(seq_a.len(), 21);
        assert_eq!(seq_b.len(), 21);
        for (i, &channel) in seq_b.iter().enumerate() {
            let expected = ((i + 6) % 10) as u32 + 1;
            assert_eq!(channel, expected, "hop {i}");
            assert_eq!(seq_a[i], (i % 10) as u32 + 1);
        }
        assert!(tracker.source(a).unwrap().last_hop_cycle.is_some());
    }

    #[test]
    fn range_entry_sweeps_before_moving_on() {
        let mut tracker = tracker();
        let (id, radio) = add_sim(&mut tracker, "sim0:channellist=sweep,hoprate=5");
        tracker.start(id, &mut Detached).unwrap();
        run_ticks(&mut tracker, 5 * 11);

        let history = radio.history();
        assert_eq!(history.len(), 12);
        assert_eq!(&history[..4], &[1, 5, 9, 2]);
        assert_eq!(history[11], 1);
        let distinct: BTreeSet<u32> = history[..11].iter().copied().collect();
        assert_eq!(distinct.len(), 11);
    }

    #[test]
    fn transient_failures_below_threshold_keep_hopping() {
        let mut tracker = tracker();
        let (id, radio) = add_sim(&mut tracker, "sim0:channellist=ten,hoprate=10");
        tracker.start(id, &mut Detached).unwrap();
        radio.fail_next_channel_sets(4);
        run_ticks(&mut tracker, 4);

        let source = tracker.source(id).unwrap();
        assert!(source.is_running());
        assert_eq!(source.consecutive_channel_errors, 4);
        assert_eq!(source.position, 4);

        run_ticks(&mut tracker, 1);
        let source = tracker.source(id).unwrap();
        assert_eq!(source.consecutive_channel_errors, 0);
        assert_eq!(radio.channel(), 6);
    }

    #[test]
    fn error_threshold_stops_scheduling() {
        let mut tracker = tracker();
        let (id, radio) = add_sim(&mut tracker, "sim0:channellist=ten,hoprate=10");
        tracker.start(id, &mut Detached).unwrap();
        radio.fail_next_channel_sets(100);
        run_ticks(&mut tracker, 5);

        let source = tracker.source(id).unwrap();
        assert!(source.is_error());
        assert!(!source.has_descriptor());
        assert!(source.warning.as_deref().unwrap().contains("5 consecutive"));
        let position = source.position;

        run_ticks(&mut tracker, 10);
        assert_eq!(tracker.source(id).unwrap().position, position);
    }

    #[test]
    fn fatal_driver_error_closes_immediately() {
        let mut tracker = tracker();
        let (id, radio) = add_sim(&mut tracker, "sim0:channellist=ten,hoprate=10");
        tracker.start(id, &mut Detached).unwrap();
        radio.fail_fatally("radio unplugged");
        run_ticks(&mut tracker, 1);
        assert!(tracker.source(id).unwrap().is_error());
        assert!(!radio.is_open());
    }

    #[test]
    fn usage_counts_each_channel_once_per_tick() {
        let mut tracker = tracker();
        let (a, _) = add_sim(&mut tracker, "sim0:channellist=ten,hoprate=1,split=false");
        let (b, _) = add_sim(&mut tracker, "sim1:channellist=ten,hoprate=1,split=false");
        tracker.start(a, &mut Detached).unwrap();
        tracker.start(b, &mut Detached).unwrap();
        run_ticks(&mut tracker, 10);

        assert_eq!(tracker.channel_usage().get(&1), Some(&10));
        assert_eq!(tracker.channel_usage().values().sum::<u64>(), 10);
    }

    #[test]
    fn helper_reports_usage_upstream() {
        let mut lists = ChannelListStore::with_defaults().unwrap();
        let ten = lists.define("ten", parse_entries("1,2,3,4,5,6,7,8,9,10").unwrap()).unwrap();
        let mut helper = SourceTracker::helper(DriverRegistry::with_defaults());
        helper.channel_lists_mut().insert(lists.get(ten).unwrap().as_ref().clone());
        helper
            .insert_remote(&wire::SourceAdd {
                source_id: 1,
                driver_type: "simroot".into(),
                source_line: "simroot0".into(),
                channel_list_id: ten,
                channel: 1,
                hop_enabled: true,
                dwell_seconds: 0,
                hop_rate: 5,
                position: 0,
            })
            .unwrap();

        let mut sink = Recorder::default();
        helper.start(1, &mut sink).unwrap();
        for i in 0..10u64 {
            helper.tick(Instant::now() + Duration::from_millis(100 * i), &mut sink);
        }

        let ticks: Vec<&Bytes> = sink
            .sent
            .iter()
            .filter(|(name, _)| name == wire::CHANNELTICKS)
            .map(|(_, payload)| payload)
            .collect();
        assert_eq!(ticks.len(), 1);
        let usage = wire::decode_channel_ticks(ticks[0]).unwrap();
        assert_eq!(usage.values().sum::<u32>(), 10);
        assert!(helper.channel_usage().is_empty());
    }

    #[test]
    fn controller_driven_hop_sends_fixed_chansets() {
        let mut tracker = tracker();
        let mut sink = Recorder::default();
        let id = tracker
            .add_source("simroot0:channellist=ten,hoprate=10,hopdriver=controller", &mut sink)
            .unwrap();
        tracker.start(id, &mut sink).unwrap();
        tracker.apply_report(&wire::SourceReport {
            source_id: id,
            status_flags: wire::STATUS_RUNNING,
            ..Default::default()
        });
        let (local, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        tracker.attach_descriptor(id, local.into());
        sink.sent.clear();

        run_ticks_with(&mut tracker, 3, &mut sink);
        let sets: Vec<wire::ChanSet> = sink
            .sent
            .iter()
            .filter(|(name, _)| name == wire::CHANSET)
            .map(|(_, payload)| wire::ChanSet::decode(payload).unwrap())
            .collect();
        assert_eq!(sets.len(), 3);
        assert!(sets.iter().all(|set| !set.hop_enabled));
        assert_eq!(
            sets.iter().map(|set| set.channel).collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
    }

    #[test]
    fn delegated_sources_are_left_to_the_helper() {
        let mut tracker = tracker();
        let mut sink = Recorder::default();
        let id = tracker
            .add_source("simroot0:channellist=ten,hoprate=10", &mut sink)
            .unwrap();
        tracker.start(id, &mut sink).unwrap();
        tracker.apply_report(&wire::SourceReport {
            source_id: id,
            status_flags: wire::STATUS_RUNNING,
            last_channel: 7,
            ..Default::default()
        });
        let (local, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        tracker.attach_descriptor(id, local.into());
        sink.sent.clear();

        run_ticks_with(&mut tracker, 5, &mut sink);
        assert!(sink.sent.is_empty());
        assert_eq!(tracker.source(id).unwrap().channel, 7);
    }

    #[test]
    fn unlinked_sink_errors_are_transient() {
        struct Refusing;
        impl CommandSink for Refusing {
            fn send_command(&mut self, name: &str, _payload: Bytes) -> capctl_ipc::Result<()> {
                Err(IpcError::NotSynced(name.to_string()))
            }
            fn send_message(&mut self, _flags: MessageFlags, _text: &str) -> capctl_ipc::Result<()> {
                Ok(())
            }
            fn is_linked(&self) -> bool {
                true
            }
        }

        let mut tracker = tracker();
        let mut sink = Recorder::default();
        let id = tracker
            .add_source("simroot0:channellist=ten,hoprate=10,hopdriver=controller", &mut sink)
            .unwrap();
        tracker.start(id, &mut sink).unwrap();
        tracker.apply_report(&wire::SourceReport {
            source_id: id,
            status_flags: wire::STATUS_RUNNING,
            ..Default::default()
        });
        let (local, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        tracker.attach_descriptor(id, local.into());

        run_ticks_with(&mut tracker, 1, &mut Refusing);
        assert_eq!(tracker.source(id).unwrap().consecutive_channel_errors, 1);
    }

    #[test]
    fn late_split_participant_retunes_running_sources() {
        let mut tracker = tracker();
        let (a, radio_a) = add_sim(&mut tracker, "sim0:channellist=ten,hoprate=1,split=true");
        let (b, radio_b) = add_sim(&mut tracker, "sim1:channellist=ten,hoprate=1,split=true");
        tracker.start(a, &mut Detached).unwrap();
        tracker.start(b, &mut Detached).unwrap();
        assert_eq!(radio_b.channel(), 7);

        let (c, _) = add_sim(&mut tracker, "sim2:channellist=ten,hoprate=1,split=true");
        let moved = tracker.source(b).unwrap();
        assert_eq!(moved.position, 4);
        assert_eq!(moved.channel, 5);
        assert_eq!(moved.countdown, 10);
        assert_eq!(radio_b.channel(), 5);
        assert_eq!(radio_a.channel(), 1);
        assert_eq!(tracker.source(c).unwrap().position, 8);

        run_ticks(&mut tracker, 10);
        assert_eq!(radio_b.channel(), 6);
    }

    #[test]
    fn untuned_source_reports_the_radio_channel() {
        let mut tracker = tracker();
        let mut driver = SimDriver::new();
        let radio = driver.handle();
        driver.set_channel("sim0", 11).unwrap();
        let id = tracker
            .add_source_with("sim0:channel=0", Some(Box::new(driver) as Box<dyn Driver>), &mut Detached)
            .unwrap();
        tracker.start(id, &mut Detached).unwrap();

        assert_eq!(tracker.source(id).unwrap().channel, 11);
        assert_eq!(radio.history(), vec![11]);
        run_ticks(&mut tracker, 10);
        assert_eq!(radio.history(), vec![11]);
    }

    #[test]
    fn locked_source_resumes_hopping_from_its_position() {
        let mut tracker = tracker();
        let (id, radio) = add_sim(&mut tracker, "sim0:channellist=ten,hoprate=10");
        tracker.start(id, &mut Detached).unwrap();
        run_ticks(&mut tracker, 3);
        assert_eq!(radio.channel(), 4);

        tracker.set_channel(id, 9, &mut Detached).unwrap();
        run_ticks(&mut tracker, 5);
        let source = tracker.source(id).unwrap();
        assert!(!source.is_hopping());
        assert_eq!(source.position, 3);
        assert_eq!(radio.channel(), 9);

        tracker.set_hopping(id, true, &mut Detached).unwrap();
        assert_eq!(radio.channel(), 4);
        run_ticks(&mut tracker, 2);
        assert_eq!(tracker.source(id).unwrap().position, 5);
        assert_eq!(radio.channel(), 6);
    }

    #[test]
    fn unlocking_a_delegated_source_tells_the_helper() {
        let mut tracker = tracker();
        let mut sink = Recorder::default();
        let id = tracker
            .add_source("simroot0:channellist=ten,hoprate=10", &mut sink)
            .unwrap();
        tracker.set_channel(id, 9, &mut sink).unwrap();
        tracker.set_hopping(id, true, &mut sink).unwrap();

        let sets: Vec<wire::ChanSet> = sink
            .sent
            .iter()
            .filter(|(name, _)| name == wire::CHANSET)
            .map(|(_, payload)| wire::ChanSet::decode(payload).unwrap())
            .collect();
        assert_eq!(sets.len(), 2);
        assert!(!sets[0].hop_enabled);
        assert_eq!(sets[0].channel, 9);
        assert!(sets[1].hop_enabled);
        assert_eq!(sets[1].position, 0);
    }

    fn run_ticks_with(tracker: &mut SourceTracker, ticks: u32, sink: &mut dyn CommandSink) {
        let start = Instant::now();
        for i in 0..ticks {
            tracker.tick(start + Duration::from_millis(100 * u64::from(i)), sink);
        }
    }
}
