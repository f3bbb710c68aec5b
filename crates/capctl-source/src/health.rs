//! Silent-disconnect detection and the reopen timer.

use std::time::{Duration, Instant};

use capctl_ipc::CommandSink;
use tracing::{debug, info};

use crate::source::SourceState;
use crate::tracker::SourceTracker;

/// Fires at a fixed interval, starting one interval after the first check.
#[derive(Debug, Clone)]
pub struct ReopenTimer {
    interval: Duration,
    next: Option<Instant>,
}

impl ReopenTimer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: None,
        }
    }

    /// True once per elapsed interval.
    pub fn is_due(&mut self, now: Instant) -> bool {
        match self.next {
            None => {
                self.next = Some(now + self.interval);
                false
            }
            Some(next) if now >= next => {
                self.next = Some(now + self.interval);
                true
            }
            Some(_) => false,
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.next
    }
}

impl SourceTracker {
    /// Record the result of reading a source's capture descriptor.
    ///
    /// Returns true when this read pushed the source into error.
    pub fn record_poll(&mut self, id: u16, bytes: usize, sink: &mut dyn CommandSink) -> bool {
        let threshold = self.config.zero_poll_threshold;
        let Some(source) = self.sources.get_mut(&id) else {
            return false;
        };
        if source.state != SourceState::Running {
            return false;
        }
        if bytes > 0 {
            source.zero_poll_count = 0;
            source.packets += 1;
            source.bytes += bytes as u64;
            return false;
        }

        source.zero_poll_count += 1;
        if source.zero_poll_count < threshold {
            return false;
        }
        let reason = format!(
            "capture returned no data {} times in a row; assuming the device is gone",
            source.zero_poll_count
        );
        self.fail_source(id, reason, sink);
        true
    }

    /// Retry errored sources whose reopen interval has elapsed.
    ///
    /// Returns the sources that were resubmitted.
    pub fn reopen_due(&mut self, now: Instant, sink: &mut dyn CommandSink) -> Vec<u16> {
        if !self.reopen.is_due(now) {
            return Vec::new();
        }
        let candidates: Vec<u16> = self
            .sources
            .values()
            .filter(|s| s.is_error() && s.reopen_on_error && !s.permanent_error && s.start_requested)
            .map(|s| s.id)
            .collect();

        for &id in &candidates {
            if let Some(source) = self.sources.get_mut(&id) {
                source.state = SourceState::Reopening;
                info!(source_id = id, name = %source.name, "reopening source");
            }
            if let Err(err) = self.start(id, sink) {
                debug!(source_id = id, error = %err, "reopen failed");
            }
        }
        candidates
    }
}
