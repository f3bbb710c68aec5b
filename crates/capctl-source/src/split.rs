//! Spreading sources that share a channel list across it.

use tracing::{debug, warn};

use crate::tracker::SourceTracker;

/// Starting positions for `participants` sources on a list of `len` entries.
///
/// Source `i` starts at `(i * (1 + len / participants)) mod len`; a slot
/// already taken probes forward, so positions are distinct while
/// `participants <= len`.
pub fn split_positions(len: usize, participants: usize) -> Vec<usize> {
    if len == 0 || participants == 0 {
        return vec![0; participants];
    }
    let offset = 1 + len / participants;
    let mut taken = vec![false; len];
    let mut positions = Vec::with_capacity(participants);
    for index in 0..participants {
        let mut position = (index * offset) % len;
        if positions.len() < len {
            while taken[position] {
                position = (position + 1) % len;
            }
        }
        taken[position] = true;
        positions.push(position);
    }
    positions
}

impl SourceTracker {
    /// Recompute split positions for every splitting, hopping source on
    /// `list_id`. Returns the sources whose position changed.
    pub(crate) fn assign_split(&mut self, list_id: u16) -> Vec<u16> {
        let Some(list) = self.lists.get(list_id) else {
            return Vec::new();
        };
        let participants: Vec<u16> = self
            .sources
            .values()
            .filter(|s| {
                s.channel_list_id == list_id && s.split_enabled && s.is_hopping() && !s.permanent_error
            })
            .map(|s| s.id)
            .collect();
        if participants.len() < 2 {
            return Vec::new();
        }

        let rates: Vec<(i32, i32)> = participants
            .iter()
            .filter_map(|id| self.sources.get(id))
            .map(|s| (s.hop_rate, s.dwell_seconds))
            .collect();
        let mismatched = rates.windows(2).any(|pair| pair[0] != pair[1]);
        if mismatched {
            warn!(
                channel_list = %list.name,
                "sources splitting one channel list hop at different rates and will drift"
            );
        }

        let positions = split_positions(list.len(), participants.len());
        let mut moved = Vec::new();
        for (id, position) in participants.into_iter().zip(positions) {
            let Some(source) = self.sources.get_mut(&id) else {
                continue;
            };
            if mismatched && source.warning.is_none() {
                source.warning = Some(format!(
                    "hop settings differ from other sources on channel list {}",
                    list.name
                ));
            }
            if source.position != position {
                source.position = position;
                source.range_position = 0;
                if let Some(entry) = list.entry(position) {
                    source.channel = entry.first_channel();
                }
                moved.push(id);
            }
            debug!(source_id = id, position, channel_list = %list.name, "split position");
        }
        moved
    }
}
