//! Channel lists: what a hopping source cycles through.
//!
//! A list is an ordered set of entries. A discrete entry names one channel
//! and how many hop slots it holds; a range entry sweeps `start..=end` in a
//! strided order so adjacent channels are not visited back to back.
//!
//! Text form, comma separated:
//!
//! ```text
//! 1:3,6:3,11:3,2,7          discrete channels, optional ":weight"
//! range-1-11-4-1            start, end, width, iteration step
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SourceError};
use crate::wire::MAX_LIST_NAME_LEN;

/// Largest channel number the wire format carries; the top bit flags ranges.
pub const MAX_CHANNEL: u32 = 0x7FFF;

/// Name of the list used by drivers that never change channel.
pub const NO_CHANNELS: &str = "n/a";

/// Built-in lists, loaded into every [`ChannelListStore`].
pub const DEFAULT_LISTS: &[(&str, &str)] = &[
    ("IEEE80211b", "1:3,6:3,11:3,2,7,3,8,4,9,5,10"),
    ("IEEE80211a", "36,40,44,48,52,56,60,64,149,153,157,161,165"),
    (
        "IEEE80211ab",
        "1:3,6:3,11:3,2,7,3,8,4,9,5,10,36,40,44,48,52,56,60,64,149,153,157,161,165",
    ),
    (NO_CHANNELS, "0"),
];

/// One slot description in a channel list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEntry {
    /// A single channel held for `dwell_weight` hop slots.
    Discrete { channel: u32, dwell_weight: u32 },
    /// A strided sweep over `start..=end`.
    Range {
        start: u32,
        end: u32,
        width: u32,
        iteration_step: u32,
    },
}

impl ChannelEntry {
    pub fn discrete(channel: u32) -> Self {
        Self::Discrete {
            channel,
            dwell_weight: 1,
        }
    }

    /// Hop-slot multiplier; ranges always count once per channel.
    pub fn dwell_weight(&self) -> u32 {
        match *self {
            ChannelEntry::Discrete { dwell_weight, .. } => dwell_weight,
            ChannelEntry::Range { .. } => 1,
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(self, ChannelEntry::Range { .. })
    }

    /// Number of distinct slots in a range; 1 for a discrete entry.
    pub fn range_total(&self) -> usize {
        match *self {
            ChannelEntry::Discrete { .. } => 1,
            ChannelEntry::Range {
                start,
                end,
                iteration_step,
                ..
            } => ((end - start) / iteration_step) as usize + 1,
        }
    }

    /// Channel for the given sweep position.
    ///
    /// `slot = (range_position * width / step) mod total`. When the jump
    /// shares a factor with `total` the sweep repeats before covering every
    /// slot.
    pub fn channel_at(&self, range_position: usize) -> u32 {
        match *self {
            ChannelEntry::Discrete { channel, .. } => channel,
            ChannelEntry::Range {
                start,
                width,
                iteration_step,
                ..
            } => {
                let total = self.range_total();
                let jump = (width / iteration_step) as usize;
                let slot = (range_position * jump) % total;
                start + slot as u32 * iteration_step
            }
        }
    }

    /// First channel this entry tunes to.
    pub fn first_channel(&self) -> u32 {
        self.channel_at(0)
    }

    pub(crate) fn validate(&self, text: &str) -> Result<()> {
        match *self {
            ChannelEntry::Discrete {
                channel,
                dwell_weight,
            } => {
                if channel > MAX_CHANNEL {
                    return Err(SourceError::channel_list(
                        text,
                        format!("channel {channel} exceeds {MAX_CHANNEL}"),
                    ));
                }
                if dwell_weight == 0 || dwell_weight > u32::from(u16::MAX) {
                    return Err(SourceError::channel_list(
                        text,
                        format!("dwell weight {dwell_weight} out of range"),
                    ));
                }
            }
            ChannelEntry::Range {
                start,
                end,
                width,
                iteration_step,
            } => {
                if iteration_step == 0 {
                    return Err(SourceError::channel_list(text, "range step must be non-zero"));
                }
                if width == 0 {
                    return Err(SourceError::channel_list(text, "range width must be non-zero"));
                }
                if end < start {
                    return Err(SourceError::channel_list(text, "range end precedes start"));
                }
                if end > MAX_CHANNEL || width > u32::from(u16::MAX) || iteration_step > u32::from(u16::MAX) {
                    return Err(SourceError::channel_list(text, "range field exceeds 16 bits"));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ChannelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ChannelEntry::Discrete {
                channel,
                dwell_weight: 1,
            } => write!(f, "{channel}"),
            ChannelEntry::Discrete {
                channel,
                dwell_weight,
            } => write!(f, "{channel}:{dwell_weight}"),
            ChannelEntry::Range {
                start,
                end,
                width,
                iteration_step,
            } => write!(f, "range-{start}-{end}-{width}-{iteration_step}"),
        }
    }
}

/// Parse the comma-separated entry syntax.
pub fn parse_entries(text: &str) -> Result<Vec<ChannelEntry>> {
    let mut entries = Vec::new();
    for token in text.split(',') {
        let token = token.trim();
        if token.is_empty() {
            return Err(SourceError::channel_list(text, "empty entry"));
        }
        let entry = parse_entry(text, token)?;
        entry.validate(text)?;
        entries.push(entry);
    }
    Ok(entries)
}

fn parse_entry(text: &str, token: &str) -> Result<ChannelEntry> {
    let number = |field: &str| -> Result<u32> {
        field
            .trim()
            .parse::<u32>()
            .map_err(|_| SourceError::channel_list(text, format!("'{field}' is not a number")))
    };

    if let Some(rest) = token.strip_prefix("range-") {
        let fields: Vec<&str> = rest.split('-').collect();
        let [start, end, width, step] = fields.as_slice() else {
            return Err(SourceError::channel_list(
                text,
                format!("'{token}' needs range-start-end-width-step"),
            ));
        };
        return Ok(ChannelEntry::Range {
            start: number(start)?,
            end: number(end)?,
            width: number(width)?,
            iteration_step: number(step)?,
        });
    }

    match token.split_once(':') {
        Some((channel, weight)) => Ok(ChannelEntry::Discrete {
            channel: number(channel)?,
            dwell_weight: number(weight)?,
        }),
        None => Ok(ChannelEntry::discrete(number(token)?)),
    }
}

/// Parse a `name:entries` command-line list definition.
pub fn parse_named(definition: &str) -> Result<(String, Vec<ChannelEntry>)> {
    let Some((name, entries)) = definition.split_once(':') else {
        return Err(SourceError::channel_list(definition, "expected name:entries"));
    };
    let name = name.trim();
    if name.is_empty() {
        return Err(SourceError::channel_list(definition, "list name is empty"));
    }
    Ok((name.to_string(), parse_entries(entries)?))
}

/// Format entries back into the text syntax.
pub fn format_entries(entries: &[ChannelEntry]) -> String {
    entries
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// An immutable, identified channel list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelList {
    pub id: u16,
    pub name: String,
    pub entries: Vec<ChannelEntry>,
}

impl ChannelList {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry at `position`, wrapping.
    pub fn entry(&self, position: usize) -> Option<&ChannelEntry> {
        if self.entries.is_empty() {
            return None;
        }
        self.entries.get(position % self.entries.len())
    }

    /// True when the list has a single fixed channel.
    pub fn is_fixed(&self) -> bool {
        self.entries.len() == 1 && !self.entries[0].is_range()
    }
}

/// All channel lists known to a process, addressed by ID.
///
/// Lists are shared by reference and never edited in place: redefining a
/// name allocates a new ID, and hardware-derived lists with identical
/// content share one ID.
#[derive(Debug)]
pub struct ChannelListStore {
    lists: BTreeMap<u16, Arc<ChannelList>>,
    by_name: HashMap<String, u16>,
    hardware: HashMap<Vec<ChannelEntry>, u16>,
    next_id: u16,
}

impl ChannelListStore {
    /// An empty store; IDs start at 1.
    pub fn empty() -> Self {
        Self {
            lists: BTreeMap::new(),
            by_name: HashMap::new(),
            hardware: HashMap::new(),
            next_id: 1,
        }
    }

    /// A store holding the built-in lists.
    pub fn with_defaults() -> Result<Self> {
        let mut store = Self::empty();
        for (name, entries) in DEFAULT_LISTS {
            store.define(name, parse_entries(entries)?)?;
        }
        Ok(store)
    }

    /// Define (or redefine) a named list and return its ID.
    ///
    /// Redefining with identical entries returns the existing ID.
    pub fn define(&mut self, name: &str, entries: Vec<ChannelEntry>) -> Result<u16> {
        if entries.is_empty() {
            return Err(SourceError::channel_list(name, "list has no entries"));
        }
        if name.len() > MAX_LIST_NAME_LEN {
            return Err(SourceError::channel_list(name, "list name is too long"));
        }
        for entry in &entries {
            entry.validate(name)?;
        }
        if let Some(&id) = self.by_name.get(name) {
            if self.lists.get(&id).is_some_and(|list| list.entries == entries) {
                return Ok(id);
            }
        }
        let id = self.allocate(name.to_string(), entries)?;
        self.by_name.insert(name.to_string(), id);
        debug!(list = name, id, "defined channel list");
        Ok(id)
    }

    /// Intern a list reported by hardware, reusing an identical earlier one.
    pub fn intern_hardware(&mut self, channels: &[u32]) -> Result<u16> {
        let entries: Vec<ChannelEntry> = channels.iter().copied().map(ChannelEntry::discrete).collect();
        if entries.is_empty() {
            return Err(SourceError::channel_list("", "hardware reported no channels"));
        }
        for entry in &entries {
            entry.validate("hardware")?;
        }
        if let Some(&id) = self.hardware.get(&entries) {
            return Ok(id);
        }
        let name = format!("hw-{}", self.next_id);
        let id = self.allocate(name.clone(), entries.clone())?;
        self.hardware.insert(entries, id);
        debug!(list = %name, id, "interned hardware channel list");
        Ok(id)
    }

    /// Store a list received from the peer under its own ID.
    pub fn insert(&mut self, list: ChannelList) {
        let id = list.id;
        self.by_name.insert(list.name.clone(), id);
        self.next_id = self.next_id.max(id.saturating_add(1));
        self.lists.insert(id, Arc::new(list));
    }

    pub fn get(&self, id: u16) -> Option<Arc<ChannelList>> {
        self.lists.get(&id).cloned()
    }

    pub fn id_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }

    /// Resolve a list name to its ID.
    pub fn lookup(&self, name: &str) -> Result<u16> {
        self.id_of(name)
            .ok_or_else(|| SourceError::UnknownChannelListName(name.to_string()))
    }

    pub fn contains(&self, id: u16) -> bool {
        self.lists.contains_key(&id)
    }

    /// Lists in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChannelList>> {
        self.lists.values()
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    fn allocate(&mut self, name: String, entries: Vec<ChannelEntry>) -> Result<u16> {
        let id = self.next_id;
        if id == u16::MAX {
            return Err(SourceError::ChannelListIdsExhausted);
        }
        self.next_id += 1;
        self.lists.insert(id, Arc::new(ChannelList { id, name, entries }));
        Ok(id)
    }
}
