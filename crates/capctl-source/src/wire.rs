//! Payloads of the source-management commands.
//!
//! All integers are little-endian. Strings carry a `u16` length prefix.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::chanlist::{ChannelEntry, ChannelList};
use crate::error::{Result, SourceError};

pub const SOURCEADD: &str = "SOURCEADD";
pub const SOURCERUN: &str = "SOURCERUN";
pub const SOURCEREMOVE: &str = "SOURCEREMOVE";
pub const CHANLIST: &str = "CHANLIST";
pub const CHANSET: &str = "CHANSET";
/// Leading `CHANSET` bytes that name the source; a newer set for the same
/// source replaces an unsent older one.
pub const CHANSET_KEY_LEN: usize = 2;
pub const SOURCEREPORT: &str = "SOURCEREPORT";
pub const CHANNELTICKS: &str = "CHANNELTICKS";
pub const SOURCEFD: &str = "SOURCEFD";

/// Commands the controller sends to the helper.
pub const CONTROLLER_COMMANDS: &[&str] = &[SOURCEADD, SOURCERUN, SOURCEREMOVE, CHANLIST, CHANSET];

/// Commands the helper sends to the controller.
pub const HELPER_COMMANDS: &[&str] = &[SOURCEREPORT, CHANNELTICKS, SOURCEFD];

pub const MAX_DRIVER_TYPE_LEN: usize = 64;
pub const MAX_SOURCE_LINE_LEN: usize = 1024;
pub const MAX_LIST_NAME_LEN: usize = 64;
pub const MAX_WARNING_LEN: usize = 1024;

const RANGE_FLAG: u16 = 0x8000;

/// Capability bits in [`SourceReport::capability_flags`].
pub const CAP_HOP: u32 = 0x01;
pub const CAP_PRIVILEGED: u32 = 0x02;
pub const CAP_DESCRIPTOR: u32 = 0x04;

/// Status bits in [`SourceReport::status_flags`].
pub const STATUS_RUNNING: u32 = 0x01;
pub const STATUS_ERROR: u32 = 0x02;

/// Controller asks the helper to create a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAdd {
    pub source_id: u16,
    pub driver_type: String,
    pub source_line: String,
    pub channel_list_id: u16,
    pub channel: u32,
    pub hop_enabled: bool,
    pub dwell_seconds: i32,
    pub hop_rate: i32,
    pub position: i32,
}

impl SourceAdd {
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(32 + self.driver_type.len() + self.source_line.len());
        buf.put_u16_le(self.source_id);
        put_str(&mut buf, SOURCEADD, &self.driver_type, MAX_DRIVER_TYPE_LEN)?;
        put_str(&mut buf, SOURCEADD, &self.source_line, MAX_SOURCE_LINE_LEN)?;
        buf.put_u16_le(self.channel_list_id);
        buf.put_u32_le(self.channel);
        buf.put_i32_le(i32::from(self.hop_enabled));
        buf.put_i32_le(self.dwell_seconds);
        buf.put_i32_le(self.hop_rate);
        buf.put_i32_le(self.position);
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        let buf = &mut payload;
        let source_id = get_u16(buf, SOURCEADD)?;
        let driver_type = get_str(buf, SOURCEADD, MAX_DRIVER_TYPE_LEN)?;
        let source_line = get_str(buf, SOURCEADD, MAX_SOURCE_LINE_LEN)?;
        need(buf, SOURCEADD, 2 + 4 + 16)?;
        let add = Self {
            source_id,
            driver_type,
            source_line,
            channel_list_id: buf.get_u16_le(),
            channel: buf.get_u32_le(),
            hop_enabled: buf.get_i32_le() != 0,
            dwell_seconds: buf.get_i32_le(),
            hop_rate: buf.get_i32_le(),
            position: buf.get_i32_le(),
        };
        finish(buf, SOURCEADD)?;
        Ok(add)
    }
}

/// Controller starts or stops a source held by the helper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRun {
    pub source_id: u16,
    pub start: bool,
}

impl SourceRun {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u16_le(self.source_id);
        buf.put_u8(u8::from(self.start));
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        let buf = &mut payload;
        need(buf, SOURCERUN, 3)?;
        let run = Self {
            source_id: buf.get_u16_le(),
            start: buf.get_u8() != 0,
        };
        finish(buf, SOURCERUN)?;
        Ok(run)
    }
}

/// Encode a bare source ID, used by `SOURCEREMOVE` and `SOURCEFD`.
pub fn encode_source_id(source_id: u16) -> Bytes {
    Bytes::copy_from_slice(&source_id.to_le_bytes())
}

pub fn decode_source_id(command: &'static str, mut payload: &[u8]) -> Result<u16> {
    let buf = &mut payload;
    let id = get_u16(buf, command)?;
    finish(buf, command)?;
    Ok(id)
}

/// `CHANLIST`: one channel list with its ID and name.
pub fn encode_channel_list(list: &ChannelList) -> Result<Bytes> {
    let count = u16::try_from(list.entries.len())
        .map_err(|_| SourceError::payload(CHANLIST, "too many entries"))?;
    let mut buf = BytesMut::with_capacity(8 + list.name.len() + list.entries.len() * 8);
    buf.put_u16_le(list.id);
    buf.put_u16_le(count);
    for entry in &list.entries {
        match *entry {
            ChannelEntry::Discrete {
                channel,
                dwell_weight,
            } => {
                buf.put_u16_le(field(channel, CHANLIST)?);
                buf.put_u16_le(field(dwell_weight, CHANLIST)?);
            }
            ChannelEntry::Range {
                start,
                end,
                width,
                iteration_step,
            } => {
                buf.put_u16_le(field(start, CHANLIST)? | RANGE_FLAG);
                buf.put_u16_le(field(end, CHANLIST)?);
                buf.put_u16_le(field(width, CHANLIST)?);
                buf.put_u16_le(field(iteration_step, CHANLIST)?);
            }
        }
    }
    put_str(&mut buf, CHANLIST, &list.name, MAX_LIST_NAME_LEN)?;
    Ok(buf.freeze())
}

pub fn decode_channel_list(mut payload: &[u8]) -> Result<ChannelList> {
    let buf = &mut payload;
    need(buf, CHANLIST, 4)?;
    let id = buf.get_u16_le();
    let count = buf.get_u16_le();
    let mut entries = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        need(buf, CHANLIST, 4)?;
        let first = buf.get_u16_le();
        let entry = if first & RANGE_FLAG != 0 {
            let end = buf.get_u16_le();
            need(buf, CHANLIST, 4)?;
            ChannelEntry::Range {
                start: u32::from(first & !RANGE_FLAG),
                end: u32::from(end),
                width: u32::from(buf.get_u16_le()),
                iteration_step: u32::from(buf.get_u16_le()),
            }
        } else {
            ChannelEntry::Discrete {
                channel: u32::from(first),
                dwell_weight: u32::from(buf.get_u16_le()),
            }
        };
        entry
            .validate(CHANLIST)
            .map_err(|err| SourceError::payload(CHANLIST, err.to_string()))?;
        entries.push(entry);
    }
    let name = get_str(buf, CHANLIST, MAX_LIST_NAME_LEN)?;
    finish(buf, CHANLIST)?;
    if entries.is_empty() {
        return Err(SourceError::payload(CHANLIST, "list has no entries"));
    }
    Ok(ChannelList { id, name, entries })
}

/// Reconfigure a source's channel or hop settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChanSet {
    pub source_id: u16,
    pub channel_list_id: u16,
    pub channel: u32,
    pub hop_enabled: bool,
    pub dwell_seconds: i32,
    pub hop_rate: i32,
    pub split_enabled: bool,
    pub position: i32,
}

impl ChanSet {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(28);
        buf.put_u16_le(self.source_id);
        buf.put_u16_le(self.channel_list_id);
        buf.put_u32_le(self.channel);
        buf.put_i32_le(i32::from(self.hop_enabled));
        buf.put_i32_le(self.dwell_seconds);
        buf.put_i32_le(self.hop_rate);
        buf.put_i32_le(i32::from(self.split_enabled));
        buf.put_i32_le(self.position);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        let buf = &mut payload;
        need(buf, CHANSET, 28)?;
        let set = Self {
            source_id: buf.get_u16_le(),
            channel_list_id: buf.get_u16_le(),
            channel: buf.get_u32_le(),
            hop_enabled: buf.get_i32_le() != 0,
            dwell_seconds: buf.get_i32_le(),
            hop_rate: buf.get_i32_le(),
            split_enabled: buf.get_i32_le() != 0,
            position: buf.get_i32_le(),
        };
        finish(buf, CHANSET)?;
        Ok(set)
    }
}

/// Helper reports a source's status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceReport {
    pub source_id: u16,
    pub channel_list_id: u16,
    pub capability_flags: u32,
    pub status_flags: u32,
    pub hop_cycle_seconds: u32,
    pub hop_cycle_micros: u32,
    pub last_channel: u32,
    pub warning: String,
}

impl SourceReport {
    pub fn is_running(&self) -> bool {
        self.status_flags & STATUS_RUNNING != 0
    }

    pub fn is_error(&self) -> bool {
        self.status_flags & STATUS_ERROR != 0
    }

    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(30 + self.warning.len());
        buf.put_u16_le(self.source_id);
        buf.put_u16_le(self.channel_list_id);
        buf.put_u32_le(self.capability_flags);
        buf.put_u32_le(self.status_flags);
        buf.put_u32_le(self.hop_cycle_seconds);
        buf.put_u32_le(self.hop_cycle_micros);
        buf.put_u32_le(self.last_channel);
        put_str(&mut buf, SOURCEREPORT, &self.warning, MAX_WARNING_LEN)?;
        Ok(buf.freeze())
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self> {
        let buf = &mut payload;
        need(buf, SOURCEREPORT, 24)?;
        let mut report = Self {
            source_id: buf.get_u16_le(),
            channel_list_id: buf.get_u16_le(),
            capability_flags: buf.get_u32_le(),
            status_flags: buf.get_u32_le(),
            hop_cycle_seconds: buf.get_u32_le(),
            hop_cycle_micros: buf.get_u32_le(),
            last_channel: buf.get_u32_le(),
            warning: String::new(),
        };
        report.warning = get_str(buf, SOURCEREPORT, MAX_WARNING_LEN)?;
        finish(buf, SOURCEREPORT)?;
        Ok(report)
    }
}

/// `CHANNELTICKS`: ticks spent per channel over one reporting period.
pub fn encode_channel_ticks(ticks: &BTreeMap<u32, u32>) -> Result<Bytes> {
    let count = u16::try_from(ticks.len())
        .map_err(|_| SourceError::payload(CHANNELTICKS, "too many channels"))?;
    let mut buf = BytesMut::with_capacity(2 + ticks.len() * 8);
    buf.put_u16_le(count);
    for (&channel, &count) in ticks {
        buf.put_u32_le(channel);
        buf.put_u32_le(count);
    }
    Ok(buf.freeze())
}

pub fn decode_channel_ticks(mut payload: &[u8]) -> Result<BTreeMap<u32, u32>> {
    let buf = &mut payload;
    let count = get_u16(buf, CHANNELTICKS)?;
    need(buf, CHANNELTICKS, usize::from(count) * 8)?;
    let mut ticks = BTreeMap::new();
    for _ in 0..count {
        let channel = buf.get_u32_le();
        *ticks.entry(channel).or_insert(0) += buf.get_u32_le();
    }
    finish(buf, CHANNELTICKS)?;
    Ok(ticks)
}

fn field(value: u32, command: &'static str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| SourceError::payload(command, format!("value {value} does not fit 16 bits")))
}

fn put_str(buf: &mut BytesMut, command: &'static str, value: &str, max: usize) -> Result<()> {
    if value.len() > max {
        return Err(SourceError::payload(
            command,
            format!("string of {} bytes exceeds {max}", value.len()),
        ));
    }
    buf.put_u16_le(value.len() as u16);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_str(buf: &mut &[u8], command: &'static str, max: usize) -> Result<String> {
    let len = usize::from(get_u16(buf, command)?);
    if len > max {
        return Err(SourceError::payload(command, format!("string length {len} exceeds {max}")));
    }
    need(buf, command, len)?;
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|_| SourceError::payload(command, "string is not UTF-8"))?
        .to_string();
    buf.advance(len);
    Ok(value)
}

fn get_u16(buf: &mut &[u8], command: &'static str) -> Result<u16> {
    need(buf, command, 2)?;
    Ok(buf.get_u16_le())
}

fn need(buf: &&[u8], command: &'static str, len: usize) -> Result<()> {
    if buf.remaining() < len {
        return Err(SourceError::payload(
            command,
            format!("truncated: need {len} bytes, have {}", buf.remaining()),
        ));
    }
    Ok(())
}

fn finish(buf: &&[u8], command: &'static str) -> Result<()> {
    if buf.has_remaining() {
        return Err(SourceError::payload(
            command,
            format!("{} trailing bytes", buf.remaining()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add() -> SourceAdd {
        SourceAdd {
            source_id: 7,
            driver_type: "linuxwifi".into(),
            source_line: "wlan0:hoprate=5".into(),
            channel_list_id: 3,
            channel: 6,
            hop_enabled: true,
            dwell_seconds: 0,
            hop_rate: 5,
            position: 4,
        }
    }

    #[test]
    fn source_add_layout() {
        let bytes = add().encode().unwrap();
        assert_eq!(&bytes[0..2], &7u16.to_le_bytes());
        assert_eq!(&bytes[2..4], &9u16.to_le_bytes());
        assert_eq!(&bytes[4..13], b"linuxwifi");
        assert_eq!(SourceAdd::decode(&bytes).unwrap(), add());
    }

    #[test]
    fn source_add_limits_and_truncation() {
        let mut long = add();
        long.driver_type = "x".repeat(MAX_DRIVER_TYPE_LEN + 1);
        assert!(long.encode().is_err());

        let bytes = add().encode().unwrap();
        assert!(SourceAdd::decode(&bytes[..bytes.len() - 1]).is_err());
        let mut extra = bytes.to_vec();
        extra.push(0);
        assert!(SourceAdd::decode(&extra).is_err());
    }

    #[test]
    fn channel_list_flags_ranges_in_top_bit() {
        let list = ChannelList {
            id: 5,
            name: "mixed".into(),
            entries: vec![
                ChannelEntry::Discrete {
                    channel: 6,
                    dwell_weight: 3,
                },
                ChannelEntry::Range {
                    start: 1,
                    end: 11,
                    width: 4,
                    iteration_step: 1,
                },
            ],
        };
        let bytes = encode_channel_list(&list).unwrap();
        assert_eq!(&bytes[0..4], &[5, 0, 2, 0]);
        assert_eq!(&bytes[4..8], &[6, 0, 3, 0]);
        assert_eq!(&bytes[8..10], &(1u16 | 0x8000).to_le_bytes());
        assert_eq!(decode_channel_list(&bytes).unwrap(), list);
    }

    #[test]
    fn channel_list_rejects_invalid_entries() {
        let mut buf = BytesMut::new();
        buf.put_u16_le(1);
        buf.put_u16_le(1);
        buf.put_u16_le(6);
        buf.put_u16_le(0);
        buf.put_u16_le(0);
        assert!(decode_channel_list(&buf).is_err());
    }

    #[test]
    fn chanset_and_report() {
        let set = ChanSet {
            source_id: 1,
            channel_list_id: 2,
            channel: 11,
            hop_enabled: false,
            dwell_seconds: 0,
            hop_rate: 5,
            split_enabled: true,
            position: 6,
        };
        assert_eq!(ChanSet::decode(&set.encode()).unwrap(), set);

        let report = SourceReport {
            source_id: 4,
            status_flags: STATUS_ERROR,
            warning: "unknown channel list 9".into(),
            ..SourceReport::default()
        };
        let decoded = SourceReport::decode(&report.encode().unwrap()).unwrap();
        assert!(decoded.is_error());
        assert!(!decoded.is_running());
        assert_eq!(decoded.warning, "unknown channel list 9");
    }

    #[test]
    fn channel_ticks_and_ids() {
        let ticks = BTreeMap::from([(1, 10), (6, 4)]);
        assert_eq!(decode_channel_ticks(&encode_channel_ticks(&ticks).unwrap()).unwrap(), ticks);
        assert_eq!(decode_source_id(SOURCEFD, &encode_source_id(42)).unwrap(), 42);
        assert!(decode_source_id(SOURCEFD, &[1]).is_err());

        let run = SourceRun { source_id: 3, start: true };
        assert_eq!(SourceRun::decode(&run.encode()).unwrap(), run);
    }
}
