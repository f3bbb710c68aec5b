use std::collections::BTreeMap;
use std::io::IsTerminal;

use capctl_source::chanlist::format_entries;
use capctl_source::{ChannelList, DriverInfo, SourceSummary};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

#[derive(Serialize)]
struct RunReport<'a> {
    sources: &'a [SourceSummary],
    channel_usage: &'a BTreeMap<u32, u64>,
    ticks: u64,
}

pub fn print_sources(
    sources: &[SourceSummary],
    channel_usage: &BTreeMap<u32, u64>,
    ticks: u64,
    format: OutputFormat,
) {
    match format {
        OutputFormat::Json => print_json(&RunReport {
            sources,
            channel_usage,
            ticks,
        }),
        OutputFormat::Table => {
            let mut out = table(vec![
                "ID", "NAME", "DRIVER", "STATE", "CHANNEL", "HOP", "PACKETS", "WARNING",
            ]);
            for source in sources {
                out.add_row(vec![
                    source.id.to_string(),
                    source.name.clone(),
                    source.driver.clone(),
                    source.state.to_string(),
                    source.channel.to_string(),
                    hop_label(source),
                    source.packets.to_string(),
                    source.warning.clone().unwrap_or_default(),
                ]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            for source in sources {
                println!(
                    "source={} name={} driver={} state={} channel={} hop={} packets={} bytes={}{}",
                    source.id,
                    source.name,
                    source.driver,
                    source.state,
                    source.channel,
                    hop_label(source),
                    source.packets,
                    source.bytes,
                    source
                        .warning
                        .as_deref()
                        .map(|w| format!(" warning=\"{w}\""))
                        .unwrap_or_default()
                );
            }
            let usage: Vec<String> = channel_usage
                .iter()
                .map(|(channel, ticks)| format!("{channel}:{ticks}"))
                .collect();
            println!("ticks={ticks} usage={}", usage.join(","));
        }
    }
}

fn hop_label(source: &SourceSummary) -> String {
    match (source.hopping, source.hop_cycle_ms) {
        (false, _) => "fixed".to_string(),
        (true, Some(ms)) => format!("cycle {ms}ms"),
        (true, None) => "hopping".to_string(),
    }
}

pub fn print_drivers(drivers: &[DriverInfo], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&drivers),
        OutputFormat::Table => {
            let mut out = table(vec!["TYPE", "PRIVILEGED", "HOP", "CHANNEL LIST", "DESCRIPTION"]);
            for driver in drivers {
                out.add_row(vec![
                    driver.type_name.to_string(),
                    yes_no(driver.requires_privilege),
                    yes_no(driver.can_hop),
                    driver.default_channel_list.to_string(),
                    driver.description.to_string(),
                ]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            for driver in drivers {
                println!(
                    "{} privileged={} hop={} list={} ({})",
                    driver.type_name,
                    driver.requires_privilege,
                    driver.can_hop,
                    driver.default_channel_list,
                    driver.description
                );
            }
        }
    }
}

#[derive(Serialize)]
struct ListOutput<'a> {
    id: u16,
    name: &'a str,
    definition: String,
    entries: usize,
}

pub fn print_channel_lists<'a>(
    lists: impl IntoIterator<Item = &'a ChannelList>,
    format: OutputFormat,
) {
    let rows: Vec<ListOutput<'_>> = lists
        .into_iter()
        .map(|list| ListOutput {
            id: list.id,
            name: &list.name,
            definition: format_entries(&list.entries),
            entries: list.len(),
        })
        .collect();
    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Table => {
            let mut out = table(vec!["ID", "NAME", "ENTRIES", "CHANNELS"]);
            for row in &rows {
                out.add_row(vec![
                    row.id.to_string(),
                    row.name.to_string(),
                    row.entries.to_string(),
                    row.definition.clone(),
                ]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            for row in &rows {
                println!("{} {}:{}", row.id, row.name, row.definition);
            }
        }
    }
}

fn yes_no(value: bool) -> String {
    if value { "yes" } else { "no" }.to_string()
}
