use std::os::fd::RawFd;
use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::logging::{LogFormat, LogLevel};
use crate::output::OutputFormat;

pub mod channels;
pub mod drivers;
pub mod helper;
pub mod run;
pub mod version;

/// Settings shared by every subcommand.
#[derive(Debug, Clone, Copy)]
pub struct Globals {
    pub format: OutputFormat,
    pub log_format: LogFormat,
    pub log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the capture controller.
    Run(RunArgs),
    /// List the registered capture drivers.
    Drivers(DriversArgs),
    /// Show the channel lists a run would start with.
    Channels(ChannelsArgs),
    /// Show version information.
    Version(VersionArgs),
    /// Privileged helper entry point, exec'd by the controller.
    #[command(hide = true)]
    Helper(HelperArgs),
}

pub fn run(command: Command, globals: Globals) -> CliResult<i32> {
    match command {
        Command::Run(args) => run::run(args, globals),
        Command::Drivers(args) => drivers::run(args, globals.format),
        Command::Channels(args) => channels::run(args, globals.format),
        Command::Version(args) => version::run(args),
        Command::Helper(args) => helper::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Source definition, `interface[:key=value,...]`. Repeatable.
    #[arg(long = "source", short = 's', value_name = "DEFINITION", env = "CAPCTL_SOURCES", value_delimiter = ';')]
    pub sources: Vec<String>,
    /// Extra channel list, `name:entries`. Repeatable.
    #[arg(long = "channel-list", value_name = "NAME:ENTRIES")]
    pub channel_lists: Vec<String>,
    /// Do not hop unless a source asks to.
    #[arg(long)]
    pub no_hop: bool,
    /// Default channels per second.
    #[arg(long, value_name = "N", default_value_t = 5)]
    pub hop_rate: i32,
    /// Default seconds per channel; overrides --hop-rate when non-zero.
    #[arg(long, value_name = "SECONDS", default_value_t = 0)]
    pub dwell: i32,
    /// Spread sources that share a channel list across it.
    #[arg(long, value_name = "BOOL", default_value_t = true, action = clap::ArgAction::Set)]
    pub split: bool,
    /// Program to exec as the privileged helper. Default: this binary.
    #[arg(long, value_name = "PATH", env = "CAPCTL_HELPER_BIN")]
    pub helper_bin: Option<PathBuf>,
    /// Directory for the descriptor side-channel socket.
    #[arg(long, value_name = "DIR", env = "CAPCTL_TMP_DIR")]
    pub tmp_dir: Option<PathBuf>,
    /// Never start a privileged helper.
    #[arg(long)]
    pub no_helper: bool,
    /// Stop after this many seconds and print the source summary.
    #[arg(long, value_name = "SECONDS")]
    pub duration: Option<f64>,
}

#[derive(Args, Debug)]
pub struct HelperArgs {
    /// Inherited command-channel descriptor.
    #[arg(long = "ipc-fd", value_name = "FD")]
    pub ipc_fd: RawFd,
    /// Directory for the descriptor side-channel socket.
    #[arg(long, value_name = "DIR")]
    pub tmp_dir: Option<PathBuf>,
    /// File-name prefix of the side-channel socket.
    #[arg(long, value_name = "PREFIX")]
    pub fd_prefix: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct DriversArgs {
    /// Show which driver would claim this interface.
    #[arg(long, value_name = "INTERFACE")]
    pub probe: Option<String>,
}

#[derive(Args, Debug, Default)]
pub struct ChannelsArgs {
    /// Extra channel list, `name:entries`. Repeatable.
    #[arg(long = "channel-list", value_name = "NAME:ENTRIES")]
    pub channel_lists: Vec<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build information.
    #[arg(long)]
    pub extended: bool,
}
