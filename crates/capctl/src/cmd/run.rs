use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use capctl_ipc::{HelperConfig, DEFAULT_FD_PREFIX};
use capctl_source::chanlist::parse_named;
use capctl_source::runtime::DEFAULT_MAX_WAIT;
use capctl_source::{
    ChannelListStore, Controller, DriverRegistry, SourceDefaults, SourceState, SourceTracker,
};
use capctl_transport::{current_program, is_privileged, HelperCommand};
use tracing::{info, warn};

use crate::cmd::{Globals, RunArgs};
use crate::exit::{self, source_error, transport_error, CliError, CliResult, SOURCE_ERROR, SUCCESS, USAGE};
use crate::logging::arg_value;
use crate::output::print_sources;

pub fn run(args: RunArgs, globals: Globals) -> CliResult<i32> {
    if args.sources.is_empty() {
        return Err(CliError::new(USAGE, "no sources given; pass --source <definition>"));
    }

    let lists = channel_lists(&args.channel_lists)?;
    let defaults = SourceDefaults {
        hop: !args.no_hop,
        hop_rate: args.hop_rate,
        dwell_seconds: args.dwell,
        split: args.split,
        ..SourceDefaults::default()
    };
    let tracker = SourceTracker::controller(DriverRegistry::with_defaults(), lists).with_defaults(defaults);
    let helper_config = helper_config(&args, globals)?;
    let mut controller = Controller::new(tracker, helper_config);

    for definition in &args.sources {
        controller
            .add_source(definition)
            .map_err(|err| source_error("add source", err))?;
    }
    controller
        .ensure_helper()
        .map_err(|err| source_error("start privileged helper", err))?;
    controller
        .start_all()
        .map_err(|err| source_error("start sources", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let deadline = args
        .duration
        .map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    info!(sources = args.sources.len(), "controller running");
    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|at| Instant::now() >= at) {
            break;
        }
        controller
            .run_once(DEFAULT_MAX_WAIT)
            .map_err(|err| source_error("controller loop", err))?;
    }

    let tracker = controller.tracker();
    let summaries = tracker.summaries();
    print_sources(&summaries, tracker.channel_usage(), tracker.ticks(), globals.format);
    let failed = summaries.iter().any(|s| s.state == SourceState::Error);

    if let Err(err) = controller.shutdown() {
        warn!(error = %err, "shutdown was not clean");
    }
    Ok(if failed { SOURCE_ERROR } else { SUCCESS })
}

fn channel_lists(definitions: &[String]) -> CliResult<ChannelListStore> {
    let mut lists = ChannelListStore::with_defaults().map_err(|err| source_error("default channel lists", err))?;
    for definition in definitions {
        let (name, entries) =
            parse_named(definition).map_err(|err| source_error("channel list", err))?;
        lists
            .define(&name, entries)
            .map_err(|err| source_error("channel list", err))?;
    }
    Ok(lists)
}

fn helper_config(args: &RunArgs, globals: Globals) -> CliResult<Option<HelperConfig>> {
    if args.no_helper {
        return Ok(None);
    }
    if is_privileged() {
        info!("running privileged; no helper needed");
        return Ok(None);
    }
    let program = match &args.helper_bin {
        Some(path) => path.clone(),
        None => current_program().map_err(|err| transport_error("locate helper", err))?,
    };
    let tmp_dir = args.tmp_dir.clone().unwrap_or_else(std::env::temp_dir);

    let command = HelperCommand::new(program)
        .arg("--log-format")
        .arg(arg_value(globals.log_format))
        .arg("--log-level")
        .arg(arg_value(globals.log_level))
        .arg("helper")
        .arg("--tmp-dir")
        .arg(&tmp_dir)
        .arg("--fd-prefix")
        .arg(DEFAULT_FD_PREFIX);
    let mut config = HelperConfig::new(command);
    config.fd_dir = tmp_dir;
    Ok(Some(config))
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(exit::INTERNAL, format!("signal handler setup failed: {err}")))
}
