use std::sync::atomic::AtomicBool;

use capctl_ipc::DEFAULT_FD_PREFIX;
use capctl_source::{run_helper, DriverRegistry, HelperOptions};
use tracing::debug;

use crate::cmd::HelperArgs;
use crate::exit::{source_error, CliError, CliResult, INTERNAL, SUCCESS};

pub fn run(args: HelperArgs) -> CliResult<i32> {
    // The controller decides when the helper stops; an interactive ^C reaches
    // both processes and must not tear the helper down first.
    ctrlc::set_handler(|| debug!("helper ignoring interrupt")).map_err(|err| {
        CliError::new(INTERNAL, format!("signal handler setup failed: {err}"))
    })?;

    let mut options = HelperOptions::new(args.ipc_fd);
    if let Some(dir) = args.tmp_dir {
        options.fd_dir = dir;
    }
    options.fd_prefix = args.fd_prefix.unwrap_or_else(|| DEFAULT_FD_PREFIX.to_string());

    let stop = AtomicBool::new(false);
    run_helper(&options, DriverRegistry::with_defaults(), &stop)
        .map_err(|err| source_error("helper", err))?;
    Ok(SUCCESS)
}
