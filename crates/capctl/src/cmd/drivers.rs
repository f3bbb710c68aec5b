use capctl_source::DriverRegistry;

use crate::cmd::DriversArgs;
use crate::exit::{CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_drivers, OutputFormat};

pub fn run(args: DriversArgs, format: OutputFormat) -> CliResult<i32> {
    let registry = DriverRegistry::with_defaults();
    let drivers = registry.describe();

    let Some(interface) = args.probe else {
        print_drivers(&drivers, format);
        return Ok(SUCCESS);
    };
    let claimed = registry
        .probe(&interface)
        .map(|driver| driver.type_name())
        .ok_or_else(|| CliError::new(FAILURE, format!("no driver claims '{interface}'")))?;
    let matched: Vec<_> = drivers
        .into_iter()
        .filter(|info| info.type_name == claimed)
        .collect();
    print_drivers(&matched, format);
    Ok(SUCCESS)
}
