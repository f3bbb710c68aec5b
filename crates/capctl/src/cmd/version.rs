use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("capctl {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: capctl");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("frame_header_len: {}", capctl_frame::HEADER_SIZE);
    println!("max_payload: {}", capctl_frame::DEFAULT_MAX_PAYLOAD);
    println!("privileged: {}", capctl_transport::is_privileged());

    Ok(SUCCESS)
}
