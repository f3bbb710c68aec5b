//! Launching the privileged helper program.

use std::ffi::OsString;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::info;

use crate::error::{Result, TransportError};
use crate::os;
use crate::stream::IpcStream;

/// Command-line flag carrying the inherited IPC descriptor number.
pub const IPC_FD_ARG: &str = "--ipc-fd";

/// What to exec for the helper side of the socket pair.
#[derive(Debug, Clone)]
pub struct HelperCommand {
    /// Program to run.
    pub program: PathBuf,
    /// Arguments placed before the descriptor flag.
    pub args: Vec<OsString>,
}

impl HelperCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }
}

/// Exec the helper with `helper_end` inherited as an open descriptor.
///
/// The descriptor number is appended as `--ipc-fd <n>`. The parent's copy of
/// `helper_end` is closed once the child is running.
pub fn spawn_helper(command: &HelperCommand, helper_end: IpcStream) -> Result<Child> {
    let fd = helper_end.as_raw_fd();

    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .arg(IPC_FD_ARG)
        .arg(fd.to_string())
        .stdin(Stdio::null());
    os::inherit_on_exec(&mut cmd, fd);

    let child = cmd.spawn().map_err(|source| TransportError::Spawn {
        program: command.program.clone(),
        source,
    })?;
    drop(helper_end);

    info!(
        program = %command.program.display(),
        pid = child.id(),
        ipc_fd = fd,
        "spawned privileged helper"
    );
    Ok(child)
}

/// The running binary, used as the default helper program.
pub fn current_program() -> Result<PathBuf> {
    std::env::current_exe().map_err(|source| TransportError::Spawn {
        program: Path::new("<current exe>").to_path_buf(),
        source,
    })
}

/// True when running with an effective uid of 0.
pub fn is_privileged() -> bool {
    os::effective_uid() == 0
}
