//! External program dispatch: the program runs with a prepared environment and the client socket
//! as its standard output.

use std::ffi::OsStr;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};

use nix::unistd::{access, dup, AccessFlags};

use crate::registry::Registry;

pub fn is_executable(path: &Path) -> bool {
    access(path, AccessFlags::X_OK).is_ok()
}

/// Run `program` in `working_dir` with exactly the `NAME=value` entries of `env`, writing to
/// `socket`, and wait for it to exit.
pub fn run<S: AsRawFd, const B: usize, const E: usize>(
    program: &Path,
    working_dir: &Path,
    env: &Registry<B, E>,
    socket: &S,
) -> io::Result<ExitStatus> {
    let fd = dup(socket.as_raw_fd()).map_err(|_| io::Error::last_os_error())?;
    let stdout = unsafe { File::from_raw_fd(fd) };

    let mut command = Command::new(program);
    command
        .env_clear()
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::null());
    for entry in env.iter() {
        if let Some(eq) = entry.iter().position(|&b| b == b'=') {
            command.env(
                OsStr::from_bytes(&entry[..eq]),
                OsStr::from_bytes(&entry[eq + 1..]),
            );
        }
    }
    command.status()
}
