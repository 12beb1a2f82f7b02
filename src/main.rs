use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, chroot, dup2, fork, pipe, setgid, setgroups, setsid, setuid, ForkResult};

use stackhttpd::config::Server;
use stackhttpd::connection;
use stackhttpd::log;
use stackhttpd::logger::Level;

const PATH_DEVNULL: &str = "/dev/null";
/// How long shutdown waits for workers that are still serving.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn main() -> Result<()> {
    println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let mut server = match Server::from_args(std::env::args())? {
        Some(server) => server,
        None => return Ok(()),
    };

    let listener = server.create_listener()?;

    let detached = if server.want_daemon {
        Some(detach().context("failed to daemonize")?)
    } else {
        None
    };

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    if server.want_chroot {
        // Force reading the local timezone before chroot makes this impossible.
        Local::now();

        chdir(server.public_dir.as_str()).with_context(|| {
            format!("failed to change working directory to {}", server.public_dir)
        })?;
        chroot(server.public_dir.as_str())
            .with_context(|| format!("failed to change root directory to {}", server.public_dir))?;
        println!("chrooted to `{}'", &server.public_dir);

        server.public_dir.clear();
    }

    if let Some(gid) = server.drop_gid {
        setgroups(&[gid])
            .with_context(|| format!("failed to set supplementary group IDs to [{}]", gid))?;
        setgid(gid).with_context(|| format!("failed to set group ID to {}", gid))?;
        println!("set gid to {}", gid);
    }

    if let Some(uid) = server.drop_uid {
        setuid(uid).with_context(|| format!("failed to set user ID to {}", uid))?;
        println!("set uid to {}", uid);
    }

    if let Some(detached) = detached {
        detached.release().context("failed to daemonize")?;
    }

    let server = Arc::new(server);
    let port = server.port;
    log!(
        server.logger,
        Level::Warn,
        0,
        "Server started. Port: {}. Pid: {}.",
        port,
        process::id()
    );

    let result = connection::run(Arc::clone(&server), &listener, &RUNNING);
    drop(listener);

    let remaining = connection::wait_for_workers(SHUTDOWN_GRACE);
    if remaining > 0 {
        log!(server.logger, Level::Warn, 0, "{} connections still open", remaining);
    }
    log!(server.logger, Level::Warn, 0, "Server exiting. Port: {}.", port);
    result
}

/// The half of a daemon fork that goes on serving. Until `release` runs, the parent process
/// waits on the lifeline so that setup errors still reach the terminal.
struct Detached {
    lifeline: File,
    null: File,
}

/// Fork into the background. Only the child returns; the parent exits once the child releases
/// the lifeline, or with the child's status if it died first.
fn detach() -> Result<Detached> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open(PATH_DEVNULL)
        .with_context(|| format!("failed to open {}", PATH_DEVNULL))?;
    let (read_end, write_end) = pipe().context("failed to create lifeline")?;
    // Both ends are fresh descriptors owned by nothing else.
    let (mut waiting, lifeline) =
        unsafe { (File::from_raw_fd(read_end), File::from_raw_fd(write_end)) };

    match unsafe { fork() }.context("failed to fork process")? {
        ForkResult::Child => Ok(Detached { lifeline, null }),
        ForkResult::Parent { child } => {
            drop(lifeline);
            // EOF once every copy of the write end is closed.
            let mut byte = [0; 1];
            waiting.read(&mut byte).ok();
            let code = match waitpid(child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => 0,
                Ok(WaitStatus::Exited(_, status)) => status,
                Ok(_) | Err(_) => 1,
            };
            process::exit(code)
        }
    }
}

impl Detached {
    /// Leave the controlling terminal and let the parent exit.
    fn release(self) -> Result<()> {
        setsid().context("failed to create session")?;
        let null = self.null.as_raw_fd();
        for &fd in &[libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
            dup2(null, fd).with_context(|| format!("failed to redirect descriptor {}", fd))?;
        }
        drop(self.lifeline);
        Ok(())
    }
}
