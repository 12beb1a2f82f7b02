//! Connection lifecycle: the accept loop and one detached worker thread per accepted socket.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::{TimeVal, TimeValLike};

use crate::config::Server;
use crate::http::ConnectionState;
use crate::logger::Level;
use crate::request::{handle_request, StreamBuffer};

/// How often the accept loop looks at the shutdown flag.
const POLL_INTERVAL_MS: i64 = 1000;

/// Workers that have not returned yet.
static ACTIVE_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// Counts a worker as active for as long as it lives.
struct ActiveWorker;

impl ActiveWorker {
    fn start() -> Self {
        ACTIVE_WORKERS.fetch_add(1, Ordering::SeqCst);
        Self
    }
}

impl Drop for ActiveWorker {
    fn drop(&mut self) {
        ACTIVE_WORKERS.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn active_workers() -> usize {
    ACTIVE_WORKERS.load(Ordering::SeqCst)
}

/// Serve requests on `socket` until a request ends with `Close`, then close it.
pub fn serve_connection(server: &Server, mut socket: TcpStream) {
    let fd = socket.as_raw_fd();
    let peer = socket.peer_addr().ok();
    let timeouts = socket
        .set_read_timeout(Some(server.receive_timeout))
        .and_then(|_| socket.set_write_timeout(Some(server.send_timeout)));
    if let Err(e) = timeouts {
        log!(server.logger, Level::Warn, fd, "failed to set socket timeouts: {}", e);
        return;
    }

    let mut stream = StreamBuffer::new();
    while handle_request(server, &mut socket, peer, &mut stream) == ConnectionState::KeepAlive {}
    log!(server.logger, Level::Debug, fd, "connection closed");
}

fn spawn_worker(server: &Arc<Server>, socket: TcpStream, peer: SocketAddr) -> Result<()> {
    let server = Arc::clone(server);
    let guard = ActiveWorker::start();
    thread::Builder::new()
        .name(format!("conn-{}", peer))
        .spawn(move || {
            let _guard = guard;
            serve_connection(&server, socket);
        })
        .context("failed to spawn connection thread")?;
    Ok(())
}

/// Accept connections until `running` is cleared, handing each to its own detached thread.
pub fn run(server: Arc<Server>, listener: &TcpListener, running: &AtomicBool) -> Result<()> {
    let listener_fd = listener.as_raw_fd();
    while running.load(Ordering::Relaxed) {
        let mut recv_set = FdSet::new();
        recv_set.insert(listener_fd);
        let mut timeout = TimeVal::milliseconds(POLL_INTERVAL_MS);
        match select(None, Some(&mut recv_set), None, None, Some(&mut timeout)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) if e.as_errno() == Some(Errno::EINTR) => continue,
            Err(e) => return Err(e).context("select() failed"),
        }

        let (socket, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) => {
                // Keep accepting; the next select() retries.
                log!(server.logger, Level::Warn, listener_fd, "accept() failed: {}", e);
                continue;
            }
        };
        log!(
            server.logger,
            Level::Debug,
            socket.as_raw_fd(),
            "{:>15}  accepted",
            peer.ip()
        );
        if let Err(e) = spawn_worker(&server, socket, peer) {
            log!(server.logger, Level::Warn, listener_fd, "{:#}", e);
        }
    }
    Ok(())
}

/// Give outstanding workers up to `grace` to finish. Returns how many are still running.
pub fn wait_for_workers(grace: Duration) -> usize {
    let deadline = Instant::now() + grace;
    while active_workers() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    active_workers()
}
