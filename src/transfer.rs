//! Blocking, timeout-bounded socket transfers.
//!
//! Sockets are expected to carry `SO_RCVTIMEO`/`SO_SNDTIMEO`, so every blocking call here returns
//! within the configured timeout. An expired timeout surfaces as `Error::Timeout`.

use std::cmp::min;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

#[cfg(target_os = "linux")]
use nix::errno::Errno;

use crate::error::{Error, Result};

/// Size of the stack buffer used by the copy loops.
pub const SCRATCH_SIZE: usize = 16 * 1024;
#[cfg(target_os = "linux")]
const SENDFILE_SIZE_LIMIT: usize = 1 << 20;

fn classify(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io(e),
    }
}

/// Receive at least one byte into `buf`. A closed or silent peer is a timeout.
pub fn receive<R: Read>(socket: &mut R, buf: &mut [u8]) -> Result<usize> {
    loop {
        match socket.read(buf) {
            Ok(0) => return Err(Error::Timeout),
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify(e)),
        }
    }
}

/// Send all of `bytes`.
pub fn send_all<W: Write>(socket: &mut W, bytes: &[u8]) -> Result<usize> {
    let mut total_sent = 0;
    while total_sent < bytes.len() {
        match socket.write(&bytes[total_sent..]) {
            Ok(0) => return Err(Error::Timeout),
            Ok(n) => total_sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify(e)),
        }
    }
    Ok(total_sent)
}

/// Safe wrapper for `libc::sendfile64`.
#[cfg(target_os = "linux")]
fn sendfile64(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: Option<&mut libc::off64_t>,
    count: usize,
) -> nix::Result<usize> {
    let offset = offset
        .map(|offset| offset as *mut _)
        .unwrap_or(std::ptr::null_mut());
    let ret = unsafe { libc::sendfile64(out_fd, in_fd, offset, count) };
    Errno::result(ret).map(|r| r as usize)
}

/// Send `count` bytes of `file`, starting at its current position.
///
/// Uses the kernel's zero-copy transfer when `zero_copy` is set and the descriptors support it,
/// and the copy loop otherwise. Returns the number of bytes sent, which is short only when the
/// file ended early.
pub fn send_file<S: Write + AsRawFd>(
    socket: &mut S,
    file: &mut File,
    count: u64,
    zero_copy: bool,
) -> Result<u64> {
    #[cfg(target_os = "linux")]
    {
        if zero_copy {
            let mut sent = 0;
            while sent < count {
                let chunk = min(count - sent, SENDFILE_SIZE_LIMIT as u64) as usize;
                match sendfile64(socket.as_raw_fd(), file.as_raw_fd(), None, chunk) {
                    Ok(0) => break,
                    Ok(n) => sent += n as u64,
                    Err(nix::Error::Sys(Errno::EINTR)) => continue,
                    Err(nix::Error::Sys(Errno::EAGAIN)) => return Err(Error::Timeout),
                    Err(nix::Error::Sys(Errno::EINVAL)) | Err(nix::Error::Sys(Errno::ENOSYS))
                        if sent == 0 =>
                    {
                        return copy_to_socket(socket, file, count);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            return Ok(sent);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = zero_copy;
    copy_to_socket(socket, file, count)
}

/// Send up to `count` bytes read from `source` through a stack buffer.
pub fn copy_to_socket<R: Read, W: Write>(socket: &mut W, source: &mut R, count: u64) -> Result<u64> {
    let mut scratch = [0; SCRATCH_SIZE];
    let mut total = 0;
    while total < count {
        let want = min(count - total, SCRATCH_SIZE as u64) as usize;
        let n = match source.read(&mut scratch[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        send_all(socket, &scratch[..n])?;
        total += n as u64;
    }
    Ok(total)
}

/// Receive up to `count` bytes from `socket` into `file`.
///
/// Stops early without error when the peer closes. Returns the number of bytes written.
pub fn receive_to_file<R: Read, W: Write>(socket: &mut R, file: &mut W, count: u64) -> Result<u64> {
    let mut scratch = [0; SCRATCH_SIZE];
    let mut total = 0;
    while total < count {
        let want = min(count - total, SCRATCH_SIZE as u64) as usize;
        let n = match socket.read(&mut scratch[..want]) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify(e)),
        };
        file.write_all(&scratch[..n])?;
        total += n as u64;
    }
    Ok(total)
}

/// Toggle `TCP_CORK` so that a header and the start of its body leave in one segment.
#[cfg(target_os = "linux")]
pub fn set_cork(fd: RawFd, enabled: bool) -> Result<()> {
    let value = enabled as libc::c_int;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    Errno::result(ret).map(drop).map_err(Error::from)
}

#[cfg(not(target_os = "linux"))]
pub fn set_cork(_fd: RawFd, _enabled: bool) -> Result<()> {
    Ok(())
}
