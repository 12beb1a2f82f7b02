use std::io;

use nix::errno::Errno;
use thiserror::Error;

/// Failures of the buffer primitives, the header parser and transfer I/O.
#[derive(Debug, Error)]
pub enum Error {
    /// A blocking socket operation returned no progress before its timeout.
    #[error("socket timed out")]
    Timeout,
    /// Propagated system error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// An arena could not hold the requested bytes.
    #[error("arena capacity exceeded")]
    CapacityExceeded,
    /// A registry has no free entry slots.
    #[error("registry is full")]
    RegistryFull,
    /// The request line does not fit in the receive buffer.
    #[error("request line exceeds receive buffer")]
    HeaderTooLarge,
    /// The request line could not be recorded.
    #[error("malformed request")]
    Parse,
    /// Percent-decoding produced a forbidden byte.
    #[error("invalid percent-encoding")]
    Decode,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Self::Io(io::Error::from_raw_os_error(errno as i32))
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        match e.as_errno() {
            Some(errno) => errno.into(),
            None => Self::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
