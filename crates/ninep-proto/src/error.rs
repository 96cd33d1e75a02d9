//! Error type used throughout the protocol engine.
//!
//! Every handler returns `Result<FCall>`; on `Err` the dispatcher rewrites the
//! frame into an `Rlerror` carrying the negated Linux errno.

use std::{fmt, io};

/// POSIX errno constants re-exported under the names used by handlers.
///
/// Kept as a flat module (rather than an enum) so `error::Error::No(EBADF)`
/// reads the same as the errno it reports on the wire.
pub mod errno {
    pub use nix::libc::{
        E2BIG, EACCES, EAGAIN, EBADF, EBUSY, ECANCELED, ECHILD, EDOM, EEXIST, EFAULT, EFBIG,
        EINTR, EINVAL, EIO, EISDIR, ELOOP, EMFILE, EMLINK, ENAMETOOLONG, ENFILE, ENODATA, ENODEV,
        ENOENT, ENOEXEC, ENOMEM, ENOSPC, ENOSYS, ENOTBLK, ENOTDIR, ENOTEMPTY, ENOTTY, ENXIO,
        EOPNOTSUPP, EPERM, EPIPE, EPROTO, ERANGE, EROFS, ESPIPE, ESRCH, ETXTBSY, EXDEV,
    };
}

/// The error type returned by every `Filesystem` and `Fid` operation.
#[derive(Debug)]
pub enum Error {
    /// A bare Linux errno, with no underlying `std::io::Error` to carry.
    No(i32),
    /// An I/O failure; `errno()` unwraps the raw OS error when present.
    Io(io::Error),
}

impl Error {
    /// The positive Linux errno this error should be reported as.
    pub fn errno(&self) -> i32 {
        match self {
            Error::No(e) => *e,
            Error::Io(e) => e.raw_os_error().unwrap_or(errno::EIO),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::No(e) => write!(f, "{}", string(*e)),
            Error::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::No(e as i32)
    }
}

/// A human-readable rendering of a Linux errno, used in log lines.
pub fn string(errno: i32) -> String {
    io::Error::from_raw_os_error(errno).to_string()
}
