//! Status codes shared by every public operation.
//!
//! Every fallible call in this crate reports one of these conditions; there
//! are no panics on public paths. Internal helpers that need a retry signal
//! use their own control flow — retry never escapes to a caller.

use thiserror::Error;

/// Failure conditions reported by queue and map operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Invalid argument supplied by the caller.
    #[error("invalid argument")]
    Arg,

    /// Problem with the shared object name.
    #[error("problem with path name")]
    Path,

    /// Create found an existing object, or open found none.
    #[error("existence error")]
    Exist,

    /// No entry matched the supplied key.
    #[error("no match found for key")]
    NoMatch,

    /// Insert found the key present, or an update token went stale.
    #[error("update conflict")]
    Conflict,

    /// No items available.
    #[error("no items available")]
    Empty,

    /// Depth limit reached.
    #[error("depth limit reached")]
    Limit,

    /// Not enough memory to satisfy the request.
    #[error("not enough memory to satisfy request")]
    NoMem,

    /// Permission denied on the backing object.
    #[error("permission error")]
    Access,

    /// Mode mismatch, wrong magic or version, or a corrupted header.
    #[error("invalid state")]
    State,

    /// Required operation not supported by the host.
    #[error("required operation not supported")]
    NoSupport,

    /// Unclassified system error.
    #[error("system error")]
    Sys,
}

impl Error {
    /// Map an errno value from a failed libc call onto the public taxonomy.
    pub(crate) fn from_errno(err: i32) -> Self {
        match err {
            libc::EINVAL => Error::Arg,
            libc::EPERM | libc::EACCES => Error::Access,
            libc::EEXIST | libc::ENOENT => Error::Exist,
            libc::ENOMEM => Error::NoMem,
            libc::EBADF | libc::ELOOP | libc::ENOTDIR | libc::ENAMETOOLONG => Error::Path,
            _ => Error::Sys,
        }
    }

    /// The errno of the calling thread, converted.
    pub(crate) fn last_os() -> Self {
        Self::from_errno(unsafe { *libc::__errno_location() })
    }
}
