//! Error handling and mapping for the envfs filesystem.
//!
//! Converts the small set of structural errors envfs itself can raise,
//! plus any backing-filesystem `io::Error`, into the POSIX error codes
//! FUSE replies with.

use std::io;
use thiserror::Error;

/// Errors that can occur while servicing a FUSE request.
#[derive(Debug, Error)]
pub enum EnvfsError {
    /// A backing-filesystem syscall failed; forwarded verbatim (§7 "passthrough").
    #[error("backing filesystem error: {0}")]
    Io(#[from] io::Error),

    /// Lookup under `ROOT` for a name other than `exe`/`raw`, or a missing
    /// backing-fs path.
    #[error("no such entry")]
    NotFound,

    /// `open` requested with a write-capable flag, or `access(W_OK)`.
    #[error("envfs is read-only")]
    ReadOnly,

    /// `open`/`opendir` mismatch between inode kind and operation.
    #[error("is a directory")]
    IsDirectory,

    /// `readlink` on an inode that isn't a symlink (notably `ROOT`).
    #[error("not a symlink")]
    NotASymlink,

    /// `getxattr` on `ROOT`.
    #[error("no extended attribute data")]
    NoXattrData,

    /// Buffer allocation failed while building a `readdir`/`getxattr`/
    /// `listxattr` reply.
    #[error("out of memory")]
    OutOfMemory,

    /// A path component or name was not valid UTF-8 / contained a NUL byte.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Referenced an inode handle the table doesn't recognize.
    #[error("stale inode handle {0}")]
    StaleHandle(u64),
}

/// Result type for envfs operations.
pub type EnvfsResult<T> = Result<T, EnvfsError>;

/// Extension trait to convert an error to a libc error code.
pub trait ToErrno {
    /// Converts this error to a libc error code suitable for `reply.error(..)`.
    fn to_errno(&self) -> i32;
}

impl ToErrno for EnvfsError {
    fn to_errno(&self) -> i32 {
        match self {
            EnvfsError::Io(e) => io_error_to_errno(e),
            EnvfsError::NotFound | EnvfsError::StaleHandle(_) => libc::ENOENT,
            EnvfsError::ReadOnly => libc::EACCES,
            EnvfsError::IsDirectory => libc::EISDIR,
            EnvfsError::NotASymlink => libc::EINVAL,
            EnvfsError::NoXattrData => libc::ENODATA,
            EnvfsError::OutOfMemory => libc::ENOMEM,
            EnvfsError::InvalidName(_) => libc::EINVAL,
        }
    }
}

impl ToErrno for io::Error {
    fn to_errno(&self) -> i32 {
        io_error_to_errno(self)
    }
}

/// Converts an `io::Error` to a libc errno, defaulting to `EIO` when the
/// error carries no raw OS error code (e.g. it didn't originate in a syscall).
pub fn io_error_to_errno(e: &io::Error) -> i32 {
    e.raw_os_error().unwrap_or(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_passthrough() {
        let e = io::Error::from_raw_os_error(libc::ENOENT);
        assert_eq!(EnvfsError::from(e).to_errno(), libc::ENOENT);
    }

    #[test]
    fn io_error_without_os_code_maps_to_eio() {
        let e = io::Error::other("boom");
        assert_eq!(io_error_to_errno(&e), libc::EIO);
    }

    #[test]
    fn structural_errors_map_as_spec_d() {
        assert_eq!(EnvfsError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(EnvfsError::ReadOnly.to_errno(), libc::EACCES);
        assert_eq!(EnvfsError::IsDirectory.to_errno(), libc::EISDIR);
        assert_eq!(EnvfsError::NotASymlink.to_errno(), libc::EINVAL);
        assert_eq!(EnvfsError::NoXattrData.to_errno(), libc::ENODATA);
        assert_eq!(EnvfsError::OutOfMemory.to_errno(), libc::ENOMEM);
        assert_eq!(EnvfsError::StaleHandle(7).to_errno(), libc::ENOENT);
    }

    #[test]
    fn display_is_human_readable() {
        assert!(EnvfsError::StaleHandle(42).to_string().contains("42"));
    }
}
