//! One-way entry into a container's user namespace.
//!
//! Grounded on `envfs.c`'s `enter_namespace`: `open(ns_path, O_RDONLY)`
//! followed by `setns(fd, 0)`. spec.md §6 requires this to happen after
//! `source_fd` is opened and the mount channel is established, but before
//! the session loop starts — and to be treated as irreversible: once this
//! process calls `setns`, it can never return to its original user
//! namespace, so failure here must abort startup rather than attempt a
//! fallback.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::sched::{setns, CloneFlags};

use crate::error::EnvfsResult;

/// Enters the user namespace identified by `/proc/<pid>/ns/user`.
///
/// This is irreversible: once it returns `Ok`, this process has left its
/// original user namespace for good. Callers must perform every other
/// setup step — opening `source_fd`, creating the mount channel — first.
pub fn enter_user_namespace(ns_path: &Path) -> EnvfsResult<()> {
    let file = File::open(ns_path)?;
    setns(file.as_raw_fd(), CloneFlags::CLONE_NEWUSER).map_err(std::io::Error::from)?;
    Ok(())
}

/// Builds the `/proc/<pid>/ns/user` path for a container pid.
pub fn user_ns_path(container_pid: u32) -> std::path::PathBuf {
    std::path::PathBuf::from(format!("/proc/{container_pid}/ns/user"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_ns_path_formats_as_expected() {
        assert_eq!(
            user_ns_path(1234),
            std::path::PathBuf::from("/proc/1234/ns/user")
        );
    }

    #[test]
    fn entering_a_nonexistent_namespace_fails_cleanly() {
        let err = enter_user_namespace(Path::new("/proc/999999999/ns/user"));
        assert!(err.is_err());
    }
}
