//! File and directory handle table.
//!
//! Grounded on `oxcrypt-fuse/src/handles.rs`'s `FuseHandle`/`FuseHandleTable`
//! (an enum of open-resource kinds keyed by an opaque `u64` file handle).
//! envfs has no write path, so there's only one handle kind per view: an
//! open regular-file descriptor (`envfs.c`'s `fh = openat(...)` in
//! `envfs_open`) or an open directory stream (`envfs.c`'s
//! `EnvfsDirHandle { DIR *dir; off_t offset; }` from `envfs_opendir`).
//! `dashmap` replaces the teacher's `oxcrypt_mount::HandleTable` since that
//! crate's generic handle table isn't carried over (see DESIGN.md).

use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;

use crate::backend::DirStream;
use crate::error::{EnvfsError, EnvfsResult};

/// First file handle value handed out (0 is avoided so `fh == 0` can be
/// used as a sentinel by callers that care to).
const FIRST_HANDLE: u64 = 1;

/// One open resource associated with an opaque FUSE file handle.
pub enum OpenHandle {
    File(File),
    Dir(DirStream),
}

/// Concurrent table of open file/directory handles.
pub struct HandleTable {
    handles: DashMap<u64, OpenHandle>,
    next_fh: AtomicU64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(FIRST_HANDLE),
        }
    }

    fn next(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers an open file, returning its handle.
    pub fn insert_file(&self, file: File) -> u64 {
        let fh = self.next();
        self.handles.insert(fh, OpenHandle::File(file));
        fh
    }

    /// Registers an open directory stream, returning its handle.
    pub fn insert_dir(&self, dir: DirStream) -> u64 {
        let fh = self.next();
        self.handles.insert(fh, OpenHandle::Dir(dir));
        fh
    }

    /// Borrows the file handle mutably for a read.
    pub fn get_file_mut(&self, fh: u64) -> EnvfsResult<RefMut<'_, u64, OpenHandle>> {
        let entry = self
            .handles
            .get_mut(&fh)
            .ok_or(EnvfsError::StaleHandle(fh))?;
        match *entry {
            OpenHandle::File(_) => Ok(entry),
            OpenHandle::Dir(_) => Err(EnvfsError::IsDirectory),
        }
    }

    /// Borrows the directory handle mutably for a readdir step.
    pub fn get_dir_mut(&self, fh: u64) -> EnvfsResult<RefMut<'_, u64, OpenHandle>> {
        let entry = self
            .handles
            .get_mut(&fh)
            .ok_or(EnvfsError::StaleHandle(fh))?;
        match *entry {
            OpenHandle::Dir(_) => Ok(entry),
            OpenHandle::File(_) => Err(EnvfsError::NotFound),
        }
    }

    /// Releases a handle. Matches `envfs_release`/`envfs_releasedir`'s
    /// "always succeeds" semantics — a missing handle is simply ignored.
    pub fn remove(&self, fh: u64) {
        self.handles.remove(&fh);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    fn tmp_open_dir(path: &std::path::Path) -> std::os::fd::OwnedFd {
        nix::fcntl::open(path, nix::fcntl::OFlag::O_PATH, nix::sys::stat::Mode::empty()).unwrap()
    }

    #[test]
    fn file_handles_round_trip() {
        let table = HandleTable::new();
        let file = File::open("/dev/null").unwrap();
        let raw = file.as_raw_fd();
        let fh = table.insert_file(file);
        {
            let entry = table.get_file_mut(fh).unwrap();
            match &*entry {
                OpenHandle::File(f) => assert_eq!(f.as_raw_fd(), raw),
                OpenHandle::Dir(_) => panic!("expected file handle"),
            }
        }
        table.remove(fh);
        assert!(table.get_file_mut(fh).is_err());
    }

    #[test]
    fn wrong_handle_kind_is_rejected() {
        let table = HandleTable::new();
        let file = File::open("/dev/null").unwrap();
        let fh = table.insert_file(file);
        assert!(table.get_dir_mut(fh).is_err());
    }

    #[test]
    fn directory_handles_track_independently() {
        let tmp = tempfile::tempdir().unwrap();
        let gateway = crate::backend::BackingFs::new(tmp_open_dir(tmp.path()));
        let dir = gateway.opendir("").unwrap();
        let table = HandleTable::new();
        let fh = table.insert_dir(dir);
        assert!(table.get_dir_mut(fh).is_ok());
        table.remove(fh);
        assert!(table.get_dir_mut(fh).is_err());
    }

    #[test]
    fn removing_an_unknown_handle_is_a_noop() {
        let table = HandleTable::new();
        table.remove(999);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn handles_are_never_reused() {
        let table = HandleTable::new();
        let a = table.insert_file(File::open("/dev/null").unwrap());
        table.remove(a);
        let b = table.insert_file(File::open("/dev/null").unwrap());
        assert_ne!(a, b);
    }
}
