//! Inode table: interns `(view, path)` identities and tracks the kernel's
//! per-inode lookup refcount.
//!
//! Grounded on `oxcrypt-fuse/src/inode.rs`'s `InodeTable` (atomic `nlookup`,
//! evict-at-zero `forget`) and on `envfs.c`'s `envfs_lookup_inode` /
//! `envfs_forget` (the `(path, is_raw)` keying and the hash-table-under-a-
//! mutex design, `envfs_inode_hash`/`envfs_inode_equal`). Unlike the
//! teacher, which uses a lock-free `DashMap` because its workload is
//! high-churn vault traffic, this table follows spec.md §4.1's explicit
//! "single mutex, short critical sections" design: the C source already
//! takes one mutex, and spec.md names it a deliberate, sufficient choice
//! rather than an optimization target.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// The FUSE-protocol-reserved root inode number.
pub const ROOT_INODE: u64 = 1;

/// First inode handle allocated for non-root entries.
const FIRST_DYNAMIC_INODE: u64 = 2;

/// Which projection a non-root inode belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum View {
    Raw,
    Exe,
}

impl View {
    /// The view-root's directory name (`raw` or `exe`) as seen under `ROOT`.
    pub fn dir_name(self) -> &'static str {
        match self {
            View::Raw => "raw",
            View::Exe => "exe",
        }
    }
}

/// One interned filesystem node.
///
/// `ROOT` is represented implicitly by [`ROOT_INODE`]; every other node is
/// represented by this struct, uniquely identified by `(view, path)`.
#[derive(Debug)]
pub struct Inode {
    pub view: View,
    /// Relative path into the container root; empty string for a view root
    /// (`/exe`, `/raw`).
    pub path: String,
    refcount: AtomicU64,
}

impl Inode {
    fn new(view: View, path: String) -> Self {
        Self {
            view,
            path,
            refcount: AtomicU64::new(1),
        }
    }

    /// Current lookup refcount.
    pub fn refcount(&self) -> u64 {
        self.refcount.load(Ordering::Relaxed)
    }

    fn inc(&self) {
        self.refcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Subtracts `n`; returns the resulting count.
    fn dec(&self, n: u64) -> u64 {
        self.refcount.fetch_sub(n, Ordering::AcqRel) - n
    }
}

#[derive(Default)]
struct Inner {
    by_key: HashMap<(View, String), u64>,
    by_handle: HashMap<u64, Arc<Inode>>,
    next_handle: u64,
}

/// Thread-safe interning table mapping `(view, path) <-> inode handle`.
pub struct InodeTable {
    inner: Mutex<Inner>,
}

impl InodeTable {
    /// Creates an empty table (the `ROOT` inode is synthetic and not stored
    /// here; see [`ROOT_INODE`]).
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_key: HashMap::new(),
                by_handle: HashMap::new(),
                next_handle: FIRST_DYNAMIC_INODE,
            }),
        }
    }

    /// Interns `(view, path)`: returns the existing handle with its
    /// refcount incremented, or allocates a fresh one with refcount 1.
    pub fn intern(&self, view: View, path: String) -> u64 {
        let mut inner = self.inner.lock();
        if let Some(&handle) = inner.by_key.get(&(view, path.clone())) {
            let inode = Arc::clone(&inner.by_handle[&handle]);
            inode.inc();
            return handle;
        }

        let handle = inner.next_handle;
        inner.next_handle += 1;
        let inode = Arc::new(Inode::new(view, path.clone()));
        inner.by_key.insert((view, path), handle);
        inner.by_handle.insert(handle, inode);
        handle
    }

    /// Looks up an inode by its opaque handle. Returns `None` for
    /// [`ROOT_INODE`] — callers must special-case the root themselves.
    pub fn get(&self, handle: u64) -> Option<Arc<Inode>> {
        if handle == ROOT_INODE {
            return None;
        }
        self.inner.lock().by_handle.get(&handle).cloned()
    }

    /// Decrements `handle`'s refcount by `n`; evicts and frees the inode if
    /// it reaches zero. A no-op for [`ROOT_INODE`].
    pub fn forget(&self, handle: u64, n: u64) {
        if handle == ROOT_INODE || n == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        let Some(inode) = inner.by_handle.get(&handle).cloned() else {
            return;
        };
        if inode.dec(n) == 0 {
            inner.by_handle.remove(&handle);
            inner.by_key.remove(&(inode.view, inode.path.clone()));
        }
    }

    /// Number of live non-root inodes.
    pub fn len(&self) -> usize {
        self.inner.lock().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
