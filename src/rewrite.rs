//! Executability rewriter: decides when a regular file's attributes get
//! replaced by the stub runner's, and enforces the filesystem-wide
//! read-only mask.
//!
//! Grounded on `envfs.c`'s `envfs_inode_stat`: the `is_raw` branch skips
//! substitution entirely; the `exe` branch only substitutes when the
//! backing file is a regular file (`S_ISREG`) with the **owner** execute
//! bit set (`mode & 0100`) — group/other-exec bits are deliberately
//! ignored, and spec.md calls out that implementations must not "fix"
//! this. Every reply, in both views, then has `mode &= ~0222` applied
//! (`st_mode &= ~(S_IWUSR | S_IWGRP | S_IWOTH)`), which is what makes the
//! whole mount read-only at the attribute level regardless of the
//! underlying permissions.

use nix::sys::stat::FileStat;

use crate::inode::View;

/// Bitmask for the owner-execute permission bit (`S_IXUSR`).
const OWNER_EXEC: u32 = 0o100;
/// Bitmask cleared from every reported `st_mode` to make the mount read-only.
const WRITE_BITS: u32 = 0o222;

/// True if `attr` is a regular file with the owner-execute bit set.
///
/// This intentionally does not consult group/other-exec bits: it mirrors
/// `envfs.c`'s `S_ISREG(st->st_mode) && (st->st_mode & 0100)` exactly.
pub fn is_owner_executable_regular_file(attr: &FileStat) -> bool {
    let mode = attr.st_mode as u32;
    (mode & libc::S_IFMT as u32) == libc::S_IFREG as u32 && (mode & OWNER_EXEC) != 0
}

/// Decides whether a `lookup`/`getattr` reply for `(view, backing_attr)`
/// should substitute the stub runner's attributes in place of the backing
/// file's.
pub fn should_substitute_stub(view: View, backing_attr: &FileStat) -> bool {
    matches!(view, View::Exe) && is_owner_executable_regular_file(backing_attr)
}

/// Clears every write bit from `mode`, matching `st_mode &= ~0222`.
pub fn strip_write_bits(mode: u32) -> u32 {
    mode & !WRITE_BITS
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn stat_with_mode(mode: u32) -> FileStat {
        // `FileStat` is a type alias for `libc::stat`; zero-initializing and
        // setting st_mode is enough for these predicate-only tests (no other
        // field is read).
        let mut raw: FileStat = unsafe { MaybeUninit::zeroed().assume_init() };
        raw.st_mode = mode as _;
        raw
    }

    #[test]
    fn owner_exec_regular_file_is_detected() {
        let attr = stat_with_mode(libc::S_IFREG | 0o744);
        assert!(is_owner_executable_regular_file(&attr));
    }

    #[test]
    fn group_or_other_exec_alone_does_not_count() {
        let attr = stat_with_mode(libc::S_IFREG | 0o644 | 0o011);
        assert!(!is_owner_executable_regular_file(&attr));
    }

    #[test]
    fn directories_are_never_substituted() {
        let attr = stat_with_mode(libc::S_IFDIR | 0o755);
        assert!(!is_owner_executable_regular_file(&attr));
    }

    #[test]
    fn raw_view_never_substitutes_even_when_executable() {
        let attr = stat_with_mode(libc::S_IFREG | 0o755);
        assert!(!should_substitute_stub(View::Raw, &attr));
        assert!(should_substitute_stub(View::Exe, &attr));
    }

    #[test]
    fn write_bits_are_stripped_for_owner_group_other() {
        assert_eq!(strip_write_bits(0o777), 0o555);
        assert_eq!(strip_write_bits(0o644), 0o444);
        assert_eq!(strip_write_bits(libc::S_IFDIR | 0o755), libc::S_IFDIR | 0o555);
    }
}
