//! Integration tests wiring `BackingFs` and `InodeTable` together against a
//! synthetic backing directory, without mounting FUSE. Always runs (no
//! `/dev/fuse` required), unlike `mount_tests.rs`.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use envfs::backend::BackingFs;
use envfs::inode::{InodeTable, ROOT_INODE, View};
use envfs::rewrite::should_substitute_stub;

fn open_source(path: &std::path::Path) -> BackingFs {
    let fd = nix::fcntl::open(path, nix::fcntl::OFlag::O_PATH, nix::sys::stat::Mode::empty())
        .unwrap();
    BackingFs::new(fd)
}

#[test]
fn lookup_chain_interns_the_same_inode_for_repeat_lookups() {
    let tmp = tempfile::tempdir().unwrap();
    fs::create_dir(tmp.path().join("usr")).unwrap();
    fs::write(tmp.path().join("usr").join("file"), b"x").unwrap();

    let table = InodeTable::new();
    let first = table.intern(View::Raw, "usr/file".to_string());
    let second = table.intern(View::Raw, "usr/file".to_string());
    assert_eq!(first, second);
    assert_eq!(table.get(first).unwrap().refcount(), 2);
}

#[test]
fn exe_view_flags_substitution_only_for_owner_exec_regular_files() {
    let tmp = tempfile::tempdir().unwrap();
    let script = tmp.path().join("run.sh");
    fs::write(&script, b"#!/bin/sh\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o744)).unwrap();
    fs::create_dir(tmp.path().join("subdir")).unwrap();

    let gateway = open_source(tmp.path());

    let script_attr = gateway.stat("run.sh").unwrap();
    assert!(should_substitute_stub(View::Exe, &script_attr));
    assert!(!should_substitute_stub(View::Raw, &script_attr));

    let dir_attr = gateway.stat("subdir").unwrap();
    assert!(!should_substitute_stub(View::Exe, &dir_attr));
}

#[test]
fn root_inode_is_never_stored_in_the_table() {
    let table = InodeTable::new();
    assert!(table.get(ROOT_INODE).is_none());
    table.forget(ROOT_INODE, 5);
    assert!(table.is_empty());
}

#[test]
fn forgetting_an_inode_to_zero_allows_its_path_to_be_reinterned() {
    let table = InodeTable::new();
    let h1 = table.intern(View::Raw, "bin/sh".to_string());
    table.forget(h1, 1);
    let h2 = table.intern(View::Raw, "bin/sh".to_string());
    assert_ne!(h1, h2);
    assert_eq!(table.get(h2).unwrap().path, "bin/sh");
}

#[test]
fn stat_distinguishes_raw_and_exe_identity_but_shares_backing_path() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join("tool"), b"x").unwrap();
    fs::set_permissions(
        tmp.path().join("tool"),
        fs::Permissions::from_mode(0o755),
    )
    .unwrap();

    let table = InodeTable::new();
    let raw = table.intern(View::Raw, "tool".to_string());
    let exe = table.intern(View::Exe, "tool".to_string());
    assert_ne!(raw, exe);
    assert_eq!(table.get(raw).unwrap().path, table.get(exe).unwrap().path);
}
