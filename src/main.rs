//! Daemon entry point.
//!
//! Mirrors `envfs.c`'s `main()`: open `source_fd` on the container's root,
//! mount the FUSE session, enter the container's user namespace (a one-way
//! operation — see `namespace.rs`), then run the session loop until a
//! shutdown signal unmounts it.
//!
//! Unlike `fuser::spawn_mount2` — which mounts *and* immediately spawns a
//! background thread to serve requests — `fuser::Session::new` only mounts:
//! no thread exists until `session.run()` is called explicitly. That is
//! what lets namespace entry happen, on this same still-single-threaded
//! process, strictly between the two: `setns(CLONE_NEWUSER)`
//! (`namespace.rs`) requires a single-threaded caller, and requests must
//! not be served in the host namespace before the switch (spec.md §4.4,
//! §4.6). This matches `envfs.c:850`'s `enter_namespace()` then
//! `fuse_session_loop_mt()` ordering — mount, then switch namespaces, then
//! start serving — rather than conflating "mount" with "start serving" the
//! way `spawn_mount2` does.
//!
//! The filesystem's own worker pool (`filesystem::EnvfsFilesystem::pool`,
//! see `worker_pool.rs`) only starts once the session loop dispatches its
//! first request, which is after namespace entry here — so the pool's own
//! threads never exist while `setns` still needs the process single
//! threaded, even though they're what gives the daemon real concurrency
//! once it's serving (spec.md §5).

use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::{Context, Result};
use fuser::{MountOption, Session, SessionUnmounter};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use parking_lot::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use envfs::backend::BackingFs;
use envfs::cli::Cli;
use envfs::config::EnvfsConfig;
use envfs::filesystem::EnvfsFilesystem;
use envfs::namespace::{enter_user_namespace, user_ns_path};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("envfs=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn open_source_fd(container_pid: u32) -> Result<OwnedFd> {
    let root_path = format!("/proc/{container_pid}/root");
    nix::fcntl::open(root_path.as_str(), OFlag::O_PATH, Mode::empty())
        .with_context(|| format!("opening {root_path}"))
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    info!(
        container_pid = cli.container_pid,
        mount_path = %cli.mount_path.display(),
        "starting envfs"
    );

    let source_fd = open_source_fd(cli.container_pid)?;
    let source_fd_raw = source_fd.as_raw_fd();
    let backend = BackingFs::new(source_fd);
    let filesystem = EnvfsFilesystem::new(backend, cli.stub_runner_path.clone(), EnvfsConfig::default());

    let options = vec![
        MountOption::RO,
        MountOption::FSName("envfs".to_string()),
        MountOption::Subtype("envfs".to_string()),
    ];

    // Mounts the channel but spawns no thread: the calling process is still
    // single-threaded here, which is what `enter_user_namespace` below
    // requires.
    let mut session = Session::new(filesystem, &cli.mount_path, &options)
        .with_context(|| format!("mounting envfs at {}", cli.mount_path.display()))?;
    info!(fd = source_fd_raw, "mount channel established");

    let ns_path = user_ns_path(cli.container_pid);
    if let Err(e) = enter_user_namespace(&ns_path) {
        error!(error = %e, ns_path = %ns_path.display(), "failed to enter user namespace");
        return Err(e.into());
    }
    info!(ns_path = %ns_path.display(), "entered user namespace");

    // Safe to spawn the signal-handling thread now: `setns`'s
    // single-threaded requirement only applies at the moment it's called.
    install_shutdown_handler(session.unmount_callable())?;

    info!("session loop starting");
    session.run().context("running envfs session loop")?;
    info!("shut down");
    Ok(())
}

/// Installs a `SIGINT`/`SIGTERM` handler that unmounts the session, which
/// makes the blocking `session.run()` call below return. `ctrlc`'s handler
/// is `Fn`, not `FnMut`, but `SessionUnmounter::unmount` takes `&mut self`,
/// hence the `Mutex` — the teacher's lighter `ctrlc`-based wait
/// (`oxcrypt-mount/src/signal.rs`'s heavier signal-hook+condvar design isn't
/// needed here: envfs only ever needs "stop the session loop once").
fn install_shutdown_handler(unmounter: SessionUnmounter) -> Result<()> {
    let unmounter = Mutex::new(unmounter);
    ctrlc::set_handler(move || {
        if let Err(e) = unmounter.lock().unmount() {
            error!(error = %e, "failed to unmount on shutdown signal");
        }
    })
    .context("installing signal handler")
}

fn main() -> Result<()> {
    init_tracing();
    if let Err(e) = run() {
        error!(error = %e, "envfs exiting with error");
        std::process::exit(1);
    }
    Ok(())
}
