//! envfs — the per-container "local environment" filesystem.
//!
//! Exposes a container's root filesystem at a host mount point in two
//! views: `raw` (pass-through) and `exe` (executable regular files
//! replaced by a stub runner). See `SPEC_FULL.md` for the full design.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod handles;
pub mod inode;
pub mod namespace;
pub mod rewrite;
pub mod worker_pool;

pub use config::EnvfsConfig;
pub use error::{EnvfsError, EnvfsResult, ToErrno};
pub use filesystem::EnvfsFilesystem;
pub use inode::{Inode, InodeTable, View, ROOT_INODE};
