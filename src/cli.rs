//! Command-line interface.
//!
//! `envfs.c`'s `main()` parses `argv[1]` as the container pid with
//! `strtod()` — a floating-point parser that silently accepts garbage
//! trailing a leading number. spec.md Open Question 4 flags this as a bug
//! to fix rather than copy: here `CONTAINER_PID` is a strict `u32`, so
//! `clap` itself rejects non-numeric or negative input before the daemon
//! ever touches `/proc`.

use std::path::PathBuf;

use clap::Parser;

/// Mount a per-container local-environment filesystem.
#[derive(Debug, Parser)]
#[command(name = "envfs", version, about)]
pub struct Cli {
    /// PID of the container whose root filesystem is exposed.
    pub container_pid: u32,

    /// Host path at which to mount the `raw`/`exe` views.
    pub mount_path: PathBuf,

    /// Path to the stub runner substituted for executable files under `exe`.
    pub stub_runner_path: PathBuf,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_arguments() {
        let cli = Cli::try_parse_from(["envfs", "1234", "/mnt/env", "/usr/libexec/toolbox-run"])
            .unwrap();
        assert_eq!(cli.container_pid, 1234);
        assert_eq!(cli.mount_path, PathBuf::from("/mnt/env"));
        assert_eq!(
            cli.stub_runner_path,
            PathBuf::from("/usr/libexec/toolbox-run")
        );
    }

    #[test]
    fn rejects_non_integer_pid() {
        assert!(Cli::try_parse_from(["envfs", "not-a-pid", "/mnt", "/stub"]).is_err());
    }

    #[test]
    fn rejects_negative_pid() {
        assert!(Cli::try_parse_from(["envfs", "-5", "/mnt", "/stub"]).is_err());
    }

    #[test]
    fn rejects_missing_arguments() {
        assert!(Cli::try_parse_from(["envfs", "1234"]).is_err());
    }
}
