//! Tunables for the envfs filesystem.
//!
//! Unlike a vault-mounting daemon talking to cloud storage, envfs's backing
//! store is always a local container root filesystem, so there is no
//! io_timeout/concurrency_limit/saturation-policy dimension to configure —
//! only the attribute and entry cache timeouts spec.md fixes at 1.0s (§3,
//! §5). The builder methods exist for test convenience, not because
//! production deployments are expected to tune them.

use std::time::Duration;

/// Default attribute/entry timeout reported to the kernel (spec.md §3, §5).
pub const DEFAULT_TTL: Duration = Duration::from_secs(1);

/// Configuration for a running envfs daemon.
#[derive(Debug, Clone, Copy)]
pub struct EnvfsConfig {
    /// TTL reported alongside `lookup` entries.
    pub entry_ttl: Duration,
    /// TTL reported alongside `getattr`/`lookup` attributes.
    pub attr_ttl: Duration,
}

impl Default for EnvfsConfig {
    fn default() -> Self {
        Self {
            entry_ttl: DEFAULT_TTL,
            attr_ttl: DEFAULT_TTL,
        }
    }
}

impl EnvfsConfig {
    /// Builds a config with both TTLs set to the same duration.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entry_ttl: ttl,
            attr_ttl: ttl,
        }
    }

    /// Overrides the entry TTL.
    #[must_use]
    pub fn entry_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }

    /// Overrides the attribute TTL.
    #[must_use]
    pub fn attr_ttl(mut self, ttl: Duration) -> Self {
        self.attr_ttl = ttl;
        self
    }
}
