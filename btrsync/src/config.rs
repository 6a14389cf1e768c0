use anyhow::{Context, Result};
use serde::Deserialize;
use std::time::Duration;

/// Process-wide tunables, loaded once from the environment. Not part of the
/// planning/execution contract itself; purely a knob surface the executor
/// and [`crate::flow::Flow`] read at construction, the same way `libblkcapt`
/// loads ad-hoc structs with `envy::from_iter`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bounded wait after a stage fails before escalating SIGTERM -> SIGKILL.
    #[serde(with = "humantime_serde", default = "default_shutdown_grace")]
    pub shutdown_grace: Duration,

    /// Bytes of stderr retained per stage before the oldest output is dropped.
    #[serde(default = "default_stderr_tail_bytes")]
    pub stderr_tail_bytes: usize,

    /// Chunk size used by the buffered-copy fallback when splice(2) isn't available.
    #[serde(default = "default_copy_chunk_bytes")]
    pub copy_chunk_bytes: usize,

    /// Flag passed to `sudo` when wrapping a command. Overridable in tests.
    #[serde(default = "default_sudo_flag")]
    pub sudo_flag: String,
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_stderr_tail_bytes() -> usize {
    16 * 1024
}

fn default_copy_chunk_bytes() -> usize {
    128 * 1024
}

fn default_sudo_flag() -> String {
    String::from("-n")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shutdown_grace: default_shutdown_grace(),
            stderr_tail_bytes: default_stderr_tail_bytes(),
            copy_chunk_bytes: default_copy_chunk_bytes(),
            sudo_flag: default_sudo_flag(),
        }
    }
}

impl Config {
    /// Load from `BTRSYNC_*` environment variables, falling back to defaults
    /// for anything unset.
    pub fn from_env() -> Result<Self> {
        envy::prefixed("BTRSYNC_")
            .from_env::<Self>()
            .context("failed to load configuration from environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.stderr_tail_bytes, 16 * 1024);
        assert_eq!(config.sudo_flag, "-n");
    }

    #[test]
    #[serial_test::serial(env)]
    fn loads_overrides_from_env() {
        std::env::set_var("BTRSYNC_STDERR_TAIL_BYTES", "4096");
        std::env::set_var("BTRSYNC_SHUTDOWN_GRACE", "10s");
        let config = Config::from_env().unwrap();
        assert_eq!(config.stderr_tail_bytes, 4096);
        assert_eq!(config.shutdown_grace, Duration::from_secs(10));
        std::env::remove_var("BTRSYNC_STDERR_TAIL_BYTES");
        std::env::remove_var("BTRSYNC_SHUTDOWN_GRACE");
    }
}
