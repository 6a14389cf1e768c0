use thiserror::Error;

/// Discriminated error kinds a caller may need to match on. Anything that is
/// purely propagated (I/O noise, parse failures that never reach a caller's
/// match arm) stays as an `anyhow::Error` with `.context(...)`, the way the
/// rest of this crate handles errors.
#[derive(Error, Debug)]
pub enum BtrSyncError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("consistency error: {0}")]
    Consistency(String),

    #[error("failed to spawn stage {stage_idx} ({argv0}): {source}")]
    Spawn {
        stage_idx: usize,
        argv0: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stage {stage_idx} exited with {exit_code:?}")]
    StageFailure {
        stage_idx: usize,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("filesystem error: {kind}")]
    Filesystem { kind: FilesystemErrorKind },

    #[error("transfer cancelled")]
    Cancelled,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemErrorKind {
    #[error("destination file already exists")]
    FileExists,
    #[error("mountpoint is not a top-level btrfs subvolume")]
    NotBtrfs,
}

impl BtrSyncError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        BtrSyncError::Configuration(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        BtrSyncError::Protocol(msg.into())
    }

    pub fn consistency(msg: impl Into<String>) -> Self {
        BtrSyncError::Consistency(msg.into())
    }

    /// True for the fatal, pre-flight classes that must abort the whole run
    /// rather than just the in-flight plan.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BtrSyncError::StageFailure { .. })
    }
}
