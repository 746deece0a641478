//! Error taxonomy for the fetch and transform phases.
//!
//! Per-task and per-artifact errors are recoverable: the orchestrator logs
//! them and moves on to the next unit of work. Only [`RunError`] aborts a run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::transform::PipelineState;

/// Failure of a single fetch task.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("invalid source URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("request to '{url}' failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("'{url}' answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("writing '{}' failed: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TransferError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::InvalidUrl { .. } | Self::Io { .. } => false,
        }
    }
}

/// Failure of the subprocess boundary, shared by every codec error.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Status {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("'{program}' did not finish within {}s and was killed", timeout.as_secs())]
    Timeout { program: String, timeout: Duration },

    #[error("waiting on '{program}' failed: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("extracting '{}' failed: {source}", image.display())]
    Tool {
        image: PathBuf,
        #[source]
        source: ProcessError,
    },

    #[error("extracting '{}' produced an empty tree", image.display())]
    Empty { image: PathBuf },

    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
}

#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("reading archive '{}' failed: {source}", archive.display())]
    Io {
        archive: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed cpio entry in '{}' at offset {offset}: {reason}", archive.display())]
    Format {
        archive: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("entry '{name}' in '{}' escapes the destination", archive.display())]
    UnsafePath { archive: PathBuf, name: String },
}

#[derive(Debug, Error)]
pub enum PackError {
    #[error("walking '{}' failed: {source}", root.display())]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("packing '{}' failed: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{}' is too large for a newc entry", path.display())]
    TooLarge { path: PathBuf },
}

/// Directory creation, copy, and rename failures.
#[derive(Debug, Error)]
#[error("{action} '{}': {source}", path.display())]
pub struct FilesystemError {
    pub action: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl FilesystemError {
    pub fn new(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self {
            action,
            path: path.into(),
            source,
        }
    }
}

/// Cause of a failed pipeline state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Unpack(#[from] UnpackError),
    #[error(transparent)]
    Pack(#[from] PackError),
    #[error(transparent)]
    Filesystem(#[from] FilesystemError),
    #[error("{0}")]
    Missing(String),
}

/// A transform failure, scoped to one artifact and the state it died in.
#[derive(Debug, Error)]
#[error("{state} failed for '{}': {source}", artifact.display())]
pub struct ArtifactError {
    pub artifact: PathBuf,
    pub state: PipelineState,
    #[source]
    pub source: StateError,
}

/// Conditions that abort the whole run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("discovery returned no artifacts")]
    NothingDiscovered,

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("discovered URL '{url}' is not an absolute http(s) URL")]
    InvalidUrl { url: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("transform phase aborted: {0}")]
    Join(String),
}
