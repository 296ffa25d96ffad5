//! Error taxonomy for the archival core.
//!
//! Lower layers (chunker, store, backend, extractor) return [`ArchiveError`].
//! The push and pull pipelines wrap it with the stage they reached and the
//! archive id when known, so an operator always sees where things stopped.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = ArchiveError> = std::result::Result<T, E>;

/// Coarse classification of an [`ArchiveError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Backend,
    Integrity,
    Concurrency,
    UnsafeArchiveMember,
    NotFound,
    Input,
    Io,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(
        "backend {operation} failed (exit status {}): {}",
        status.map_or_else(|| "none".to_string(), |s| s.to_string()),
        diagnostic(stdout, stderr)
    )]
    Backend {
        operation: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("integrity check failed for {subject}: expected {expected}, got {actual}")]
    Integrity {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("{} is claimed by lock {id} (owner {owner}, mode {mode})", path.display())]
    Claimed {
        id: String,
        owner: String,
        mode: String,
        path: PathBuf,
    },

    #[error("unsafe archive member {member:?}: {reason}")]
    UnsafeMember { member: String, reason: String },

    #[error("archive {0} not found in manifest")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

fn diagnostic(stdout: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    let stdout = stdout.trim();
    match (stderr.is_empty(), stdout.is_empty()) {
        (false, _) => stderr.to_string(),
        (true, false) => stdout.to_string(),
        (true, true) => "<no output>".to_string(),
    }
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::Configuration(_) => ErrorKind::Configuration,
            ArchiveError::Backend { .. } => ErrorKind::Backend,
            ArchiveError::Integrity { .. } => ErrorKind::Integrity,
            ArchiveError::Claimed { .. } => ErrorKind::Concurrency,
            ArchiveError::UnsafeMember { .. } => ErrorKind::UnsafeArchiveMember,
            ArchiveError::NotFound(_) => ErrorKind::NotFound,
            ArchiveError::InvalidInput(_) => ErrorKind::Input,
            ArchiveError::Io { .. } | ArchiveError::Json(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn integrity(
        subject: impl Into<String>,
        expected: impl fmt::Display,
        actual: impl fmt::Display,
    ) -> Self {
        ArchiveError::Integrity {
            subject: subject.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Attach a human-readable context to `std::io::Error` results.
pub(crate) trait IoContext<T> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T> IoContext<T> for std::result::Result<T, std::io::Error> {
    fn io_context<F, S>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|source| ArchiveError::Io {
            context: f().into(),
            source,
        })
    }
}

/// Push pipeline states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PushStage {
    Planned,
    Chunked,
    BucketReady,
    Uploaded,
    Journaled,
}

impl fmt::Display for PushStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PushStage::Planned => "PLANNED",
            PushStage::Chunked => "CHUNKED",
            PushStage::BucketReady => "BUCKET_READY",
            PushStage::Uploaded => "UPLOADED",
            PushStage::Journaled => "JOURNALED",
        };
        f.write_str(name)
    }
}

/// Pull pipeline states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PullStage {
    Resolved,
    Downloaded,
    ChunksVerified,
    Concatenated,
    WholeVerified,
}

impl fmt::Display for PullStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PullStage::Resolved => "RESOLVED",
            PullStage::Downloaded => "DOWNLOADED",
            PullStage::ChunksVerified => "CHUNKS_VERIFIED",
            PullStage::Concatenated => "CONCATENATED",
            PullStage::WholeVerified => "WHOLE_VERIFIED",
        };
        f.write_str(name)
    }
}

/// A push failure. `stage` is the last state successfully reached, `None`
/// when planning itself failed.
#[derive(Debug, Error)]
#[error(
    "push failed after {} (archive {})",
    stage.map_or_else(|| "START".to_string(), |s| s.to_string()),
    archive_id.as_deref().unwrap_or("<unallocated>")
)]
pub struct PushError {
    pub archive_id: Option<String>,
    pub stage: Option<PushStage>,
    #[source]
    pub source: ArchiveError,
}

/// A pull failure. `stage` is the last state successfully reached, `None`
/// when the archive could not even be resolved.
#[derive(Debug, Error)]
#[error(
    "pull of {archive_id} failed after {}",
    stage.map_or_else(|| "START".to_string(), |s| s.to_string())
)]
pub struct PullError {
    pub archive_id: String,
    pub stage: Option<PullStage>,
    #[source]
    pub source: ArchiveError,
}

impl PushError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

impl PullError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}
