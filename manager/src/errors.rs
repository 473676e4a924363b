//! Error types for the snapshot engine
//!
//! Unit-level failures carry enough context (path, part, unit) for an operator
//! to retry one unit instead of the whole fleet.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::db::DbError;

pub type Result<T, E = SnapshotError> = std::result::Result<T, E>;

/// Main error type for snapshot, restore and squash operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The unit's database is held by another process
    #[error("database at '{}' is locked by another process", path.display())]
    Locked { path: PathBuf },

    /// Filesystem error with the path it happened on
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Manifest could not be read, parsed or written
    #[error("manifest '{}': {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    /// An incremental does not continue from the cursor the previous entry produced
    #[error("corrupt lineage for {unit}: entry {index} starts at {found}, expected {expected}")]
    CorruptLineage {
        unit: String,
        index: usize,
        expected: u64,
        found: u64,
    },

    /// Part contents do not match the manifest
    #[error("checksum mismatch for part '{part}': expected {expected}, got {actual}")]
    ChecksumMismatch {
        part: String,
        expected: String,
        actual: String,
    },

    /// Part size does not match the manifest
    #[error("size mismatch for part '{part}': expected {expected} bytes, found {actual}")]
    SizeMismatch {
        part: String,
        expected: u64,
        actual: u64,
    },

    /// A part referenced by a manifest is not on disk
    #[error("missing part '{}'", path.display())]
    MissingPart { path: PathBuf },

    /// Snapshot identifier or unit does not exist
    #[error("{0} not found")]
    NotFound(String),

    /// Snapshot identifier that cannot be used as a directory name
    #[error("invalid snapshot name '{0}'")]
    InvalidName(String),

    /// A background task panicked or was aborted
    #[error("background task failed: {0}")]
    Task(String),

    /// Operation was cancelled before it completed
    #[error("operation cancelled")]
    Cancelled,

    /// Error reported by the database engine
    #[error(transparent)]
    Database(DbError),
}

impl SnapshotError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SnapshotError::Io {
            path: path.into(),
            source,
        }
    }

    /// True for failures that mean "try again later" rather than "broken"
    pub fn is_skippable(&self) -> bool {
        matches!(self, SnapshotError::Locked { .. })
    }
}

impl From<DbError> for SnapshotError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Locked { path } => SnapshotError::Locked { path },
            DbError::Io(source) if is_cancellation(&source) => SnapshotError::Cancelled,
            other => SnapshotError::Database(other),
        }
    }
}

/// Tag an `io::Result` with the path it operated on
pub(crate) trait IoContext<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| {
            if is_cancellation(&source) {
                SnapshotError::Cancelled
            } else {
                SnapshotError::io(path, source)
            }
        })
    }
}

/// Marker carried by `io::Error`s raised when a chunk writer is cancelled
#[derive(Debug, Error)]
#[error("chunk writer cancelled")]
pub(crate) struct CancelledWrite;

pub(crate) fn cancelled_io_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, CancelledWrite)
}

pub(crate) fn is_cancellation(err: &io::Error) -> bool {
    err.get_ref()
        .map(|inner| inner.is::<CancelledWrite>())
        .unwrap_or(false)
}
