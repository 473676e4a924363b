//! Database contract consumed by the snapshot engine
//!
//! The engine never looks inside a database. It needs three things from it:
//! a differential `backup` stream anchored to a version cursor, a `load` that
//! replays such a stream, and a `compact` to run after replay. Engines are
//! opened against arbitrary directories and must report a held lock as
//! [`DbError::Locked`] so the scheduler can skip the unit instead of failing.

pub mod file_store;

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

pub use file_store::{FileStore, FileStoreEngine};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database at '{}' is locked", path.display())]
    Locked { path: PathBuf },

    #[error("database I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt database stream: {0}")]
    Corrupt(String),
}

/// An open, exclusively held database
pub trait Database: Send {
    /// Stream every change newer than `since` and return the cursor after the backup
    fn backup(&mut self, writer: &mut dyn Write, since: u64) -> Result<u64, DbError>;

    /// Replay a stream produced by [`Database::backup`]
    fn load(&mut self, reader: &mut dyn Read) -> Result<(), DbError>;

    /// Compact the key range `[start, end)`; `None` leaves that side unbounded
    fn compact(&mut self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<(), DbError>;
}

/// Opens databases of one kind
pub trait DatabaseEngine: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn open(&self, path: &Path) -> Result<Box<dyn Database>, DbError>;
}
