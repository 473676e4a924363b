//! Central repository for sizes, names, and retention thresholds
//!
//! Organized by category the same way the rest of the crate reads them:
//! chunking and compression, on-disk layout names, retention defaults.

use std::time::Duration;

/// Chunking and compression constants
pub mod chunking {
    /// Maximum size of a single chunk file (hosting providers cap uploads near 100MB)
    pub const CHUNK_SIZE: u64 = 99 * 1024 * 1024;

    /// Width of the zero-padded part index in chunk file names
    pub const PART_INDEX_WIDTH: usize = 5;

    /// Extension of every chunk file
    pub const PART_EXTENSION: &str = "zst";

    /// Default zstd level for backup streams
    pub const COMPRESSION_LEVEL: i32 = 3;

    /// Buffer size used when streaming parts back into a database
    pub const READ_BUFFER_SIZE: usize = 1024 * 1024;
}

/// Directory and file names of the on-disk layout
pub mod layout {
    pub const RUNS_DIR: &str = "runs";
    pub const SNAPSHOTS_DIR: &str = "snapshots";
    pub const CURRENT_RUN: &str = "current";
    pub const RUN_PREFIX: &str = "run_";
    pub const NODE_PREFIX: &str = "node";
    pub const NODE_DB_DIR: &str = "db";
    pub const CHAIN_DATA_DIR: &str = "chainData";
    pub const CHAIN_DATA_NETWORK_PREFIX: &str = "network-";
    pub const MANIFEST_FILE: &str = "manifest.json";
    pub const CHUNKS_DIR: &str = "chunks";
    pub const MAIN_UNIT_PREFIX: &str = "chain_";
    pub const CHAIN_DATA_UNIT_PREFIX: &str = "chaindata_";

    /// Number of chain ID characters kept in chaindata unit directory names
    pub const CHAIN_ID_PREFIX_LEN: usize = 16;

    /// Prefix of scratch directories created by squash
    pub const SCRATCH_PREFIX: &str = ".squash-";
}

/// Retention and cleanup defaults
pub mod retention {
    use super::Duration;

    /// Logs larger than this are removed
    pub const MAX_LOG_SIZE: u64 = 100 * 1024 * 1024;

    /// Logs older than this are removed
    pub const MAX_LOG_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

    /// `.backup.*` run directories older than this are removed
    pub const MAX_BACKUP_AGE: Duration = Duration::from_secs(7 * 24 * 3600);

    /// Superseded run directories older than this are removed
    pub const MAX_STALE_RUN_AGE: Duration = Duration::from_secs(24 * 3600);

    /// Name of the log file written by the network runner
    pub const SERVER_LOG_NAME: &str = "netrunner-server.log";

    /// Directory under `runs/` holding runner sessions
    pub const SERVER_DIR: &str = "server";

    /// Marker contained in the names of backup run directories
    pub const BACKUP_MARKER: &str = ".backup.";

    /// Network types swept for stale runs
    pub const NETWORK_TYPES: [&str; 4] = ["mainnet", "testnet", "devnet", "custom"];

    /// A partial first line is searched for within this many bytes after truncation
    pub const TRUNCATE_LINE_SCAN: usize = 1024;
}

/// Default configuration values
pub mod defaults {
    /// Units processed at once; 0 means one task per unit with no cap
    pub const MAX_PARALLEL_UNITS: usize = 0;

    /// Default cron expression for the cleanup sweep (hourly)
    pub const CLEANUP_SCHEDULE: &str = "0 0 * * * *";

    /// Config directory read by the binary
    pub const CONFIG_DIR: &str = "config";

    /// How often the daemon looks for stuck operations
    pub const OPERATION_SWEEP_INTERVAL_SECONDS: u64 = 3600;

    /// Operations running longer than this are cancelled
    pub const OPERATION_TIMEOUT_HOURS: i64 = 24;
}
