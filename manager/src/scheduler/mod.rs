//! Cron-based scheduling for snapshots and retention sweeps
//!
//! This module provides automated scheduling for:
//! - Per-network snapshot creation (incremental by default)
//! - Squashing chains that grew past a configured length
//! - The retention sweep over runner logs, backups and stale runs
//!
//! # Features
//!
//! - **Cron-based scheduling**: Uses 6-field cron expressions (sec min hour day month dow)
//! - **One snapshot per day**: Scheduled runs write into `<network>-<YYYY-MM-DD>`, later runs the same day extend it
//! - **Conflict prevention**: Skips a run if the network is already busy
//!
//! # Configuration
//!
//! Schedules are defined per network in `config/{network}.toml`:
//!
//! ```toml
//! [network]
//! name = "mainnet"
//! snapshot_schedule = "0 0 */6 * * *"  # Every six hours
//! incremental = true
//! squash_after = 7
//! ```

pub mod operations;
pub use operations::{
    run_scheduled_cleanup, run_scheduled_snapshot, scheduled_snapshot_id, validate_6_field_cron,
    SnapshotScheduler,
};
