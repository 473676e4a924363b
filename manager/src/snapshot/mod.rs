// File: manager/src/snapshot/mod.rs

//! Chunked, incremental database snapshots
//!
//! This module snapshots every node database of a local network fleet into
//! size-bounded, checksummed, zstd-compressed chunk files and rebuilds them
//! again.
//!
//! # Key Features
//!
//! - **Chunked Parts**: Streams split into `<prefix>.partNNNNN.zst` files under a size cap
//! - **Incremental Lineage**: Differential backups anchored to the database's version cursor
//! - **Self-Contained Snapshots**: Parent parts are hard-linked (or copied) into each new snapshot
//! - **Skip on Lock**: Databases held by a running node are skipped, never waited on
//! - **Squash**: A long chain is folded back into a single base
//!
//! # Snapshot Process
//!
//! 1. Discover units under `runs/<network>/<current|run_*>/node*`
//! 2. Open each unit's database exclusively, one task per unit
//! 3. Take an incremental on top of the newest parent, or a base
//! 4. Write the manifest once every part is on disk
//!
//! # Restore Process
//!
//! 1. Validate the lineage and check every part exists
//! 2. **Delete the target database**
//! 3. Replay base and incrementals in order, verifying each part
//! 4. Compact

pub mod builder;
pub mod chunk;
pub mod discovery;
pub mod manager;
pub mod manifest;
pub mod restore;

pub use builder::PipelineOptions;
pub use discovery::{SnapshotUnit, UnitKind};
pub use manager::{
    EngineConfig, GcReport, SnapshotInfo, SnapshotManager, SnapshotReport, StoredUnit, UnitOutcome,
    UnitReport,
};
pub use manifest::{Part, SnapshotEntry, SnapshotManifest};
pub use restore::{RestoreStats, SquashOutcome};
