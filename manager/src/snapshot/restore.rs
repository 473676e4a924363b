// File: manager/src/snapshot/restore.rs

//! Replaying a manifest chain into a database, and squashing a chain into a new base

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::layout::SCRATCH_PREFIX;
use crate::db::{Database, DatabaseEngine};
use crate::errors::{IoContext, Result, SnapshotError};
use crate::snapshot::builder::{remove_parts, stream_backup, PipelineOptions};
use crate::snapshot::chunk::PartReader;
use crate::snapshot::manifest::{
    chunks_dir, load_manifest, manifest_path, save_manifest, SnapshotEntry, SnapshotManifest,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreStats {
    pub entries: usize,
    pub parts: usize,
    pub bytes: u64,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SquashOutcome {
    /// The chain had no incrementals
    AlreadyBase,
    Squashed {
        incrementals: usize,
        parts_removed: usize,
        base_parts: usize,
    },
}

/// Feed one entry's parts through zstd into `db`, verifying every part
pub fn replay_entry(db: &mut dyn Database, chunks: &Path, entry: &SnapshotEntry) -> Result<()> {
    let mut reader = PartReader::new(chunks, &entry.parts);
    match decode_into(db, &mut reader, chunks) {
        Ok(()) => reader.finish(),
        // A bad part usually breaks the decoder first; prefer the verification failure
        Err(e) => match reader.finish() {
            Err(failure) => Err(failure),
            Ok(()) => Err(e),
        },
    }
}

fn decode_into(db: &mut dyn Database, reader: &mut PartReader, chunks: &Path) -> Result<()> {
    let mut decoder = zstd::Decoder::new(reader).with_path(chunks)?;
    db.load(&mut decoder)?;
    Ok(())
}

/// Every referenced part must exist before anything is torn down
fn check_parts_present(manifest: &SnapshotManifest, chunks: &Path) -> Result<()> {
    for part in manifest.all_parts() {
        let path = chunks.join(&part.name);
        if !path.exists() {
            return Err(SnapshotError::MissingPart { path });
        }
    }
    Ok(())
}

/// Replay the whole chain into `db`, then compact it
fn replay_chain(
    db: &mut dyn Database,
    manifest: &SnapshotManifest,
    chunks: &Path,
    cancel: &CancellationToken,
) -> Result<RestoreStats> {
    let mut stats = RestoreStats {
        entries: 0,
        parts: 0,
        bytes: 0,
        version: manifest.last_version,
    };
    for entry in manifest.entries() {
        if cancel.is_cancelled() {
            return Err(SnapshotError::Cancelled);
        }
        replay_entry(db, chunks, entry)?;
        stats.entries += 1;
        stats.parts += entry.parts.len();
        stats.bytes += entry.total_bytes();
    }
    db.compact(None, None)?;
    Ok(stats)
}

/// Rebuild the database at `target` from the manifest in `unit_dir`
///
/// The target is deleted first; the lineage and the presence of every part
/// are checked before that happens.
pub fn restore_unit(
    engine: &dyn DatabaseEngine,
    manifest: &SnapshotManifest,
    unit_dir: &Path,
    target: &Path,
    label: &str,
    cancel: &CancellationToken,
) -> Result<RestoreStats> {
    manifest.validate_lineage(label)?;
    let chunks = chunks_dir(unit_dir);
    check_parts_present(manifest, &chunks)?;

    match fs::remove_dir_all(target) {
        Ok(()) => debug!("Removed existing database at {}", target.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(SnapshotError::io(target, e)),
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_path(parent)?;
    }

    let mut db = engine.open(target)?;
    let stats = replay_chain(db.as_mut(), manifest, &chunks, cancel)?;

    info!(
        "Restored {} into {}: {} entries, {} parts, version {}",
        label,
        target.display(),
        stats.entries,
        stats.parts,
        stats.version
    );
    Ok(stats)
}

/// Scratch database directory removed on drop
struct ScratchDir(PathBuf);

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.0) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Failed to remove scratch dir {}: {}", self.0.display(), e);
            }
        }
    }
}

/// Collapse a unit's base and incrementals into a single new base
///
/// The chain is restored into a scratch database next to the unit, backed up
/// again from cursor 0, and the manifest is rewritten before old parts are
/// removed. `last_version` is carried over unchanged so later incrementals
/// continue from the same cursor.
pub fn squash(
    engine: &dyn DatabaseEngine,
    unit_dir: &Path,
    options: &PipelineOptions,
) -> Result<SquashOutcome> {
    let path = manifest_path(unit_dir);
    let manifest = load_manifest(&path)?;
    let label = unit_dir.display().to_string();
    if !manifest.is_incremental() {
        debug!("{} has no incrementals, nothing to squash", label);
        return Ok(SquashOutcome::AlreadyBase);
    }
    manifest.validate_lineage(&label)?;

    let chunks = chunks_dir(unit_dir);
    check_parts_present(&manifest, &chunks)?;

    let scratch = ScratchDir(unit_dir.join(format!("{}{}", SCRATCH_PREFIX, Uuid::new_v4().simple())));
    let (parts, version) = {
        let mut db = engine.open(&scratch.0)?;
        replay_chain(db.as_mut(), &manifest, &chunks, &options.cancel)?;
        stream_backup(db.as_mut(), &chunks, 0, options, |v| format!("base_{}", v))?
    };
    drop(scratch);

    let mut base = SnapshotEntry::new(0, version, parts);
    base.height = manifest.last_version.max(version);
    let squashed = SnapshotManifest {
        base,
        incrementals: Vec::new(),
        last_version: manifest.last_version,
        ..manifest.clone()
    };
    if let Err(e) = save_manifest(&path, &squashed) {
        remove_parts(&chunks, &squashed.base.parts);
        return Err(e);
    }

    let keep: HashSet<&str> = squashed.base.parts.iter().map(|p| p.name.as_str()).collect();
    let stale: Vec<_> = manifest
        .all_parts()
        .filter(|p| !keep.contains(p.name.as_str()))
        .cloned()
        .collect();
    remove_parts(&chunks, &stale);

    info!(
        "Squashed {}: {} incrementals folded, {} parts removed, new base has {} parts",
        label,
        manifest.incrementals.len(),
        stale.len(),
        squashed.base.parts.len()
    );
    Ok(SquashOutcome::Squashed {
        incrementals: manifest.incrementals.len(),
        parts_removed: stale.len(),
        base_parts: squashed.base.parts.len(),
    })
}
